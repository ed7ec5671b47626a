#![forbid(unsafe_code)]

use cardveil_kernel_contracts::audit::AuditRow;
use cardveil_kernel_contracts::billing::{OwnerBillingRecord, SettlementRecord};
use cardveil_kernel_contracts::card::{
    ProfileIndex, ProfilePermission, ProfilePermissionPatch, ProfileSlot, SealedSecret,
    SplitCardRecord,
};
use cardveil_kernel_contracts::confirmation::{
    CheckoutConfirmation, ConfirmationInput, ConfirmationStatus,
};
use cardveil_kernel_contracts::ids::{
    BotId, CardId, CheckoutId, ConfirmationId, EventId, OwnerId, PurchaseRequestId,
};
use cardveil_kernel_contracts::obfuscation::{
    ObfuscationEvent, ObfuscationEventInput, PurchaseSpec, RealPurchaseRequest,
};
use cardveil_kernel_contracts::rail5::{
    CheckoutOutcome, KeyMaterial, Rail5Card, Rail5Checkout, Rail5CheckoutInput,
    Rail5CheckoutStatus, Rail5Limits,
};
use cardveil_kernel_contracts::ReasonCodeId;
use chrono::{DateTime, Utc};

use crate::store::{CardVaultStore, SplitCardInitialized, StorageError};

/// Typed repository interface for split-knowledge card custody rows.
pub trait SplitCardRepo {
    fn split_card_initialize_row(
        &self,
        record: SplitCardRecord,
        slots: Vec<ProfileSlot>,
        max_cards_per_bot: usize,
        reason_code: ReasonCodeId,
    ) -> Result<SplitCardInitialized, StorageError>;

    #[allow(clippy::too_many_arguments)]
    fn split_card_owner_data_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        sealed_secret: SealedSecret,
        owner_name: String,
        owner_zip: String,
        reason_code: ReasonCodeId,
    ) -> Result<SplitCardRecord, StorageError>;

    fn split_card_link_bot_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        bot_id: BotId,
        max_cards_per_bot: usize,
        reason_code: ReasonCodeId,
    ) -> Result<SplitCardRecord, StorageError>;

    fn split_card_freeze_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        frozen: bool,
        reason_code: ReasonCodeId,
    ) -> Result<SplitCardRecord, StorageError>;

    fn split_card_permission_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        profile_index: ProfileIndex,
        patch: &ProfilePermissionPatch,
        reason_code: ReasonCodeId,
    ) -> Result<ProfilePermission, StorageError>;

    fn split_card_delete_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        reason_code: ReasonCodeId,
    ) -> Result<(), StorageError>;

    fn split_card_row(&self, card_id: &CardId) -> Option<SplitCardRecord>;
    fn split_card_rows_for_bot(&self, bot_id: &BotId) -> Vec<SplitCardRecord>;
    fn profile_slot_rows(&self, card_id: &CardId) -> Vec<ProfileSlot>;
}

/// Typed repository interface for per-profile allowance usage.
pub trait AllowanceRepo {
    fn allowance_spent_row(
        &self,
        card_id: &CardId,
        profile_index: ProfileIndex,
        window_start: DateTime<Utc>,
    ) -> u64;

    fn allowance_spend_row(
        &self,
        card_id: &CardId,
        profile_index: ProfileIndex,
        amount_cents: u64,
        enforce_limit: bool,
        window_for: impl FnOnce(&ProfilePermission) -> DateTime<Utc>,
    ) -> Result<u64, StorageError>;
}

/// Typed repository interface for obfuscation events and the real-purchase queue.
pub trait ObfuscationRepo {
    fn pending_event_row(&self, bot_id: &BotId) -> Option<ObfuscationEvent>;
    fn event_rows_since(&self, bot_id: &BotId, since: DateTime<Utc>) -> Vec<ObfuscationEvent>;

    fn insert_event_if_idle_row(
        &self,
        input: ObfuscationEventInput,
        reason_code: ReasonCodeId,
    ) -> Result<ObfuscationEvent, StorageError>;

    fn complete_event_row(
        &self,
        now: DateTime<Utc>,
        bot_id: &BotId,
        event_id: &EventId,
        reason_code: ReasonCodeId,
    ) -> Result<ObfuscationEvent, StorageError>;

    fn enqueue_real_purchase_row(
        &self,
        now: DateTime<Utc>,
        owner_id: OwnerId,
        bot_id: BotId,
        purchase: PurchaseSpec,
        reason_code: ReasonCodeId,
    ) -> Result<RealPurchaseRequest, StorageError>;

    fn next_real_purchase_row(&self, bot_id: &BotId) -> Option<RealPurchaseRequest>;

    fn dispatch_real_purchase_row(
        &self,
        request_id: &PurchaseRequestId,
        input: ObfuscationEventInput,
        reason_code: ReasonCodeId,
    ) -> Result<ObfuscationEvent, StorageError>;
}

/// Typed repository interface for split-knowledge checkout confirmations.
pub trait ConfirmationRepo {
    fn insert_confirmation_row(
        &self,
        input: ConfirmationInput,
        window_for: impl FnOnce(&ProfilePermission) -> DateTime<Utc>,
        decide: impl FnOnce(&ProfilePermission, u64) -> Result<ConfirmationStatus, StorageError>,
        reason_code: ReasonCodeId,
    ) -> Result<CheckoutConfirmation, StorageError>;

    fn confirmation_row(
        &self,
        now: DateTime<Utc>,
        confirmation_id: &ConfirmationId,
    ) -> Option<CheckoutConfirmation>;

    fn decide_confirmation_row(
        &self,
        now: DateTime<Utc>,
        confirmation_id: &ConfirmationId,
        owner_id: &OwnerId,
        approve: bool,
        window_for: impl FnOnce(&ProfilePermission) -> DateTime<Utc>,
        reason_code: ReasonCodeId,
    ) -> Result<CheckoutConfirmation, StorageError>;

    fn sweep_expired_rows(&self, now: DateTime<Utc>) -> usize;
}

/// Typed repository interface for the key-escrow rail.
pub trait Rail5Repo {
    fn insert_rail5_card_row(
        &self,
        card: Rail5Card,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Card, StorageError>;

    fn rail5_card_row(&self, card_id: &CardId) -> Option<Rail5Card>;

    fn rail5_key_material_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        material: KeyMaterial,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Card, StorageError>;

    fn rail5_link_bot_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        bot_id: BotId,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Card, StorageError>;

    fn insert_rail5_checkout_row(
        &self,
        input: Rail5CheckoutInput,
        day_start: DateTime<Utc>,
        month_start: DateTime<Utc>,
        decide: impl FnOnce(&Rail5Limits, u64, u64) -> Result<Rail5CheckoutStatus, StorageError>,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Checkout, StorageError>;

    fn rail5_checkout_row(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
    ) -> Option<Rail5Checkout>;

    fn decide_rail5_checkout_row(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
        owner_id: &OwnerId,
        approve: bool,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Checkout, StorageError>;

    fn deliver_rail5_key_row(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
        bot_id: &BotId,
        reason_code: ReasonCodeId,
    ) -> Result<KeyMaterial, StorageError>;

    fn revert_rail5_key_delivery_row(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Checkout, StorageError>;

    fn confirm_rail5_checkout_row(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
        bot_id: &BotId,
        outcome: CheckoutOutcome,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Checkout, StorageError>;
}

/// Owner processor handles and the once-per-subject settlement ledger.
pub trait BillingRepo {
    fn upsert_owner_billing_row(
        &self,
        record: OwnerBillingRecord,
        reason_code: ReasonCodeId,
    ) -> Result<OwnerBillingRecord, StorageError>;

    fn owner_billing_row(&self, owner_id: &OwnerId) -> Option<OwnerBillingRecord>;

    fn insert_settlement_row(
        &self,
        record: SettlementRecord,
        reason_code: ReasonCodeId,
    ) -> Result<SettlementRecord, StorageError>;

    fn settlement_row(&self, subject_id: &str) -> Option<SettlementRecord>;
}

/// Read-only view over the append-only transition log.
pub trait AuditRepo {
    fn audit_rows(&self) -> Vec<AuditRow>;
    fn audit_rows_for_subject(&self, subject_id: &str) -> Vec<AuditRow>;
}

impl SplitCardRepo for CardVaultStore {
    fn split_card_initialize_row(
        &self,
        record: SplitCardRecord,
        slots: Vec<ProfileSlot>,
        max_cards_per_bot: usize,
        reason_code: ReasonCodeId,
    ) -> Result<SplitCardInitialized, StorageError> {
        self.split_card_initialize_commit(record, slots, max_cards_per_bot, reason_code)
    }

    fn split_card_owner_data_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        sealed_secret: SealedSecret,
        owner_name: String,
        owner_zip: String,
        reason_code: ReasonCodeId,
    ) -> Result<SplitCardRecord, StorageError> {
        self.split_card_owner_data_commit(
            now,
            card_id,
            owner_id,
            sealed_secret,
            owner_name,
            owner_zip,
            reason_code,
        )
    }

    fn split_card_link_bot_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        bot_id: BotId,
        max_cards_per_bot: usize,
        reason_code: ReasonCodeId,
    ) -> Result<SplitCardRecord, StorageError> {
        self.split_card_link_bot_commit(now, card_id, owner_id, bot_id, max_cards_per_bot, reason_code)
    }

    fn split_card_freeze_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        frozen: bool,
        reason_code: ReasonCodeId,
    ) -> Result<SplitCardRecord, StorageError> {
        self.split_card_freeze_commit(now, card_id, owner_id, frozen, reason_code)
    }

    fn split_card_permission_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        profile_index: ProfileIndex,
        patch: &ProfilePermissionPatch,
        reason_code: ReasonCodeId,
    ) -> Result<ProfilePermission, StorageError> {
        self.split_card_permission_update_commit(
            now,
            card_id,
            owner_id,
            profile_index,
            patch,
            reason_code,
        )
    }

    fn split_card_delete_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        reason_code: ReasonCodeId,
    ) -> Result<(), StorageError> {
        self.split_card_delete_commit(now, card_id, owner_id, reason_code)
    }

    fn split_card_row(&self, card_id: &CardId) -> Option<SplitCardRecord> {
        self.split_card_get(card_id)
    }

    fn split_card_rows_for_bot(&self, bot_id: &BotId) -> Vec<SplitCardRecord> {
        self.split_cards_for_bot(bot_id)
    }

    fn profile_slot_rows(&self, card_id: &CardId) -> Vec<ProfileSlot> {
        self.split_card_profile_slots(card_id)
    }
}

impl AllowanceRepo for CardVaultStore {
    fn allowance_spent_row(
        &self,
        card_id: &CardId,
        profile_index: ProfileIndex,
        window_start: DateTime<Utc>,
    ) -> u64 {
        self.allowance_spent(card_id, profile_index, window_start)
    }

    fn allowance_spend_row(
        &self,
        card_id: &CardId,
        profile_index: ProfileIndex,
        amount_cents: u64,
        enforce_limit: bool,
        window_for: impl FnOnce(&ProfilePermission) -> DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        self.allowance_spend_commit(card_id, profile_index, amount_cents, enforce_limit, window_for)
    }
}

impl ObfuscationRepo for CardVaultStore {
    fn pending_event_row(&self, bot_id: &BotId) -> Option<ObfuscationEvent> {
        self.event_pending_for_bot(bot_id)
    }

    fn event_rows_since(&self, bot_id: &BotId, since: DateTime<Utc>) -> Vec<ObfuscationEvent> {
        self.events_for_bot_since(bot_id, since)
    }

    fn insert_event_if_idle_row(
        &self,
        input: ObfuscationEventInput,
        reason_code: ReasonCodeId,
    ) -> Result<ObfuscationEvent, StorageError> {
        self.event_insert_if_idle_commit(input, reason_code)
    }

    fn complete_event_row(
        &self,
        now: DateTime<Utc>,
        bot_id: &BotId,
        event_id: &EventId,
        reason_code: ReasonCodeId,
    ) -> Result<ObfuscationEvent, StorageError> {
        self.event_complete_commit(now, bot_id, event_id, reason_code)
    }

    fn enqueue_real_purchase_row(
        &self,
        now: DateTime<Utc>,
        owner_id: OwnerId,
        bot_id: BotId,
        purchase: PurchaseSpec,
        reason_code: ReasonCodeId,
    ) -> Result<RealPurchaseRequest, StorageError> {
        self.real_purchase_enqueue_commit(now, owner_id, bot_id, purchase, reason_code)
    }

    fn next_real_purchase_row(&self, bot_id: &BotId) -> Option<RealPurchaseRequest> {
        self.real_purchase_next_queued(bot_id)
    }

    fn dispatch_real_purchase_row(
        &self,
        request_id: &PurchaseRequestId,
        input: ObfuscationEventInput,
        reason_code: ReasonCodeId,
    ) -> Result<ObfuscationEvent, StorageError> {
        self.real_purchase_dispatch_commit(request_id, input, reason_code)
    }
}

impl ConfirmationRepo for CardVaultStore {
    fn insert_confirmation_row(
        &self,
        input: ConfirmationInput,
        window_for: impl FnOnce(&ProfilePermission) -> DateTime<Utc>,
        decide: impl FnOnce(&ProfilePermission, u64) -> Result<ConfirmationStatus, StorageError>,
        reason_code: ReasonCodeId,
    ) -> Result<CheckoutConfirmation, StorageError> {
        self.confirmation_insert_commit(input, window_for, decide, reason_code)
    }

    fn confirmation_row(
        &self,
        now: DateTime<Utc>,
        confirmation_id: &ConfirmationId,
    ) -> Option<CheckoutConfirmation> {
        self.confirmation_read(now, confirmation_id)
    }

    fn decide_confirmation_row(
        &self,
        now: DateTime<Utc>,
        confirmation_id: &ConfirmationId,
        owner_id: &OwnerId,
        approve: bool,
        window_for: impl FnOnce(&ProfilePermission) -> DateTime<Utc>,
        reason_code: ReasonCodeId,
    ) -> Result<CheckoutConfirmation, StorageError> {
        self.confirmation_decide_commit(now, confirmation_id, owner_id, approve, window_for, reason_code)
    }

    fn sweep_expired_rows(&self, now: DateTime<Utc>) -> usize {
        self.expiry_sweep_commit(now)
    }
}

impl Rail5Repo for CardVaultStore {
    fn insert_rail5_card_row(
        &self,
        card: Rail5Card,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Card, StorageError> {
        self.rail5_card_insert_commit(card, reason_code)
    }

    fn rail5_card_row(&self, card_id: &CardId) -> Option<Rail5Card> {
        self.rail5_card_get(card_id)
    }

    fn rail5_key_material_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        material: KeyMaterial,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Card, StorageError> {
        self.rail5_key_material_commit(now, card_id, owner_id, material, reason_code)
    }

    fn rail5_link_bot_row(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        bot_id: BotId,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Card, StorageError> {
        self.rail5_link_bot_commit(now, card_id, owner_id, bot_id, reason_code)
    }

    fn insert_rail5_checkout_row(
        &self,
        input: Rail5CheckoutInput,
        day_start: DateTime<Utc>,
        month_start: DateTime<Utc>,
        decide: impl FnOnce(&Rail5Limits, u64, u64) -> Result<Rail5CheckoutStatus, StorageError>,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Checkout, StorageError> {
        self.rail5_checkout_insert_commit(input, day_start, month_start, decide, reason_code)
    }

    fn rail5_checkout_row(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
    ) -> Option<Rail5Checkout> {
        self.rail5_checkout_read(now, checkout_id)
    }

    fn decide_rail5_checkout_row(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
        owner_id: &OwnerId,
        approve: bool,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Checkout, StorageError> {
        self.rail5_checkout_decide_commit(now, checkout_id, owner_id, approve, reason_code)
    }

    fn deliver_rail5_key_row(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
        bot_id: &BotId,
        reason_code: ReasonCodeId,
    ) -> Result<KeyMaterial, StorageError> {
        self.rail5_key_delivery_commit(now, checkout_id, bot_id, reason_code)
    }

    fn revert_rail5_key_delivery_row(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Checkout, StorageError> {
        self.rail5_key_delivery_revert_commit(now, checkout_id, reason_code)
    }

    fn confirm_rail5_checkout_row(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
        bot_id: &BotId,
        outcome: CheckoutOutcome,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Checkout, StorageError> {
        self.rail5_checkout_confirm_commit(now, checkout_id, bot_id, outcome, reason_code)
    }
}

impl BillingRepo for CardVaultStore {
    fn upsert_owner_billing_row(
        &self,
        record: OwnerBillingRecord,
        reason_code: ReasonCodeId,
    ) -> Result<OwnerBillingRecord, StorageError> {
        self.owner_billing_upsert_commit(record, reason_code)
    }

    fn owner_billing_row(&self, owner_id: &OwnerId) -> Option<OwnerBillingRecord> {
        self.owner_billing_get(owner_id)
    }

    fn insert_settlement_row(
        &self,
        record: SettlementRecord,
        reason_code: ReasonCodeId,
    ) -> Result<SettlementRecord, StorageError> {
        self.settlement_record_commit(record, reason_code)
    }

    fn settlement_row(&self, subject_id: &str) -> Option<SettlementRecord> {
        self.settlement_get(subject_id)
    }
}

impl AuditRepo for CardVaultStore {
    fn audit_rows(&self) -> Vec<AuditRow> {
        CardVaultStore::audit_rows(self)
    }

    fn audit_rows_for_subject(&self, subject_id: &str) -> Vec<AuditRow> {
        CardVaultStore::audit_rows_for_subject(self, subject_id)
    }
}
