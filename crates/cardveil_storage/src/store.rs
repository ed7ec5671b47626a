#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use cardveil_kernel_contracts::allowance::AllowanceUsageRow;
use cardveil_kernel_contracts::audit::{AuditRow, AuditSubjectKind};
use cardveil_kernel_contracts::billing::{OwnerBillingRecord, SettlementRecord};
use cardveil_kernel_contracts::card::{
    ProfileIndex, ProfilePermission, ProfilePermissionPatch, ProfileSlot, SealedSecret,
    SplitCardRecord, SplitCardStatus,
};
use cardveil_kernel_contracts::confirmation::{
    CheckoutConfirmation, ConfirmationInput, ConfirmationStatus,
};
use cardveil_kernel_contracts::ids::{
    BotId, CardId, CheckoutId, ConfirmationId, EventId, OwnerId, PurchaseRequestId,
};
use cardveil_kernel_contracts::obfuscation::{
    ObfuscationEvent, ObfuscationEventInput, ObfuscationEventStatus, PurchaseSpec,
    RealPurchaseRequest, RealPurchaseStatus,
};
use cardveil_kernel_contracts::rail5::{
    CheckoutOutcome, KeyMaterial, Rail5Card, Rail5CardStatus, Rail5Checkout, Rail5CheckoutInput,
    Rail5CheckoutStatus, Rail5Limits,
};
use cardveil_kernel_contracts::{ContractViolation, ReasonCodeId, Validate};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

pub mod reason_codes {
    use cardveil_kernel_contracts::ReasonCodeId;

    // Storage-originated transitions (lazy expiry observed on read or sweep).
    pub const STORE_LAZY_EXPIRY: ReasonCodeId = ReasonCodeId(0x5354_0001);
    pub const STORE_PENDING_REPLACED: ReasonCodeId = ReasonCodeId(0x5354_0002);
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    NotFound {
        table: &'static str,
        key: String,
    },
    Forbidden {
        table: &'static str,
        key: String,
    },
    DuplicateKey {
        table: &'static str,
        key: String,
    },
    StateConflict {
        table: &'static str,
        key: String,
        state: &'static str,
    },
    AlreadyConsumed {
        table: &'static str,
        key: String,
    },
    Expired {
        table: &'static str,
        key: String,
    },
    LimitExceeded {
        table: &'static str,
        key: String,
        remaining_cents: u64,
    },
    CapacityExceeded {
        table: &'static str,
        key: String,
        max: usize,
    },
    ContractViolation(ContractViolation),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { table, key } => write!(f, "{table}: {key} not found"),
            Self::Forbidden { table, key } => write!(f, "{table}: {key} not accessible"),
            Self::DuplicateKey { table, key } => write!(f, "{table}: duplicate key {key}"),
            Self::StateConflict { table, key, state } => {
                write!(f, "{table}: {key} is {state}")
            }
            Self::AlreadyConsumed { table, key } => write!(f, "{table}: {key} already consumed"),
            Self::Expired { table, key } => write!(f, "{table}: {key} expired"),
            Self::LimitExceeded {
                table,
                key,
                remaining_cents,
            } => write!(f, "{table}: {key} limit exceeded ({remaining_cents} remaining)"),
            Self::CapacityExceeded { table, key, max } => {
                write!(f, "{table}: {key} already holds {max} rows")
            }
            Self::ContractViolation(v) => write!(f, "contract violation: {v}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

fn not_found(table: &'static str, key: &str) -> StorageError {
    StorageError::NotFound {
        table,
        key: key.to_string(),
    }
}

fn mint_id(prefix: &str, seq: u64) -> String {
    format!("{prefix}_{seq:06}_{:08x}", rand::random::<u32>())
}

/// Outcome of a card initialization commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitCardInitialized {
    pub record: SplitCardRecord,
    pub replaced_pending: Vec<CardId>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Tables {
    pub(crate) split_cards: BTreeMap<CardId, SplitCardRecord>,
    pub(crate) profile_slots: BTreeMap<(CardId, ProfileIndex), ProfileSlot>,
    pub(crate) allowance_usage: BTreeMap<(CardId, ProfileIndex, DateTime<Utc>), u64>,
    pub(crate) events: BTreeMap<EventId, ObfuscationEvent>,
    pub(crate) pending_event_by_bot: BTreeMap<BotId, EventId>,
    pub(crate) real_purchases: BTreeMap<PurchaseRequestId, RealPurchaseRequest>,
    pub(crate) confirmations: BTreeMap<ConfirmationId, CheckoutConfirmation>,
    pub(crate) rail5_cards: BTreeMap<CardId, Rail5Card>,
    pub(crate) rail5_checkouts: BTreeMap<CheckoutId, Rail5Checkout>,
    pub(crate) owner_billing: BTreeMap<OwnerId, OwnerBillingRecord>,
    pub(crate) settlements: BTreeMap<String, SettlementRecord>,
    pub(crate) audit: Vec<AuditRow>,
    pub(crate) next_seq: u64,
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        self.next_seq = self.next_seq.saturating_add(1);
        self.next_seq
    }

    fn audit(
        &mut self,
        at: DateTime<Utc>,
        subject_kind: AuditSubjectKind,
        subject_id: &str,
        state_from: &str,
        state_to: &str,
        reason_code: ReasonCodeId,
    ) {
        let seq = self.next_seq();
        self.audit.push(AuditRow {
            seq,
            at,
            subject_kind,
            subject_id: subject_id.to_string(),
            state_from: state_from.to_string(),
            state_to: state_to.to_string(),
            reason_code,
        });
    }

    fn remove_split_card(&mut self, card_id: &CardId) {
        self.split_cards.remove(card_id);
        self.profile_slots.retain(|(c, _), _| c != card_id);
        self.allowance_usage.retain(|(c, _, _), _| c != card_id);
    }

    fn owned_split_card_mut(
        &mut self,
        card_id: &CardId,
        owner_id: &OwnerId,
    ) -> Result<&mut SplitCardRecord, StorageError> {
        match self.split_cards.get_mut(card_id) {
            Some(rec) if &rec.owner_id == owner_id => Ok(rec),
            _ => Err(not_found("split_cards.card_id", card_id.as_str())),
        }
    }

    fn slot_permission(
        &self,
        card_id: &CardId,
        profile_index: ProfileIndex,
    ) -> Result<ProfilePermission, StorageError> {
        self.profile_slots
            .get(&(card_id.clone(), profile_index))
            .map(|s| s.permission.clone())
            .ok_or_else(|| not_found("profile_slots.profile_index", card_id.as_str()))
    }

    fn spent(&self, card_id: &CardId, profile_index: ProfileIndex, window: DateTime<Utc>) -> u64 {
        self.allowance_usage
            .get(&(card_id.clone(), profile_index, window))
            .copied()
            .unwrap_or(0)
    }

    fn add_spend(
        &mut self,
        card_id: &CardId,
        profile_index: ProfileIndex,
        window: DateTime<Utc>,
        amount_cents: u64,
    ) -> u64 {
        let slot = self
            .allowance_usage
            .entry((card_id.clone(), profile_index, window))
            .or_insert(0);
        *slot = slot.saturating_add(amount_cents);
        *slot
    }

    fn expire_confirmation(&mut self, confirmation_id: &ConfirmationId, now: DateTime<Utc>) {
        let fired = self
            .confirmations
            .get_mut(confirmation_id)
            .map(|c| c.expire_if_due(now))
            .unwrap_or(false);
        if fired {
            self.audit(
                now,
                AuditSubjectKind::Confirmation,
                confirmation_id.as_str(),
                ConfirmationStatus::Pending.as_str(),
                ConfirmationStatus::Expired.as_str(),
                reason_codes::STORE_LAZY_EXPIRY,
            );
        }
    }

    fn expire_rail5_checkout(&mut self, checkout_id: &CheckoutId, now: DateTime<Utc>) {
        let fired = self
            .rail5_checkouts
            .get_mut(checkout_id)
            .map(|c| c.expire_if_due(now))
            .unwrap_or(false);
        if fired {
            self.audit(
                now,
                AuditSubjectKind::Rail5Checkout,
                checkout_id.as_str(),
                Rail5CheckoutStatus::Pending.as_str(),
                Rail5CheckoutStatus::Expired.as_str(),
                reason_codes::STORE_LAZY_EXPIRY,
            );
        }
    }

    fn rail5_reserved_since(
        &self,
        card_id: &CardId,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> u64 {
        self.rail5_checkouts
            .values()
            .filter(|c| &c.card_id == card_id && c.created_at >= since)
            .filter(|c| match c.status {
                Rail5CheckoutStatus::Approved => true,
                Rail5CheckoutStatus::Pending => now <= c.expires_at,
                Rail5CheckoutStatus::Denied | Rail5CheckoutStatus::Expired => false,
            })
            .map(|c| c.purchase.amount_cents)
            .fold(0u64, u64::saturating_add)
    }

    fn insert_event(&mut self, input: ObfuscationEventInput) -> Result<ObfuscationEvent, StorageError> {
        if let Some(existing) = self.pending_event_by_bot.get(&input.bot_id) {
            return Err(StorageError::StateConflict {
                table: "obfuscation_events.bot_id",
                key: existing.as_str().to_string(),
                state: "pending_event_exists",
            });
        }
        let seq = self.next_seq();
        let event_id = EventId::new(mint_id("evt", seq))?;
        let event = ObfuscationEvent {
            event_id: event_id.clone(),
            bot_id: input.bot_id.clone(),
            card_id: input.card_id,
            profile_index: input.profile_index,
            purchase: input.purchase,
            origin: input.origin,
            status: ObfuscationEventStatus::Pending,
            occurred_at: input.occurred_at,
            completed_at: None,
        };
        self.events.insert(event_id.clone(), event.clone());
        self.pending_event_by_bot.insert(input.bot_id, event_id);
        Ok(event)
    }
}

/// Durable state for card custody, decoy traffic and both checkout rails.
///
/// Every `*_commit` method runs its state check and its write (plus the audit row and
/// any usage side effect) inside one critical section, so concurrent callers racing on
/// the same single-shot transition observe exactly one winner. Closures passed to
/// commit methods run under that lock and must not call back into the store.
#[derive(Debug, Default)]
pub struct CardVaultStore {
    pub(crate) tables: Mutex<Tables>,
}

impl CardVaultStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    // ----- split-knowledge cards -------------------------------------------------------

    /// Inserts a freshly generated card. Pending cards previously initialized for the
    /// same `(owner, bot)` are discarded; a non-pending one blocks the insert. A card
    /// created for a bot counts against that bot's `max_cards_per_bot` like a linked one.
    pub fn split_card_initialize_commit(
        &self,
        record: SplitCardRecord,
        slots: Vec<ProfileSlot>,
        max_cards_per_bot: usize,
        reason_code: ReasonCodeId,
    ) -> Result<SplitCardInitialized, StorageError> {
        record.validate()?;
        if slots.len() != usize::from(record.profile_count)
            || slots.iter().any(|s| s.card_id != record.card_id)
        {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "split_card_initialize_commit.slots",
                    reason: "must hold exactly one slot per profile of this card",
                },
            ));
        }
        let mut t = self.tables.lock();
        if t.split_cards.contains_key(&record.card_id) {
            return Err(StorageError::DuplicateKey {
                table: "split_cards.card_id",
                key: record.card_id.as_str().to_string(),
            });
        }
        let same_slot: Vec<&SplitCardRecord> = t
            .split_cards
            .values()
            .filter(|c| c.owner_id == record.owner_id && c.bot_id == record.bot_id)
            .collect();
        if let Some(bot_id) = &record.bot_id {
            if same_slot
                .iter()
                .any(|c| c.status != SplitCardStatus::PendingSetup)
            {
                return Err(StorageError::StateConflict {
                    table: "split_cards.bot_id",
                    key: bot_id.as_str().to_string(),
                    state: "active",
                });
            }
        }
        let replaced_pending: Vec<CardId> = same_slot
            .iter()
            .filter(|c| c.status == SplitCardStatus::PendingSetup)
            .map(|c| c.card_id.clone())
            .collect();
        if let Some(bot_id) = &record.bot_id {
            let held = t
                .split_cards
                .values()
                .filter(|c| c.bot_id.as_ref() == Some(bot_id))
                .filter(|c| !replaced_pending.contains(&c.card_id))
                .count();
            if held >= max_cards_per_bot {
                return Err(StorageError::CapacityExceeded {
                    table: "split_cards.bot_id",
                    key: bot_id.as_str().to_string(),
                    max: max_cards_per_bot,
                });
            }
        }
        for old in &replaced_pending {
            t.remove_split_card(old);
            t.audit(
                record.created_at,
                AuditSubjectKind::SplitCard,
                old.as_str(),
                SplitCardStatus::PendingSetup.as_str(),
                "discarded",
                reason_codes::STORE_PENDING_REPLACED,
            );
        }
        for slot in slots {
            t.profile_slots
                .insert((slot.card_id.clone(), slot.profile_index), slot);
        }
        t.split_cards.insert(record.card_id.clone(), record.clone());
        t.audit(
            record.created_at,
            AuditSubjectKind::SplitCard,
            record.card_id.as_str(),
            "none",
            SplitCardStatus::PendingSetup.as_str(),
            reason_code,
        );
        Ok(SplitCardInitialized {
            record,
            replaced_pending,
        })
    }

    pub fn split_card_get(&self, card_id: &CardId) -> Option<SplitCardRecord> {
        self.tables.lock().split_cards.get(card_id).cloned()
    }

    pub fn split_cards_for_bot(&self, bot_id: &BotId) -> Vec<SplitCardRecord> {
        self.tables
            .lock()
            .split_cards
            .values()
            .filter(|c| c.bot_id.as_ref() == Some(bot_id))
            .cloned()
            .collect()
    }

    pub fn split_cards_for_owner(&self, owner_id: &OwnerId) -> Vec<SplitCardRecord> {
        self.tables
            .lock()
            .split_cards
            .values()
            .filter(|c| &c.owner_id == owner_id)
            .cloned()
            .collect()
    }

    /// Bots that hold at least one `Active` split-knowledge card.
    pub fn bots_with_active_split_cards(&self) -> Vec<BotId> {
        let t = self.tables.lock();
        let bots: BTreeSet<BotId> = t
            .split_cards
            .values()
            .filter(|c| c.status == SplitCardStatus::Active)
            .filter_map(|c| c.bot_id.clone())
            .collect();
        bots.into_iter().collect()
    }

    pub fn split_card_profile_slots(&self, card_id: &CardId) -> Vec<ProfileSlot> {
        self.tables
            .lock()
            .profile_slots
            .iter()
            .filter(|((c, _), _)| c == card_id)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn split_card_profile_slot(
        &self,
        card_id: &CardId,
        profile_index: ProfileIndex,
    ) -> Option<ProfileSlot> {
        self.tables
            .lock()
            .profile_slots
            .get(&(card_id.clone(), profile_index))
            .cloned()
    }

    /// One-way `PendingSetup -> {Active | AwaitingBot}` that stores the sealed real
    /// fragment. A second call fails with `StateConflict`.
    #[allow(clippy::too_many_arguments)]
    pub fn split_card_owner_data_commit(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        sealed_secret: SealedSecret,
        owner_name: String,
        owner_zip: String,
        reason_code: ReasonCodeId,
    ) -> Result<SplitCardRecord, StorageError> {
        let mut t = self.tables.lock();
        let rec = t.owned_split_card_mut(card_id, owner_id)?;
        if rec.status != SplitCardStatus::PendingSetup {
            return Err(StorageError::StateConflict {
                table: "split_cards.status",
                key: card_id.as_str().to_string(),
                state: rec.status.as_str(),
            });
        }
        let next = if rec.bot_id.is_some() {
            SplitCardStatus::Active
        } else {
            SplitCardStatus::AwaitingBot
        };
        rec.status = next;
        if next == SplitCardStatus::Active {
            rec.activated_at = Some(now);
        }
        let real_index = rec.real_profile_index;
        let out = rec.clone();
        let slot = t
            .profile_slots
            .get_mut(&(card_id.clone(), real_index))
            .ok_or_else(|| not_found("profile_slots.profile_index", card_id.as_str()))?;
        slot.sealed_secret = Some(sealed_secret);
        slot.holder_name = Some(owner_name);
        slot.holder_zip = Some(owner_zip);
        t.audit(
            now,
            AuditSubjectKind::SplitCard,
            card_id.as_str(),
            SplitCardStatus::PendingSetup.as_str(),
            next.as_str(),
            reason_code,
        );
        Ok(out)
    }

    pub fn split_card_link_bot_commit(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        bot_id: BotId,
        max_cards_per_bot: usize,
        reason_code: ReasonCodeId,
    ) -> Result<SplitCardRecord, StorageError> {
        let mut t = self.tables.lock();
        let linked = t
            .split_cards
            .values()
            .filter(|c| c.bot_id.as_ref() == Some(&bot_id) && c.card_id != *card_id)
            .count();
        let rec = t.owned_split_card_mut(card_id, owner_id)?;
        if rec.status != SplitCardStatus::AwaitingBot {
            return Err(StorageError::StateConflict {
                table: "split_cards.status",
                key: card_id.as_str().to_string(),
                state: rec.status.as_str(),
            });
        }
        if linked >= max_cards_per_bot {
            return Err(StorageError::CapacityExceeded {
                table: "split_cards.bot_id",
                key: bot_id.as_str().to_string(),
                max: max_cards_per_bot,
            });
        }
        rec.bot_id = Some(bot_id);
        rec.status = SplitCardStatus::Active;
        rec.activated_at = Some(now);
        let out = rec.clone();
        t.audit(
            now,
            AuditSubjectKind::SplitCard,
            card_id.as_str(),
            SplitCardStatus::AwaitingBot.as_str(),
            SplitCardStatus::Active.as_str(),
            reason_code,
        );
        Ok(out)
    }

    pub fn split_card_freeze_commit(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        frozen: bool,
        reason_code: ReasonCodeId,
    ) -> Result<SplitCardRecord, StorageError> {
        let mut t = self.tables.lock();
        let rec = t.owned_split_card_mut(card_id, owner_id)?;
        let from = rec.status;
        if !matches!(from, SplitCardStatus::Active | SplitCardStatus::Frozen) {
            return Err(StorageError::StateConflict {
                table: "split_cards.status",
                key: card_id.as_str().to_string(),
                state: from.as_str(),
            });
        }
        rec.status = if frozen {
            SplitCardStatus::Frozen
        } else {
            SplitCardStatus::Active
        };
        let out = rec.clone();
        if from != out.status {
            t.audit(
                now,
                AuditSubjectKind::SplitCard,
                card_id.as_str(),
                from.as_str(),
                out.status.as_str(),
                reason_code,
            );
        }
        Ok(out)
    }

    /// Only the real profile's permission is owner-editable.
    pub fn split_card_permission_update_commit(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        profile_index: ProfileIndex,
        patch: &ProfilePermissionPatch,
        reason_code: ReasonCodeId,
    ) -> Result<ProfilePermission, StorageError> {
        let mut t = self.tables.lock();
        let real_index = t.owned_split_card_mut(card_id, owner_id)?.real_profile_index;
        if profile_index != real_index {
            return Err(StorageError::StateConflict {
                table: "profile_slots.profile_index",
                key: card_id.as_str().to_string(),
                state: "not_owner_editable",
            });
        }
        let slot = t
            .profile_slots
            .get_mut(&(card_id.clone(), profile_index))
            .ok_or_else(|| not_found("profile_slots.profile_index", card_id.as_str()))?;
        let next = slot.permission.apply(patch)?;
        slot.permission = next.clone();
        t.audit(
            now,
            AuditSubjectKind::SplitCard,
            card_id.as_str(),
            "permission",
            "permission_updated",
            reason_code,
        );
        Ok(next)
    }

    pub fn split_card_delete_commit(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        reason_code: ReasonCodeId,
    ) -> Result<(), StorageError> {
        let mut t = self.tables.lock();
        let status = t.owned_split_card_mut(card_id, owner_id)?.status;
        t.remove_split_card(card_id);
        t.audit(
            now,
            AuditSubjectKind::SplitCard,
            card_id.as_str(),
            status.as_str(),
            "deleted",
            reason_code,
        );
        Ok(())
    }

    // ----- allowance usage -------------------------------------------------------------

    pub fn allowance_spent(
        &self,
        card_id: &CardId,
        profile_index: ProfileIndex,
        window_start: DateTime<Utc>,
    ) -> u64 {
        self.tables.lock().spent(card_id, profile_index, window_start)
    }

    /// Atomic add into the window bucket chosen by `window_for` from the profile's
    /// current permission. With `enforce_limit` the add only happens if it fits.
    /// Returns the new window total.
    pub fn allowance_spend_commit(
        &self,
        card_id: &CardId,
        profile_index: ProfileIndex,
        amount_cents: u64,
        enforce_limit: bool,
        window_for: impl FnOnce(&ProfilePermission) -> DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let mut t = self.tables.lock();
        let permission = t.slot_permission(card_id, profile_index)?;
        let window = window_for(&permission);
        let spent = t.spent(card_id, profile_index, window);
        if enforce_limit && spent.saturating_add(amount_cents) > permission.allowance_value_cents {
            return Err(StorageError::LimitExceeded {
                table: "allowance_usage",
                key: card_id.as_str().to_string(),
                remaining_cents: permission.allowance_value_cents.saturating_sub(spent),
            });
        }
        Ok(t.add_spend(card_id, profile_index, window, amount_cents))
    }

    pub fn allowance_usage_rows(&self, card_id: &CardId) -> Vec<AllowanceUsageRow> {
        self.tables
            .lock()
            .allowance_usage
            .iter()
            .filter(|((c, _, _), _)| c == card_id)
            .map(|((c, p, w), spent)| AllowanceUsageRow {
                card_id: c.clone(),
                profile_index: *p,
                window_start: *w,
                spent_cents: *spent,
            })
            .collect()
    }

    // ----- obfuscation events ------------------------------------------------------------

    pub fn event_pending_for_bot(&self, bot_id: &BotId) -> Option<ObfuscationEvent> {
        let t = self.tables.lock();
        t.pending_event_by_bot
            .get(bot_id)
            .and_then(|id| t.events.get(id))
            .cloned()
    }

    pub fn event_get(&self, event_id: &EventId) -> Option<ObfuscationEvent> {
        self.tables.lock().events.get(event_id).cloned()
    }

    pub fn events_for_bot_since(
        &self,
        bot_id: &BotId,
        since: DateTime<Utc>,
    ) -> Vec<ObfuscationEvent> {
        self.tables
            .lock()
            .events
            .values()
            .filter(|e| &e.bot_id == bot_id && e.occurred_at >= since)
            .cloned()
            .collect()
    }

    /// Inserts a pending event unless the bot already has one.
    pub fn event_insert_if_idle_commit(
        &self,
        input: ObfuscationEventInput,
        reason_code: ReasonCodeId,
    ) -> Result<ObfuscationEvent, StorageError> {
        input.validate()?;
        let mut t = self.tables.lock();
        let event = t.insert_event(input)?;
        t.audit(
            event.occurred_at,
            AuditSubjectKind::ObfuscationEvent,
            event.event_id.as_str(),
            "none",
            ObfuscationEventStatus::Pending.as_str(),
            reason_code,
        );
        Ok(event)
    }

    /// `Pending -> Completed`, exactly once, only by the bot the event belongs to.
    pub fn event_complete_commit(
        &self,
        now: DateTime<Utc>,
        bot_id: &BotId,
        event_id: &EventId,
        reason_code: ReasonCodeId,
    ) -> Result<ObfuscationEvent, StorageError> {
        let mut t = self.tables.lock();
        let event = match t.events.get_mut(event_id) {
            Some(e) if &e.bot_id == bot_id => e,
            _ => return Err(not_found("obfuscation_events.event_id", event_id.as_str())),
        };
        if event.status == ObfuscationEventStatus::Completed {
            return Err(StorageError::AlreadyConsumed {
                table: "obfuscation_events.status",
                key: event_id.as_str().to_string(),
            });
        }
        event.status = ObfuscationEventStatus::Completed;
        event.completed_at = Some(now);
        let out = event.clone();
        if t.pending_event_by_bot.get(bot_id) == Some(event_id) {
            t.pending_event_by_bot.remove(bot_id);
        }
        t.audit(
            now,
            AuditSubjectKind::ObfuscationEvent,
            event_id.as_str(),
            ObfuscationEventStatus::Pending.as_str(),
            ObfuscationEventStatus::Completed.as_str(),
            reason_code,
        );
        Ok(out)
    }

    // ----- real purchase queue -----------------------------------------------------------

    pub fn real_purchase_enqueue_commit(
        &self,
        now: DateTime<Utc>,
        owner_id: OwnerId,
        bot_id: BotId,
        purchase: PurchaseSpec,
        reason_code: ReasonCodeId,
    ) -> Result<RealPurchaseRequest, StorageError> {
        purchase.validate()?;
        let mut t = self.tables.lock();
        let seq = t.next_seq();
        let request_id = PurchaseRequestId::new(mint_id("rpq", seq))?;
        let request = RealPurchaseRequest {
            request_id: request_id.clone(),
            owner_id,
            bot_id,
            purchase,
            status: RealPurchaseStatus::Queued,
            queued_at: now,
            dispatched_event_id: None,
        };
        t.real_purchases.insert(request_id.clone(), request.clone());
        t.audit(
            now,
            AuditSubjectKind::RealPurchase,
            request_id.as_str(),
            "none",
            "queued",
            reason_code,
        );
        Ok(request)
    }

    /// Oldest queued request for the bot.
    pub fn real_purchase_next_queued(&self, bot_id: &BotId) -> Option<RealPurchaseRequest> {
        self.tables
            .lock()
            .real_purchases
            .values()
            .filter(|r| &r.bot_id == bot_id && r.status == RealPurchaseStatus::Queued)
            .min_by_key(|r| r.queued_at)
            .cloned()
    }

    /// Marks the request dispatched and creates its event in one unit. Fails without
    /// side effects if the bot already has a pending event or the request was taken.
    pub fn real_purchase_dispatch_commit(
        &self,
        request_id: &PurchaseRequestId,
        input: ObfuscationEventInput,
        reason_code: ReasonCodeId,
    ) -> Result<ObfuscationEvent, StorageError> {
        input.validate()?;
        let mut t = self.tables.lock();
        match t.real_purchases.get(request_id) {
            Some(r) if r.bot_id == input.bot_id && r.status == RealPurchaseStatus::Queued => {}
            Some(r) if r.bot_id == input.bot_id => {
                return Err(StorageError::AlreadyConsumed {
                    table: "real_purchases.status",
                    key: request_id.as_str().to_string(),
                })
            }
            _ => return Err(not_found("real_purchases.request_id", request_id.as_str())),
        }
        let event = t.insert_event(input)?;
        if let Some(r) = t.real_purchases.get_mut(request_id) {
            r.status = RealPurchaseStatus::Dispatched;
            r.dispatched_event_id = Some(event.event_id.clone());
        }
        t.audit(
            event.occurred_at,
            AuditSubjectKind::RealPurchase,
            request_id.as_str(),
            "queued",
            "dispatched",
            reason_code,
        );
        t.audit(
            event.occurred_at,
            AuditSubjectKind::ObfuscationEvent,
            event.event_id.as_str(),
            "none",
            ObfuscationEventStatus::Pending.as_str(),
            reason_code,
        );
        Ok(event)
    }

    // ----- split-knowledge checkout confirmations --------------------------------------

    /// Creates a confirmation whose initial status is chosen by `decide` from the
    /// profile's permission and current window spend. An `Approved` outcome books the
    /// spend in the same unit.
    pub fn confirmation_insert_commit(
        &self,
        input: ConfirmationInput,
        window_for: impl FnOnce(&ProfilePermission) -> DateTime<Utc>,
        decide: impl FnOnce(&ProfilePermission, u64) -> Result<ConfirmationStatus, StorageError>,
        reason_code: ReasonCodeId,
    ) -> Result<CheckoutConfirmation, StorageError> {
        input.validate()?;
        let mut t = self.tables.lock();
        match t.split_cards.get(&input.card_id) {
            Some(c) if c.bot_id.as_ref() == Some(&input.bot_id) => {
                if c.status != SplitCardStatus::Active {
                    return Err(StorageError::StateConflict {
                        table: "split_cards.status",
                        key: input.card_id.as_str().to_string(),
                        state: c.status.as_str(),
                    });
                }
            }
            _ => return Err(not_found("split_cards.card_id", input.card_id.as_str())),
        }
        let permission = t.slot_permission(&input.card_id, input.profile_index)?;
        let window = window_for(&permission);
        let spent = t.spent(&input.card_id, input.profile_index, window);
        let status = decide(&permission, spent)?;
        if status == ConfirmationStatus::Approved {
            t.add_spend(
                &input.card_id,
                input.profile_index,
                window,
                input.purchase.amount_cents,
            );
        }
        let seq = t.next_seq();
        let confirmation_id = ConfirmationId::new(mint_id("conf", seq))?;
        let confirmation = CheckoutConfirmation {
            confirmation_id: confirmation_id.clone(),
            card_id: input.card_id,
            bot_id: input.bot_id,
            profile_index: input.profile_index,
            purchase: input.purchase,
            status,
            created_at: input.created_at,
            expires_at: input.expires_at,
            decided_at: (status != ConfirmationStatus::Pending).then_some(input.created_at),
        };
        t.confirmations
            .insert(confirmation_id.clone(), confirmation.clone());
        t.audit(
            confirmation.created_at,
            AuditSubjectKind::Confirmation,
            confirmation_id.as_str(),
            "none",
            status.as_str(),
            reason_code,
        );
        Ok(confirmation)
    }

    /// Read with lazy `Pending -> Expired`.
    pub fn confirmation_read(
        &self,
        now: DateTime<Utc>,
        confirmation_id: &ConfirmationId,
    ) -> Option<CheckoutConfirmation> {
        let mut t = self.tables.lock();
        t.expire_confirmation(confirmation_id, now);
        t.confirmations.get(confirmation_id).cloned()
    }

    /// Owner decision on a pending confirmation. Approval re-checks the allowance and
    /// books the spend atomically with the transition.
    pub fn confirmation_decide_commit(
        &self,
        now: DateTime<Utc>,
        confirmation_id: &ConfirmationId,
        owner_id: &OwnerId,
        approve: bool,
        window_for: impl FnOnce(&ProfilePermission) -> DateTime<Utc>,
        reason_code: ReasonCodeId,
    ) -> Result<CheckoutConfirmation, StorageError> {
        let mut t = self.tables.lock();
        let (card_id, profile_index, amount_cents) = match t.confirmations.get(confirmation_id) {
            Some(c) => (c.card_id.clone(), c.profile_index, c.purchase.amount_cents),
            None => return Err(not_found("confirmations.confirmation_id", confirmation_id.as_str())),
        };
        match t.split_cards.get(&card_id) {
            Some(card) if &card.owner_id == owner_id => {}
            _ => return Err(not_found("confirmations.confirmation_id", confirmation_id.as_str())),
        }
        t.expire_confirmation(confirmation_id, now);
        let status = t
            .confirmations
            .get(confirmation_id)
            .map(|c| c.status)
            .unwrap_or(ConfirmationStatus::Expired);
        match status {
            ConfirmationStatus::Pending => {}
            ConfirmationStatus::Expired => {
                return Err(StorageError::Expired {
                    table: "confirmations.status",
                    key: confirmation_id.as_str().to_string(),
                })
            }
            other => {
                return Err(StorageError::StateConflict {
                    table: "confirmations.status",
                    key: confirmation_id.as_str().to_string(),
                    state: other.as_str(),
                })
            }
        }
        let next = if approve {
            let permission = t.slot_permission(&card_id, profile_index)?;
            let window = window_for(&permission);
            let spent = t.spent(&card_id, profile_index, window);
            if spent.saturating_add(amount_cents) > permission.allowance_value_cents {
                return Err(StorageError::LimitExceeded {
                    table: "allowance_usage",
                    key: card_id.as_str().to_string(),
                    remaining_cents: permission.allowance_value_cents.saturating_sub(spent),
                });
            }
            t.add_spend(&card_id, profile_index, window, amount_cents);
            ConfirmationStatus::Approved
        } else {
            ConfirmationStatus::Denied
        };
        let out = match t.confirmations.get_mut(confirmation_id) {
            Some(c) => {
                c.status = next;
                c.decided_at = Some(now);
                c.clone()
            }
            None => return Err(not_found("confirmations.confirmation_id", confirmation_id.as_str())),
        };
        t.audit(
            now,
            AuditSubjectKind::Confirmation,
            confirmation_id.as_str(),
            ConfirmationStatus::Pending.as_str(),
            next.as_str(),
            reason_code,
        );
        Ok(out)
    }

    pub fn confirmations_for_bot(&self, bot_id: &BotId) -> Vec<CheckoutConfirmation> {
        self.tables
            .lock()
            .confirmations
            .values()
            .filter(|c| &c.bot_id == bot_id)
            .cloned()
            .collect()
    }

    /// Explicit sweep for deployments that want prompt expiry. Returns how many fired.
    pub fn expiry_sweep_commit(&self, now: DateTime<Utc>) -> usize {
        let mut t = self.tables.lock();
        let confirmations: Vec<ConfirmationId> = t
            .confirmations
            .values()
            .filter(|c| c.status == ConfirmationStatus::Pending && now > c.expires_at)
            .map(|c| c.confirmation_id.clone())
            .collect();
        let checkouts: Vec<CheckoutId> = t
            .rail5_checkouts
            .values()
            .filter(|c| c.status == Rail5CheckoutStatus::Pending && now > c.expires_at)
            .map(|c| c.checkout_id.clone())
            .collect();
        for id in &confirmations {
            t.expire_confirmation(id, now);
        }
        for id in &checkouts {
            t.expire_rail5_checkout(id, now);
        }
        confirmations.len() + checkouts.len()
    }

    // ----- key-escrow rail ---------------------------------------------------------------

    pub fn rail5_card_insert_commit(
        &self,
        card: Rail5Card,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Card, StorageError> {
        card.validate()?;
        let mut t = self.tables.lock();
        if t.rail5_cards.contains_key(&card.card_id) {
            return Err(StorageError::DuplicateKey {
                table: "rail5_cards.card_id",
                key: card.card_id.as_str().to_string(),
            });
        }
        t.rail5_cards.insert(card.card_id.clone(), card.clone());
        t.audit(
            card.created_at,
            AuditSubjectKind::Rail5Card,
            card.card_id.as_str(),
            "none",
            Rail5CardStatus::PendingSetup.as_str(),
            reason_code,
        );
        Ok(card)
    }

    pub fn rail5_card_get(&self, card_id: &CardId) -> Option<Rail5Card> {
        self.tables.lock().rail5_cards.get(card_id).cloned()
    }

    pub fn rail5_card_for_bot(&self, bot_id: &BotId) -> Option<Rail5Card> {
        self.tables
            .lock()
            .rail5_cards
            .values()
            .find(|c| c.bot_id.as_ref() == Some(bot_id))
            .cloned()
    }

    /// Accepts key material exactly once (`PendingSetup -> Active`).
    pub fn rail5_key_material_commit(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        material: KeyMaterial,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Card, StorageError> {
        material.validate()?;
        let mut t = self.tables.lock();
        let card = match t.rail5_cards.get_mut(card_id) {
            Some(c) if &c.owner_id == owner_id => c,
            _ => return Err(not_found("rail5_cards.card_id", card_id.as_str())),
        };
        if card.status != Rail5CardStatus::PendingSetup {
            return Err(StorageError::StateConflict {
                table: "rail5_cards.status",
                key: card_id.as_str().to_string(),
                state: card.status.as_str(),
            });
        }
        card.key_material = Some(material);
        card.status = Rail5CardStatus::Active;
        card.activated_at = Some(now);
        let out = card.clone();
        t.audit(
            now,
            AuditSubjectKind::Rail5Card,
            card_id.as_str(),
            Rail5CardStatus::PendingSetup.as_str(),
            Rail5CardStatus::Active.as_str(),
            reason_code,
        );
        Ok(out)
    }

    pub fn rail5_link_bot_commit(
        &self,
        now: DateTime<Utc>,
        card_id: &CardId,
        owner_id: &OwnerId,
        bot_id: BotId,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Card, StorageError> {
        let mut t = self.tables.lock();
        if t
            .rail5_cards
            .values()
            .any(|c| c.bot_id.as_ref() == Some(&bot_id) && &c.card_id != card_id)
        {
            return Err(StorageError::DuplicateKey {
                table: "rail5_cards.bot_id",
                key: bot_id.as_str().to_string(),
            });
        }
        let card = match t.rail5_cards.get_mut(card_id) {
            Some(c) if &c.owner_id == owner_id => c,
            _ => return Err(not_found("rail5_cards.card_id", card_id.as_str())),
        };
        card.bot_id = Some(bot_id);
        let out = card.clone();
        t.audit(
            now,
            AuditSubjectKind::Rail5Card,
            card_id.as_str(),
            out.status.as_str(),
            "bot_linked",
            reason_code,
        );
        Ok(out)
    }

    /// Creates a checkout whose status `decide` picks from the card limits and the
    /// amounts already reserved today / this month (approved plus live pending).
    pub fn rail5_checkout_insert_commit(
        &self,
        input: Rail5CheckoutInput,
        day_start: DateTime<Utc>,
        month_start: DateTime<Utc>,
        decide: impl FnOnce(&Rail5Limits, u64, u64) -> Result<Rail5CheckoutStatus, StorageError>,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Checkout, StorageError> {
        input.validate()?;
        let mut t = self.tables.lock();
        let limits = match t.rail5_cards.get(&input.card_id) {
            Some(c) if c.bot_id.as_ref() == Some(&input.bot_id) => {
                if c.status != Rail5CardStatus::Active {
                    return Err(StorageError::StateConflict {
                        table: "rail5_cards.status",
                        key: input.card_id.as_str().to_string(),
                        state: c.status.as_str(),
                    });
                }
                c.limits
            }
            _ => return Err(not_found("rail5_cards.card_id", input.card_id.as_str())),
        };
        let today = t.rail5_reserved_since(&input.card_id, day_start, input.created_at);
        let month = t.rail5_reserved_since(&input.card_id, month_start, input.created_at);
        let status = decide(&limits, today, month)?;
        let seq = t.next_seq();
        let checkout_id = CheckoutId::new(mint_id("r5co", seq))?;
        let checkout = Rail5Checkout {
            checkout_id: checkout_id.clone(),
            card_id: input.card_id,
            bot_id: input.bot_id,
            purchase: input.purchase,
            status,
            key_delivered: false,
            created_at: input.created_at,
            expires_at: input.expires_at,
            decided_at: (status != Rail5CheckoutStatus::Pending).then_some(input.created_at),
            confirmed_at: None,
            confirmed_outcome: None,
        };
        t.rail5_checkouts
            .insert(checkout_id.clone(), checkout.clone());
        t.audit(
            checkout.created_at,
            AuditSubjectKind::Rail5Checkout,
            checkout_id.as_str(),
            "none",
            status.as_str(),
            reason_code,
        );
        Ok(checkout)
    }

    pub fn rail5_checkout_read(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
    ) -> Option<Rail5Checkout> {
        let mut t = self.tables.lock();
        t.expire_rail5_checkout(checkout_id, now);
        t.rail5_checkouts.get(checkout_id).cloned()
    }

    pub fn rail5_checkout_decide_commit(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
        owner_id: &OwnerId,
        approve: bool,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Checkout, StorageError> {
        let mut t = self.tables.lock();
        let card_id = match t.rail5_checkouts.get(checkout_id) {
            Some(c) => c.card_id.clone(),
            None => return Err(not_found("rail5_checkouts.checkout_id", checkout_id.as_str())),
        };
        match t.rail5_cards.get(&card_id) {
            Some(card) if &card.owner_id == owner_id => {}
            _ => return Err(not_found("rail5_checkouts.checkout_id", checkout_id.as_str())),
        }
        t.expire_rail5_checkout(checkout_id, now);
        let next = if approve {
            Rail5CheckoutStatus::Approved
        } else {
            Rail5CheckoutStatus::Denied
        };
        let out = {
            let checkout = t
                .rail5_checkouts
                .get_mut(checkout_id)
                .ok_or_else(|| not_found("rail5_checkouts.checkout_id", checkout_id.as_str()))?;
            match checkout.status {
                Rail5CheckoutStatus::Pending => {}
                Rail5CheckoutStatus::Expired => {
                    return Err(StorageError::Expired {
                        table: "rail5_checkouts.status",
                        key: checkout_id.as_str().to_string(),
                    })
                }
                other => {
                    return Err(StorageError::StateConflict {
                        table: "rail5_checkouts.status",
                        key: checkout_id.as_str().to_string(),
                        state: other.as_str(),
                    })
                }
            }
            checkout.status = next;
            checkout.decided_at = Some(now);
            checkout.clone()
        };
        t.audit(
            now,
            AuditSubjectKind::Rail5Checkout,
            checkout_id.as_str(),
            Rail5CheckoutStatus::Pending.as_str(),
            next.as_str(),
            reason_code,
        );
        Ok(out)
    }

    /// One-shot key release: legal only while `Approved` and not yet delivered. The flag
    /// flip and the material read happen in the same critical section.
    pub fn rail5_key_delivery_commit(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
        bot_id: &BotId,
        reason_code: ReasonCodeId,
    ) -> Result<KeyMaterial, StorageError> {
        let mut t = self.tables.lock();
        t.expire_rail5_checkout(checkout_id, now);
        let (card_id, status, delivered) = match t.rail5_checkouts.get(checkout_id) {
            Some(c) if &c.bot_id == bot_id => (c.card_id.clone(), c.status, c.key_delivered),
            _ => return Err(not_found("rail5_checkouts.checkout_id", checkout_id.as_str())),
        };
        // A relinked card no longer releases keys to checkouts of its previous bot.
        let card_bot = t.rail5_cards.get(&card_id).and_then(|c| c.bot_id.as_ref());
        if card_bot != Some(bot_id) {
            return Err(not_found("rail5_checkouts.checkout_id", checkout_id.as_str()));
        }
        if status != Rail5CheckoutStatus::Approved {
            return Err(StorageError::StateConflict {
                table: "rail5_checkouts.status",
                key: checkout_id.as_str().to_string(),
                state: status.as_str(),
            });
        }
        if delivered {
            return Err(StorageError::AlreadyConsumed {
                table: "rail5_checkouts.key_delivered",
                key: checkout_id.as_str().to_string(),
            });
        }
        let material = t
            .rail5_cards
            .get(&card_id)
            .and_then(|c| c.key_material.clone())
            .ok_or_else(|| not_found("rail5_cards.key_material", card_id.as_str()))?;
        if let Some(c) = t.rail5_checkouts.get_mut(checkout_id) {
            c.key_delivered = true;
        }
        t.audit(
            now,
            AuditSubjectKind::Rail5Checkout,
            checkout_id.as_str(),
            "key_pending",
            "key_delivered",
            reason_code,
        );
        Ok(material)
    }

    /// Undoes a key release whose delivery could not be made durable. Only a checkout
    /// that is still `Approved` with the flag set is reverted.
    pub fn rail5_key_delivery_revert_commit(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Checkout, StorageError> {
        let mut t = self.tables.lock();
        let out = {
            let checkout = t
                .rail5_checkouts
                .get_mut(checkout_id)
                .ok_or_else(|| not_found("rail5_checkouts.checkout_id", checkout_id.as_str()))?;
            if checkout.status != Rail5CheckoutStatus::Approved || !checkout.key_delivered {
                return Err(StorageError::StateConflict {
                    table: "rail5_checkouts.key_delivered",
                    key: checkout_id.as_str().to_string(),
                    state: "not_delivered",
                });
            }
            checkout.key_delivered = false;
            checkout.clone()
        };
        t.audit(
            now,
            AuditSubjectKind::Rail5Checkout,
            checkout_id.as_str(),
            "key_delivered",
            "key_pending",
            reason_code,
        );
        Ok(out)
    }

    pub fn rail5_checkout_confirm_commit(
        &self,
        now: DateTime<Utc>,
        checkout_id: &CheckoutId,
        bot_id: &BotId,
        outcome: CheckoutOutcome,
        reason_code: ReasonCodeId,
    ) -> Result<Rail5Checkout, StorageError> {
        let mut t = self.tables.lock();
        let out = {
            let checkout = match t.rail5_checkouts.get_mut(checkout_id) {
                Some(c) if &c.bot_id == bot_id => c,
                _ => return Err(not_found("rail5_checkouts.checkout_id", checkout_id.as_str())),
            };
            if checkout.status != Rail5CheckoutStatus::Approved || !checkout.key_delivered {
                return Err(StorageError::StateConflict {
                    table: "rail5_checkouts.status",
                    key: checkout_id.as_str().to_string(),
                    state: if checkout.key_delivered {
                        checkout.status.as_str()
                    } else {
                        "key_not_delivered"
                    },
                });
            }
            if checkout.confirmed_at.is_some() {
                return Err(StorageError::AlreadyConsumed {
                    table: "rail5_checkouts.confirmed_at",
                    key: checkout_id.as_str().to_string(),
                });
            }
            checkout.confirmed_at = Some(now);
            checkout.confirmed_outcome = Some(outcome);
            checkout.clone()
        };
        t.audit(
            now,
            AuditSubjectKind::Rail5Checkout,
            checkout_id.as_str(),
            "key_delivered",
            match outcome {
                CheckoutOutcome::Success => "confirmed_success",
                CheckoutOutcome::Failed => "confirmed_failed",
            },
            reason_code,
        );
        Ok(out)
    }

    // ----- audit -------------------------------------------------------------------------

    // ----- billing ---------------------------------------------------------------------

    /// Stores (or replaces) an owner's processor handles.
    pub fn owner_billing_upsert_commit(
        &self,
        record: OwnerBillingRecord,
        reason_code: ReasonCodeId,
    ) -> Result<OwnerBillingRecord, StorageError> {
        record.validate()?;
        let mut t = self.tables.lock();
        let from = if t.owner_billing.contains_key(&record.owner_id) {
            "registered"
        } else {
            "none"
        };
        t.owner_billing
            .insert(record.owner_id.clone(), record.clone());
        t.audit(
            record.registered_at,
            AuditSubjectKind::OwnerBilling,
            record.owner_id.as_str(),
            from,
            "registered",
            reason_code,
        );
        Ok(record)
    }

    pub fn owner_billing_get(&self, owner_id: &OwnerId) -> Option<OwnerBillingRecord> {
        self.tables.lock().owner_billing.get(owner_id).cloned()
    }

    /// Records a processor charge. A subject can be settled once; a second record for
    /// the same subject fails with `DuplicateKey`.
    pub fn settlement_record_commit(
        &self,
        record: SettlementRecord,
        reason_code: ReasonCodeId,
    ) -> Result<SettlementRecord, StorageError> {
        record.validate()?;
        let mut t = self.tables.lock();
        if t.settlements.contains_key(&record.subject_id) {
            return Err(StorageError::DuplicateKey {
                table: "settlements.subject_id",
                key: record.subject_id.clone(),
            });
        }
        t.settlements
            .insert(record.subject_id.clone(), record.clone());
        t.audit(
            record.settled_at,
            AuditSubjectKind::Settlement,
            &record.subject_id,
            "approved",
            "settled",
            reason_code,
        );
        Ok(record)
    }

    pub fn settlement_get(&self, subject_id: &str) -> Option<SettlementRecord> {
        self.tables.lock().settlements.get(subject_id).cloned()
    }

    pub fn audit_rows(&self) -> Vec<AuditRow> {
        self.tables.lock().audit.clone()
    }

    pub fn audit_rows_for_subject(&self, subject_id: &str) -> Vec<AuditRow> {
        self.tables
            .lock()
            .audit
            .iter()
            .filter(|r| r.subject_id == subject_id)
            .cloned()
            .collect()
    }
}
