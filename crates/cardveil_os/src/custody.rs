#![forbid(unsafe_code)]

use std::sync::Arc;

use cardveil_engines::custody::CustodyGenerator;
use cardveil_engines::fragment_seal::FragmentSealer;
use cardveil_kernel_contracts::card::{
    CardExpiry, DigitFragment, MissingDigitPositions, OwnerCardData, ProfileIndex,
    ProfilePermission, ProfilePermissionPatch, ProfileSlot, SplitCardRecord, SplitCardStatus,
};
use cardveil_kernel_contracts::ids::{BotId, CardId, OwnerId};
use cardveil_kernel_contracts::ContractViolation;
use cardveil_storage::{CardVaultStore, StorageError};
use chrono::{DateTime, Datelike, Utc};
use rand::Rng;
use tracing::{debug, info};

use crate::config::CardVaultConfig;
use crate::error::CoreError;
use crate::external::{fire_and_forget, WebhookEvent, WebhookKind, WebhookSink};

pub mod reason_codes {
    use cardveil_kernel_contracts::ReasonCodeId;

    // Custody reason-code namespace.
    pub const CUSTODY_OK_INITIALIZE: ReasonCodeId = ReasonCodeId(0x4300_0001);
    pub const CUSTODY_OK_OWNER_DATA: ReasonCodeId = ReasonCodeId(0x4300_0002);
    pub const CUSTODY_OK_LINK_BOT: ReasonCodeId = ReasonCodeId(0x4300_0003);
    pub const CUSTODY_OK_FREEZE: ReasonCodeId = ReasonCodeId(0x4300_0004);
    pub const CUSTODY_OK_UNFREEZE: ReasonCodeId = ReasonCodeId(0x4300_0005);
    pub const CUSTODY_OK_PERMISSION_UPDATE: ReasonCodeId = ReasonCodeId(0x4300_0006);
    pub const CUSTODY_OK_DELETE: ReasonCodeId = ReasonCodeId(0x4300_0007);
}

/// Everything the owner needs to complete the card off-platform. Returned once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeOutcome {
    pub card_id: CardId,
    pub artifact_text: String,
    pub artifact_digest: String,
    pub missing_digit_positions: MissingDigitPositions,
    pub real_profile_index: ProfileIndex,
    pub profile_count: u8,
}

/// Raw owner input; validated into [`OwnerCardData`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerDataInput {
    pub missing_digits: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
    pub owner_name: String,
    pub owner_zip: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardPermissions {
    pub card_id: CardId,
    pub real_profile_index: ProfileIndex,
    pub profiles: Vec<(ProfileIndex, ProfilePermission)>,
}

#[derive(Clone)]
pub struct CustodyRuntime {
    generator: CustodyGenerator,
    sealer: Arc<FragmentSealer>,
    webhooks: Arc<dyn WebhookSink>,
    max_cards_per_bot: usize,
    expiry_year_horizon: u16,
}

impl CustodyRuntime {
    pub fn new(
        config: &CardVaultConfig,
        sealer: Arc<FragmentSealer>,
        webhooks: Arc<dyn WebhookSink>,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            generator: CustodyGenerator::new(config.custody_config())?,
            sealer,
            webhooks,
            max_cards_per_bot: config.max_cards_per_bot,
            expiry_year_horizon: config.expiry_year_horizon,
        })
    }

    /// Generates a fresh card with its synthetic population and decoy artifact.
    ///
    /// A pending card for the same `(owner, bot)` is replaced; an already completed one
    /// yields `AlreadyActive`. The real profile's digits are never known here.
    pub fn initialize(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        bot_id: Option<BotId>,
        now: DateTime<Utc>,
    ) -> Result<InitializeOutcome, CoreError> {
        let mut rng = rand::thread_rng();
        let generated = self.generator.generate(&mut rng, now)?;
        let card_id = CardId::new(format!("card_{:016x}", rng.gen::<u64>()))?;
        let profile_count = self.generator.config().profile_count;

        let record = SplitCardRecord::v1(
            card_id.clone(),
            owner_id.clone(),
            bot_id,
            profile_count,
            generated.real_profile_index,
            generated.missing_digit_positions,
            generated.artifact.digest_hex.clone(),
            now,
        )?;

        let mut slots = Vec::with_capacity(usize::from(profile_count));
        for (profile_index, permission) in generated.permissions {
            let fake = generated
                .fake_profiles
                .iter()
                .find(|f| f.profile_index == profile_index);
            let slot = match fake {
                Some(fake) => ProfileSlot {
                    card_id: card_id.clone(),
                    profile_index,
                    holder_name: Some(fake.holder_name.clone()),
                    holder_zip: Some(fake.holder_zip.clone()),
                    sealed_secret: Some(self.sealer.seal(
                        &fake
                            .card_number
                            .fragment_at(&generated.missing_digit_positions),
                        fake.expiry,
                    )?),
                    permission,
                },
                None => ProfileSlot {
                    card_id: card_id.clone(),
                    profile_index,
                    holder_name: None,
                    holder_zip: None,
                    sealed_secret: None,
                    permission,
                },
            };
            slots.push(slot);
        }

        let out = store
            .split_card_initialize_commit(
                record,
                slots,
                self.max_cards_per_bot,
                reason_codes::CUSTODY_OK_INITIALIZE,
            )
            .map_err(|err| match err {
                StorageError::StateConflict { .. } => CoreError::AlreadyActive,
                other => other.into(),
            })?;
        info!(
            card_id = %card_id,
            owner_id = %owner_id,
            profile_count,
            replaced_pending = out.replaced_pending.len(),
            "split card initialized"
        );
        Ok(InitializeOutcome {
            card_id,
            artifact_text: generated.artifact.text,
            artifact_digest: generated.artifact.digest_hex,
            missing_digit_positions: generated.missing_digit_positions,
            real_profile_index: generated.real_profile_index,
            profile_count,
        })
    }

    /// The owner's card still awaiting owner data for `bot_id`.
    pub fn resolve_pending_card(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        bot_id: &BotId,
    ) -> Result<CardId, CoreError> {
        store
            .split_cards_for_bot(bot_id)
            .into_iter()
            .find(|c| &c.owner_id == owner_id && c.status == SplitCardStatus::PendingSetup)
            .map(|c| c.card_id)
            .ok_or(CoreError::NotFound)
    }

    pub fn submit_owner_data(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        card_id: &CardId,
        input: OwnerDataInput,
        now: DateTime<Utc>,
    ) -> Result<SplitCardRecord, CoreError> {
        let data = self.validate_owner_data(input, now)?;
        let sealed = self.sealer.seal(&data.missing_digits, data.expiry)?;
        let record = store
            .split_card_owner_data_commit(
                now,
                card_id,
                owner_id,
                sealed,
                data.owner_name,
                data.owner_zip,
                reason_codes::CUSTODY_OK_OWNER_DATA,
            )
            .map_err(|err| match err {
                StorageError::StateConflict { .. } => CoreError::AlreadyActive,
                other => other.into(),
            })?;
        info!(card_id = %card_id, status = record.status.as_str(), "owner data accepted");
        if record.status == SplitCardStatus::Active {
            self.notify_activated(&record, now);
        }
        Ok(record)
    }

    fn validate_owner_data(
        &self,
        input: OwnerDataInput,
        now: DateTime<Utc>,
    ) -> Result<OwnerCardData, CoreError> {
        let missing_digits = DigitFragment::new(input.missing_digits)?;
        let expiry = CardExpiry::v1(input.expiry_month, input.expiry_year)?;
        let current = now.year().clamp(0, i32::from(u16::MAX)) as u16;
        let latest = current.saturating_add(self.expiry_year_horizon);
        if !(current..=latest).contains(&expiry.year) {
            return Err(CoreError::Validation(ContractViolation::InvalidRange {
                field: "owner_card_data.expiry_year",
                min: i64::from(current),
                max: i64::from(latest),
                got: i64::from(expiry.year),
            }));
        }
        Ok(OwnerCardData::v1(
            missing_digits,
            expiry,
            input.owner_name,
            input.owner_zip,
        )?)
    }

    pub fn link_bot(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        card_id: &CardId,
        bot_id: BotId,
        now: DateTime<Utc>,
    ) -> Result<SplitCardRecord, CoreError> {
        let record = store.split_card_link_bot_commit(
            now,
            card_id,
            owner_id,
            bot_id,
            self.max_cards_per_bot,
            reason_codes::CUSTODY_OK_LINK_BOT,
        )?;
        info!(card_id = %card_id, "split card linked to bot");
        self.notify_activated(&record, now);
        Ok(record)
    }

    pub fn freeze(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        card_id: &CardId,
        frozen: bool,
        now: DateTime<Utc>,
    ) -> Result<SplitCardRecord, CoreError> {
        let reason = if frozen {
            reason_codes::CUSTODY_OK_FREEZE
        } else {
            reason_codes::CUSTODY_OK_UNFREEZE
        };
        let record = store.split_card_freeze_commit(now, card_id, owner_id, frozen, reason)?;
        debug!(card_id = %card_id, status = record.status.as_str(), "freeze toggled");
        Ok(record)
    }

    pub fn permissions(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        card_id: &CardId,
    ) -> Result<CardPermissions, CoreError> {
        let record = owned_card(store, owner_id, card_id)?;
        let profiles = store
            .split_card_profile_slots(card_id)
            .into_iter()
            .map(|slot| (slot.profile_index, slot.permission))
            .collect();
        Ok(CardPermissions {
            card_id: record.card_id,
            real_profile_index: record.real_profile_index,
            profiles,
        })
    }

    pub fn update_permission(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        card_id: &CardId,
        profile_index: ProfileIndex,
        patch: &ProfilePermissionPatch,
        now: DateTime<Utc>,
    ) -> Result<ProfilePermission, CoreError> {
        if patch.is_empty() {
            return Err(CoreError::invalid_state("empty permission patch"));
        }
        let permission = store.split_card_permission_update_commit(
            now,
            card_id,
            owner_id,
            profile_index,
            patch,
            reason_codes::CUSTODY_OK_PERMISSION_UPDATE,
        )?;
        debug!(card_id = %card_id, "permission updated");
        Ok(permission)
    }

    pub fn delete_card(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        card_id: &CardId,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        store.split_card_delete_commit(now, card_id, owner_id, reason_codes::CUSTODY_OK_DELETE)?;
        info!(card_id = %card_id, "split card deleted");
        Ok(())
    }

    fn notify_activated(&self, record: &SplitCardRecord, now: DateTime<Utc>) {
        fire_and_forget(
            self.webhooks.as_ref(),
            WebhookEvent {
                kind: WebhookKind::CardActivated,
                owner_id: record.owner_id.clone(),
                subject_id: record.card_id.as_str().to_string(),
                detail: record.status.as_str().to_string(),
                at: now,
            },
        );
    }
}

pub(crate) fn owned_card(
    store: &CardVaultStore,
    owner_id: &OwnerId,
    card_id: &CardId,
) -> Result<SplitCardRecord, CoreError> {
    match store.split_card_get(card_id) {
        Some(card) if &card.owner_id == owner_id => Ok(card),
        _ => Err(CoreError::NotFound),
    }
}

/// The card as seen by its bot; foreign or unbound cards are indistinguishable from
/// missing ones.
pub(crate) fn bot_card(
    store: &CardVaultStore,
    bot_id: &BotId,
    card_id: &CardId,
) -> Result<SplitCardRecord, CoreError> {
    match store.split_card_get(card_id) {
        Some(card) if card.bot_id.as_ref() == Some(bot_id) => Ok(card),
        _ => Err(CoreError::NotFound),
    }
}
