#![forbid(unsafe_code)]

use std::sync::Arc;

use cardveil_engines::allowance::{remaining_cents, window_start};
use cardveil_engines::fragment_seal::FragmentSealer;
use cardveil_engines::limits::{evaluate_profile_spend, SpendDecision};
use cardveil_kernel_contracts::card::{ProfileIndex, ReleasedCardData};
use cardveil_kernel_contracts::confirmation::{
    CheckoutConfirmation, ConfirmationInput, ConfirmationStatus,
};
use cardveil_kernel_contracts::ids::{BotId, CardId, ConfirmationId, OwnerId};
use cardveil_kernel_contracts::obfuscation::PurchaseSpec;
use cardveil_storage::{CardVaultStore, StorageError};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::custody::bot_card;
use crate::error::CoreError;
use crate::external::{fire_and_forget, WebhookEvent, WebhookKind, WebhookSink};

pub mod reason_codes {
    use cardveil_kernel_contracts::ReasonCodeId;

    pub const CONFIRM_OK_REQUESTED: ReasonCodeId = ReasonCodeId(0x4346_0001);
    pub const CONFIRM_OK_OWNER_APPROVED: ReasonCodeId = ReasonCodeId(0x4346_0002);
    pub const CONFIRM_OK_OWNER_DENIED: ReasonCodeId = ReasonCodeId(0x4346_0003);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub card_id: CardId,
    pub profile_index: ProfileIndex,
    pub purchase: PurchaseSpec,
}

/// Bot view of a confirmation. Card data is present only while `Approved`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationView {
    pub confirmation: CheckoutConfirmation,
    pub card_data: Option<ReleasedCardData>,
}

#[derive(Clone)]
pub struct ConfirmationRuntime {
    ttl: Duration,
    sealer: Arc<FragmentSealer>,
    webhooks: Arc<dyn WebhookSink>,
}

impl ConfirmationRuntime {
    pub fn new(ttl: Duration, sealer: Arc<FragmentSealer>, webhooks: Arc<dyn WebhookSink>) -> Self {
        Self {
            ttl,
            sealer,
            webhooks,
        }
    }

    /// Opens a checkout on one profile. Within the allowance the profile policy picks
    /// between immediate approval (spend booked in the same unit) and a pending
    /// owner decision.
    pub fn request_checkout(
        &self,
        store: &CardVaultStore,
        bot_id: &BotId,
        request: CheckoutRequest,
        now: DateTime<Utc>,
    ) -> Result<CheckoutConfirmation, CoreError> {
        let card = bot_card(store, bot_id, &request.card_id)?;
        let amount_cents = request.purchase.amount_cents;
        let confirmation = store.confirmation_insert_commit(
            ConfirmationInput {
                card_id: request.card_id,
                bot_id: bot_id.clone(),
                profile_index: request.profile_index,
                purchase: request.purchase,
                created_at: now,
                expires_at: now + self.ttl,
            },
            |p| window_start(p.allowance_duration, now),
            |permission, spent| {
                let remaining = remaining_cents(permission.allowance_value_cents, spent);
                match evaluate_profile_spend(permission, remaining, amount_cents) {
                    SpendDecision::AutoApprove => Ok(ConfirmationStatus::Approved),
                    SpendDecision::RequireHuman => Ok(ConfirmationStatus::Pending),
                    // The only profile-rail rejection is the allowance.
                    SpendDecision::Reject(_) => Err(StorageError::LimitExceeded {
                        table: "allowance_usage",
                        key: card.card_id.as_str().to_string(),
                        remaining_cents: remaining,
                    }),
                }
            },
            reason_codes::CONFIRM_OK_REQUESTED,
        )?;
        debug!(
            confirmation_id = %confirmation.confirmation_id,
            status = confirmation.status.as_str(),
            "checkout requested"
        );
        if confirmation.status == ConfirmationStatus::Pending {
            self.notify(WebhookKind::CheckoutPending, &card.owner_id, &confirmation, now);
        }
        Ok(confirmation)
    }

    pub fn decide(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        confirmation_id: &ConfirmationId,
        approve: bool,
        now: DateTime<Utc>,
    ) -> Result<CheckoutConfirmation, CoreError> {
        let reason = if approve {
            reason_codes::CONFIRM_OK_OWNER_APPROVED
        } else {
            reason_codes::CONFIRM_OK_OWNER_DENIED
        };
        let confirmation = store.confirmation_decide_commit(
            now,
            confirmation_id,
            owner_id,
            approve,
            |p| window_start(p.allowance_duration, now),
            reason,
        )?;
        info!(
            confirmation_id = %confirmation_id,
            status = confirmation.status.as_str(),
            "checkout decided"
        );
        self.notify(WebhookKind::CheckoutDecided, owner_id, &confirmation, now);
        Ok(confirmation)
    }

    pub fn status(
        &self,
        store: &CardVaultStore,
        bot_id: &BotId,
        confirmation_id: &ConfirmationId,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationView, CoreError> {
        let confirmation = store
            .confirmation_read(now, confirmation_id)
            .ok_or(CoreError::NotFound)?;
        if &confirmation.bot_id != bot_id {
            return Err(CoreError::Forbidden);
        }
        let card_data = if confirmation.status == ConfirmationStatus::Approved {
            Some(self.release(store, &confirmation)?)
        } else {
            None
        };
        Ok(ConfirmationView {
            confirmation,
            card_data,
        })
    }

    /// Expires every overdue pending confirmation and rail-5 checkout.
    pub fn sweep_expired(&self, store: &CardVaultStore, now: DateTime<Utc>) -> usize {
        let expired = store.expiry_sweep_commit(now);
        if expired > 0 {
            debug!(expired, "expiry sweep");
        }
        expired
    }

    fn release(
        &self,
        store: &CardVaultStore,
        confirmation: &CheckoutConfirmation,
    ) -> Result<ReleasedCardData, CoreError> {
        let slot = store
            .split_card_profile_slot(&confirmation.card_id, confirmation.profile_index)
            .ok_or(CoreError::NotFound)?;
        let (Some(sealed), Some(holder_name), Some(holder_zip)) =
            (slot.sealed_secret, slot.holder_name, slot.holder_zip)
        else {
            return Err(CoreError::invalid_state("profile data incomplete"));
        };
        let (missing_digits, expiry) = self.sealer.open(&sealed)?;
        Ok(ReleasedCardData {
            profile_index: slot.profile_index,
            missing_digits,
            expiry,
            holder_name,
            holder_zip,
        })
    }

    fn notify(
        &self,
        kind: WebhookKind,
        owner_id: &OwnerId,
        confirmation: &CheckoutConfirmation,
        now: DateTime<Utc>,
    ) {
        fire_and_forget(
            self.webhooks.as_ref(),
            WebhookEvent {
                kind,
                owner_id: owner_id.clone(),
                subject_id: confirmation.confirmation_id.as_str().to_string(),
                detail: confirmation.status.as_str().to_string(),
                at: now,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowance::AllowanceLedger;
    use crate::config::CardVaultConfig;
    use crate::custody::{CustodyRuntime, OwnerDataInput};
    use crate::external::test_support::RecordingWebhookSink;
    use crate::purchase::purchase_spec;
    use cardveil_engines::limits::LimitKind;
    use cardveil_kernel_contracts::card::{HumanPermissionPolicy, ProfilePermissionPatch};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    struct Fixture {
        store: CardVaultStore,
        custody: CustodyRuntime,
        rt: ConfirmationRuntime,
        sink: Arc<RecordingWebhookSink>,
        owner: OwnerId,
        bot: BotId,
        card_id: CardId,
        real: ProfileIndex,
    }

    fn fixture() -> Fixture {
        let sealer = Arc::new(FragmentSealer::generate());
        let sink = Arc::new(RecordingWebhookSink::default());
        let config = CardVaultConfig::mvp_v1();
        let custody = CustodyRuntime::new(&config, sealer.clone(), sink.clone()).unwrap();
        let store = CardVaultStore::new_in_memory();
        let owner = OwnerId::new("owner_conf").unwrap();
        let bot = BotId::new("bot_conf").unwrap();
        let out = custody
            .initialize(&store, &owner, Some(bot.clone()), now())
            .unwrap();
        custody
            .submit_owner_data(
                &store,
                &owner,
                &out.card_id,
                OwnerDataInput {
                    missing_digits: "482".to_string(),
                    expiry_month: 9,
                    expiry_year: 2027,
                    owner_name: "Dana Ortiz".to_string(),
                    owner_zip: "94107".to_string(),
                },
                now(),
            )
            .unwrap();
        Fixture {
            store,
            custody,
            rt: ConfirmationRuntime::new(config.confirmation_ttl, sealer, sink.clone()),
            sink,
            owner,
            bot,
            card_id: out.card_id,
            real: out.real_profile_index,
        }
    }

    fn set_policy(f: &Fixture, allowance: u64, policy: HumanPermissionPolicy, exempt: u64) {
        f.custody
            .update_permission(
                &f.store,
                &f.owner,
                &f.card_id,
                f.real,
                &ProfilePermissionPatch {
                    allowance_value_cents: Some(allowance),
                    confirmation_exempt_limit_cents: Some(exempt),
                    human_permission_required: Some(policy),
                    ..ProfilePermissionPatch::default()
                },
                now(),
            )
            .unwrap();
    }

    fn request(f: &Fixture, amount: u64) -> CheckoutRequest {
        CheckoutRequest {
            card_id: f.card_id.clone(),
            profile_index: f.real,
            purchase: purchase_spec("Corner Books", "https://books.example", "Atlas", amount)
                .unwrap(),
        }
    }

    #[test]
    fn at_confirm_01_auto_approval_books_spend_and_releases_card_data() {
        let f = fixture();
        set_policy(&f, 10_000, HumanPermissionPolicy::None, 0);
        let c = f
            .rt
            .request_checkout(&f.store, &f.bot, request(&f, 2_500), now())
            .unwrap();
        assert_eq!(c.status, ConfirmationStatus::Approved);
        let snap = AllowanceLedger
            .remaining(&f.store, &f.card_id, f.real, now())
            .unwrap();
        assert_eq!(snap.spent_cents, 2_500);
        let view = f
            .rt
            .status(&f.store, &f.bot, &c.confirmation_id, now())
            .unwrap();
        let data = view.card_data.unwrap();
        assert_eq!(data.missing_digits.as_str(), "482");
        assert_eq!(data.holder_zip, "94107");
    }

    #[test]
    fn at_confirm_02_pending_then_owner_approves_once() {
        let f = fixture();
        set_policy(&f, 10_000, HumanPermissionPolicy::All, 0);
        let c = f
            .rt
            .request_checkout(&f.store, &f.bot, request(&f, 2_000), now())
            .unwrap();
        assert_eq!(c.status, ConfirmationStatus::Pending);
        assert_eq!(c.expires_at, now() + Duration::minutes(15));
        let pending = f
            .rt
            .status(&f.store, &f.bot, &c.confirmation_id, now())
            .unwrap();
        assert!(pending.card_data.is_none());

        let later = now() + Duration::minutes(2);
        let decided = f
            .rt
            .decide(&f.store, &f.owner, &c.confirmation_id, true, later)
            .unwrap();
        assert_eq!(decided.status, ConfirmationStatus::Approved);
        assert!(matches!(
            f.rt.decide(&f.store, &f.owner, &c.confirmation_id, false, later),
            Err(CoreError::InvalidState { .. })
        ));
        let kinds: Vec<_> = f.sink.events.lock().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&WebhookKind::CheckoutPending));
        assert!(kinds.contains(&WebhookKind::CheckoutDecided));
    }

    #[test]
    fn at_confirm_03_over_allowance_is_rejected_with_remaining() {
        let f = fixture();
        set_policy(&f, 1_000, HumanPermissionPolicy::None, 0);
        assert_eq!(
            f.rt.request_checkout(&f.store, &f.bot, request(&f, 1_001), now()),
            Err(CoreError::LimitExceeded {
                limit: LimitKind::Allowance,
                remaining_cents: 1_000
            })
        );
    }

    #[test]
    fn at_confirm_04_expired_confirmation_cannot_be_decided_and_hides_from_other_bots() {
        let f = fixture();
        set_policy(&f, 10_000, HumanPermissionPolicy::All, 0);
        let c = f
            .rt
            .request_checkout(&f.store, &f.bot, request(&f, 500), now())
            .unwrap();
        let stranger = BotId::new("bot_stranger").unwrap();
        assert_eq!(
            f.rt.status(&f.store, &stranger, &c.confirmation_id, now()),
            Err(CoreError::Forbidden)
        );
        let late = now() + Duration::minutes(16);
        assert_eq!(
            f.rt.decide(&f.store, &f.owner, &c.confirmation_id, true, late),
            Err(CoreError::Expired)
        );
        let view = f
            .rt
            .status(&f.store, &f.bot, &c.confirmation_id, late)
            .unwrap();
        assert_eq!(view.confirmation.status, ConfirmationStatus::Expired);
        assert!(view.card_data.is_none());
    }

    #[test]
    fn at_confirm_05_sweep_expires_overdue_pending_rows() {
        let f = fixture();
        set_policy(&f, 10_000, HumanPermissionPolicy::All, 0);
        f.rt.request_checkout(&f.store, &f.bot, request(&f, 500), now())
            .unwrap();
        assert_eq!(f.rt.sweep_expired(&f.store, now()), 0);
        assert_eq!(f.rt.sweep_expired(&f.store, now() + Duration::hours(1)), 1);
    }
}
