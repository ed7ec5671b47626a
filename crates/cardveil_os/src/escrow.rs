#![forbid(unsafe_code)]

use std::sync::Arc;

use cardveil_engines::allowance::window_start;
use cardveil_engines::limits::{evaluate_rail5_spend, LimitKind, SpendDecision};
use cardveil_kernel_contracts::card::AllowanceDuration;
use cardveil_kernel_contracts::ids::{BotId, CardId, CheckoutId, OwnerId};
use cardveil_kernel_contracts::obfuscation::PurchaseSpec;
use cardveil_kernel_contracts::rail5::{
    CheckoutOutcome, KeyMaterial, Rail5Card, Rail5Checkout, Rail5CheckoutInput,
    Rail5CheckoutStatus, Rail5Limits,
};
use cardveil_storage::{CardVaultStore, StorageError};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::external::{fire_and_forget, WebhookEvent, WebhookKind, WebhookSink};

pub mod reason_codes {
    use cardveil_kernel_contracts::ReasonCodeId;

    // Key-escrow rail reason-code namespace.
    pub const ESCROW_OK_CARD_CREATED: ReasonCodeId = ReasonCodeId(0x4535_0001);
    pub const ESCROW_OK_KEY_MATERIAL: ReasonCodeId = ReasonCodeId(0x4535_0002);
    pub const ESCROW_OK_LINK_BOT: ReasonCodeId = ReasonCodeId(0x4535_0003);
    pub const ESCROW_OK_CHECKOUT_REQUESTED: ReasonCodeId = ReasonCodeId(0x4535_0004);
    pub const ESCROW_OK_OWNER_APPROVED: ReasonCodeId = ReasonCodeId(0x4535_0005);
    pub const ESCROW_OK_OWNER_DENIED: ReasonCodeId = ReasonCodeId(0x4535_0006);
    pub const ESCROW_OK_KEY_DELIVERED: ReasonCodeId = ReasonCodeId(0x4535_0007);
    pub const ESCROW_OK_CONFIRMED: ReasonCodeId = ReasonCodeId(0x4535_0008);
    pub const ESCROW_KEY_DELIVERY_REVERTED: ReasonCodeId = ReasonCodeId(0x4535_0009);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRail5Card {
    pub card_brand: String,
    pub card_last4: String,
    pub limits: Rail5Limits,
}

#[derive(Clone)]
pub struct EscrowRuntime {
    approval_ttl: Duration,
    webhooks: Arc<dyn WebhookSink>,
}

impl EscrowRuntime {
    pub fn new(approval_ttl: Duration, webhooks: Arc<dyn WebhookSink>) -> Self {
        Self {
            approval_ttl,
            webhooks,
        }
    }

    pub fn create_card(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        new_card: NewRail5Card,
        now: DateTime<Utc>,
    ) -> Result<Rail5Card, CoreError> {
        let card_id = CardId::new(format!("r5card_{:016x}", rand::thread_rng().gen::<u64>()))?;
        let card = Rail5Card::v1(
            card_id,
            owner_id.clone(),
            new_card.card_brand,
            new_card.card_last4,
            new_card.limits,
            now,
        )?;
        let card = store.rail5_card_insert_commit(card, reason_codes::ESCROW_OK_CARD_CREATED)?;
        debug!(card_id = %card.card_id, "rail5 card created");
        Ok(card)
    }

    /// Accepts the owner's encrypted key exactly once.
    pub fn submit_key_material(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        card_id: &CardId,
        material: KeyMaterial,
        now: DateTime<Utc>,
    ) -> Result<Rail5Card, CoreError> {
        let card = store
            .rail5_key_material_commit(
                now,
                card_id,
                owner_id,
                material,
                reason_codes::ESCROW_OK_KEY_MATERIAL,
            )
            .map_err(|err| match err {
                StorageError::StateConflict { .. } => CoreError::AlreadyActive,
                other => other.into(),
            })?;
        info!(card_id = %card_id, "rail5 card activated");
        fire_and_forget(
            self.webhooks.as_ref(),
            WebhookEvent {
                kind: WebhookKind::CardActivated,
                owner_id: owner_id.clone(),
                subject_id: card_id.as_str().to_string(),
                detail: card.status.as_str().to_string(),
                at: now,
            },
        );
        Ok(card)
    }

    pub fn link_bot(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        card_id: &CardId,
        bot_id: BotId,
        now: DateTime<Utc>,
    ) -> Result<Rail5Card, CoreError> {
        Ok(store.rail5_link_bot_commit(
            now,
            card_id,
            owner_id,
            bot_id,
            reason_codes::ESCROW_OK_LINK_BOT,
        )?)
    }

    /// Checks the per-transaction ceiling and the UTC day / month totals, then either
    /// approves outright or parks the checkout for the owner.
    pub fn request_checkout(
        &self,
        store: &CardVaultStore,
        bot_id: &BotId,
        purchase: PurchaseSpec,
        now: DateTime<Utc>,
    ) -> Result<Rail5Checkout, CoreError> {
        let card = store.rail5_card_for_bot(bot_id).ok_or(CoreError::NotFound)?;
        let amount_cents = purchase.amount_cents;
        let mut rejected: Option<(LimitKind, u64)> = None;
        let inserted = store.rail5_checkout_insert_commit(
            Rail5CheckoutInput {
                card_id: card.card_id.clone(),
                bot_id: bot_id.clone(),
                purchase,
                created_at: now,
                expires_at: now + self.approval_ttl,
            },
            window_start(AllowanceDuration::Day, now),
            window_start(AllowanceDuration::Month, now),
            |limits, today, month| {
                match evaluate_rail5_spend(limits, today, month, amount_cents) {
                    SpendDecision::AutoApprove => Ok(Rail5CheckoutStatus::Approved),
                    SpendDecision::RequireHuman => Ok(Rail5CheckoutStatus::Pending),
                    SpendDecision::Reject(kind) => {
                        let remaining = match kind {
                            LimitKind::Daily => limits.daily_limit_cents.saturating_sub(today),
                            LimitKind::Monthly => {
                                limits.monthly_limit_cents.saturating_sub(month)
                            }
                            LimitKind::PerTransaction | LimitKind::Allowance => {
                                limits.spending_limit_cents
                            }
                        };
                        rejected = Some((kind, remaining));
                        Err(StorageError::LimitExceeded {
                            table: "rail5_checkouts",
                            key: card.card_id.as_str().to_string(),
                            remaining_cents: remaining,
                        })
                    }
                }
            },
            reason_codes::ESCROW_OK_CHECKOUT_REQUESTED,
        );
        let checkout = inserted.map_err(|err| match rejected {
            Some((limit, remaining_cents)) => CoreError::LimitExceeded {
                limit,
                remaining_cents,
            },
            None => err.into(),
        })?;
        debug!(
            checkout_id = %checkout.checkout_id,
            status = checkout.status.as_str(),
            "rail5 checkout requested"
        );
        if checkout.status == Rail5CheckoutStatus::Pending {
            self.notify(WebhookKind::CheckoutPending, &card.owner_id, &checkout, now);
        }
        Ok(checkout)
    }

    pub fn decide(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        checkout_id: &CheckoutId,
        approve: bool,
        now: DateTime<Utc>,
    ) -> Result<Rail5Checkout, CoreError> {
        let reason = if approve {
            reason_codes::ESCROW_OK_OWNER_APPROVED
        } else {
            reason_codes::ESCROW_OK_OWNER_DENIED
        };
        let checkout =
            store.rail5_checkout_decide_commit(now, checkout_id, owner_id, approve, reason)?;
        info!(
            checkout_id = %checkout_id,
            status = checkout.status.as_str(),
            "rail5 checkout decided"
        );
        self.notify(WebhookKind::CheckoutDecided, owner_id, &checkout, now);
        Ok(checkout)
    }

    pub fn status(
        &self,
        store: &CardVaultStore,
        bot_id: &BotId,
        checkout_id: &CheckoutId,
        now: DateTime<Utc>,
    ) -> Result<Rail5Checkout, CoreError> {
        let checkout = store
            .rail5_checkout_read(now, checkout_id)
            .ok_or(CoreError::NotFound)?;
        if &checkout.bot_id != bot_id {
            return Err(CoreError::Forbidden);
        }
        Ok(checkout)
    }

    /// Single release of the decryption key for an approved checkout.
    pub fn deliver_key(
        &self,
        store: &CardVaultStore,
        bot_id: &BotId,
        checkout_id: &CheckoutId,
        now: DateTime<Utc>,
    ) -> Result<KeyMaterial, CoreError> {
        self.deliver_key_durably(store, bot_id, checkout_id, now, || Ok(()))
    }

    /// Releases the key only once `persist` has made the delivered flag durable. When
    /// `persist` fails the flag is reverted and the material is withheld, so the bot
    /// may retry.
    pub fn deliver_key_durably(
        &self,
        store: &CardVaultStore,
        bot_id: &BotId,
        checkout_id: &CheckoutId,
        now: DateTime<Utc>,
        persist: impl FnOnce() -> Result<(), String>,
    ) -> Result<KeyMaterial, CoreError> {
        let material = store
            .rail5_key_delivery_commit(now, checkout_id, bot_id, reason_codes::ESCROW_OK_KEY_DELIVERED)
            .map_err(|err| match err {
                StorageError::StateConflict { .. } => CoreError::CheckoutNotApproved,
                StorageError::AlreadyConsumed { .. } => {
                    warn!(checkout_id = %checkout_id, "repeat key delivery refused");
                    CoreError::KeyAlreadyDelivered
                }
                other => other.into(),
            })?;
        if let Err(detail) = persist() {
            warn!(checkout_id = %checkout_id, error = %detail, "key delivery not durable, reverting");
            if let Err(err) = store.rail5_key_delivery_revert_commit(
                now,
                checkout_id,
                reason_codes::ESCROW_KEY_DELIVERY_REVERTED,
            ) {
                warn!(checkout_id = %checkout_id, error = %err, "key delivery revert failed");
            }
            return Err(CoreError::Internal(format!("persist key delivery: {detail}")));
        }
        info!(checkout_id = %checkout_id, bot_id = %bot_id, "rail5 key delivered");
        if let Some(card) = store.rail5_card_for_bot(bot_id) {
            fire_and_forget(
                self.webhooks.as_ref(),
                WebhookEvent {
                    kind: WebhookKind::KeyDelivered,
                    owner_id: card.owner_id,
                    subject_id: checkout_id.as_str().to_string(),
                    detail: "key_delivered".to_string(),
                    at: now,
                },
            );
        }
        Ok(material)
    }

    /// Records the bot-reported outcome once, after the key went out.
    pub fn confirm(
        &self,
        store: &CardVaultStore,
        bot_id: &BotId,
        checkout_id: &CheckoutId,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<Rail5Checkout, CoreError> {
        let outcome = if success {
            CheckoutOutcome::Success
        } else {
            CheckoutOutcome::Failed
        };
        let checkout = store.rail5_checkout_confirm_commit(
            now,
            checkout_id,
            bot_id,
            outcome,
            reason_codes::ESCROW_OK_CONFIRMED,
        )?;
        debug!(checkout_id = %checkout_id, success, "rail5 checkout confirmed");
        Ok(checkout)
    }

    fn notify(
        &self,
        kind: WebhookKind,
        owner_id: &OwnerId,
        checkout: &Rail5Checkout,
        now: DateTime<Utc>,
    ) {
        fire_and_forget(
            self.webhooks.as_ref(),
            WebhookEvent {
                kind,
                owner_id: owner_id.clone(),
                subject_id: checkout.checkout_id.as_str().to_string(),
                detail: checkout.status.as_str().to_string(),
                at: now,
            },
        );
    }
}
