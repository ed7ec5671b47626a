#![forbid(unsafe_code)]

use std::sync::Arc;

use cardveil_kernel_contracts::billing::{OwnerBillingRecord, SettlementRail, SettlementRecord};
use cardveil_kernel_contracts::card::CurrencyCode;
use cardveil_kernel_contracts::confirmation::{CheckoutConfirmation, ConfirmationStatus};
use cardveil_kernel_contracts::ids::OwnerId;
use cardveil_kernel_contracts::rail5::{Rail5Checkout, Rail5CheckoutStatus};
use cardveil_storage::CardVaultStore;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::external::{CustomerRef, OwnerIdentity, PaymentMethodRef, PaymentProcessor};

pub mod reason_codes {
    use cardveil_kernel_contracts::ReasonCodeId;

    // Billing reason-code namespace.
    pub const BILLING_OK_REGISTERED: ReasonCodeId = ReasonCodeId(0x4249_0001);
    pub const BILLING_OK_SETTLED: ReasonCodeId = ReasonCodeId(0x4249_0002);
}

/// Owner payment registration and the one charge per approved real purchase.
#[derive(Clone)]
pub struct BillingRuntime {
    payments: Arc<dyn PaymentProcessor>,
}

impl BillingRuntime {
    pub fn new(payments: Arc<dyn PaymentProcessor>) -> Self {
        Self { payments }
    }

    /// Creates the processor customer, attaches the payment method and stores both
    /// handles. A second registration replaces the previous handles.
    pub fn register(
        &self,
        store: &CardVaultStore,
        owner: &OwnerIdentity,
        payment_method_token: &str,
        now: DateTime<Utc>,
    ) -> Result<OwnerBillingRecord, CoreError> {
        let customer = self.payments.create_customer(owner)?;
        let method = self
            .payments
            .attach_payment_method(&customer, payment_method_token)?;
        let record = OwnerBillingRecord::v1(owner.owner_id.clone(), customer.0, method.0, now)?;
        let record =
            store.owner_billing_upsert_commit(record, reason_codes::BILLING_OK_REGISTERED)?;
        info!(owner_id = %owner.owner_id, "owner billing registered");
        Ok(record)
    }

    pub fn registration(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
    ) -> Option<OwnerBillingRecord> {
        store.owner_billing_get(owner_id)
    }

    /// Settles an approved split-card confirmation. Synthetic profiles never move
    /// money, so only a confirmation on the card's real profile is charged.
    pub fn settle_confirmation(
        &self,
        store: &CardVaultStore,
        confirmation: &CheckoutConfirmation,
        now: DateTime<Utc>,
    ) -> Option<SettlementRecord> {
        if confirmation.status != ConfirmationStatus::Approved {
            return None;
        }
        let card = store.split_card_get(&confirmation.card_id)?;
        if card.real_profile_index != confirmation.profile_index {
            return None;
        }
        let currency = store
            .split_card_profile_slot(&confirmation.card_id, confirmation.profile_index)
            .map_or_else(CurrencyCode::usd, |s| s.permission.allowance_currency);
        self.settle(
            store,
            Charge {
                subject_id: confirmation.confirmation_id.as_str(),
                rail: SettlementRail::SplitCard,
                owner_id: &card.owner_id,
                amount_cents: confirmation.purchase.amount_cents,
                currency,
            },
            now,
        )
    }

    pub fn settle_rail5_checkout(
        &self,
        store: &CardVaultStore,
        checkout: &Rail5Checkout,
        now: DateTime<Utc>,
    ) -> Option<SettlementRecord> {
        if checkout.status != Rail5CheckoutStatus::Approved {
            return None;
        }
        let card = store.rail5_card_get(&checkout.card_id)?;
        self.settle(
            store,
            Charge {
                subject_id: checkout.checkout_id.as_str(),
                rail: SettlementRail::Rail5,
                owner_id: &card.owner_id,
                amount_cents: checkout.purchase.amount_cents,
                currency: CurrencyCode::usd(),
            },
            now,
        )
    }

    pub fn settlement(&self, store: &CardVaultStore, subject_id: &str) -> Option<SettlementRecord> {
        store.settlement_get(subject_id)
    }

    // A failed charge leaves the approval in place and is logged; no settlement row is
    // written so a later attempt can still record one.
    fn settle(
        &self,
        store: &CardVaultStore,
        charge: Charge<'_>,
        now: DateTime<Utc>,
    ) -> Option<SettlementRecord> {
        if store.settlement_get(charge.subject_id).is_some() {
            return None;
        }
        let Some(billing) = store.owner_billing_get(charge.owner_id) else {
            debug!(
                subject_id = charge.subject_id,
                owner_id = %charge.owner_id,
                "no billing registration, settlement skipped"
            );
            return None;
        };
        let charged = self.payments.charge(
            &CustomerRef(billing.customer_ref),
            &PaymentMethodRef(billing.payment_method_ref),
            charge.amount_cents,
            &charge.currency,
        );
        let charge_ref = match charged {
            Ok(r) => r,
            Err(err) => {
                warn!(subject_id = charge.subject_id, error = %err, "settlement charge failed");
                return None;
            }
        };
        let record = SettlementRecord {
            subject_id: charge.subject_id.to_string(),
            rail: charge.rail,
            owner_id: charge.owner_id.clone(),
            amount_cents: charge.amount_cents,
            currency: charge.currency,
            charge_ref: charge_ref.0,
            settled_at: now,
        };
        match store.settlement_record_commit(record, reason_codes::BILLING_OK_SETTLED) {
            Ok(settled) => {
                info!(
                    subject_id = %settled.subject_id,
                    rail = settled.rail.as_str(),
                    amount_cents = settled.amount_cents,
                    "purchase settled"
                );
                Some(settled)
            }
            Err(err) => {
                warn!(subject_id = charge.subject_id, error = %err, "settlement not recorded");
                None
            }
        }
    }
}

struct Charge<'a> {
    subject_id: &'a str,
    rail: SettlementRail,
    owner_id: &'a OwnerId,
    amount_cents: u64,
    currency: CurrencyCode,
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingPaymentProcessor;
    use super::*;
    use cardveil_kernel_contracts::ids::{BotId, CardId, CheckoutId};
    use cardveil_kernel_contracts::obfuscation::PurchaseSpec;
    use cardveil_kernel_contracts::rail5::{KeyMaterial, Rail5Card, Rail5Limits};
    use cardveil_storage::repo::Rail5Repo;
    use chrono::{Duration, TimeZone};

    use crate::purchase::purchase_spec;

    const RC: cardveil_kernel_contracts::ReasonCodeId =
        cardveil_kernel_contracts::ReasonCodeId(0x4249_00ff);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 14, 0, 0).unwrap()
    }

    fn owner() -> OwnerIdentity {
        OwnerIdentity {
            owner_id: OwnerId::new("owner_settle").unwrap(),
            email: "settle@example.com".to_string(),
        }
    }

    fn buy(amount: u64) -> PurchaseSpec {
        purchase_spec("Tool Barn", "https://toolbarn.example", "Clamp", amount).unwrap()
    }

    fn rail5_checkout(store: &CardVaultStore, status: Rail5CheckoutStatus) -> Rail5Checkout {
        let card_id = CardId::new("r5card_settle").unwrap();
        let bot = BotId::new("bot_settle").unwrap();
        if store.rail5_card_get(&card_id).is_none() {
            let card = Rail5Card::v1(
                card_id.clone(),
                owner().owner_id,
                "visa".to_string(),
                "4242".to_string(),
                Rail5Limits::v1(5_000, 10_000, 50_000, 1_000).unwrap(),
                now(),
            )
            .unwrap();
            store.insert_rail5_card_row(card, RC).unwrap();
            store
                .rail5_key_material_row(
                    now(),
                    &card_id,
                    &owner().owner_id,
                    KeyMaterial::v1("ab".repeat(32), "cd".repeat(12), "ef".repeat(16)).unwrap(),
                    RC,
                )
                .unwrap();
            store
                .rail5_link_bot_row(now(), &card_id, &owner().owner_id, bot.clone(), RC)
                .unwrap();
        }
        Rail5Checkout {
            checkout_id: CheckoutId::new(format!("r5co_settle_{}", status.as_str())).unwrap(),
            card_id,
            bot_id: bot,
            purchase: buy(1_800),
            status,
            key_delivered: false,
            created_at: now(),
            expires_at: now() + Duration::minutes(15),
            decided_at: None,
            confirmed_at: None,
            confirmed_outcome: None,
        }
    }

    #[test]
    fn at_billing_01_registration_stores_processor_handles() {
        let store = CardVaultStore::new_in_memory();
        let billing = BillingRuntime::new(Arc::new(RecordingPaymentProcessor::default()));
        assert!(billing.register(&store, &owner(), " ", now()).is_err());
        assert!(billing.registration(&store, &owner().owner_id).is_none());
        let record = billing.register(&store, &owner(), "tok_visa", now()).unwrap();
        assert!(record.customer_ref.contains("owner_settle"));
        assert_eq!(billing.registration(&store, &owner().owner_id), Some(record));
    }

    #[test]
    fn at_billing_02_approved_checkout_is_charged_once() {
        let store = CardVaultStore::new_in_memory();
        let payments = Arc::new(RecordingPaymentProcessor::default());
        let billing = BillingRuntime::new(payments.clone());

        let unregistered = rail5_checkout(&store, Rail5CheckoutStatus::Approved);
        assert!(billing.settle_rail5_checkout(&store, &unregistered, now()).is_none());

        billing.register(&store, &owner(), "tok_visa", now()).unwrap();
        let pending = rail5_checkout(&store, Rail5CheckoutStatus::Pending);
        assert!(billing.settle_rail5_checkout(&store, &pending, now()).is_none());

        let settled = billing
            .settle_rail5_checkout(&store, &unregistered, now())
            .unwrap();
        assert_eq!(settled.amount_cents, 1_800);
        assert_eq!(settled.rail, SettlementRail::Rail5);
        assert!(billing.settle_rail5_checkout(&store, &unregistered, now()).is_none());
        assert_eq!(payments.charges.lock().len(), 1);
    }

    #[test]
    fn at_billing_03_declined_charge_leaves_no_settlement() {
        let store = CardVaultStore::new_in_memory();
        let payments = Arc::new(RecordingPaymentProcessor {
            decline: true,
            ..RecordingPaymentProcessor::default()
        });
        let billing = BillingRuntime::new(payments);
        billing.register(&store, &owner(), "tok_visa", now()).unwrap();
        let checkout = rail5_checkout(&store, Rail5CheckoutStatus::Approved);
        assert!(billing.settle_rail5_checkout(&store, &checkout, now()).is_none());
        assert!(billing
            .settlement(&store, checkout.checkout_id.as_str())
            .is_none());
    }
}
