#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::card::CurrencyCode;
use crate::common::{validate_amount_cents, validate_token};
use crate::ids::OwnerId;
use crate::{ContractViolation, Validate};

/// Processor handles for an owner. Opaque strings minted by the payment processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerBillingRecord {
    pub owner_id: OwnerId,
    pub customer_ref: String,
    pub payment_method_ref: String,
    pub registered_at: DateTime<Utc>,
}

impl OwnerBillingRecord {
    pub fn v1(
        owner_id: OwnerId,
        customer_ref: String,
        payment_method_ref: String,
        registered_at: DateTime<Utc>,
    ) -> Result<Self, ContractViolation> {
        let record = Self {
            owner_id,
            customer_ref,
            payment_method_ref,
            registered_at,
        };
        record.validate()?;
        Ok(record)
    }
}

impl Validate for OwnerBillingRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("owner_billing.customer_ref", &self.customer_ref, 128)?;
        validate_token("owner_billing.payment_method_ref", &self.payment_method_ref, 128)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementRail {
    SplitCard,
    Rail5,
}

impl SettlementRail {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SplitCard => "split_card",
            Self::Rail5 => "rail5",
        }
    }
}

/// One processor charge, keyed by the approved confirmation or checkout it settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub subject_id: String,
    pub rail: SettlementRail,
    pub owner_id: OwnerId,
    pub amount_cents: u64,
    pub currency: CurrencyCode,
    pub charge_ref: String,
    pub settled_at: DateTime<Utc>,
}

impl Validate for SettlementRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("settlement.subject_id", &self.subject_id, 128)?;
        validate_amount_cents("settlement.amount_cents", self.amount_cents)?;
        validate_token("settlement.charge_ref", &self.charge_ref, 256)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap()
    }

    #[test]
    fn billing_refs_must_be_present() {
        let owner = OwnerId::new("owner_bill").unwrap();
        assert!(OwnerBillingRecord::v1(owner.clone(), " ".to_string(), "pm_1".to_string(), at())
            .is_err());
        assert!(OwnerBillingRecord::v1(owner, "cus_1".to_string(), "pm_1".to_string(), at())
            .is_ok());
    }

    #[test]
    fn settlement_rejects_zero_amount() {
        let settlement = SettlementRecord {
            subject_id: "r5co_000001_00000000".to_string(),
            rail: SettlementRail::Rail5,
            owner_id: OwnerId::new("owner_bill").unwrap(),
            amount_cents: 0,
            currency: CurrencyCode::usd(),
            charge_ref: "ch_1".to_string(),
            settled_at: at(),
        };
        assert!(settlement.validate().is_err());
    }
}
