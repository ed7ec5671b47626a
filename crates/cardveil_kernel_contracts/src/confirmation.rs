#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::card::ProfileIndex;
use crate::ids::{BotId, CardId, ConfirmationId};
use crate::obfuscation::PurchaseSpec;
use crate::{ContractViolation, Validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfirmationStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ConfirmationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationInput {
    pub card_id: CardId,
    pub bot_id: BotId,
    pub profile_index: ProfileIndex,
    pub purchase: PurchaseSpec,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Validate for ConfirmationInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.purchase.validate()?;
        if self.expires_at <= self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "confirmation_input.expires_at",
                reason: "must be after created_at",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutConfirmation {
    pub confirmation_id: ConfirmationId,
    pub card_id: CardId,
    pub bot_id: BotId,
    pub profile_index: ProfileIndex,
    pub purchase: PurchaseSpec,
    pub status: ConfirmationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl CheckoutConfirmation {
    /// Applies the lazy `Pending -> Expired` transition. Returns true when it fired.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == ConfirmationStatus::Pending && now > self.expires_at {
            self.status = ConfirmationStatus::Expired;
            self.decided_at = Some(now);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::MerchantDescriptor;
    use chrono::{Duration, TimeZone};

    fn confirmation(expires_at: DateTime<Utc>) -> CheckoutConfirmation {
        CheckoutConfirmation {
            confirmation_id: ConfirmationId::new("conf_1").unwrap(),
            card_id: CardId::new("card_1").unwrap(),
            bot_id: BotId::new("bot_1").unwrap(),
            profile_index: ProfileIndex::new(2).unwrap(),
            purchase: PurchaseSpec::v1(
                MerchantDescriptor::v1(
                    "Corner Hardware".to_string(),
                    "corner-hardware".to_string(),
                    "https://corner.example".to_string(),
                )
                .unwrap(),
                "Hex keys".to_string(),
                899,
            )
            .unwrap(),
            status: ConfirmationStatus::Pending,
            created_at: expires_at - Duration::minutes(15),
            expires_at,
            decided_at: None,
        }
    }

    #[test]
    fn expiry_fires_only_after_deadline_and_only_once() {
        let deadline = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut c = confirmation(deadline);
        assert!(!c.expire_if_due(deadline));
        assert_eq!(c.status, ConfirmationStatus::Pending);
        assert!(c.expire_if_due(deadline + Duration::seconds(1)));
        assert_eq!(c.status, ConfirmationStatus::Expired);
        assert!(!c.expire_if_due(deadline + Duration::seconds(2)));
    }

    #[test]
    fn decided_confirmations_never_expire() {
        let deadline = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut c = confirmation(deadline);
        c.status = ConfirmationStatus::Approved;
        assert!(!c.expire_if_due(deadline + Duration::hours(1)));
        assert_eq!(c.status, ConfirmationStatus::Approved);
    }
}
