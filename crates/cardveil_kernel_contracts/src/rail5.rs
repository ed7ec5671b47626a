#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::validate_token;
use crate::ids::{BotId, CardId, CheckoutId, OwnerId};
use crate::obfuscation::PurchaseSpec;
use crate::{ContractViolation, SchemaVersion, Validate};

pub const RAIL5_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rail5CardStatus {
    PendingSetup,
    Active,
}

impl Rail5CardStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingSetup => "pending_setup",
            Self::Active => "active",
        }
    }
}

/// Client-encrypted key material. The platform stores and forwards it, never opens it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub encrypted_key_hex: String,
    pub iv_hex: String,
    pub tag_hex: String,
}

impl KeyMaterial {
    pub fn v1(
        encrypted_key_hex: String,
        iv_hex: String,
        tag_hex: String,
    ) -> Result<Self, ContractViolation> {
        let material = Self {
            encrypted_key_hex,
            iv_hex,
            tag_hex,
        };
        material.validate()?;
        Ok(material)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

fn validate_hex(
    field: &'static str,
    value: &str,
    min_len: usize,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.len() < min_len || value.len() > max_len || value.len() % 2 != 0 {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "hex length out of range",
        });
    }
    if !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be hex encoded",
        });
    }
    Ok(())
}

impl Validate for KeyMaterial {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_hex("key_material.encrypted_key_hex", &self.encrypted_key_hex, 32, 1024)?;
        // AES-GCM: 96-bit IV, 128-bit tag.
        validate_hex("key_material.iv_hex", &self.iv_hex, 24, 24)?;
        validate_hex("key_material.tag_hex", &self.tag_hex, 32, 32)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rail5Limits {
    pub spending_limit_cents: u64,
    pub daily_limit_cents: u64,
    pub monthly_limit_cents: u64,
    pub human_approval_above_cents: u64,
}

impl Rail5Limits {
    pub fn v1(
        spending_limit_cents: u64,
        daily_limit_cents: u64,
        monthly_limit_cents: u64,
        human_approval_above_cents: u64,
    ) -> Result<Self, ContractViolation> {
        let limits = Self {
            spending_limit_cents,
            daily_limit_cents,
            monthly_limit_cents,
            human_approval_above_cents,
        };
        limits.validate()?;
        Ok(limits)
    }
}

impl Validate for Rail5Limits {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.spending_limit_cents == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "rail5_limits.spending_limit_cents",
                reason: "must be > 0",
            });
        }
        if self.daily_limit_cents < self.spending_limit_cents {
            return Err(ContractViolation::InvalidValue {
                field: "rail5_limits.daily_limit_cents",
                reason: "must be >= spending_limit_cents",
            });
        }
        if self.monthly_limit_cents < self.daily_limit_cents {
            return Err(ContractViolation::InvalidValue {
                field: "rail5_limits.monthly_limit_cents",
                reason: "must be >= daily_limit_cents",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rail5Card {
    pub schema_version: SchemaVersion,
    pub card_id: CardId,
    pub owner_id: OwnerId,
    pub bot_id: Option<BotId>,
    pub card_brand: String,
    pub card_last4: String,
    pub status: Rail5CardStatus,
    pub key_material: Option<KeyMaterial>,
    pub limits: Rail5Limits,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

impl Rail5Card {
    pub fn v1(
        card_id: CardId,
        owner_id: OwnerId,
        card_brand: String,
        card_last4: String,
        limits: Rail5Limits,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ContractViolation> {
        let card = Self {
            schema_version: RAIL5_CONTRACT_VERSION,
            card_id,
            owner_id,
            bot_id: None,
            card_brand,
            card_last4,
            status: Rail5CardStatus::PendingSetup,
            key_material: None,
            limits,
            created_at,
            activated_at: None,
        };
        card.validate()?;
        Ok(card)
    }
}

impl Validate for Rail5Card {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != RAIL5_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "rail5_card.schema_version",
                reason: "must match RAIL5_CONTRACT_VERSION",
            });
        }
        validate_token("rail5_card.card_brand", &self.card_brand, 32)?;
        if self.card_last4.len() != 4 || !self.card_last4.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ContractViolation::InvalidValue {
                field: "rail5_card.card_last4",
                reason: "must be exactly 4 ascii digits",
            });
        }
        self.limits.validate()?;
        if self.status == Rail5CardStatus::Active && self.key_material.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "rail5_card.key_material",
                reason: "active cards must carry key material",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rail5CheckoutStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl Rail5CheckoutStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckoutOutcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rail5CheckoutInput {
    pub card_id: CardId,
    pub bot_id: BotId,
    pub purchase: PurchaseSpec,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Validate for Rail5CheckoutInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.purchase.validate()?;
        if self.expires_at <= self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "rail5_checkout_input.expires_at",
                reason: "must be after created_at",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rail5Checkout {
    pub checkout_id: CheckoutId,
    pub card_id: CardId,
    pub bot_id: BotId,
    pub purchase: PurchaseSpec,
    pub status: Rail5CheckoutStatus,
    pub key_delivered: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub confirmed_outcome: Option<CheckoutOutcome>,
}

impl Rail5Checkout {
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == Rail5CheckoutStatus::Pending && now > self.expires_at {
            self.status = Rail5CheckoutStatus::Expired;
            self.decided_at = Some(now);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> KeyMaterial {
        KeyMaterial::v1("ab".repeat(32), "01".repeat(12), "ff".repeat(16)).unwrap()
    }

    #[test]
    fn key_material_requires_gcm_shaped_hex() {
        assert!(KeyMaterial::v1("ab".repeat(32), "01".repeat(11), "ff".repeat(16)).is_err());
        assert!(KeyMaterial::v1("zz".repeat(32), "01".repeat(12), "ff".repeat(16)).is_err());
        assert!(material().validate().is_ok());
    }

    #[test]
    fn key_material_debug_is_redacted() {
        assert!(!format!("{:?}", material()).contains("abab"));
    }

    #[test]
    fn limits_must_nest() {
        assert!(Rail5Limits::v1(5_000, 4_000, 100_000, 2_500).is_err());
        assert!(Rail5Limits::v1(5_000, 10_000, 9_000, 2_500).is_err());
        assert!(Rail5Limits::v1(5_000, 10_000, 100_000, 2_500).is_ok());
    }
}
