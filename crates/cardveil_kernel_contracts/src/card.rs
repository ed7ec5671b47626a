#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::validate_token;
use crate::ids::{BotId, CardId, OwnerId};
use crate::{ContractViolation, SchemaVersion, Validate};

pub const SPLIT_CARD_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const CARD_NUMBER_LEN: usize = 16;
pub const MISSING_DIGIT_COUNT: usize = 3;
pub const MIN_PROFILE_COUNT: u8 = 3;
pub const MAX_PROFILE_COUNT: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitCardStatus {
    PendingSetup,
    AwaitingBot,
    Active,
    Frozen,
}

impl SplitCardStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingSetup => "pending_setup",
            Self::AwaitingBot => "awaiting_bot",
            Self::Active => "active",
            Self::Frozen => "frozen",
        }
    }
}

/// 1-based slot number inside a card's profile population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ProfileIndex(u8);

impl ProfileIndex {
    pub fn new(index: u8) -> Result<Self, ContractViolation> {
        if index == 0 || index > MAX_PROFILE_COUNT {
            return Err(ContractViolation::InvalidRange {
                field: "profile_index",
                min: 1,
                max: i64::from(MAX_PROFILE_COUNT),
                got: i64::from(index),
            });
        }
        Ok(Self(index))
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for ProfileIndex {
    type Error = ContractViolation;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProfileIndex> for u8 {
    fn from(value: ProfileIndex) -> Self {
        value.0
    }
}

/// Exactly three distinct, ascending positions (0-based) inside a 16 digit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct MissingDigitPositions([u8; MISSING_DIGIT_COUNT]);

impl MissingDigitPositions {
    pub fn new(mut positions: [u8; MISSING_DIGIT_COUNT]) -> Result<Self, ContractViolation> {
        positions.sort_unstable();
        if positions.iter().any(|p| usize::from(*p) >= CARD_NUMBER_LEN) {
            return Err(ContractViolation::InvalidValue {
                field: "missing_digit_positions",
                reason: "positions must be within 0..16",
            });
        }
        if positions.windows(2).any(|w| w[0] == w[1]) {
            return Err(ContractViolation::InvalidValue {
                field: "missing_digit_positions",
                reason: "positions must be distinct",
            });
        }
        Ok(Self(positions))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn contains(&self, position: usize) -> bool {
        self.0.iter().any(|p| usize::from(*p) == position)
    }
}

impl TryFrom<Vec<u8>> for MissingDigitPositions {
    type Error = ContractViolation;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let arr: [u8; MISSING_DIGIT_COUNT] =
            value
                .try_into()
                .map_err(|_| ContractViolation::InvalidValue {
                    field: "missing_digit_positions",
                    reason: "must contain exactly 3 positions",
                })?;
        Self::new(arr)
    }
}

impl From<MissingDigitPositions> for Vec<u8> {
    fn from(value: MissingDigitPositions) -> Self {
        value.0.to_vec()
    }
}

/// The three digits that the platform-held artifact leaves blank.
#[derive(Clone, PartialEq, Eq)]
pub struct DigitFragment(String);

impl DigitFragment {
    pub fn new(digits: impl Into<String>) -> Result<Self, ContractViolation> {
        let digits = digits.into();
        if digits.len() != MISSING_DIGIT_COUNT || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ContractViolation::InvalidValue {
                field: "missing_digits",
                reason: "must be exactly 3 ascii digits",
            });
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for DigitFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DigitFragment(***)")
    }
}

/// Full 16 digit number; only ever held for synthetic profiles while the decoy artifact
/// is being rendered.
#[derive(Clone, PartialEq, Eq)]
pub struct CardNumber(String);

impl CardNumber {
    pub fn new(digits: impl Into<String>) -> Result<Self, ContractViolation> {
        let digits = digits.into();
        if digits.len() != CARD_NUMBER_LEN || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ContractViolation::InvalidValue {
                field: "card_number",
                reason: "must be exactly 16 ascii digits",
            });
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn fragment_at(&self, positions: &MissingDigitPositions) -> DigitFragment {
        let bytes = self.0.as_bytes();
        let digits: String = positions
            .as_slice()
            .iter()
            .map(|p| char::from(bytes[usize::from(*p)]))
            .collect();
        DigitFragment(digits)
    }
}

impl std::fmt::Debug for CardNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CardNumber(****)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CardExpiry {
    pub month: u8,
    pub year: u16,
}

impl CardExpiry {
    pub fn v1(month: u8, year: u16) -> Result<Self, ContractViolation> {
        let expiry = Self { month, year };
        expiry.validate()?;
        Ok(expiry)
    }
}

impl Validate for CardExpiry {
    fn validate(&self) -> Result<(), ContractViolation> {
        if !(1..=12).contains(&self.month) {
            return Err(ContractViolation::InvalidRange {
                field: "card_expiry.month",
                min: 1,
                max: 12,
                got: i64::from(self.month),
            });
        }
        if !(2000..=2100).contains(&self.year) {
            return Err(ContractViolation::InvalidRange {
                field: "card_expiry.year",
                min: 2000,
                max: 2100,
                got: i64::from(self.year),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllowanceDuration {
    Day,
    Week,
    Month,
}

impl AllowanceDuration {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HumanPermissionPolicy {
    All,
    AboveExemptLimit,
    None,
}

impl HumanPermissionPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::AboveExemptLimit => "above_exempt_limit",
            Self::None => "none",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Some(Self::All),
            "above_exempt_limit" => Some(Self::AboveExemptLimit),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Whether a spend of `amount_cents` must wait for the owner.
    pub fn requires_human(self, amount_cents: u64, exempt_limit_cents: u64) -> bool {
        match self {
            Self::All => true,
            Self::AboveExemptLimit => amount_cents >= exempt_limit_cents,
            Self::None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn new(code: impl Into<String>) -> Result<Self, ContractViolation> {
        let code = code.into();
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(ContractViolation::InvalidValue {
                field: "allowance_currency",
                reason: "must be a 3 letter upper-case ISO-4217 code",
            });
        }
        Ok(Self(code))
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CurrencyCode> for String {
    fn from(value: CurrencyCode) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePermission {
    pub allowance_value_cents: u64,
    pub allowance_currency: CurrencyCode,
    pub allowance_duration: AllowanceDuration,
    pub confirmation_exempt_limit_cents: u64,
    pub human_permission_required: HumanPermissionPolicy,
}

impl ProfilePermission {
    pub fn v1(
        allowance_value_cents: u64,
        allowance_currency: CurrencyCode,
        allowance_duration: AllowanceDuration,
        confirmation_exempt_limit_cents: u64,
        human_permission_required: HumanPermissionPolicy,
    ) -> Result<Self, ContractViolation> {
        let permission = Self {
            allowance_value_cents,
            allowance_currency,
            allowance_duration,
            confirmation_exempt_limit_cents,
            human_permission_required,
        };
        permission.validate()?;
        Ok(permission)
    }

    pub fn apply(&self, patch: &ProfilePermissionPatch) -> Result<Self, ContractViolation> {
        let next = Self {
            allowance_value_cents: patch
                .allowance_value_cents
                .unwrap_or(self.allowance_value_cents),
            allowance_currency: patch
                .allowance_currency
                .clone()
                .unwrap_or_else(|| self.allowance_currency.clone()),
            allowance_duration: patch.allowance_duration.unwrap_or(self.allowance_duration),
            confirmation_exempt_limit_cents: patch
                .confirmation_exempt_limit_cents
                .unwrap_or(self.confirmation_exempt_limit_cents),
            human_permission_required: patch
                .human_permission_required
                .unwrap_or(self.human_permission_required),
        };
        next.validate()?;
        Ok(next)
    }
}

impl Validate for ProfilePermission {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.allowance_value_cents > 100_000_000 {
            return Err(ContractViolation::InvalidRange {
                field: "profile_permission.allowance_value_cents",
                min: 0,
                max: 100_000_000,
                got: self.allowance_value_cents.min(i64::MAX as u64) as i64,
            });
        }
        if self.confirmation_exempt_limit_cents > self.allowance_value_cents {
            return Err(ContractViolation::InvalidValue {
                field: "profile_permission.confirmation_exempt_limit_cents",
                reason: "must be <= allowance_value_cents",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePermissionPatch {
    pub allowance_value_cents: Option<u64>,
    pub allowance_currency: Option<CurrencyCode>,
    pub allowance_duration: Option<AllowanceDuration>,
    pub confirmation_exempt_limit_cents: Option<u64>,
    pub human_permission_required: Option<HumanPermissionPolicy>,
}

impl ProfilePermissionPatch {
    pub fn is_empty(&self) -> bool {
        self.allowance_value_cents.is_none()
            && self.allowance_currency.is_none()
            && self.allowance_duration.is_none()
            && self.confirmation_exempt_limit_cents.is_none()
            && self.human_permission_required.is_none()
    }
}

/// AES-GCM sealed bytes, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub nonce_b64: String,
    pub ciphertext_b64: String,
}

/// A synthetic profile as produced by the generator. The full number only lives long
/// enough to render the decoy artifact; storage keeps a [`ProfileSlot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeProfile {
    pub profile_index: ProfileIndex,
    pub card_number: CardNumber,
    pub holder_name: String,
    pub holder_zip: String,
    pub expiry: CardExpiry,
}

/// Uniform per-profile row. Real and synthetic slots have the same shape once the owner
/// has supplied the real fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSlot {
    pub card_id: CardId,
    pub profile_index: ProfileIndex,
    pub holder_name: Option<String>,
    pub holder_zip: Option<String>,
    pub sealed_secret: Option<SealedSecret>,
    pub permission: ProfilePermission,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitCardRecord {
    pub schema_version: SchemaVersion,
    pub card_id: CardId,
    pub owner_id: OwnerId,
    pub bot_id: Option<BotId>,
    pub status: SplitCardStatus,
    pub profile_count: u8,
    pub real_profile_index: ProfileIndex,
    pub missing_digit_positions: MissingDigitPositions,
    pub decoy_artifact_ref: String,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

impl SplitCardRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        card_id: CardId,
        owner_id: OwnerId,
        bot_id: Option<BotId>,
        profile_count: u8,
        real_profile_index: ProfileIndex,
        missing_digit_positions: MissingDigitPositions,
        decoy_artifact_ref: String,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ContractViolation> {
        let record = Self {
            schema_version: SPLIT_CARD_CONTRACT_VERSION,
            card_id,
            owner_id,
            bot_id,
            status: SplitCardStatus::PendingSetup,
            profile_count,
            real_profile_index,
            missing_digit_positions,
            decoy_artifact_ref,
            created_at,
            activated_at: None,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn is_usable(&self) -> bool {
        self.status == SplitCardStatus::Active
    }
}

impl Validate for SplitCardRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != SPLIT_CARD_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "split_card_record.schema_version",
                reason: "must match SPLIT_CARD_CONTRACT_VERSION",
            });
        }
        if !(MIN_PROFILE_COUNT..=MAX_PROFILE_COUNT).contains(&self.profile_count) {
            return Err(ContractViolation::InvalidRange {
                field: "split_card_record.profile_count",
                min: i64::from(MIN_PROFILE_COUNT),
                max: i64::from(MAX_PROFILE_COUNT),
                got: i64::from(self.profile_count),
            });
        }
        if self.real_profile_index.get() > self.profile_count {
            return Err(ContractViolation::InvalidValue {
                field: "split_card_record.real_profile_index",
                reason: "must be within 1..=profile_count",
            });
        }
        if self.decoy_artifact_ref.len() != 64
            || !self.decoy_artifact_ref.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ContractViolation::InvalidValue {
                field: "split_card_record.decoy_artifact_ref",
                reason: "must be a sha256 hex digest",
            });
        }
        Ok(())
    }
}

/// Owner-supplied completion of the real profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerCardData {
    pub missing_digits: DigitFragment,
    pub expiry: CardExpiry,
    pub owner_name: String,
    pub owner_zip: String,
}

impl OwnerCardData {
    pub fn v1(
        missing_digits: DigitFragment,
        expiry: CardExpiry,
        owner_name: String,
        owner_zip: String,
    ) -> Result<Self, ContractViolation> {
        let data = Self {
            missing_digits,
            expiry,
            owner_name,
            owner_zip,
        };
        data.validate()?;
        Ok(data)
    }
}

impl Validate for OwnerCardData {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.expiry.validate()?;
        validate_token("owner_card_data.owner_name", &self.owner_name, 128)?;
        validate_token("owner_card_data.owner_zip", &self.owner_zip, 16)?;
        Ok(())
    }
}

/// What an approved checkout hands the bot: the blanks for one profile plus its
/// billing identity. Never the full number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedCardData {
    pub profile_index: ProfileIndex,
    pub missing_digits: DigitFragment,
    pub expiry: CardExpiry,
    pub holder_name: String,
    pub holder_zip: String,
}
