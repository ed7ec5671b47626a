#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::card::{AllowanceDuration, CurrencyCode, ProfileIndex};
use crate::ids::CardId;

/// Accumulated spend for one `(card, profile, window)` bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceUsageRow {
    pub card_id: CardId,
    pub profile_index: ProfileIndex,
    pub window_start: DateTime<Utc>,
    pub spent_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceSnapshot {
    pub profile_index: ProfileIndex,
    pub allowance_value_cents: u64,
    pub allowance_currency: CurrencyCode,
    pub allowance_duration: AllowanceDuration,
    pub window_start: DateTime<Utc>,
    pub resets_at: DateTime<Utc>,
    pub spent_cents: u64,
    pub remaining_cents: u64,
}
