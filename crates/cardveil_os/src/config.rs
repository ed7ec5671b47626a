#![forbid(unsafe_code)]

use std::env;
use std::time::Duration as StdDuration;

use cardveil_engines::custody::CustodyConfig;
use cardveil_engines::decoy::DecoyPolicy;
use cardveil_engines::fragment_seal::FragmentSealer;
use chrono::Duration;
use tracing::warn;

use crate::error::CoreError;
use crate::rate_limit::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardVaultConfig {
    pub profile_count: u8,
    pub default_allowance_cents: u64,
    pub default_exempt_limit_cents: u64,
    pub confirmation_ttl: Duration,
    pub rail5_approval_ttl: Duration,
    pub max_cards_per_bot: usize,
    pub expiry_year_horizon: u16,
    pub decoy: DecoyPolicy,
    pub rate_limit: RateLimitConfig,
}

impl CardVaultConfig {
    pub fn mvp_v1() -> Self {
        let custody = CustodyConfig::mvp_v1();
        Self {
            profile_count: custody.profile_count,
            default_allowance_cents: custody.default_allowance_cents,
            default_exempt_limit_cents: custody.default_exempt_limit_cents,
            confirmation_ttl: Duration::minutes(15),
            rail5_approval_ttl: Duration::minutes(15),
            max_cards_per_bot: 3,
            expiry_year_horizon: 20,
            decoy: DecoyPolicy::mvp_v1(),
            rate_limit: RateLimitConfig::mvp_v1(),
        }
    }

    pub fn custody_config(&self) -> CustodyConfig {
        CustodyConfig {
            profile_count: self.profile_count,
            default_allowance_cents: self.default_allowance_cents,
            default_exempt_limit_cents: self.default_exempt_limit_cents,
        }
    }

    pub fn default_from_env() -> Self {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    /// `mvp_v1` with `CARDVEIL_*` overrides. Out-of-range values fall back to the default.
    pub fn from_env_var_map(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::mvp_v1();
        if let Some(v) = parse_in_range(&lookup, "CARDVEIL_PROFILE_COUNT", 3, 9) {
            config.profile_count = v as u8;
        }
        if let Some(v) = parse_in_range(&lookup, "CARDVEIL_CONFIRMATION_TTL_SECS", 30, 86_400) {
            config.confirmation_ttl = Duration::seconds(v as i64);
        }
        if let Some(v) = parse_in_range(&lookup, "CARDVEIL_RAIL5_APPROVAL_TTL_SECS", 30, 86_400) {
            config.rail5_approval_ttl = Duration::seconds(v as i64);
        }
        if let Some(v) = parse_in_range(&lookup, "CARDVEIL_DECOYS_PER_REAL", 0, 20) {
            config.decoy.decoys_per_real = v as u32;
        }
        if let Some(v) = parse_in_range(&lookup, "CARDVEIL_DECOY_IDLE_DAYS", 1, 90) {
            config.decoy.idle_cadence_days = v as u32;
        }
        if let Some(v) = parse_in_range(&lookup, "CARDVEIL_RATE_LIMIT_PER_MINUTE", 1, 100_000) {
            config.rate_limit = RateLimitConfig {
                window: StdDuration::from_secs(60),
                max_requests: v as u32,
            };
        }
        config
    }
}

fn parse_in_range(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    min: u64,
    max: u64,
) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) if (min..=max).contains(&v) => Some(v),
        _ => {
            warn!(key, value = %raw.trim(), min, max, "ignoring out-of-range config override");
            None
        }
    }
}

/// Fragment key from `CARDVEIL_FRAGMENT_KEY_B64`. Without it an ephemeral key is used,
/// which makes any persisted snapshot unreadable after restart.
pub fn fragment_sealer_from_env_var_map(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<FragmentSealer, CoreError> {
    match lookup("CARDVEIL_FRAGMENT_KEY_B64")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        Some(encoded) => Ok(FragmentSealer::from_base64(&encoded)?),
        None => {
            warn!("CARDVEIL_FRAGMENT_KEY_B64 not set; using an ephemeral fragment key");
            Ok(FragmentSealer::generate())
        }
    }
}
