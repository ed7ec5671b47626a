#![forbid(unsafe_code)]

use cardveil_engines::fragment_seal::SealError;
use cardveil_engines::limits::LimitKind;
use cardveil_kernel_contracts::ContractViolation;
use cardveil_storage::StorageError;
use thiserror::Error;

/// Runtime-level failure returned by every `cardveil_os` operation.
///
/// `NotFound` and `Forbidden` stay distinct internally (logs, tests) but share one
/// external code so callers cannot discover records they do not own.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("invalid state: {detail}")]
    InvalidState { detail: String },
    #[error("already active")]
    AlreadyActive,
    #[error("key already delivered")]
    KeyAlreadyDelivered,
    #[error("already completed")]
    AlreadyCompleted,
    #[error("checkout not approved")]
    CheckoutNotApproved,
    #[error("validation failed: {0}")]
    Validation(#[from] ContractViolation),
    #[error("expired")]
    Expired,
    #[error("{} limit exceeded", .limit.as_str())]
    LimitExceeded { limit: LimitKind, remaining_cents: u64 },
    #[error("rate limited")]
    RateLimited,
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound | Self::Forbidden => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::AlreadyActive => "already_active",
            Self::KeyAlreadyDelivered => "key_already_delivered",
            Self::AlreadyCompleted => "already_completed",
            Self::CheckoutNotApproved => "checkout_not_approved",
            Self::Validation(_) => "validation_error",
            Self::Expired => "expired",
            Self::LimitExceeded { .. } => "limit_exceeded",
            Self::RateLimited => "rate_limited",
            Self::Internal(_) => "internal_error",
        }
    }

    pub(crate) fn invalid_state(detail: impl Into<String>) -> Self {
        Self::InvalidState {
            detail: detail.into(),
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => Self::NotFound,
            StorageError::Forbidden { .. } => Self::Forbidden,
            StorageError::DuplicateKey { table, .. } => {
                Self::invalid_state(format!("{table} already bound"))
            }
            StorageError::StateConflict { state, .. } => Self::invalid_state(state),
            StorageError::AlreadyConsumed { .. } => Self::AlreadyCompleted,
            StorageError::Expired { .. } => Self::Expired,
            StorageError::LimitExceeded {
                remaining_cents, ..
            } => Self::LimitExceeded {
                limit: LimitKind::Allowance,
                remaining_cents,
            },
            StorageError::CapacityExceeded { max, .. } => {
                Self::invalid_state(format!("capacity of {max} reached"))
            }
            StorageError::ContractViolation(v) => Self::Validation(v),
        }
    }
}

impl From<SealError> for CoreError {
    fn from(err: SealError) -> Self {
        Self::Internal(format!("fragment seal: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_error_01_not_found_and_forbidden_share_code() {
        assert_eq!(CoreError::NotFound.code(), CoreError::Forbidden.code());
        assert_eq!(CoreError::CheckoutNotApproved.code(), "checkout_not_approved");
        assert_eq!(CoreError::KeyAlreadyDelivered.code(), "key_already_delivered");
    }

    #[test]
    fn at_error_02_storage_errors_map_to_runtime_taxonomy() {
        let e: CoreError = StorageError::LimitExceeded {
            table: "allowance_usage",
            key: "card".to_string(),
            remaining_cents: 12,
        }
        .into();
        assert_eq!(
            e,
            CoreError::LimitExceeded {
                limit: LimitKind::Allowance,
                remaining_cents: 12
            }
        );
        let e: CoreError = StorageError::Forbidden {
            table: "confirmations",
            key: "c".to_string(),
        }
        .into();
        assert_eq!(e.code(), "not_found");
    }
}
