#![forbid(unsafe_code)]

use cardveil_kernel_contracts::card::ProfilePermission;
use cardveil_kernel_contracts::rail5::Rail5Limits;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Allowance,
    PerTransaction,
    Daily,
    Monthly,
}

impl LimitKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowance => "allowance",
            Self::PerTransaction => "per_transaction",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendDecision {
    AutoApprove,
    RequireHuman,
    Reject(LimitKind),
}

/// Split-knowledge rail: allowance first, then the profile's confirmation policy.
pub fn evaluate_profile_spend(
    permission: &ProfilePermission,
    remaining_cents: u64,
    amount_cents: u64,
) -> SpendDecision {
    if amount_cents > remaining_cents {
        return SpendDecision::Reject(LimitKind::Allowance);
    }
    if permission
        .human_permission_required
        .requires_human(amount_cents, permission.confirmation_exempt_limit_cents)
    {
        SpendDecision::RequireHuman
    } else {
        SpendDecision::AutoApprove
    }
}

/// Key-escrow rail: per-transaction, daily and monthly ceilings, then the approval
/// threshold.
pub fn evaluate_rail5_spend(
    limits: &Rail5Limits,
    spent_today_cents: u64,
    spent_month_cents: u64,
    amount_cents: u64,
) -> SpendDecision {
    if amount_cents > limits.spending_limit_cents {
        return SpendDecision::Reject(LimitKind::PerTransaction);
    }
    if spent_today_cents.saturating_add(amount_cents) > limits.daily_limit_cents {
        return SpendDecision::Reject(LimitKind::Daily);
    }
    if spent_month_cents.saturating_add(amount_cents) > limits.monthly_limit_cents {
        return SpendDecision::Reject(LimitKind::Monthly);
    }
    if amount_cents > limits.human_approval_above_cents {
        SpendDecision::RequireHuman
    } else {
        SpendDecision::AutoApprove
    }
}
