#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ReasonCodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditSubjectKind {
    SplitCard,
    ObfuscationEvent,
    Confirmation,
    Rail5Card,
    Rail5Checkout,
    RealPurchase,
    OwnerBilling,
    Settlement,
}

/// Append-only transition row, written in the same commit as the transition itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRow {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub subject_kind: AuditSubjectKind,
    pub subject_id: String,
    pub state_from: String,
    pub state_to: String,
    pub reason_code: ReasonCodeId,
}
