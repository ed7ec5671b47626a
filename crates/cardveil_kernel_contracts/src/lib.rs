#![forbid(unsafe_code)]

pub mod allowance;
pub mod audit;
pub mod billing;
pub mod card;
pub mod common;
pub mod confirmation;
pub mod ids;
pub mod obfuscation;
pub mod rail5;

pub use common::{ContractViolation, ReasonCodeId, SchemaVersion, Validate};
