#![forbid(unsafe_code)]

pub mod allowance;
pub mod billing;
pub mod config;
pub mod confirmation;
pub mod custody;
pub mod decoy;
pub mod error;
pub mod escrow;
pub mod external;
pub mod keyed_lock;
pub mod purchase;
pub mod rate_limit;
pub mod runtime;
pub mod tasks;
pub mod verification;

pub use config::CardVaultConfig;
pub use error::CoreError;
pub use runtime::{CardVaultRuntime, RuntimeDeps, TickReport};
