#![forbid(unsafe_code)]

pub mod repo;
pub mod snapshot;
pub mod store;

pub use store::{CardVaultStore, SplitCardInitialized, StorageError};
