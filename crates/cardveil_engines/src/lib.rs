#![forbid(unsafe_code)]

pub mod allowance;
pub mod custody;
pub mod decoy;
pub mod fragment_seal;
pub mod limits;
pub mod verify;
