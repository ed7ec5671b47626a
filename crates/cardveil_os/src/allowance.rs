#![forbid(unsafe_code)]

use cardveil_engines::allowance::{next_window_start, remaining_cents, window_start};
use cardveil_kernel_contracts::allowance::AllowanceSnapshot;
use cardveil_kernel_contracts::card::{ProfileIndex, ProfilePermission};
use cardveil_kernel_contracts::ids::CardId;
use cardveil_storage::CardVaultStore;
use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// Per-profile spend ledger over UTC allowance windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowanceLedger;

impl AllowanceLedger {
    /// Unconditional add into the window containing `now`. Returns the window total.
    pub fn record_spend(
        &self,
        store: &CardVaultStore,
        card_id: &CardId,
        profile_index: ProfileIndex,
        amount_cents: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        Ok(store.allowance_spend_commit(card_id, profile_index, amount_cents, false, |p| {
            window_start(p.allowance_duration, now)
        })?)
    }

    /// Check-and-add in one unit; `LimitExceeded` leaves usage untouched.
    pub fn try_spend(
        &self,
        store: &CardVaultStore,
        card_id: &CardId,
        profile_index: ProfileIndex,
        amount_cents: u64,
        now: DateTime<Utc>,
    ) -> Result<AllowanceSnapshot, CoreError> {
        store.allowance_spend_commit(card_id, profile_index, amount_cents, true, |p| {
            window_start(p.allowance_duration, now)
        })?;
        self.remaining(store, card_id, profile_index, now)
    }

    pub fn remaining(
        &self,
        store: &CardVaultStore,
        card_id: &CardId,
        profile_index: ProfileIndex,
        now: DateTime<Utc>,
    ) -> Result<AllowanceSnapshot, CoreError> {
        let slot = store
            .split_card_profile_slot(card_id, profile_index)
            .ok_or(CoreError::NotFound)?;
        Ok(snapshot(store, card_id, profile_index, &slot.permission, now))
    }

    /// One snapshot per profile slot of the card, ordered by profile index.
    pub fn snapshots(
        &self,
        store: &CardVaultStore,
        card_id: &CardId,
        now: DateTime<Utc>,
    ) -> Vec<AllowanceSnapshot> {
        store
            .split_card_profile_slots(card_id)
            .iter()
            .map(|slot| snapshot(store, card_id, slot.profile_index, &slot.permission, now))
            .collect()
    }
}

fn snapshot(
    store: &CardVaultStore,
    card_id: &CardId,
    profile_index: ProfileIndex,
    permission: &ProfilePermission,
    now: DateTime<Utc>,
) -> AllowanceSnapshot {
    let start = window_start(permission.allowance_duration, now);
    let spent = store.allowance_spent(card_id, profile_index, start);
    AllowanceSnapshot {
        profile_index,
        allowance_value_cents: permission.allowance_value_cents,
        allowance_currency: permission.allowance_currency.clone(),
        allowance_duration: permission.allowance_duration,
        window_start: start,
        resets_at: next_window_start(permission.allowance_duration, now),
        spent_cents: spent,
        remaining_cents: remaining_cents(permission.allowance_value_cents, spent),
    }
}
