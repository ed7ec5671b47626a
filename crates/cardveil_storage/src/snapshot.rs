#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use cardveil_kernel_contracts::allowance::AllowanceUsageRow;
use cardveil_kernel_contracts::audit::AuditRow;
use cardveil_kernel_contracts::billing::{OwnerBillingRecord, SettlementRecord};
use cardveil_kernel_contracts::card::{ProfileSlot, SplitCardRecord};
use cardveil_kernel_contracts::confirmation::CheckoutConfirmation;
use cardveil_kernel_contracts::obfuscation::{ObfuscationEvent, RealPurchaseRequest};
use cardveil_kernel_contracts::rail5::{Rail5Card, Rail5Checkout};
use cardveil_kernel_contracts::Validate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::store::{CardVaultStore, Tables};

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug)]
pub enum SnapshotError {
    Io(std::io::Error),
    Json(serde_json::Error),
    UnsupportedVersion(u32),
    Corrupt(&'static str),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported snapshot version {v}"),
            Self::Corrupt(what) => write!(f, "corrupt snapshot: {what}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<std::io::Error> for SnapshotError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

// Composite-keyed tables are stored as row lists; indexes are rebuilt on load.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    format_version: u32,
    next_seq: u64,
    split_cards: Vec<SplitCardRecord>,
    profile_slots: Vec<ProfileSlot>,
    allowance_usage: Vec<AllowanceUsageRow>,
    events: Vec<ObfuscationEvent>,
    real_purchases: Vec<RealPurchaseRequest>,
    confirmations: Vec<CheckoutConfirmation>,
    rail5_cards: Vec<Rail5Card>,
    rail5_checkouts: Vec<Rail5Checkout>,
    #[serde(default)]
    owner_billing: Vec<OwnerBillingRecord>,
    #[serde(default)]
    settlements: Vec<SettlementRecord>,
    audit: Vec<AuditRow>,
}

impl SnapshotDocument {
    fn from_tables(t: &Tables) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            next_seq: t.next_seq,
            split_cards: t.split_cards.values().cloned().collect(),
            profile_slots: t.profile_slots.values().cloned().collect(),
            allowance_usage: t
                .allowance_usage
                .iter()
                .map(|((card_id, profile_index, window_start), spent)| AllowanceUsageRow {
                    card_id: card_id.clone(),
                    profile_index: *profile_index,
                    window_start: *window_start,
                    spent_cents: *spent,
                })
                .collect(),
            events: t.events.values().cloned().collect(),
            real_purchases: t.real_purchases.values().cloned().collect(),
            confirmations: t.confirmations.values().cloned().collect(),
            rail5_cards: t.rail5_cards.values().cloned().collect(),
            rail5_checkouts: t.rail5_checkouts.values().cloned().collect(),
            owner_billing: t.owner_billing.values().cloned().collect(),
            settlements: t.settlements.values().cloned().collect(),
            audit: t.audit.clone(),
        }
    }

    fn into_tables(self) -> Result<Tables, SnapshotError> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(self.format_version));
        }
        let mut t = Tables {
            next_seq: self.next_seq,
            audit: self.audit,
            ..Tables::default()
        };
        for card in self.split_cards {
            card.validate()
                .map_err(|_| SnapshotError::Corrupt("split_cards"))?;
            t.split_cards.insert(card.card_id.clone(), card);
        }
        for slot in self.profile_slots {
            if !t.split_cards.contains_key(&slot.card_id) {
                return Err(SnapshotError::Corrupt("profile_slots"));
            }
            t.profile_slots
                .insert((slot.card_id.clone(), slot.profile_index), slot);
        }
        for row in self.allowance_usage {
            t.allowance_usage
                .insert((row.card_id, row.profile_index, row.window_start), row.spent_cents);
        }
        for event in self.events {
            if event.is_pending()
                && t
                    .pending_event_by_bot
                    .insert(event.bot_id.clone(), event.event_id.clone())
                    .is_some()
            {
                return Err(SnapshotError::Corrupt("events.pending"));
            }
            t.events.insert(event.event_id.clone(), event);
        }
        for request in self.real_purchases {
            t.real_purchases.insert(request.request_id.clone(), request);
        }
        for confirmation in self.confirmations {
            t.confirmations
                .insert(confirmation.confirmation_id.clone(), confirmation);
        }
        for card in self.rail5_cards {
            t.rail5_cards.insert(card.card_id.clone(), card);
        }
        for checkout in self.rail5_checkouts {
            t.rail5_checkouts
                .insert(checkout.checkout_id.clone(), checkout);
        }
        for record in self.owner_billing {
            t.owner_billing.insert(record.owner_id.clone(), record);
        }
        for settlement in self.settlements {
            t.settlements
                .insert(settlement.subject_id.clone(), settlement);
        }
        let max_seq = t.audit.iter().map(|r| r.seq).max().unwrap_or(0);
        t.next_seq = t.next_seq.max(max_seq);
        Ok(t)
    }
}

impl CardVaultStore {
    /// Writes the full table set to `path` (tmp file + rename).
    pub fn save_snapshot(&self, path: &Path) -> Result<(), SnapshotError> {
        let doc = {
            let t = self.tables.lock();
            SnapshotDocument::from_tables(&t)
        };
        let data = serde_json::to_vec_pretty(&doc)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        atomic_write(path, &data)
    }

    /// Loads a snapshot; a missing file yields an empty store.
    pub fn load_snapshot(path: &Path) -> Result<Self, SnapshotError> {
        if !path.exists() {
            return Ok(Self::new_in_memory());
        }
        let raw = fs::read(path)?;
        let doc: SnapshotDocument = serde_json::from_slice(&raw)?;
        Ok(Self {
            tables: Mutex::new(doc.into_tables()?),
        })
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), SnapshotError> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    fs::write(&tmp, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(tmp, path)?;
    Ok(())
}
