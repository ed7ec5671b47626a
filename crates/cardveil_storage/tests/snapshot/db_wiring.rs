#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use cardveil_kernel_contracts::card::{
    AllowanceDuration, CurrencyCode, HumanPermissionPolicy, MissingDigitPositions, ProfileIndex,
    ProfilePermission, ProfileSlot, SplitCardRecord,
};
use cardveil_kernel_contracts::ids::{BotId, CardId, OwnerId};
use cardveil_kernel_contracts::obfuscation::{
    EventOrigin, MerchantDescriptor, ObfuscationEventInput, PurchaseSpec,
};
use cardveil_kernel_contracts::ReasonCodeId;
use cardveil_storage::repo::{AllowanceRepo, AuditRepo, ObfuscationRepo, SplitCardRepo};
use cardveil_storage::{CardVaultStore, StorageError};
use chrono::{DateTime, TimeZone, Utc};

const RC: ReasonCodeId = ReasonCodeId(0x4442_0005);
const CAP: usize = 3;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 3, 8, 30, 0).unwrap()
}

fn temp_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir()
        .join(format!("cardveil_snapshot_{name}_{nanos}"))
        .join("vault.json")
}

fn populated() -> CardVaultStore {
    let s = CardVaultStore::new_in_memory();
    let card_id = CardId::new("card_snap").unwrap();
    let record = SplitCardRecord::v1(
        card_id.clone(),
        OwnerId::new("owner_snap").unwrap(),
        Some(BotId::new("bot_snap").unwrap()),
        3,
        ProfileIndex::new(3).unwrap(),
        MissingDigitPositions::new([1, 2, 3]).unwrap(),
        "c".repeat(64),
        t0(),
    )
    .unwrap();
    let slots = (1..=3)
        .map(|n| ProfileSlot {
            card_id: card_id.clone(),
            profile_index: ProfileIndex::new(n).unwrap(),
            holder_name: None,
            holder_zip: None,
            sealed_secret: None,
            permission: ProfilePermission::v1(
                9_000,
                CurrencyCode::usd(),
                AllowanceDuration::Week,
                0,
                HumanPermissionPolicy::None,
            )
            .unwrap(),
        })
        .collect();
    s.split_card_initialize_row(record, slots, CAP, RC).unwrap();
    s.allowance_spend_row(&card_id, ProfileIndex::new(2).unwrap(), 700, true, |_| t0())
        .unwrap();
    s.insert_event_if_idle_row(
        ObfuscationEventInput {
            bot_id: BotId::new("bot_snap").unwrap(),
            card_id,
            profile_index: ProfileIndex::new(2).unwrap(),
            purchase: PurchaseSpec::v1(
                MerchantDescriptor::v1(
                    "Cinder Coffee".to_string(),
                    "cinder-coffee".to_string(),
                    "https://cinder-coffee.example".to_string(),
                )
                .unwrap(),
                "Whole beans".to_string(),
                1_850,
            )
            .unwrap(),
            origin: EventOrigin::Decoy,
            occurred_at: t0(),
        },
        RC,
    )
    .unwrap();
    s
}

#[test]
fn at_snapshot_db_01_round_trip_rebuilds_pending_index() {
    let path = temp_path("round_trip");
    let s = populated();
    s.save_snapshot(&path).unwrap();

    let loaded = CardVaultStore::load_snapshot(&path).unwrap();
    let bot = BotId::new("bot_snap").unwrap();
    assert!(loaded.pending_event_row(&bot).is_some());
    assert_eq!(
        loaded.allowance_spent_row(
            &CardId::new("card_snap").unwrap(),
            ProfileIndex::new(2).unwrap(),
            t0()
        ),
        700
    );
    assert_eq!(loaded.audit_rows(), s.audit_rows());

    // The pending guard survives the reload.
    let again = loaded.insert_event_if_idle_row(
        ObfuscationEventInput {
            bot_id: bot,
            card_id: CardId::new("card_snap").unwrap(),
            profile_index: ProfileIndex::new(1).unwrap(),
            purchase: loaded
                .event_rows_since(&BotId::new("bot_snap").unwrap(), t0())
                .remove(0)
                .purchase,
            origin: EventOrigin::Decoy,
            occurred_at: t0(),
        },
        RC,
    );
    assert!(matches!(again, Err(StorageError::StateConflict { .. })));
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn at_snapshot_db_02_missing_file_loads_empty_store() {
    let path = temp_path("missing");
    let loaded = CardVaultStore::load_snapshot(&path).unwrap();
    assert!(loaded.audit_rows().is_empty());
}

#[test]
fn at_snapshot_db_03_rejects_unknown_format_version() {
    let path = temp_path("version");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        &path,
        br#"{"format_version":99,"next_seq":0,"split_cards":[],"profile_slots":[],
            "allowance_usage":[],"events":[],"real_purchases":[],"confirmations":[],
            "rail5_cards":[],"rail5_checkouts":[],"audit":[]}"#,
    )
    .unwrap();
    assert!(CardVaultStore::load_snapshot(&path).is_err());
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}
