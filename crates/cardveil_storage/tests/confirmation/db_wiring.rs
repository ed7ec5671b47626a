#![forbid(unsafe_code)]

use cardveil_kernel_contracts::card::{
    AllowanceDuration, CurrencyCode, HumanPermissionPolicy, MissingDigitPositions, ProfileIndex,
    ProfilePermission, ProfileSlot, SealedSecret, SplitCardRecord,
};
use cardveil_kernel_contracts::confirmation::{ConfirmationInput, ConfirmationStatus};
use cardveil_kernel_contracts::ids::{BotId, CardId, OwnerId};
use cardveil_kernel_contracts::obfuscation::{MerchantDescriptor, PurchaseSpec};
use cardveil_kernel_contracts::ReasonCodeId;
use cardveil_storage::repo::{AllowanceRepo, ConfirmationRepo, SplitCardRepo};
use cardveil_storage::{CardVaultStore, StorageError};
use chrono::{DateTime, Duration, TimeZone, Utc};

const RC: ReasonCodeId = ReasonCodeId(0x4442_0003);
const CAP: usize = 3;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 10, 15, 0, 0).unwrap()
}

fn window() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()
}

fn owner() -> OwnerId {
    OwnerId::new("owner_dbw_conf").unwrap()
}

fn bot() -> BotId {
    BotId::new("bot_dbw_conf").unwrap()
}

fn card_id() -> CardId {
    CardId::new("card_conf").unwrap()
}

fn idx(n: u8) -> ProfileIndex {
    ProfileIndex::new(n).unwrap()
}

fn active_store() -> CardVaultStore {
    let s = CardVaultStore::new_in_memory();
    let record = SplitCardRecord::v1(
        card_id(),
        owner(),
        Some(bot()),
        3,
        idx(1),
        MissingDigitPositions::new([0, 5, 15]).unwrap(),
        "b".repeat(64),
        t0(),
    )
    .unwrap();
    let slots = (1..=3)
        .map(|n| ProfileSlot {
            card_id: card_id(),
            profile_index: idx(n),
            holder_name: None,
            holder_zip: None,
            sealed_secret: None,
            permission: ProfilePermission::v1(
                10_000,
                CurrencyCode::usd(),
                AllowanceDuration::Month,
                2_500,
                HumanPermissionPolicy::AboveExemptLimit,
            )
            .unwrap(),
        })
        .collect();
    s.split_card_initialize_row(record, slots, CAP, RC).unwrap();
    s.split_card_owner_data_row(
        t0(),
        &card_id(),
        &owner(),
        SealedSecret {
            nonce_b64: "bm9uY2U=".to_string(),
            ciphertext_b64: "Y2lwaGVy".to_string(),
        },
        "Pat Owner".to_string(),
        "94110".to_string(),
        RC,
    )
    .unwrap();
    s
}

fn input(amount_cents: u64) -> ConfirmationInput {
    ConfirmationInput {
        card_id: card_id(),
        bot_id: bot(),
        profile_index: idx(1),
        purchase: PurchaseSpec::v1(
            MerchantDescriptor::v1(
                "Harbor Outfitters".to_string(),
                "harbor-outfitters".to_string(),
                "https://harbor-outfitters.example".to_string(),
            )
            .unwrap(),
            "Rain shell".to_string(),
            amount_cents,
        )
        .unwrap(),
        created_at: t0(),
        expires_at: t0() + Duration::minutes(15),
    }
}

#[test]
fn at_conf_db_01_auto_approval_books_spend_in_same_unit() {
    let s = active_store();
    let conf = s
        .insert_confirmation_row(
            input(1_000),
            |_| window(),
            |_, _| Ok(ConfirmationStatus::Approved),
            RC,
        )
        .unwrap();
    assert_eq!(conf.status, ConfirmationStatus::Approved);
    assert_eq!(conf.decided_at, Some(t0()));
    assert_eq!(s.allowance_spent_row(&card_id(), idx(1), window()), 1_000);
}

#[test]
fn at_conf_db_02_decide_rechecks_allowance() {
    let s = active_store();
    let pending = s
        .insert_confirmation_row(
            input(6_000),
            |_| window(),
            |_, _| Ok(ConfirmationStatus::Pending),
            RC,
        )
        .unwrap();
    s.allowance_spend_row(&card_id(), idx(1), 5_000, true, |_| window())
        .unwrap();
    let out = s.decide_confirmation_row(
        t0() + Duration::minutes(1),
        &pending.confirmation_id,
        &owner(),
        true,
        |_| window(),
        RC,
    );
    assert!(matches!(
        out,
        Err(StorageError::LimitExceeded {
            remaining_cents: 5_000,
            ..
        })
    ));
    let denied = s
        .decide_confirmation_row(
            t0() + Duration::minutes(2),
            &pending.confirmation_id,
            &owner(),
            false,
            |_| window(),
            RC,
        )
        .unwrap();
    assert_eq!(denied.status, ConfirmationStatus::Denied);
    assert_eq!(s.allowance_spent_row(&card_id(), idx(1), window()), 5_000);
}

#[test]
fn at_conf_db_03_expiry_is_lazy_and_terminal() {
    let s = active_store();
    let pending = s
        .insert_confirmation_row(
            input(3_000),
            |_| window(),
            |_, _| Ok(ConfirmationStatus::Pending),
            RC,
        )
        .unwrap();
    let at_deadline = s
        .confirmation_row(pending.expires_at, &pending.confirmation_id)
        .unwrap();
    assert_eq!(at_deadline.status, ConfirmationStatus::Pending);

    let late = pending.expires_at + Duration::seconds(1);
    assert_eq!(
        s.confirmation_row(late, &pending.confirmation_id)
            .unwrap()
            .status,
        ConfirmationStatus::Expired
    );
    assert!(matches!(
        s.decide_confirmation_row(late, &pending.confirmation_id, &owner(), true, |_| window(), RC),
        Err(StorageError::Expired { .. })
    ));
}

#[test]
fn at_conf_db_04_sweep_expires_only_overdue_rows() {
    let s = active_store();
    for _ in 0..3 {
        s.insert_confirmation_row(
            input(100),
            |_| window(),
            |_, _| Ok(ConfirmationStatus::Pending),
            RC,
        )
        .unwrap();
    }
    assert_eq!(s.sweep_expired_rows(t0() + Duration::minutes(5)), 0);
    assert_eq!(s.sweep_expired_rows(t0() + Duration::minutes(16)), 3);
    assert_eq!(s.sweep_expired_rows(t0() + Duration::minutes(17)), 0);
}

#[test]
fn at_conf_db_05_foreign_owner_cannot_decide() {
    let s = active_store();
    let pending = s
        .insert_confirmation_row(
            input(3_000),
            |_| window(),
            |_, _| Ok(ConfirmationStatus::Pending),
            RC,
        )
        .unwrap();
    let stranger = OwnerId::new("owner_stranger").unwrap();
    assert!(matches!(
        s.decide_confirmation_row(t0(), &pending.confirmation_id, &stranger, true, |_| window(), RC),
        Err(StorageError::NotFound { .. })
    ));
}
