#![forbid(unsafe_code)]

use cardveil_kernel_contracts::audit::AuditSubjectKind;
use cardveil_kernel_contracts::card::{
    AllowanceDuration, CurrencyCode, HumanPermissionPolicy, MissingDigitPositions, ProfileIndex,
    ProfilePermission, ProfilePermissionPatch, ProfileSlot, SealedSecret, SplitCardRecord,
    SplitCardStatus,
};
use cardveil_kernel_contracts::ids::{BotId, CardId, OwnerId};
use cardveil_kernel_contracts::ReasonCodeId;
use cardveil_storage::repo::{AllowanceRepo, AuditRepo, SplitCardRepo};
use cardveil_storage::{CardVaultStore, StorageError};
use chrono::{DateTime, TimeZone, Utc};

const RC: ReasonCodeId = ReasonCodeId(0x4442_0001);
const CAP: usize = 3;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
}

fn owner() -> OwnerId {
    OwnerId::new("owner_dbw_1").unwrap()
}

fn bot(n: u8) -> BotId {
    BotId::new(format!("bot_dbw_{n}")).unwrap()
}

fn idx(n: u8) -> ProfileIndex {
    ProfileIndex::new(n).unwrap()
}

fn permission(allowance: u64) -> ProfilePermission {
    ProfilePermission::v1(
        allowance,
        CurrencyCode::usd(),
        AllowanceDuration::Month,
        0,
        HumanPermissionPolicy::None,
    )
    .unwrap()
}

fn card(id: &str, bot_id: Option<BotId>) -> (SplitCardRecord, Vec<ProfileSlot>) {
    card_of(owner(), id, bot_id)
}

fn card_of(
    owner_id: OwnerId,
    id: &str,
    bot_id: Option<BotId>,
) -> (SplitCardRecord, Vec<ProfileSlot>) {
    let card_id = CardId::new(id).unwrap();
    let record = SplitCardRecord::v1(
        card_id.clone(),
        owner_id,
        bot_id,
        3,
        idx(2),
        MissingDigitPositions::new([6, 7, 8]).unwrap(),
        "a".repeat(64),
        t0(),
    )
    .unwrap();
    let slots = (1..=3)
        .map(|n| ProfileSlot {
            card_id: card_id.clone(),
            profile_index: idx(n),
            holder_name: None,
            holder_zip: None,
            sealed_secret: None,
            permission: permission(10_000),
        })
        .collect();
    (record, slots)
}

fn sealed() -> SealedSecret {
    SealedSecret {
        nonce_b64: "bm9uY2U=".to_string(),
        ciphertext_b64: "Y2lwaGVy".to_string(),
    }
}

#[test]
fn at_split_card_db_01_initialize_replaces_pending_and_blocks_active() {
    let s = CardVaultStore::new_in_memory();
    let (first, slots) = card("card_a", Some(bot(1)));
    s.split_card_initialize_row(first, slots, CAP, RC).unwrap();

    let (second, slots) = card("card_b", Some(bot(1)));
    let out = s.split_card_initialize_row(second, slots, CAP, RC).unwrap();
    assert_eq!(out.replaced_pending, vec![CardId::new("card_a").unwrap()]);
    assert!(s.split_card_row(&CardId::new("card_a").unwrap()).is_none());

    s.split_card_owner_data_row(
        t0(),
        &CardId::new("card_b").unwrap(),
        &owner(),
        sealed(),
        "Pat Owner".to_string(),
        "94110".to_string(),
        RC,
    )
    .unwrap();

    let (third, slots) = card("card_c", Some(bot(1)));
    assert!(matches!(
        s.split_card_initialize_row(third, slots, CAP, RC),
        Err(StorageError::StateConflict { .. })
    ));
}

#[test]
fn at_split_card_db_02_owner_data_is_one_way() {
    let s = CardVaultStore::new_in_memory();
    let (record, slots) = card("card_a", None);
    let card_id = record.card_id.clone();
    s.split_card_initialize_row(record, slots, CAP, RC).unwrap();

    let rec = s
        .split_card_owner_data_row(
            t0(),
            &card_id,
            &owner(),
            sealed(),
            "Pat Owner".to_string(),
            "94110".to_string(),
            RC,
        )
        .unwrap();
    assert_eq!(rec.status, SplitCardStatus::AwaitingBot);
    let real = s
        .profile_slot_rows(&card_id)
        .into_iter()
        .find(|slot| slot.profile_index == idx(2))
        .unwrap();
    assert_eq!(real.sealed_secret, Some(sealed()));

    let again = s.split_card_owner_data_row(
        t0(),
        &card_id,
        &owner(),
        sealed(),
        "Pat Owner".to_string(),
        "94110".to_string(),
        RC,
    );
    assert!(matches!(again, Err(StorageError::StateConflict { .. })));
}

#[test]
fn at_split_card_db_03_link_bot_enforces_capacity() {
    let s = CardVaultStore::new_in_memory();
    for n in 0..4 {
        let (record, slots) = card(&format!("card_{n}"), None);
        let card_id = record.card_id.clone();
        s.split_card_initialize_row(record, slots, CAP, RC).unwrap();
        s.split_card_owner_data_row(
            t0(),
            &card_id,
            &owner(),
            sealed(),
            "Pat Owner".to_string(),
            "94110".to_string(),
            RC,
        )
        .unwrap();
        let linked = s.split_card_link_bot_row(t0(), &card_id, &owner(), bot(7), 3, RC);
        if n < 3 {
            assert_eq!(linked.unwrap().status, SplitCardStatus::Active);
        } else {
            assert!(matches!(linked, Err(StorageError::CapacityExceeded { max: 3, .. })));
        }
    }
    assert_eq!(s.split_card_rows_for_bot(&bot(7)).len(), 3);
    assert_eq!(s.bots_with_active_split_cards(), vec![bot(7)]);
}

#[test]
fn at_split_card_db_04_foreign_owner_sees_not_found() {
    let s = CardVaultStore::new_in_memory();
    let (record, slots) = card("card_a", Some(bot(1)));
    let card_id = record.card_id.clone();
    s.split_card_initialize_row(record, slots, CAP, RC).unwrap();
    let stranger = OwnerId::new("owner_other").unwrap();
    assert!(matches!(
        s.split_card_freeze_row(t0(), &card_id, &stranger, true, RC),
        Err(StorageError::NotFound { .. })
    ));
    assert!(matches!(
        s.split_card_delete_row(t0(), &card_id, &stranger, RC),
        Err(StorageError::NotFound { .. })
    ));
}

#[test]
fn at_split_card_db_05_only_real_permission_is_editable() {
    let s = CardVaultStore::new_in_memory();
    let (record, slots) = card("card_a", Some(bot(1)));
    let card_id = record.card_id.clone();
    s.split_card_initialize_row(record, slots, CAP, RC).unwrap();
    let patch = ProfilePermissionPatch {
        allowance_value_cents: Some(20_000),
        ..ProfilePermissionPatch::default()
    };
    assert!(matches!(
        s.split_card_permission_row(t0(), &card_id, &owner(), idx(1), &patch, RC),
        Err(StorageError::StateConflict { .. })
    ));
    let next = s
        .split_card_permission_row(t0(), &card_id, &owner(), idx(2), &patch, RC)
        .unwrap();
    assert_eq!(next.allowance_value_cents, 20_000);
}

#[test]
fn at_split_card_db_06_allowance_spend_respects_limit_and_audit_is_ordered() {
    let s = CardVaultStore::new_in_memory();
    let (record, slots) = card("card_a", Some(bot(1)));
    let card_id = record.card_id.clone();
    s.split_card_initialize_row(record, slots, CAP, RC).unwrap();

    let window = t0();
    assert_eq!(
        s.allowance_spend_row(&card_id, idx(1), 6_000, true, |_| window)
            .unwrap(),
        6_000
    );
    assert!(matches!(
        s.allowance_spend_row(&card_id, idx(1), 6_000, true, |_| window),
        Err(StorageError::LimitExceeded {
            remaining_cents: 4_000,
            ..
        })
    ));
    assert_eq!(s.allowance_spent_row(&card_id, idx(1), window), 6_000);
    assert_eq!(s.allowance_spent_row(&card_id, idx(2), window), 0);

    s.split_card_freeze_row(t0(), &card_id, &owner(), true, RC)
        .unwrap_err();
    let rows = s.audit_rows_for_subject(card_id.as_str());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].subject_kind, AuditSubjectKind::SplitCard);
    let all = s.audit_rows();
    assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[test]
fn at_split_card_db_07_initialize_for_a_bot_counts_against_its_capacity() {
    let s = CardVaultStore::new_in_memory();
    for n in 0..5u8 {
        let owner_n = OwnerId::new(format!("owner_cap_{n}")).unwrap();
        let (record, slots) = card_of(owner_n, &format!("card_cap_{n}"), Some(bot(9)));
        let created = s.split_card_initialize_row(record, slots, CAP, RC);
        if n < 3 {
            created.unwrap();
        } else {
            assert!(matches!(
                created,
                Err(StorageError::CapacityExceeded { max: 3, .. })
            ));
        }
    }
    assert_eq!(s.split_card_rows_for_bot(&bot(9)).len(), 3);

    // Re-initializing a pending card replaces it instead of counting twice.
    let (record, slots) = card("card_full_a", Some(bot(10)));
    s.split_card_initialize_row(record, slots, 1, RC).unwrap();
    let (record, slots) = card("card_full_b", Some(bot(10)));
    let out = s.split_card_initialize_row(record, slots, 1, RC).unwrap();
    assert_eq!(out.replaced_pending, vec![CardId::new("card_full_a").unwrap()]);
}
