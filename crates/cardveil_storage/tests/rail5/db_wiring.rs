#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;

use cardveil_kernel_contracts::ids::{BotId, CardId, OwnerId};
use cardveil_kernel_contracts::obfuscation::{MerchantDescriptor, PurchaseSpec};
use cardveil_kernel_contracts::rail5::{
    CheckoutOutcome, KeyMaterial, Rail5Card, Rail5CardStatus, Rail5CheckoutInput,
    Rail5CheckoutStatus, Rail5Limits,
};
use cardveil_kernel_contracts::ReasonCodeId;
use cardveil_storage::repo::Rail5Repo;
use cardveil_storage::{CardVaultStore, StorageError};
use chrono::{DateTime, Duration, TimeZone, Utc};

const RC: ReasonCodeId = ReasonCodeId(0x4442_0004);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 15, 10, 0, 0).unwrap()
}

fn day_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 15, 0, 0, 0).unwrap()
}

fn month_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap()
}

fn owner() -> OwnerId {
    OwnerId::new("owner_dbw_r5").unwrap()
}

fn bot() -> BotId {
    BotId::new("bot_dbw_r5").unwrap()
}

fn card_id() -> CardId {
    CardId::new("r5card_1").unwrap()
}

fn material() -> KeyMaterial {
    KeyMaterial::v1("ab".repeat(32), "cd".repeat(12), "ef".repeat(16)).unwrap()
}

fn active_store() -> CardVaultStore {
    let s = CardVaultStore::new_in_memory();
    let card = Rail5Card::v1(
        card_id(),
        owner(),
        "visa".to_string(),
        "4242".to_string(),
        Rail5Limits::v1(5_000, 10_000, 50_000, 2_000).unwrap(),
        t0(),
    )
    .unwrap();
    s.insert_rail5_card_row(card, RC).unwrap();
    let active = s
        .rail5_key_material_row(t0(), &card_id(), &owner(), material(), RC)
        .unwrap();
    assert_eq!(active.status, Rail5CardStatus::Active);
    s.rail5_link_bot_row(t0(), &card_id(), &owner(), bot(), RC)
        .unwrap();
    s
}

fn input(amount_cents: u64) -> Rail5CheckoutInput {
    Rail5CheckoutInput {
        card_id: card_id(),
        bot_id: bot(),
        purchase: PurchaseSpec::v1(
            MerchantDescriptor::v1(
                "Meridian Audio".to_string(),
                "meridian-audio".to_string(),
                "https://meridian-audio.example".to_string(),
            )
            .unwrap(),
            "Headphones".to_string(),
            amount_cents,
        )
        .unwrap(),
        created_at: t0(),
        expires_at: t0() + Duration::minutes(15),
    }
}

#[test]
fn at_r5_db_01_key_material_is_accepted_once() {
    let s = active_store();
    assert!(matches!(
        s.rail5_key_material_row(t0(), &card_id(), &owner(), material(), RC),
        Err(StorageError::StateConflict { .. })
    ));
}

#[test]
fn at_r5_db_02_reservations_count_pending_and_approved() {
    let s = active_store();
    s.insert_rail5_checkout_row(
        input(4_000),
        day_start(),
        month_start(),
        |_, _, _| Ok(Rail5CheckoutStatus::Pending),
        RC,
    )
    .unwrap();
    s.insert_rail5_checkout_row(
        input(3_000),
        day_start(),
        month_start(),
        |_, _, _| Ok(Rail5CheckoutStatus::Approved),
        RC,
    )
    .unwrap();
    let mut seen = (0, 0);
    s.insert_rail5_checkout_row(
        input(1_000),
        day_start(),
        month_start(),
        |_, today, month| {
            seen = (today, month);
            Ok(Rail5CheckoutStatus::Denied)
        },
        RC,
    )
    .unwrap();
    assert_eq!(seen, (7_000, 7_000));
}

#[test]
fn at_r5_db_03_key_delivery_is_single_shot_and_confirm_follows() {
    let s = active_store();
    let checkout = s
        .insert_rail5_checkout_row(
            input(1_500),
            day_start(),
            month_start(),
            |_, _, _| Ok(Rail5CheckoutStatus::Approved),
            RC,
        )
        .unwrap();
    assert!(matches!(
        s.confirm_rail5_checkout_row(t0(), &checkout.checkout_id, &bot(), CheckoutOutcome::Success, RC),
        Err(StorageError::StateConflict { .. })
    ));
    let key = s
        .deliver_rail5_key_row(t0(), &checkout.checkout_id, &bot(), RC)
        .unwrap();
    assert_eq!(key, material());
    assert!(matches!(
        s.deliver_rail5_key_row(t0(), &checkout.checkout_id, &bot(), RC),
        Err(StorageError::AlreadyConsumed { .. })
    ));
    let confirmed = s
        .confirm_rail5_checkout_row(t0(), &checkout.checkout_id, &bot(), CheckoutOutcome::Success, RC)
        .unwrap();
    assert_eq!(confirmed.confirmed_outcome, Some(CheckoutOutcome::Success));
    assert!(matches!(
        s.confirm_rail5_checkout_row(t0(), &checkout.checkout_id, &bot(), CheckoutOutcome::Failed, RC),
        Err(StorageError::AlreadyConsumed { .. })
    ));
}

#[test]
fn at_r5_db_04_pending_checkout_withholds_key_until_approved() {
    let s = active_store();
    let checkout = s
        .insert_rail5_checkout_row(
            input(4_000),
            day_start(),
            month_start(),
            |_, _, _| Ok(Rail5CheckoutStatus::Pending),
            RC,
        )
        .unwrap();
    assert!(matches!(
        s.deliver_rail5_key_row(t0(), &checkout.checkout_id, &bot(), RC),
        Err(StorageError::StateConflict { .. })
    ));
    s.decide_rail5_checkout_row(t0(), &checkout.checkout_id, &owner(), true, RC)
        .unwrap();
    assert!(s
        .deliver_rail5_key_row(t0(), &checkout.checkout_id, &bot(), RC)
        .is_ok());
}

#[test]
fn at_r5_db_05_concurrent_key_delivery_has_one_winner() {
    let s = Arc::new(active_store());
    let checkout = s
        .insert_rail5_checkout_row(
            input(1_000),
            day_start(),
            month_start(),
            |_, _, _| Ok(Rail5CheckoutStatus::Approved),
            RC,
        )
        .unwrap();
    let handles: Vec<_> = (0..12)
        .map(|_| {
            let s = Arc::clone(&s);
            let id = checkout.checkout_id.clone();
            thread::spawn(move || s.deliver_rail5_key_row(t0(), &id, &bot(), RC).is_ok())
        })
        .collect();
    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(wins, 1);
}

#[test]
fn at_r5_db_06_second_card_for_bot_is_rejected() {
    let s = active_store();
    let other = Rail5Card::v1(
        CardId::new("r5card_2").unwrap(),
        owner(),
        "visa".to_string(),
        "1111".to_string(),
        Rail5Limits::v1(5_000, 10_000, 50_000, 2_000).unwrap(),
        t0(),
    )
    .unwrap();
    s.insert_rail5_card_row(other, RC).unwrap();
    assert!(matches!(
        s.rail5_link_bot_row(t0(), &CardId::new("r5card_2").unwrap(), &owner(), bot(), RC),
        Err(StorageError::DuplicateKey { .. })
    ));
}

#[test]
fn at_r5_db_07_relinked_card_stops_releasing_to_previous_bot() {
    let s = active_store();
    let checkout = s
        .insert_rail5_checkout_row(
            input(1_200),
            day_start(),
            month_start(),
            |_, _, _| Ok(Rail5CheckoutStatus::Approved),
            RC,
        )
        .unwrap();
    let next_bot = BotId::new("bot_dbw_r5_next").unwrap();
    s.rail5_link_bot_row(t0(), &card_id(), &owner(), next_bot.clone(), RC)
        .unwrap();
    assert!(matches!(
        s.deliver_rail5_key_row(t0(), &checkout.checkout_id, &bot(), RC),
        Err(StorageError::NotFound { .. })
    ));
    assert!(matches!(
        s.deliver_rail5_key_row(t0(), &checkout.checkout_id, &next_bot, RC),
        Err(StorageError::NotFound { .. })
    ));
    let row = s.rail5_checkout_row(t0(), &checkout.checkout_id).unwrap();
    assert!(!row.key_delivered);
}

#[test]
fn at_r5_db_08_reverted_delivery_can_be_retried_once() {
    let s = active_store();
    let checkout = s
        .insert_rail5_checkout_row(
            input(900),
            day_start(),
            month_start(),
            |_, _, _| Ok(Rail5CheckoutStatus::Approved),
            RC,
        )
        .unwrap();
    assert!(matches!(
        s.revert_rail5_key_delivery_row(t0(), &checkout.checkout_id, RC),
        Err(StorageError::StateConflict { .. })
    ));
    s.deliver_rail5_key_row(t0(), &checkout.checkout_id, &bot(), RC)
        .unwrap();
    let reverted = s
        .revert_rail5_key_delivery_row(t0(), &checkout.checkout_id, RC)
        .unwrap();
    assert!(!reverted.key_delivered);
    assert_eq!(
        s.deliver_rail5_key_row(t0(), &checkout.checkout_id, &bot(), RC)
            .unwrap(),
        material()
    );
    assert!(matches!(
        s.deliver_rail5_key_row(t0(), &checkout.checkout_id, &bot(), RC),
        Err(StorageError::AlreadyConsumed { .. })
    ));
}
