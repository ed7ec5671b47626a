#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;

use cardveil_kernel_contracts::card::ProfileIndex;
use cardveil_kernel_contracts::ids::{BotId, CardId, EventId, OwnerId};
use cardveil_kernel_contracts::obfuscation::{
    EventOrigin, MerchantDescriptor, ObfuscationEventInput, ObfuscationEventStatus, PurchaseSpec,
    RealPurchaseStatus,
};
use cardveil_kernel_contracts::ReasonCodeId;
use cardveil_storage::repo::ObfuscationRepo;
use cardveil_storage::{CardVaultStore, StorageError};
use chrono::{DateTime, Duration, TimeZone, Utc};

const RC: ReasonCodeId = ReasonCodeId(0x4442_0002);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()
}

fn bot() -> BotId {
    BotId::new("bot_dbw_obf").unwrap()
}

fn purchase(amount_cents: u64) -> PurchaseSpec {
    PurchaseSpec::v1(
        MerchantDescriptor::v1(
            "Lantern Books".to_string(),
            "lantern-books".to_string(),
            "https://lantern-books.example".to_string(),
        )
        .unwrap(),
        "Paperback".to_string(),
        amount_cents,
    )
    .unwrap()
}

fn input(origin: EventOrigin, at: DateTime<Utc>) -> ObfuscationEventInput {
    ObfuscationEventInput {
        bot_id: bot(),
        card_id: CardId::new("card_obf").unwrap(),
        profile_index: ProfileIndex::new(1).unwrap(),
        purchase: purchase(1_299),
        origin,
        occurred_at: at,
    }
}

#[test]
fn at_obf_db_01_single_pending_event_per_bot() {
    let s = CardVaultStore::new_in_memory();
    let first = s
        .insert_event_if_idle_row(input(EventOrigin::Decoy, t0()), RC)
        .unwrap();
    assert!(matches!(
        s.insert_event_if_idle_row(input(EventOrigin::Decoy, t0()), RC),
        Err(StorageError::StateConflict { .. })
    ));
    assert_eq!(s.pending_event_row(&bot()).unwrap().event_id, first.event_id);

    let done = s
        .complete_event_row(t0() + Duration::minutes(5), &bot(), &first.event_id, RC)
        .unwrap();
    assert_eq!(done.status, ObfuscationEventStatus::Completed);
    assert!(s.pending_event_row(&bot()).is_none());
    assert!(matches!(
        s.complete_event_row(t0(), &bot(), &first.event_id, RC),
        Err(StorageError::AlreadyConsumed { .. })
    ));
}

#[test]
fn at_obf_db_02_completion_is_bot_scoped() {
    let s = CardVaultStore::new_in_memory();
    let event = s
        .insert_event_if_idle_row(input(EventOrigin::Decoy, t0()), RC)
        .unwrap();
    let other = BotId::new("bot_someone_else").unwrap();
    assert!(matches!(
        s.complete_event_row(t0(), &other, &event.event_id, RC),
        Err(StorageError::NotFound { .. })
    ));
    let unknown = EventId::new("evt_missing").unwrap();
    assert!(matches!(
        s.complete_event_row(t0(), &bot(), &unknown, RC),
        Err(StorageError::NotFound { .. })
    ));
}

#[test]
fn at_obf_db_03_real_purchase_dispatch_is_atomic_with_event_insert() {
    let s = CardVaultStore::new_in_memory();
    let request = s
        .enqueue_real_purchase_row(
            t0(),
            OwnerId::new("owner_dbw_obf").unwrap(),
            bot(),
            purchase(4_500),
            RC,
        )
        .unwrap();
    assert_eq!(
        s.next_real_purchase_row(&bot()).unwrap().request_id,
        request.request_id
    );

    // A pending decoy blocks dispatch and leaves the request queued.
    let decoy = s
        .insert_event_if_idle_row(input(EventOrigin::Decoy, t0()), RC)
        .unwrap();
    assert!(s
        .dispatch_real_purchase_row(
            &request.request_id,
            input(EventOrigin::RealPurchase, t0()),
            RC
        )
        .is_err());
    assert_eq!(
        s.next_real_purchase_row(&bot()).unwrap().status,
        RealPurchaseStatus::Queued
    );

    s.complete_event_row(t0(), &bot(), &decoy.event_id, RC)
        .unwrap();
    let event = s
        .dispatch_real_purchase_row(
            &request.request_id,
            input(EventOrigin::RealPurchase, t0()),
            RC,
        )
        .unwrap();
    assert_eq!(event.origin, EventOrigin::RealPurchase);
    assert!(s.next_real_purchase_row(&bot()).is_none());
    assert!(matches!(
        s.dispatch_real_purchase_row(
            &request.request_id,
            input(EventOrigin::RealPurchase, t0()),
            RC
        ),
        Err(StorageError::AlreadyConsumed { .. })
    ));
}

#[test]
fn at_obf_db_04_concurrent_inserts_yield_one_pending_event() {
    let s = Arc::new(CardVaultStore::new_in_memory());
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let s = Arc::clone(&s);
            thread::spawn(move || {
                s.insert_event_if_idle_row(input(EventOrigin::Decoy, t0()), RC)
                    .is_ok()
            })
        })
        .collect();
    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(wins, 1);
    assert_eq!(s.event_rows_since(&bot(), t0()).len(), 1);
}
