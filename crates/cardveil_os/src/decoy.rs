#![forbid(unsafe_code)]

use cardveil_engines::decoy::{decide_need, synthesize_purchase, DecoyHistory, DecoyPolicy};
use cardveil_engines::limits::LimitKind;
use cardveil_kernel_contracts::card::{ProfileIndex, SplitCardRecord, SplitCardStatus};
use cardveil_kernel_contracts::confirmation::ConfirmationStatus;
use cardveil_kernel_contracts::ids::{BotId, EventId};
use cardveil_kernel_contracts::obfuscation::{EventOrigin, ObfuscationEvent, ObfuscationEventInput};
use cardveil_storage::{CardVaultStore, StorageError};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::allowance::AllowanceLedger;
use crate::error::CoreError;
use crate::keyed_lock::KeyedLocks;

pub mod reason_codes {
    use cardveil_kernel_contracts::ReasonCodeId;

    // Decoy scheduler reason-code namespace.
    pub const DECOY_OK_EVENT_CREATED: ReasonCodeId = ReasonCodeId(0x4443_0001);
    pub const DECOY_OK_EVENT_COMPLETED: ReasonCodeId = ReasonCodeId(0x4443_0002);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoyNeed {
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub bot_id: BotId,
    pub needed: u32,
    pub created: u32,
}

#[derive(Debug, Clone)]
pub struct DecoyRuntime {
    policy: DecoyPolicy,
    ledger: AllowanceLedger,
}

impl DecoyRuntime {
    pub fn new(policy: DecoyPolicy) -> Self {
        Self {
            policy,
            ledger: AllowanceLedger,
        }
    }

    pub fn policy(&self) -> &DecoyPolicy {
        &self.policy
    }

    pub fn pending_events(&self, store: &CardVaultStore, bot_id: &BotId) -> Vec<ObfuscationEvent> {
        store.event_pending_for_bot(bot_id).into_iter().collect()
    }

    /// Activity over the trailing window. Real purchases are approved confirmations on a
    /// card's real profile plus dispatched real-purchase events.
    pub fn history(&self, store: &CardVaultStore, bot_id: &BotId, now: DateTime<Utc>) -> DecoyHistory {
        let since = now - self.policy.trailing_window();
        let cards = store.split_cards_for_bot(bot_id);
        let events = store.events_for_bot_since(bot_id, since);

        let mut history = DecoyHistory {
            pending_event: store.event_pending_for_bot(bot_id).is_some(),
            ..DecoyHistory::default()
        };
        for event in &events {
            match event.origin {
                EventOrigin::Decoy => history.decoy_events_in_window += 1,
                EventOrigin::RealPurchase => history.real_purchases_in_window += 1,
            }
            bump(
                &mut history.last_activity_at,
                event.completed_at.unwrap_or(event.occurred_at),
            );
        }
        for confirmation in store.confirmations_for_bot(bot_id) {
            if confirmation.created_at < since {
                continue;
            }
            let on_real = cards.iter().any(|c| {
                c.card_id == confirmation.card_id && c.real_profile_index == confirmation.profile_index
            });
            if on_real && confirmation.status == ConfirmationStatus::Approved {
                history.real_purchases_in_window += 1;
            }
            bump(&mut history.last_activity_at, confirmation.created_at);
        }
        history
    }

    /// Zero while an event is pending or the bot has no active card.
    pub fn decide_obfuscation_need(
        &self,
        store: &CardVaultStore,
        bot_id: &BotId,
        now: DateTime<Utc>,
    ) -> DecoyNeed {
        if active_cards(store, bot_id).is_empty() {
            return DecoyNeed { count: 0 };
        }
        let history = self.history(store, bot_id, now);
        let count = decide_need(&self.policy, &history, now);
        debug!(bot_id = %bot_id, count, "obfuscation need");
        DecoyNeed { count }
    }

    /// Manufactures one pending decoy event on a fake profile of one of the bot's
    /// active cards. Fails without side effects if the bot already has a pending event.
    pub fn create_event(
        &self,
        store: &CardVaultStore,
        bot_id: &BotId,
        profile_index: Option<ProfileIndex>,
        now: DateTime<Utc>,
    ) -> Result<ObfuscationEvent, CoreError> {
        let mut rng = rand::thread_rng();
        let mut cards = active_cards(store, bot_id);
        if cards.is_empty() {
            return Err(CoreError::NotFound);
        }
        cards.shuffle(&mut rng);

        let mut best_remaining = 0;
        for card in &cards {
            let mut candidates = fake_profiles(card);
            if let Some(requested) = profile_index {
                if requested == card.real_profile_index {
                    return Err(CoreError::invalid_state("decoy_on_real_profile"));
                }
                candidates.retain(|p| *p == requested);
            }
            candidates.shuffle(&mut rng);
            for candidate in candidates {
                let remaining = self
                    .ledger
                    .remaining(store, &card.card_id, candidate, now)?
                    .remaining_cents;
                best_remaining = best_remaining.max(remaining);
                let Some(purchase) =
                    synthesize_purchase(&mut rng, &card.card_id, candidate, remaining)?
                else {
                    continue;
                };
                let event = store
                    .event_insert_if_idle_commit(
                        ObfuscationEventInput {
                            bot_id: bot_id.clone(),
                            card_id: card.card_id.clone(),
                            profile_index: candidate,
                            purchase,
                            origin: EventOrigin::Decoy,
                            occurred_at: now,
                        },
                        reason_codes::DECOY_OK_EVENT_CREATED,
                    )
                    .map_err(pending_conflict)?;
                debug!(event_id = %event.event_id, bot_id = %bot_id, "decoy event created");
                return Ok(event);
            }
        }
        Err(CoreError::LimitExceeded {
            limit: LimitKind::Allowance,
            remaining_cents: best_remaining,
        })
    }

    /// `Pending -> Completed` once, by the owning bot.
    pub fn complete_event(
        &self,
        store: &CardVaultStore,
        bot_id: &BotId,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<ObfuscationEvent, CoreError> {
        let event = store.event_complete_commit(
            now,
            bot_id,
            event_id,
            reason_codes::DECOY_OK_EVENT_COMPLETED,
        )?;
        debug!(event_id = %event_id, "event completed");
        Ok(event)
    }

    /// One scheduling pass over every bot with an active card. Each bot's decision and
    /// insert run under that bot's lock.
    pub fn tick_all_active_bots(
        &self,
        store: &CardVaultStore,
        locks: &KeyedLocks<BotId>,
        now: DateTime<Utc>,
    ) -> Vec<TickOutcome> {
        let outcomes: Vec<TickOutcome> = store
            .bots_with_active_split_cards()
            .into_iter()
            .map(|bot_id| {
                locks.with_lock(&bot_id, || {
                    let needed = self.decide_obfuscation_need(store, &bot_id, now).count;
                    let mut created = 0;
                    for _ in 0..needed {
                        match self.create_event(store, &bot_id, None, now) {
                            Ok(_) => created += 1,
                            Err(err) => {
                                debug!(bot_id = %bot_id, code = err.code(), "decoy not created");
                                break;
                            }
                        }
                    }
                    TickOutcome {
                        bot_id: bot_id.clone(),
                        needed,
                        created,
                    }
                })
            })
            .collect();
        info!(
            bots = outcomes.len(),
            created = outcomes.iter().map(|o| o.created).sum::<u32>(),
            "decoy tick"
        );
        outcomes
    }
}

pub(crate) fn active_cards(store: &CardVaultStore, bot_id: &BotId) -> Vec<SplitCardRecord> {
    store
        .split_cards_for_bot(bot_id)
        .into_iter()
        .filter(|c| c.status == SplitCardStatus::Active)
        .collect()
}

fn fake_profiles(card: &SplitCardRecord) -> Vec<ProfileIndex> {
    (1..=card.profile_count)
        .filter_map(|n| ProfileIndex::new(n).ok())
        .filter(|p| *p != card.real_profile_index)
        .collect()
}

fn bump(slot: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) {
    if slot.map_or(true, |current| at > current) {
        *slot = Some(at);
    }
}

pub(crate) fn pending_conflict(err: StorageError) -> CoreError {
    match err {
        StorageError::StateConflict { state, .. } => CoreError::invalid_state(state),
        other => other.into(),
    }
}
