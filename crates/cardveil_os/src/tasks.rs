#![forbid(unsafe_code)]

use cardveil_kernel_contracts::ids::{BotId, EventId, OwnerId};
use cardveil_kernel_contracts::obfuscation::{
    BotTask, EventOrigin, ObfuscationEvent, ObfuscationEventInput, PurchaseSpec,
    RealPurchaseRequest,
};
use cardveil_storage::CardVaultStore;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::decoy::{active_cards, pending_conflict, DecoyRuntime};
use crate::error::CoreError;
use crate::keyed_lock::KeyedLocks;

pub mod reason_codes {
    use cardveil_kernel_contracts::ReasonCodeId;

    // Bot task API reason-code namespace.
    pub const TASK_OK_REAL_QUEUED: ReasonCodeId = ReasonCodeId(0x5441_0001);
    pub const TASK_OK_REAL_DISPATCHED: ReasonCodeId = ReasonCodeId(0x5441_0002);
}

/// Single pull-based entry point for bots. Real and decoy work come out in the same
/// [`BotTask`] shape.
#[derive(Debug, Clone)]
pub struct TaskRuntime {
    decoy: DecoyRuntime,
}

impl TaskRuntime {
    pub fn new(decoy: DecoyRuntime) -> Self {
        Self { decoy }
    }

    pub fn queue_real_purchase(
        &self,
        store: &CardVaultStore,
        owner_id: &OwnerId,
        bot_id: &BotId,
        purchase: PurchaseSpec,
        now: DateTime<Utc>,
    ) -> Result<RealPurchaseRequest, CoreError> {
        if !active_cards(store, bot_id)
            .iter()
            .any(|c| &c.owner_id == owner_id)
        {
            return Err(CoreError::NotFound);
        }
        let request = store.real_purchase_enqueue_commit(
            now,
            owner_id.clone(),
            bot_id.clone(),
            purchase,
            reason_codes::TASK_OK_REAL_QUEUED,
        )?;
        debug!(request_id = %request.request_id, bot_id = %bot_id, "real purchase queued");
        Ok(request)
    }

    /// Pending event first, then the oldest queued real purchase, then a decoy when the
    /// policy wants one. Runs under the bot's lock.
    pub fn next_task(
        &self,
        store: &CardVaultStore,
        locks: &KeyedLocks<BotId>,
        bot_id: &BotId,
        now: DateTime<Utc>,
    ) -> Result<Option<BotTask>, CoreError> {
        locks.with_lock(bot_id, || {
            if let Some(event) = store.event_pending_for_bot(bot_id) {
                return Ok(Some(BotTask::from_event(&event)));
            }
            if let Some(request) = store.real_purchase_next_queued(bot_id) {
                let event = self.dispatch_real(store, bot_id, &request, now)?;
                return Ok(Some(BotTask::from_event(&event)));
            }
            if self.decoy.decide_obfuscation_need(store, bot_id, now).count == 0 {
                return Ok(None);
            }
            match self.decoy.create_event(store, bot_id, None, now) {
                Ok(event) => Ok(Some(BotTask::from_event(&event))),
                Err(CoreError::LimitExceeded { .. }) => {
                    debug!(bot_id = %bot_id, "no decoy fits the remaining allowances");
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        })
    }

    pub fn complete_task(
        &self,
        store: &CardVaultStore,
        bot_id: &BotId,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<ObfuscationEvent, CoreError> {
        self.decoy.complete_event(store, bot_id, event_id, now)
    }

    // Real purchases ride on the real profile of the queuing owner's first active card.
    fn dispatch_real(
        &self,
        store: &CardVaultStore,
        bot_id: &BotId,
        request: &RealPurchaseRequest,
        now: DateTime<Utc>,
    ) -> Result<ObfuscationEvent, CoreError> {
        let card = active_cards(store, bot_id)
            .into_iter()
            .find(|c| c.owner_id == request.owner_id)
            .ok_or_else(|| CoreError::invalid_state("no_active_card"))?;
        let event = store
            .real_purchase_dispatch_commit(
                &request.request_id,
                ObfuscationEventInput {
                    bot_id: bot_id.clone(),
                    card_id: card.card_id,
                    profile_index: card.real_profile_index,
                    purchase: request.purchase.clone(),
                    origin: EventOrigin::RealPurchase,
                    occurred_at: now,
                },
                reason_codes::TASK_OK_REAL_DISPATCHED,
            )
            .map_err(pending_conflict)?;
        debug!(event_id = %event.event_id, "real purchase dispatched");
        Ok(event)
    }
}
