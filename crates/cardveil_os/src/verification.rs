#![forbid(unsafe_code)]

use std::sync::Arc;

use cardveil_engines::fragment_seal::FragmentSealer;
use cardveil_engines::verify::profile_secret_matches;
use cardveil_kernel_contracts::card::{CardExpiry, DigitFragment, ProfileIndex, SplitCardStatus};
use cardveil_kernel_contracts::ids::{BotId, CardId};
use cardveil_storage::CardVaultStore;
use tracing::debug;

use crate::custody::bot_card;
use crate::error::CoreError;

/// Raw fragment check presented by a bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRequest {
    pub card_id: CardId,
    pub profile_index: Option<ProfileIndex>,
    pub missing_digits: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
}

#[derive(Clone)]
pub struct VerificationRuntime {
    sealer: Arc<FragmentSealer>,
}

impl VerificationRuntime {
    pub fn new(sealer: Arc<FragmentSealer>) -> Self {
        Self { sealer }
    }

    /// `true` only on an exact fragment and expiry match for the addressed profile.
    ///
    /// The profile is the explicit index, else the profile of the bot's pending event on
    /// this card, else the real one. The reason for a mismatch is never reported.
    pub fn verify(
        &self,
        store: &CardVaultStore,
        bot_id: &BotId,
        request: &VerifyRequest,
    ) -> Result<bool, CoreError> {
        let card = bot_card(store, bot_id, &request.card_id)?;
        if card.status != SplitCardStatus::Active {
            return Err(CoreError::invalid_state(card.status.as_str()));
        }
        // Shape is checked before anything is compared.
        DigitFragment::new(request.missing_digits.clone())?;
        CardExpiry::v1(request.expiry_month, request.expiry_year)?;

        let profile_index = match request.profile_index {
            Some(index) => index,
            None => store
                .event_pending_for_bot(bot_id)
                .filter(|e| e.card_id == card.card_id)
                .map(|e| e.profile_index)
                .unwrap_or(card.real_profile_index),
        };
        let slot = store
            .split_card_profile_slot(&card.card_id, profile_index)
            .ok_or(CoreError::NotFound)?;
        let Some(sealed) = slot.sealed_secret.as_ref() else {
            return Ok(false);
        };
        let (digits, expiry) = self.sealer.open(sealed)?;
        let verified = profile_secret_matches(
            &request.missing_digits,
            request.expiry_month,
            request.expiry_year,
            &digits,
            expiry,
        );
        debug!(card_id = %card.card_id, verified, "fragment verification");
        Ok(verified)
    }
}
