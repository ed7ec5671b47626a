#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::card::ProfileIndex;
use crate::common::{validate_amount_cents, validate_token};
use crate::ids::{BotId, CardId, EventId, OwnerId, PurchaseRequestId};
use crate::{ContractViolation, Validate};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MerchantDescriptor {
    pub name: String,
    pub slug: String,
    pub url: String,
}

impl MerchantDescriptor {
    pub fn v1(name: String, slug: String, url: String) -> Result<Self, ContractViolation> {
        let merchant = Self { name, slug, url };
        merchant.validate()?;
        Ok(merchant)
    }
}

impl Validate for MerchantDescriptor {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("merchant.name", &self.name, 128)?;
        validate_token("merchant.slug", &self.slug, 64)?;
        if !self
            .slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
        {
            return Err(ContractViolation::InvalidValue {
                field: "merchant.slug",
                reason: "must be lower-case ascii, digits, '-' or '_'",
            });
        }
        validate_token("merchant.url", &self.url, 256)?;
        if !self.url.starts_with("https://") {
            return Err(ContractViolation::InvalidValue {
                field: "merchant.url",
                reason: "must be an https url",
            });
        }
        Ok(())
    }
}

/// Merchant, item and price of one purchase, real or decoy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseSpec {
    pub merchant: MerchantDescriptor,
    pub item_name: String,
    pub amount_cents: u64,
}

impl PurchaseSpec {
    pub fn v1(
        merchant: MerchantDescriptor,
        item_name: String,
        amount_cents: u64,
    ) -> Result<Self, ContractViolation> {
        let spec = Self {
            merchant,
            item_name,
            amount_cents,
        };
        spec.validate()?;
        Ok(spec)
    }
}

impl Validate for PurchaseSpec {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.merchant.validate()?;
        validate_token("purchase.item_name", &self.item_name, 160)?;
        validate_amount_cents("purchase.amount_cents", self.amount_cents)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObfuscationEventStatus {
    Pending,
    Completed,
}

impl ObfuscationEventStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

/// Internal provenance of an event. Never part of anything the bot sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventOrigin {
    Decoy,
    RealPurchase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObfuscationEventInput {
    pub bot_id: BotId,
    pub card_id: CardId,
    pub profile_index: ProfileIndex,
    pub purchase: PurchaseSpec,
    pub origin: EventOrigin,
    pub occurred_at: DateTime<Utc>,
}

impl Validate for ObfuscationEventInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.purchase.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationEvent {
    pub event_id: EventId,
    pub bot_id: BotId,
    pub card_id: CardId,
    pub profile_index: ProfileIndex,
    pub purchase: PurchaseSpec,
    pub origin: EventOrigin,
    pub status: ObfuscationEventStatus,
    pub occurred_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ObfuscationEvent {
    pub fn is_pending(&self) -> bool {
        self.status == ObfuscationEventStatus::Pending
    }
}

/// Bot-facing instruction. Real and decoy tasks share this exact shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotTask {
    pub event_id: EventId,
    pub card_id: CardId,
    pub profile_index: ProfileIndex,
    pub merchant: MerchantDescriptor,
    pub item_name: String,
    pub amount_cents: u64,
    pub instructions: String,
}

impl BotTask {
    pub fn from_event(event: &ObfuscationEvent) -> Self {
        let instructions = format!(
            "Purchase \"{}\" from {} ({}) for {} using profile {}. Request checkout, complete the purchase once approved, then report completion for event {}.",
            event.purchase.item_name,
            event.purchase.merchant.name,
            event.purchase.merchant.url,
            format_cents(event.purchase.amount_cents),
            event.profile_index.get(),
            event.event_id.as_str(),
        );
        Self {
            event_id: event.event_id.clone(),
            card_id: event.card_id.clone(),
            profile_index: event.profile_index,
            merchant: event.purchase.merchant.clone(),
            item_name: event.purchase.item_name.clone(),
            amount_cents: event.purchase.amount_cents,
            instructions,
        }
    }
}

pub fn format_cents(amount_cents: u64) -> String {
    format!("${}.{:02}", amount_cents / 100, amount_cents % 100)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RealPurchaseStatus {
    Queued,
    Dispatched,
}

/// Owner-queued genuine purchase, waiting to be handed out as a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealPurchaseRequest {
    pub request_id: PurchaseRequestId,
    pub owner_id: OwnerId,
    pub bot_id: BotId,
    pub purchase: PurchaseSpec,
    pub status: RealPurchaseStatus,
    pub queued_at: DateTime<Utc>,
    pub dispatched_event_id: Option<EventId>,
}
