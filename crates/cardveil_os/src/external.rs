#![forbid(unsafe_code)]

use cardveil_kernel_contracts::card::CurrencyCode;
use cardveil_kernel_contracts::ids::OwnerId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::CoreError;

/// Caller identity as asserted by the identity provider in front of the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerIdentity {
    pub owner_id: OwnerId,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerRef(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentMethodRef(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRef(pub String);

/// Money movement lives behind this seam; nothing in this workspace moves funds.
pub trait PaymentProcessor: Send + Sync {
    fn create_customer(&self, owner: &OwnerIdentity) -> Result<CustomerRef, CoreError>;

    fn attach_payment_method(
        &self,
        customer: &CustomerRef,
        payment_method_token: &str,
    ) -> Result<PaymentMethodRef, CoreError>;

    fn charge(
        &self,
        customer: &CustomerRef,
        method: &PaymentMethodRef,
        amount_cents: u64,
        currency: &CurrencyCode,
    ) -> Result<ChargeRef, CoreError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPaymentProcessor;

impl PaymentProcessor for NoopPaymentProcessor {
    fn create_customer(&self, owner: &OwnerIdentity) -> Result<CustomerRef, CoreError> {
        Ok(CustomerRef(format!("cus_noop_{}", owner.owner_id)))
    }

    fn attach_payment_method(
        &self,
        customer: &CustomerRef,
        payment_method_token: &str,
    ) -> Result<PaymentMethodRef, CoreError> {
        if payment_method_token.trim().is_empty() {
            return Err(CoreError::invalid_state("empty payment method token"));
        }
        Ok(PaymentMethodRef(format!("pm_noop_{}", customer.0)))
    }

    fn charge(
        &self,
        _customer: &CustomerRef,
        method: &PaymentMethodRef,
        amount_cents: u64,
        currency: &CurrencyCode,
    ) -> Result<ChargeRef, CoreError> {
        Ok(ChargeRef(format!(
            "ch_noop_{}_{amount_cents}_{}",
            method.0,
            currency.as_str()
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookKind {
    CardActivated,
    CheckoutPending,
    CheckoutDecided,
    KeyDelivered,
}

impl WebhookKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CardActivated => "card.activated",
            Self::CheckoutPending => "checkout.pending",
            Self::CheckoutDecided => "checkout.decided",
            Self::KeyDelivered => "rail5.key_delivered",
        }
    }
}

/// Owner-facing notification. Carries ids and states only, never card data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookEvent {
    pub kind: WebhookKind,
    pub owner_id: OwnerId,
    pub subject_id: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookError(pub String);

impl std::fmt::Display for WebhookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "webhook delivery failed: {}", self.0)
    }
}

impl std::error::Error for WebhookError {}

pub trait WebhookSink: Send + Sync {
    fn notify(&self, event: &WebhookEvent) -> Result<(), WebhookError>;
}

/// Default sink: emits the event as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWebhookSink;

impl WebhookSink for TracingWebhookSink {
    fn notify(&self, event: &WebhookEvent) -> Result<(), WebhookError> {
        info!(
            kind = event.kind.as_str(),
            owner_id = %event.owner_id,
            subject_id = %event.subject_id,
            detail = %event.detail,
            "webhook"
        );
        Ok(())
    }
}

/// Delivery failures are logged and dropped.
pub(crate) fn fire_and_forget(sink: &dyn WebhookSink, event: WebhookEvent) {
    if let Err(err) = sink.notify(&event) {
        warn!(
            kind = event.kind.as_str(),
            subject_id = %event.subject_id,
            error = %err,
            "webhook notify failed"
        );
    }
}
