#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use cardveil_kernel_contracts::allowance::AllowanceSnapshot;
use cardveil_kernel_contracts::card::{
    AllowanceDuration, CurrencyCode, HumanPermissionPolicy, ProfileIndex,
    ProfilePermission, ProfilePermissionPatch, ReleasedCardData, SplitCardRecord,
};
use cardveil_kernel_contracts::confirmation::CheckoutConfirmation;
use cardveil_kernel_contracts::ids::{BotId, CardId, CheckoutId, ConfirmationId, EventId, OwnerId};
use cardveil_kernel_contracts::obfuscation::{BotTask, PurchaseSpec, RealPurchaseStatus};
use cardveil_kernel_contracts::rail5::{
    CheckoutOutcome, KeyMaterial, Rail5Card, Rail5Checkout, Rail5Limits,
};
use cardveil_kernel_contracts::ContractViolation;
use cardveil_os::config::fragment_sealer_from_env_var_map;
use cardveil_os::confirmation::{CheckoutRequest, ConfirmationView};
use cardveil_os::custody::OwnerDataInput;
use cardveil_os::escrow::NewRail5Card;
use cardveil_os::external::{NoopPaymentProcessor, OwnerIdentity, TracingWebhookSink};
use cardveil_os::purchase::purchase_spec;
use cardveil_os::rate_limit::FixedWindowRateLimiter;
use cardveil_os::verification::VerifyRequest;
use cardveil_os::{CardVaultConfig, CardVaultRuntime, CoreError, RuntimeDeps};
use cardveil_storage::CardVaultStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub mod reason_codes {
    use cardveil_kernel_contracts::ReasonCodeId;

    pub const ADAPTER_SNAPSHOT_SAVED: ReasonCodeId = ReasonCodeId(0xAD70_0001);
    pub const ADAPTER_SNAPSHOT_FAILED: ReasonCodeId = ReasonCodeId(0xAD70_0002);
}

// ----- errors -----------------------------------------------------------------------

/// Error body returned by every route. `status` is the HTTP status the binary sends.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterError {
    #[serde(skip)]
    pub status: u16,
    pub code: String,
    pub message: String,
    pub limit: Option<String>,
    pub remaining_cents: Option<u64>,
}

impl AdapterError {
    fn new(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            limit: None,
            remaining_cents: None,
        }
    }

    pub fn unauthenticated(header: &str) -> Self {
        Self::new(401, "unauthenticated", format!("missing or invalid {header} header"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, "internal_error", message)
    }
}

impl From<CoreError> for AdapterError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::NotFound | CoreError::Forbidden => 404,
            CoreError::InvalidState { .. }
            | CoreError::AlreadyActive
            | CoreError::KeyAlreadyDelivered
            | CoreError::AlreadyCompleted
            | CoreError::CheckoutNotApproved => 409,
            CoreError::Validation(_) => 400,
            CoreError::Expired => 410,
            CoreError::LimitExceeded { .. } => 422,
            CoreError::RateLimited => 429,
            CoreError::Internal(_) => 500,
        };
        // Forbidden reads as NotFound on the wire.
        let message = match &err {
            CoreError::Forbidden => CoreError::NotFound.to_string(),
            other => other.to_string(),
        };
        let mut out = Self::new(status, err.code(), message);
        if let CoreError::LimitExceeded {
            limit,
            remaining_cents,
        } = err
        {
            out.limit = Some(limit.as_str().to_string());
            out.remaining_cents = Some(remaining_cents);
        }
        out
    }
}

impl From<ContractViolation> for AdapterError {
    fn from(err: ContractViolation) -> Self {
        CoreError::Validation(err).into()
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

// ----- identity ---------------------------------------------------------------------

/// Owner identity from the `x-owner-id` / `x-owner-email` headers set by the identity
/// provider in front of the service.
pub fn owner_from_headers(
    owner_id: Option<&str>,
    email: Option<&str>,
) -> AdapterResult<OwnerIdentity> {
    let owner_id = owner_id
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| OwnerId::new(v).ok())
        .ok_or_else(|| AdapterError::unauthenticated("x-owner-id"))?;
    Ok(OwnerIdentity {
        owner_id,
        email: email.map(|v| v.trim().to_string()).unwrap_or_default(),
    })
}

pub fn bot_from_headers(bot_id: Option<&str>) -> AdapterResult<BotId> {
    bot_id
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| BotId::new(v).ok())
        .ok_or_else(|| AdapterError::unauthenticated("x-bot-id"))
}

// ----- wire types -------------------------------------------------------------------

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct InitializeAdapterRequest {
    pub bot_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InitializeAdapterResponse {
    pub card_id: String,
    pub artifact_text: String,
    pub artifact_digest: String,
    pub missing_digit_positions: Vec<u8>,
    pub real_profile_index: u8,
    pub profile_count: u8,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubmitOwnerDataAdapterRequest {
    pub card_id: Option<String>,
    pub bot_id: Option<String>,
    pub missing_digits: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
    pub owner_name: String,
    pub owner_zip: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CardAdapterResponse {
    pub card_id: String,
    pub bot_id: Option<String>,
    pub status: String,
    pub profile_count: u8,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LinkBotAdapterRequest {
    pub card_id: String,
    pub bot_id: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FreezeAdapterRequest {
    pub card_id: String,
    pub frozen: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CardQuery {
    pub card_id: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProfilePermissionRow {
    pub profile_index: u8,
    pub allowance_value_cents: u64,
    pub allowance_currency: String,
    pub allowance_duration: String,
    pub confirmation_exempt_limit_cents: u64,
    pub human_permission_required: String,
    pub spent_cents: u64,
    pub remaining_cents: u64,
    pub resets_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PermissionsAdapterResponse {
    pub card_id: String,
    pub real_profile_index: u8,
    pub profiles: Vec<ProfilePermissionRow>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct UpdatePermissionAdapterRequest {
    pub card_id: String,
    pub profile_index: u8,
    pub allowance_value_cents: Option<u64>,
    pub allowance_currency: Option<String>,
    pub allowance_duration: Option<String>,
    pub confirmation_exempt_limit_cents: Option<u64>,
    pub human_permission_required: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VerifyAdapterRequest {
    pub card_id: String,
    pub profile_index: Option<u8>,
    pub missing_digits: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VerifyAdapterResponse {
    pub verified: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PurchaseFields {
    pub merchant_name: String,
    pub merchant_url: String,
    pub item_name: String,
    pub amount_cents: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckoutAdapterRequest {
    pub card_id: String,
    pub profile_index: u8,
    #[serde(flatten)]
    pub purchase: PurchaseFields,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReleasedCardDataDto {
    pub profile_index: u8,
    pub missing_digits: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
    pub holder_name: String,
    pub holder_zip: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConfirmationAdapterResponse {
    pub confirmation_id: String,
    pub card_id: String,
    pub profile_index: u8,
    pub status: String,
    pub merchant_name: String,
    pub item_name: String,
    pub amount_cents: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub card_data: Option<ReleasedCardDataDto>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DecideCheckoutAdapterRequest {
    pub confirmation_id: String,
    pub approve: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConfirmationQuery {
    pub confirmation_id: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ObfuscationNextAdapterRequest {
    pub profile_index: Option<u8>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompleteEventAdapterRequest {
    pub event_id: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompleteEventAdapterResponse {
    pub event_id: String,
    pub status: String,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Bot-facing task envelope. Real and decoy work are indistinguishable here.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskAdapterResponse {
    pub task: Option<BotTask>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueuePurchaseAdapterRequest {
    pub bot_id: String,
    #[serde(flatten)]
    pub purchase: PurchaseFields,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueuePurchaseAdapterResponse {
    pub request_id: String,
    pub status: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CreateRail5CardAdapterRequest {
    pub card_brand: String,
    pub card_last4: String,
    pub spending_limit_cents: u64,
    pub daily_limit_cents: u64,
    pub monthly_limit_cents: u64,
    pub human_approval_above_cents: u64,
}

/// Owner view of a key-escrow card. Key material is never echoed.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Rail5CardAdapterResponse {
    pub card_id: String,
    pub bot_id: Option<String>,
    pub card_brand: String,
    pub card_last4: String,
    pub status: String,
    pub spending_limit_cents: u64,
    pub daily_limit_cents: u64,
    pub monthly_limit_cents: u64,
    pub human_approval_above_cents: u64,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KeyMaterialAdapterRequest {
    pub card_id: String,
    pub encrypted_key_hex: String,
    pub iv_hex: String,
    pub tag_hex: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Rail5CheckoutAdapterRequest {
    #[serde(flatten)]
    pub purchase: PurchaseFields,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Rail5CheckoutAdapterResponse {
    pub checkout_id: String,
    pub card_id: String,
    pub status: String,
    pub merchant_name: String,
    pub item_name: String,
    pub amount_cents: u64,
    pub key_delivered: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub confirmed_outcome: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Rail5DecideAdapterRequest {
    pub checkout_id: String,
    pub approve: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Rail5CheckoutRef {
    pub checkout_id: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Rail5KeyAdapterResponse {
    pub checkout_id: String,
    pub encrypted_key_hex: String,
    pub iv_hex: String,
    pub tag_hex: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Rail5ConfirmAdapterRequest {
    pub checkout_id: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TickAdapterResponse {
    pub bots: usize,
    pub decoys_created: u32,
    pub expired: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeletedAdapterResponse {
    pub card_id: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RegisterBillingAdapterRequest {
    pub payment_method_token: String,
}

/// Processor handles stay server-side; the owner only sees that billing is on file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BillingAdapterResponse {
    pub owner_id: String,
    pub registered: bool,
    pub registered_at: DateTime<Utc>,
}

// ----- runtime ----------------------------------------------------------------------

#[derive(Debug, Clone)]
struct AdapterPersistenceConfig {
    snapshot_path: PathBuf,
}

/// HTTP-facing wrapper around [`CardVaultRuntime`]: parses wire ids, applies admission,
/// maps errors, and writes a snapshot after each state change when persistence is on.
#[derive(Clone)]
pub struct AdapterRuntime {
    runtime: Arc<CardVaultRuntime>,
    persistence: Option<AdapterPersistenceConfig>,
    snapshot_lock: Arc<Mutex<()>>,
}

impl AdapterRuntime {
    pub fn new(runtime: Arc<CardVaultRuntime>) -> Self {
        Self {
            runtime,
            persistence: None,
            snapshot_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn new_with_persistence(
        config: CardVaultConfig,
        deps: RuntimeDeps,
        snapshot_path: PathBuf,
    ) -> Result<Self, String> {
        let store = CardVaultStore::load_snapshot(&snapshot_path).map_err(|err| {
            format!(
                "failed to load card vault snapshot '{}': {}",
                snapshot_path.display(),
                err
            )
        })?;
        let runtime = CardVaultRuntime::new(config, Arc::new(store), deps)
            .map_err(|err| format!("failed to build card vault runtime: {err}"))?;
        info!(path = %snapshot_path.display(), "card vault snapshot loaded");
        Ok(Self {
            runtime: Arc::new(runtime),
            persistence: Some(AdapterPersistenceConfig { snapshot_path }),
            snapshot_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn default_from_env() -> Result<Self, String> {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    pub fn from_env_var_map(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let config = CardVaultConfig::from_env_var_map(&lookup);
        let sealer = fragment_sealer_from_env_var_map(&lookup)
            .map_err(|err| format!("invalid CARDVEIL_FRAGMENT_KEY_B64: {err}"))?;
        let deps = RuntimeDeps {
            sealer: Arc::new(sealer),
            webhooks: Arc::new(TracingWebhookSink),
            rate_limiter: Arc::new(FixedWindowRateLimiter::new(config.rate_limit)),
            payments: Arc::new(NoopPaymentProcessor),
        };
        match lookup("CARDVEIL_SNAPSHOT_PATH")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            Some(path) => Self::new_with_persistence(config, deps, PathBuf::from(path)),
            None => {
                warn!("CARDVEIL_SNAPSHOT_PATH not set; state is memory-only");
                let runtime = CardVaultRuntime::new(
                    config,
                    Arc::new(CardVaultStore::new_in_memory()),
                    deps,
                )
                .map_err(|err| format!("failed to build card vault runtime: {err}"))?;
                Ok(Self::new(Arc::new(runtime)))
            }
        }
    }

    pub fn runtime(&self) -> &CardVaultRuntime {
        &self.runtime
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            persistent: self.persistence.is_some(),
        }
    }

    fn persist(&self) -> AdapterResult<()> {
        self.persist_snapshot()
            .map_err(|err| AdapterError::internal(format!("snapshot save failed: {err}")))
    }

    fn persist_snapshot(&self) -> Result<(), String> {
        let Some(persistence) = self.persistence.as_ref() else {
            return Ok(());
        };
        let _guard = self.snapshot_lock.lock();
        match self.runtime.store().save_snapshot(&persistence.snapshot_path) {
            Ok(()) => {
                debug!(reason_code = reason_codes::ADAPTER_SNAPSHOT_SAVED.0, "snapshot saved");
                Ok(())
            }
            Err(err) => {
                warn!(
                    reason_code = reason_codes::ADAPTER_SNAPSHOT_FAILED.0,
                    error = %err,
                    "snapshot save failed"
                );
                Err(err.to_string())
            }
        }
    }

    fn admit(&self, caller: &str, endpoint: &'static str) -> AdapterResult<()> {
        Ok(self.runtime.admit(caller, endpoint)?)
    }

    // ----- owner billing -------------------------------------------------------------

    pub fn register_billing(
        &self,
        owner: &OwnerIdentity,
        request: RegisterBillingAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<BillingAdapterResponse> {
        self.admit(owner.owner_id.as_str(), "billing_payment_method")?;
        let record =
            self.runtime
                .register_owner_billing(owner, &request.payment_method_token, now)?;
        self.persist()?;
        Ok(BillingAdapterResponse {
            owner_id: record.owner_id.as_str().to_string(),
            registered: true,
            registered_at: record.registered_at,
        })
    }

    // ----- split-knowledge rail: owner ----------------------------------------------

    pub fn initialize(
        &self,
        owner: &OwnerIdentity,
        request: InitializeAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<InitializeAdapterResponse> {
        self.admit(owner.owner_id.as_str(), "rail4_initialize")?;
        let bot_id = request.bot_id.map(BotId::new).transpose()?;
        let out = self.runtime.initialize(&owner.owner_id, bot_id, now)?;
        self.persist()?;
        Ok(InitializeAdapterResponse {
            card_id: out.card_id.as_str().to_string(),
            artifact_text: out.artifact_text,
            artifact_digest: out.artifact_digest,
            missing_digit_positions: out.missing_digit_positions.as_slice().to_vec(),
            real_profile_index: out.real_profile_index.get(),
            profile_count: out.profile_count,
        })
    }

    pub fn submit_owner_data(
        &self,
        owner: &OwnerIdentity,
        request: SubmitOwnerDataAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<CardAdapterResponse> {
        self.admit(owner.owner_id.as_str(), "rail4_submit_owner_data")?;
        let card_id = match (request.card_id, request.bot_id) {
            (Some(card_id), _) => CardId::new(card_id)?,
            (None, Some(bot_id)) => self
                .runtime
                .resolve_pending_card(&owner.owner_id, &BotId::new(bot_id)?)?,
            (None, None) => {
                return Err(ContractViolation::InvalidValue {
                    field: "submit_owner_data.card_id",
                    reason: "card_id or bot_id is required",
                }
                .into())
            }
        };
        let record = self.runtime.submit_owner_data(
            &owner.owner_id,
            &card_id,
            OwnerDataInput {
                missing_digits: request.missing_digits,
                expiry_month: request.expiry_month,
                expiry_year: request.expiry_year,
                owner_name: request.owner_name,
                owner_zip: request.owner_zip,
            },
            now,
        )?;
        self.persist()?;
        Ok(card_response(&record))
    }

    pub fn link_bot(
        &self,
        owner: &OwnerIdentity,
        request: LinkBotAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<CardAdapterResponse> {
        self.admit(owner.owner_id.as_str(), "rail4_link_bot")?;
        let record = self.runtime.link_bot(
            &owner.owner_id,
            &CardId::new(request.card_id)?,
            BotId::new(request.bot_id)?,
            now,
        )?;
        self.persist()?;
        Ok(card_response(&record))
    }

    pub fn freeze(
        &self,
        owner: &OwnerIdentity,
        request: FreezeAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<CardAdapterResponse> {
        self.admit(owner.owner_id.as_str(), "rail4_freeze")?;
        let record = self.runtime.freeze(
            &owner.owner_id,
            &CardId::new(request.card_id)?,
            request.frozen,
            now,
        )?;
        self.persist()?;
        Ok(card_response(&record))
    }

    pub fn permissions(
        &self,
        owner: &OwnerIdentity,
        query: CardQuery,
        now: DateTime<Utc>,
    ) -> AdapterResult<PermissionsAdapterResponse> {
        self.admit(owner.owner_id.as_str(), "rail4_permissions")?;
        let card_id = CardId::new(query.card_id)?;
        let permissions = self.runtime.permissions(&owner.owner_id, &card_id)?;
        let allowances = self.runtime.allowances(&owner.owner_id, &card_id, now)?;
        let profiles = permissions
            .profiles
            .iter()
            .map(|(index, permission)| {
                permission_row(
                    *index,
                    permission,
                    allowances.iter().find(|s| s.profile_index == *index),
                )
            })
            .collect();
        Ok(PermissionsAdapterResponse {
            card_id: card_id.as_str().to_string(),
            real_profile_index: permissions.real_profile_index.get(),
            profiles,
        })
    }

    pub fn update_permission(
        &self,
        owner: &OwnerIdentity,
        request: UpdatePermissionAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<ProfilePermissionRow> {
        self.admit(owner.owner_id.as_str(), "rail4_update_permission")?;
        let card_id = CardId::new(request.card_id)?;
        let profile_index = ProfileIndex::new(request.profile_index)?;
        let patch = ProfilePermissionPatch {
            allowance_value_cents: request.allowance_value_cents,
            allowance_currency: request.allowance_currency.map(CurrencyCode::new).transpose()?,
            allowance_duration: request
                .allowance_duration
                .map(|raw| {
                    AllowanceDuration::parse(&raw).ok_or(ContractViolation::InvalidValue {
                        field: "allowance_duration",
                        reason: "must be day, week or month",
                    })
                })
                .transpose()?,
            confirmation_exempt_limit_cents: request.confirmation_exempt_limit_cents,
            human_permission_required: request
                .human_permission_required
                .map(|raw| {
                    HumanPermissionPolicy::parse(&raw).ok_or(ContractViolation::InvalidValue {
                        field: "human_permission_required",
                        reason: "must be all, above_exempt_limit or none",
                    })
                })
                .transpose()?,
        };
        let permission =
            self.runtime
                .update_permission(&owner.owner_id, &card_id, profile_index, &patch, now)?;
        self.persist()?;
        let allowances = self.runtime.allowances(&owner.owner_id, &card_id, now)?;
        Ok(permission_row(
            profile_index,
            &permission,
            allowances.iter().find(|s| s.profile_index == profile_index),
        ))
    }

    pub fn delete_card(
        &self,
        owner: &OwnerIdentity,
        query: CardQuery,
        now: DateTime<Utc>,
    ) -> AdapterResult<DeletedAdapterResponse> {
        self.admit(owner.owner_id.as_str(), "rail4_delete")?;
        let card_id = CardId::new(query.card_id)?;
        self.runtime.delete_card(&owner.owner_id, &card_id, now)?;
        self.persist()?;
        Ok(DeletedAdapterResponse {
            card_id: card_id.as_str().to_string(),
            deleted: true,
        })
    }

    pub fn decide_checkout(
        &self,
        owner: &OwnerIdentity,
        request: DecideCheckoutAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<ConfirmationAdapterResponse> {
        self.admit(owner.owner_id.as_str(), "rail4_checkout_decide")?;
        let confirmation = self.runtime.decide_checkout(
            &owner.owner_id,
            &ConfirmationId::new(request.confirmation_id)?,
            request.approve,
            now,
        )?;
        self.persist()?;
        Ok(confirmation_response(&confirmation, None))
    }

    // ----- split-knowledge rail: bot ------------------------------------------------

    pub fn verify(
        &self,
        bot_id: &BotId,
        request: VerifyAdapterRequest,
    ) -> AdapterResult<VerifyAdapterResponse> {
        self.admit(bot_id.as_str(), "rail4_verify")?;
        let verified = self.runtime.verify(
            bot_id,
            &VerifyRequest {
                card_id: CardId::new(request.card_id)?,
                profile_index: request.profile_index.map(ProfileIndex::new).transpose()?,
                missing_digits: request.missing_digits,
                expiry_month: request.expiry_month,
                expiry_year: request.expiry_year,
            },
        )?;
        Ok(VerifyAdapterResponse { verified })
    }

    pub fn request_checkout(
        &self,
        bot_id: &BotId,
        request: CheckoutAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<ConfirmationAdapterResponse> {
        self.admit(bot_id.as_str(), "rail4_checkout")?;
        let confirmation = self.runtime.request_checkout(
            bot_id,
            CheckoutRequest {
                card_id: CardId::new(request.card_id)?,
                profile_index: ProfileIndex::new(request.profile_index)?,
                purchase: to_purchase(request.purchase)?,
            },
            now,
        )?;
        self.persist()?;
        Ok(confirmation_response(&confirmation, None))
    }

    pub fn checkout_status(
        &self,
        bot_id: &BotId,
        query: ConfirmationQuery,
        now: DateTime<Utc>,
    ) -> AdapterResult<ConfirmationAdapterResponse> {
        self.admit(bot_id.as_str(), "rail4_checkout_status")?;
        let ConfirmationView {
            confirmation,
            card_data,
        } = self
            .runtime
            .checkout_status(bot_id, &ConfirmationId::new(query.confirmation_id)?, now)?;
        Ok(confirmation_response(&confirmation, card_data.as_ref()))
    }

    // ----- obfuscation and tasks ----------------------------------------------------

    /// The bot's pending obfuscation task, or a freshly created decoy.
    pub fn obfuscation_next(
        &self,
        bot_id: &BotId,
        request: ObfuscationNextAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<TaskAdapterResponse> {
        self.admit(bot_id.as_str(), "obfuscation_next")?;
        if let Some(event) = self.runtime.pending_events(bot_id).first() {
            return Ok(TaskAdapterResponse {
                task: Some(BotTask::from_event(event)),
            });
        }
        let profile_index = request.profile_index.map(ProfileIndex::new).transpose()?;
        let event = self
            .runtime
            .create_decoy_event(bot_id, profile_index, now)?;
        self.persist()?;
        Ok(TaskAdapterResponse {
            task: Some(BotTask::from_event(&event)),
        })
    }

    pub fn complete_event(
        &self,
        bot_id: &BotId,
        request: CompleteEventAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<CompleteEventAdapterResponse> {
        self.admit(bot_id.as_str(), "obfuscation_complete")?;
        let event = self
            .runtime
            .complete_task(bot_id, &EventId::new(request.event_id)?, now)?;
        self.persist()?;
        Ok(CompleteEventAdapterResponse {
            event_id: event.event_id.as_str().to_string(),
            status: event.status.as_str().to_string(),
            completed_at: event.completed_at,
        })
    }

    pub fn next_task(&self, bot_id: &BotId, now: DateTime<Utc>) -> AdapterResult<TaskAdapterResponse> {
        self.admit(bot_id.as_str(), "tasks_next")?;
        let task = self.runtime.next_task(bot_id, now)?;
        if task.is_some() {
            self.persist()?;
        }
        Ok(TaskAdapterResponse { task })
    }

    pub fn queue_real_purchase(
        &self,
        owner: &OwnerIdentity,
        request: QueuePurchaseAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<QueuePurchaseAdapterResponse> {
        self.admit(owner.owner_id.as_str(), "tasks_queue")?;
        let queued = self.runtime.queue_real_purchase(
            &owner.owner_id,
            &BotId::new(request.bot_id)?,
            to_purchase(request.purchase)?,
            now,
        )?;
        self.persist()?;
        Ok(QueuePurchaseAdapterResponse {
            request_id: queued.request_id.as_str().to_string(),
            status: match queued.status {
                RealPurchaseStatus::Queued => "queued",
                RealPurchaseStatus::Dispatched => "dispatched",
            }
            .to_string(),
            queued_at: queued.queued_at,
        })
    }

    pub fn tick(&self, now: DateTime<Utc>) -> AdapterResult<TickAdapterResponse> {
        let report = self.runtime.tick(now);
        let decoys_created: u32 = report.outcomes.iter().map(|o| o.created).sum();
        if decoys_created > 0 || report.expired > 0 {
            self.persist()?;
        }
        Ok(TickAdapterResponse {
            bots: report.outcomes.len(),
            decoys_created,
            expired: report.expired,
        })
    }

    // ----- key-escrow rail ----------------------------------------------------------

    pub fn rail5_create_card(
        &self,
        owner: &OwnerIdentity,
        request: CreateRail5CardAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<Rail5CardAdapterResponse> {
        self.admit(owner.owner_id.as_str(), "rail5_cards")?;
        let card = self.runtime.rail5_create_card(
            &owner.owner_id,
            NewRail5Card {
                card_brand: request.card_brand,
                card_last4: request.card_last4,
                limits: Rail5Limits::v1(
                    request.spending_limit_cents,
                    request.daily_limit_cents,
                    request.monthly_limit_cents,
                    request.human_approval_above_cents,
                )?,
            },
            now,
        )?;
        self.persist()?;
        Ok(rail5_card_response(&card))
    }

    pub fn rail5_submit_key_material(
        &self,
        owner: &OwnerIdentity,
        request: KeyMaterialAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<Rail5CardAdapterResponse> {
        self.admit(owner.owner_id.as_str(), "rail5_key_material")?;
        let card = self.runtime.rail5_submit_key_material(
            &owner.owner_id,
            &CardId::new(request.card_id)?,
            KeyMaterial::v1(request.encrypted_key_hex, request.iv_hex, request.tag_hex)?,
            now,
        )?;
        self.persist()?;
        Ok(rail5_card_response(&card))
    }

    pub fn rail5_link_bot(
        &self,
        owner: &OwnerIdentity,
        request: LinkBotAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<Rail5CardAdapterResponse> {
        self.admit(owner.owner_id.as_str(), "rail5_link_bot")?;
        let card = self.runtime.rail5_link_bot(
            &owner.owner_id,
            &CardId::new(request.card_id)?,
            BotId::new(request.bot_id)?,
            now,
        )?;
        self.persist()?;
        Ok(rail5_card_response(&card))
    }

    pub fn rail5_request_checkout(
        &self,
        bot_id: &BotId,
        request: Rail5CheckoutAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<Rail5CheckoutAdapterResponse> {
        self.admit(bot_id.as_str(), "rail5_checkout")?;
        let checkout = self
            .runtime
            .rail5_request_checkout(bot_id, to_purchase(request.purchase)?, now)?;
        self.persist()?;
        Ok(rail5_checkout_response(&checkout))
    }

    pub fn rail5_decide(
        &self,
        owner: &OwnerIdentity,
        request: Rail5DecideAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<Rail5CheckoutAdapterResponse> {
        self.admit(owner.owner_id.as_str(), "rail5_checkout_decide")?;
        let checkout = self.runtime.rail5_decide(
            &owner.owner_id,
            &CheckoutId::new(request.checkout_id)?,
            request.approve,
            now,
        )?;
        self.persist()?;
        Ok(rail5_checkout_response(&checkout))
    }

    pub fn rail5_status(
        &self,
        bot_id: &BotId,
        query: Rail5CheckoutRef,
        now: DateTime<Utc>,
    ) -> AdapterResult<Rail5CheckoutAdapterResponse> {
        self.admit(bot_id.as_str(), "rail5_checkout_status")?;
        let checkout =
            self.runtime
                .rail5_status(bot_id, &CheckoutId::new(query.checkout_id)?, now)?;
        Ok(rail5_checkout_response(&checkout))
    }

    pub fn rail5_deliver_key(
        &self,
        bot_id: &BotId,
        request: Rail5CheckoutRef,
        now: DateTime<Utc>,
    ) -> AdapterResult<Rail5KeyAdapterResponse> {
        self.admit(bot_id.as_str(), "rail5_key")?;
        let checkout_id = CheckoutId::new(request.checkout_id)?;
        let material = self
            .runtime
            .rail5_deliver_key_durably(bot_id, &checkout_id, now, || self.persist_snapshot())?;
        Ok(Rail5KeyAdapterResponse {
            checkout_id: checkout_id.as_str().to_string(),
            encrypted_key_hex: material.encrypted_key_hex,
            iv_hex: material.iv_hex,
            tag_hex: material.tag_hex,
        })
    }

    pub fn rail5_confirm(
        &self,
        bot_id: &BotId,
        request: Rail5ConfirmAdapterRequest,
        now: DateTime<Utc>,
    ) -> AdapterResult<Rail5CheckoutAdapterResponse> {
        self.admit(bot_id.as_str(), "rail5_confirm")?;
        let checkout = self.runtime.rail5_confirm(
            bot_id,
            &CheckoutId::new(request.checkout_id)?,
            request.success,
            now,
        )?;
        self.persist()?;
        Ok(rail5_checkout_response(&checkout))
    }
}

fn to_purchase(fields: PurchaseFields) -> Result<PurchaseSpec, CoreError> {
    purchase_spec(
        &fields.merchant_name,
        &fields.merchant_url,
        &fields.item_name,
        fields.amount_cents,
    )
}

fn permission_row(
    profile_index: ProfileIndex,
    permission: &ProfilePermission,
    snapshot: Option<&AllowanceSnapshot>,
) -> ProfilePermissionRow {
    ProfilePermissionRow {
        profile_index: profile_index.get(),
        allowance_value_cents: permission.allowance_value_cents,
        allowance_currency: permission.allowance_currency.as_str().to_string(),
        allowance_duration: permission.allowance_duration.as_str().to_string(),
        confirmation_exempt_limit_cents: permission.confirmation_exempt_limit_cents,
        human_permission_required: permission.human_permission_required.as_str().to_string(),
        spent_cents: snapshot.map_or(0, |s| s.spent_cents),
        remaining_cents: snapshot.map_or(permission.allowance_value_cents, |s| s.remaining_cents),
        resets_at: snapshot.map(|s| s.resets_at),
    }
}

fn card_response(record: &SplitCardRecord) -> CardAdapterResponse {
    CardAdapterResponse {
        card_id: record.card_id.as_str().to_string(),
        bot_id: record.bot_id.as_ref().map(|b| b.as_str().to_string()),
        status: record.status.as_str().to_string(),
        profile_count: record.profile_count,
        created_at: record.created_at,
        activated_at: record.activated_at,
    }
}

fn confirmation_response(
    confirmation: &CheckoutConfirmation,
    card_data: Option<&ReleasedCardData>,
) -> ConfirmationAdapterResponse {
    ConfirmationAdapterResponse {
        confirmation_id: confirmation.confirmation_id.as_str().to_string(),
        card_id: confirmation.card_id.as_str().to_string(),
        profile_index: confirmation.profile_index.get(),
        status: confirmation.status.as_str().to_string(),
        merchant_name: confirmation.purchase.merchant.name.clone(),
        item_name: confirmation.purchase.item_name.clone(),
        amount_cents: confirmation.purchase.amount_cents,
        created_at: confirmation.created_at,
        expires_at: confirmation.expires_at,
        decided_at: confirmation.decided_at,
        card_data: card_data.map(|data| ReleasedCardDataDto {
            profile_index: data.profile_index.get(),
            missing_digits: data.missing_digits.as_str().to_string(),
            expiry_month: data.expiry.month,
            expiry_year: data.expiry.year,
            holder_name: data.holder_name.clone(),
            holder_zip: data.holder_zip.clone(),
        }),
    }
}

fn rail5_card_response(card: &Rail5Card) -> Rail5CardAdapterResponse {
    Rail5CardAdapterResponse {
        card_id: card.card_id.as_str().to_string(),
        bot_id: card.bot_id.as_ref().map(|b| b.as_str().to_string()),
        card_brand: card.card_brand.clone(),
        card_last4: card.card_last4.clone(),
        status: card.status.as_str().to_string(),
        spending_limit_cents: card.limits.spending_limit_cents,
        daily_limit_cents: card.limits.daily_limit_cents,
        monthly_limit_cents: card.limits.monthly_limit_cents,
        human_approval_above_cents: card.limits.human_approval_above_cents,
        created_at: card.created_at,
        activated_at: card.activated_at,
    }
}

fn rail5_checkout_response(checkout: &Rail5Checkout) -> Rail5CheckoutAdapterResponse {
    Rail5CheckoutAdapterResponse {
        checkout_id: checkout.checkout_id.as_str().to_string(),
        card_id: checkout.card_id.as_str().to_string(),
        status: checkout.status.as_str().to_string(),
        merchant_name: checkout.purchase.merchant.name.clone(),
        item_name: checkout.purchase.item_name.clone(),
        amount_cents: checkout.purchase.amount_cents,
        key_delivered: checkout.key_delivered,
        created_at: checkout.created_at,
        expires_at: checkout.expires_at,
        decided_at: checkout.decided_at,
        confirmed_outcome: checkout.confirmed_outcome.map(|o| {
            match o {
                CheckoutOutcome::Success => "success",
                CheckoutOutcome::Failed => "failed",
            }
            .to_string()
        }),
    }
}

/// Tick worker switch; anything but an explicit off value enables it.
pub fn parse_tick_enabled(raw: Option<&str>) -> bool {
    match raw {
        Some(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "off" | "no"
        ),
        None => true,
    }
}

pub fn parse_tick_interval_ms(raw: Option<&str>) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| (100..=3_600_000).contains(v))
        .unwrap_or(60_000)
}
