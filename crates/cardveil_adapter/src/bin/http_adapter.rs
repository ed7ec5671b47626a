#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, time::Duration};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cardveil_adapter::{
    bot_from_headers, owner_from_headers, parse_tick_enabled, parse_tick_interval_ms,
    AdapterError, AdapterHealthResponse, AdapterRuntime, BillingAdapterResponse,
    CardAdapterResponse, CardQuery,
    CheckoutAdapterRequest, CompleteEventAdapterRequest, CompleteEventAdapterResponse,
    ConfirmationAdapterResponse, ConfirmationQuery, CreateRail5CardAdapterRequest,
    DecideCheckoutAdapterRequest, DeletedAdapterResponse, FreezeAdapterRequest,
    InitializeAdapterRequest, InitializeAdapterResponse, KeyMaterialAdapterRequest,
    LinkBotAdapterRequest, ObfuscationNextAdapterRequest, PermissionsAdapterResponse,
    ProfilePermissionRow, QueuePurchaseAdapterRequest, QueuePurchaseAdapterResponse,
    Rail5CardAdapterResponse, Rail5CheckoutAdapterRequest, Rail5CheckoutAdapterResponse,
    Rail5CheckoutRef, Rail5ConfirmAdapterRequest, Rail5DecideAdapterRequest,
    Rail5KeyAdapterResponse, RegisterBillingAdapterRequest, SubmitOwnerDataAdapterRequest, TaskAdapterResponse,
    TickAdapterResponse, UpdatePermissionAdapterRequest, VerifyAdapterRequest,
    VerifyAdapterResponse,
};
use cardveil_kernel_contracts::ids::BotId;
use cardveil_os::external::OwnerIdentity;
use chrono::Utc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct ApiError(AdapterError);

impl From<AdapterError> for ApiError {
    fn from(err: AdapterError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(code = %self.0.code, message = %self.0.message, "request failed");
        }
        (status, Json(self.0)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn owner(headers: &HeaderMap) -> Result<OwnerIdentity, ApiError> {
    Ok(owner_from_headers(
        header(headers, "x-owner-id"),
        header(headers, "x-owner-email"),
    )?)
}

fn bot(headers: &HeaderMap) -> Result<BotId, ApiError> {
    Ok(bot_from_headers(header(headers, "x-bot-id"))?)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = env::var("CARDVEIL_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let bind = env::var("CARDVEIL_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let addr: SocketAddr = bind.parse()?;
    let tick_enabled = parse_tick_enabled(env::var("CARDVEIL_TICK_ENABLED").ok().as_deref());
    let tick_interval_ms =
        parse_tick_interval_ms(env::var("CARDVEIL_TICK_INTERVAL_MS").ok().as_deref());

    let runtime = AdapterRuntime::default_from_env()?;
    if tick_enabled {
        let runtime_for_worker = runtime.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(tick_interval_ms));
            loop {
                ticker.tick().await;
                if let Err(err) = runtime_for_worker.tick(Utc::now()) {
                    warn!(code = %err.code, message = %err.message, "tick pass failed");
                }
            }
        });
    }

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/billing/payment-method", post(billing_payment_method))
        .route("/v1/rail4/initialize", post(rail4_initialize))
        .route("/v1/rail4/submit-owner-data", post(rail4_submit_owner_data))
        .route("/v1/rail4/link-bot", post(rail4_link_bot))
        .route("/v1/rail4/freeze", post(rail4_freeze))
        .route(
            "/v1/rail4/permissions",
            get(rail4_permissions).patch(rail4_update_permission),
        )
        .route("/v1/rail4/card", axum::routing::delete(rail4_delete_card))
        .route("/v1/rail4/verify", post(rail4_verify))
        .route("/v1/rail4/checkout", post(rail4_checkout))
        .route("/v1/rail4/checkout/decide", post(rail4_checkout_decide))
        .route("/v1/rail4/checkout/status", get(rail4_checkout_status))
        .route("/v1/obfuscation/next", post(obfuscation_next))
        .route("/v1/obfuscation/complete", post(obfuscation_complete))
        .route("/v1/rail5/cards", post(rail5_create_card))
        .route("/v1/rail5/key-material", post(rail5_key_material))
        .route("/v1/rail5/link-bot", post(rail5_link_bot))
        .route("/v1/rail5/checkout", post(rail5_checkout))
        .route("/v1/rail5/checkout/decide", post(rail5_checkout_decide))
        .route("/v1/rail5/checkout/status", get(rail5_checkout_status))
        .route("/v1/rail5/key", post(rail5_key))
        .route("/v1/rail5/confirm", post(rail5_confirm))
        .route("/v1/tasks/next", post(tasks_next))
        .route("/v1/tasks/queue", post(tasks_queue))
        .route("/v1/tick", post(tick))
        .with_state(runtime);

    info!(%addr, tick_enabled, tick_interval_ms, "cardveil_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("cardveil_adapter_http stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
}

async fn healthz(State(runtime): State<AdapterRuntime>) -> Json<AdapterHealthResponse> {
    Json(runtime.health_report())
}

// ----- owner billing ---------------------------------------------------------------

async fn billing_payment_method(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<RegisterBillingAdapterRequest>,
) -> ApiResult<BillingAdapterResponse> {
    let owner = owner(&headers)?;
    Ok(Json(runtime.register_billing(&owner, request, Utc::now())?))
}

// ----- split-knowledge rail ---------------------------------------------------------

async fn rail4_initialize(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    body: Option<Json<InitializeAdapterRequest>>,
) -> ApiResult<InitializeAdapterResponse> {
    let owner = owner(&headers)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(runtime.initialize(&owner, request, Utc::now())?))
}

async fn rail4_submit_owner_data(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<SubmitOwnerDataAdapterRequest>,
) -> ApiResult<CardAdapterResponse> {
    let owner = owner(&headers)?;
    Ok(Json(runtime.submit_owner_data(&owner, request, Utc::now())?))
}

async fn rail4_link_bot(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<LinkBotAdapterRequest>,
) -> ApiResult<CardAdapterResponse> {
    let owner = owner(&headers)?;
    Ok(Json(runtime.link_bot(&owner, request, Utc::now())?))
}

async fn rail4_freeze(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<FreezeAdapterRequest>,
) -> ApiResult<CardAdapterResponse> {
    let owner = owner(&headers)?;
    Ok(Json(runtime.freeze(&owner, request, Utc::now())?))
}

async fn rail4_permissions(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Query(query): Query<CardQuery>,
) -> ApiResult<PermissionsAdapterResponse> {
    let owner = owner(&headers)?;
    Ok(Json(runtime.permissions(&owner, query, Utc::now())?))
}

async fn rail4_update_permission(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<UpdatePermissionAdapterRequest>,
) -> ApiResult<ProfilePermissionRow> {
    let owner = owner(&headers)?;
    Ok(Json(runtime.update_permission(&owner, request, Utc::now())?))
}

async fn rail4_delete_card(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Query(query): Query<CardQuery>,
) -> ApiResult<DeletedAdapterResponse> {
    let owner = owner(&headers)?;
    Ok(Json(runtime.delete_card(&owner, query, Utc::now())?))
}

async fn rail4_verify(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<VerifyAdapterRequest>,
) -> ApiResult<VerifyAdapterResponse> {
    let bot = bot(&headers)?;
    Ok(Json(runtime.verify(&bot, request)?))
}

async fn rail4_checkout(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<CheckoutAdapterRequest>,
) -> ApiResult<ConfirmationAdapterResponse> {
    let bot = bot(&headers)?;
    Ok(Json(runtime.request_checkout(&bot, request, Utc::now())?))
}

async fn rail4_checkout_decide(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<DecideCheckoutAdapterRequest>,
) -> ApiResult<ConfirmationAdapterResponse> {
    let owner = owner(&headers)?;
    Ok(Json(runtime.decide_checkout(&owner, request, Utc::now())?))
}

async fn rail4_checkout_status(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Query(query): Query<ConfirmationQuery>,
) -> ApiResult<ConfirmationAdapterResponse> {
    let bot = bot(&headers)?;
    Ok(Json(runtime.checkout_status(&bot, query, Utc::now())?))
}

// ----- obfuscation and tasks --------------------------------------------------------

async fn obfuscation_next(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    body: Option<Json<ObfuscationNextAdapterRequest>>,
) -> ApiResult<TaskAdapterResponse> {
    let bot = bot(&headers)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(runtime.obfuscation_next(&bot, request, Utc::now())?))
}

async fn obfuscation_complete(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<CompleteEventAdapterRequest>,
) -> ApiResult<CompleteEventAdapterResponse> {
    let bot = bot(&headers)?;
    Ok(Json(runtime.complete_event(&bot, request, Utc::now())?))
}

async fn tasks_next(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
) -> ApiResult<TaskAdapterResponse> {
    let bot = bot(&headers)?;
    Ok(Json(runtime.next_task(&bot, Utc::now())?))
}

async fn tasks_queue(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<QueuePurchaseAdapterRequest>,
) -> ApiResult<QueuePurchaseAdapterResponse> {
    let owner = owner(&headers)?;
    Ok(Json(runtime.queue_real_purchase(&owner, request, Utc::now())?))
}

async fn tick(State(runtime): State<AdapterRuntime>) -> ApiResult<TickAdapterResponse> {
    Ok(Json(runtime.tick(Utc::now())?))
}

// ----- key-escrow rail --------------------------------------------------------------

async fn rail5_create_card(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<CreateRail5CardAdapterRequest>,
) -> ApiResult<Rail5CardAdapterResponse> {
    let owner = owner(&headers)?;
    Ok(Json(runtime.rail5_create_card(&owner, request, Utc::now())?))
}

async fn rail5_key_material(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<KeyMaterialAdapterRequest>,
) -> ApiResult<Rail5CardAdapterResponse> {
    let owner = owner(&headers)?;
    Ok(Json(runtime.rail5_submit_key_material(&owner, request, Utc::now())?))
}

async fn rail5_link_bot(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<LinkBotAdapterRequest>,
) -> ApiResult<Rail5CardAdapterResponse> {
    let owner = owner(&headers)?;
    Ok(Json(runtime.rail5_link_bot(&owner, request, Utc::now())?))
}

async fn rail5_checkout(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<Rail5CheckoutAdapterRequest>,
) -> ApiResult<Rail5CheckoutAdapterResponse> {
    let bot = bot(&headers)?;
    Ok(Json(runtime.rail5_request_checkout(&bot, request, Utc::now())?))
}

async fn rail5_checkout_decide(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<Rail5DecideAdapterRequest>,
) -> ApiResult<Rail5CheckoutAdapterResponse> {
    let owner = owner(&headers)?;
    Ok(Json(runtime.rail5_decide(&owner, request, Utc::now())?))
}

async fn rail5_checkout_status(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Query(query): Query<Rail5CheckoutRef>,
) -> ApiResult<Rail5CheckoutAdapterResponse> {
    let bot = bot(&headers)?;
    Ok(Json(runtime.rail5_status(&bot, query, Utc::now())?))
}

async fn rail5_key(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<Rail5CheckoutRef>,
) -> ApiResult<Rail5KeyAdapterResponse> {
    let bot = bot(&headers)?;
    Ok(Json(runtime.rail5_deliver_key(&bot, request, Utc::now())?))
}

async fn rail5_confirm(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    Json(request): Json<Rail5ConfirmAdapterRequest>,
) -> ApiResult<Rail5CheckoutAdapterResponse> {
    let bot = bot(&headers)?;
    Ok(Json(runtime.rail5_confirm(&bot, request, Utc::now())?))
}
