use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::{Config, StoreBackend};
use crate::contacts::PhoneHasher;
use crate::error::{ConfigError, DispatchError, OnboardingError, StartupError, StoreError};
use crate::prompting::PromptConfig;
use crate::replies::ReplyGenerator;
use crate::store::{MemoryStore, PgStore, SharedStore};
use crate::types::{Direction, MessageFilter, OnboardingRequest};
use crate::webhook::{extract_events, Pipeline};
use crate::whatsapp::{verify_signature, WhatsAppClient};

const PG_MAX_CONNECTIONS: u32 = 10;

pub struct AppState {
    pub pipeline: Pipeline,
    verify_token: String,
    app_secret: String,
}

impl AppState {
    pub fn new(config: &Config, store: SharedStore) -> Result<Self, ConfigError> {
        let prompts = PromptConfig::load(config.llm.prompts_path.as_deref())?;
        let replies = ReplyGenerator::new(config.llm.clone(), prompts)?;
        let dispatcher = WhatsAppClient::new(config.whatsapp.clone());
        let hasher = PhoneHasher::new(config.contact_hash_key.as_deref());
        Ok(Self {
            pipeline: Pipeline::new(
                store,
                hasher,
                Arc::new(replies),
                dispatcher,
                config.default_channel.clone(),
            ),
            verify_token: config.whatsapp.verify_token.clone(),
            app_secret: config.whatsapp.app_secret.clone(),
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(webhook_verify).post(webhook_event))
        .route("/onboarding", post(onboarding))
        .route("/debug/token", post(debug_token))
        .route("/debug/phone", post(debug_phone))
        .route("/tenants/{tenant_id}/conversations", get(list_conversations))
        .route(
            "/tenants/{tenant_id}/conversations/{conversation_id}/messages",
            get(conversation_messages),
        )
        .route("/tenants/{tenant_id}/messages", get(list_messages))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn open_store(config: &Config) -> Result<SharedStore, StoreError> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let store = PgStore::connect(&config.database_url, PG_MAX_CONNECTIONS).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("using in-memory store; data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub async fn run(config: Config) -> Result<(), StartupError> {
    let store = open_store(&config).await?;
    let state = Arc::new(AppState::new(&config, store)?);
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        port = config.port,
        models = ?config.llm.models,
        backend = ?config.store_backend,
        "wa-relay listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or_default();
    let token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or_default();
    let challenge = params
        .get("hub.challenge")
        .map(String::as_str)
        .unwrap_or_default();

    if mode == "subscribe"
        && !challenge.is_empty()
        && !state.verify_token.is_empty()
        && token == state.verify_token
    {
        info!("webhook subscription verified");
        return (StatusCode::OK, challenge.to_string()).into_response();
    }
    warn!(mode, "webhook verification rejected");
    error_response(StatusCode::FORBIDDEN, "invalid webhook verification token")
}

async fn webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_signature(&state.app_secret, signature, &body) {
        warn!("webhook signature mismatch");
        return error_response(StatusCode::UNAUTHORIZED, "invalid webhook signature");
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "webhook body is not valid JSON");
    };

    // Acknowledge first; the delivery runs detached.
    let events = extract_events(&payload).len();
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        pipeline.process_delivery(&payload).await;
    });
    (
        StatusCode::OK,
        Json(json!({ "received": true, "events": events })),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
    contact_id: Option<String>,
    direction: Option<Direction>,
}

fn store_error_response(err: StoreError) -> Response {
    warn!(error = %err, "history read failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match state
        .pipeline
        .conversations()
        .list(&tenant_id, query.limit, query.offset)
        .await
    {
        Ok(conversations) => Json(json!({ "conversations": conversations })).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn conversation_messages(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, conversation_id)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let conversation = match state
        .pipeline
        .conversations()
        .get(&tenant_id, &conversation_id)
        .await
    {
        Ok(Some(conversation)) => conversation,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "conversation not found"),
        Err(err) => return store_error_response(err),
    };
    match state
        .pipeline
        .messages()
        .transcript(&tenant_id, &conversation.id, query.limit, query.offset)
        .await
    {
        Ok(messages) => Json(json!({
            "conversation": conversation,
            "messages": messages,
        }))
        .into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let mut filter = MessageFilter::for_tenant(&tenant_id);
    if let Some(contact_id) = query.contact_id.as_deref().filter(|c| !c.is_empty()) {
        filter = filter.contact(contact_id);
    }
    if let Some(direction) = query.direction {
        filter = filter.direction(direction);
    }
    match state
        .pipeline
        .messages()
        .find(&filter, query.limit, query.offset)
        .await
    {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn onboarding(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OnboardingRequest>,
) -> Response {
    match state.pipeline.tenants().onboard(request).await {
        Ok(tenant) => (StatusCode::OK, Json(json!({ "tenant": tenant }))).into_response(),
        Err(err) => {
            let status = match &err {
                OnboardingError::InvalidPhone(_) | OnboardingError::MissingField(_) => {
                    StatusCode::BAD_REQUEST
                }
                OnboardingError::Store(StoreError::Duplicate(_)) => StatusCode::CONFLICT,
                OnboardingError::Password(_) | OnboardingError::Store(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            warn!(error = %err, "onboarding rejected");
            error_response(status, err.to_string())
        }
    }
}

fn diagnostics_response(result: Result<Value, DispatchError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(DispatchError::Api { status, body }) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
            Json(body),
        )
            .into_response(),
        Err(DispatchError::Timeout) => {
            error_response(StatusCode::GATEWAY_TIMEOUT, DispatchError::Timeout.to_string())
        }
        Err(err @ DispatchError::Config(_)) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
        Err(err) => error_response(StatusCode::BAD_GATEWAY, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct TokenCheck {
    token: String,
}

#[derive(Debug, Deserialize)]
struct PhoneCheck {
    token: String,
    phone_number_id: String,
}

async fn debug_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TokenCheck>,
) -> Response {
    if body.token.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "token is required");
    }
    diagnostics_response(state.pipeline.dispatcher().debug_token(body.token.trim()).await)
}

async fn debug_phone(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PhoneCheck>,
) -> Response {
    if body.token.trim().is_empty() || body.phone_number_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "token and phone_number_id are required");
    }
    diagnostics_response(
        state
            .pipeline
            .dispatcher()
            .debug_phone(body.token.trim(), &body.phone_number_id)
            .await,
    )
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use std::time::Duration;

    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::conversations::ConversationTracker;
    use crate::store::Store;
    use crate::messages::MessageStore;
    use crate::types::NewMessage;

    fn test_app(extra: &[(&str, &str)]) -> (Arc<MemoryStore>, Router) {
        let mut values = HashMap::from([
            ("STORE_BACKEND".to_string(), "memory".to_string()),
            ("VERIFY_TOKEN".to_string(), "verify-me".to_string()),
            ("LLM_API_URL".to_string(), "http://127.0.0.1:9".to_string()),
            ("WHATSAPP_API_URL".to_string(), "http://127.0.0.1:9".to_string()),
        ]);
        for (key, value) in extra {
            values.insert(key.to_string(), value.to_string());
        }
        let config = Config::from_map(&values).unwrap();
        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(&config, store.clone()).unwrap();
        (store, router(Arc::new(state)))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (_, app) = test_app(&[]);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["ok"], true);
    }

    #[tokio::test]
    async fn verification_echoes_challenge_only_for_matching_token() {
        let (_, app) = test_app(&[]);
        let ok = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=12345")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let bytes = to_bytes(ok.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"12345");

        let denied = app
            .oneshot(
                Request::builder()
                    .uri("/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=12345")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_channel_delivery_is_acknowledged_without_writes() {
        let (store, app) = test_app(&[]);
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "metadata": { "phone_number_id": "unknown-pid" },
                "messages": [{ "from": "1555", "id": "wamid.1", "type": "text", "text": { "body": "hi" } }]
            } }] }]
        });
        let response = app.oneshot(post_json("/webhook", payload)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["received"], true);
        assert_eq!(body["events"], 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.contact_count().await, 0);
        assert_eq!(store.message_count().await, 0);
    }

    #[tokio::test]
    async fn signed_webhooks_require_valid_signature() {
        let (_, app) = test_app(&[("WHATSAPP_APP_SECRET", "app-secret")]);
        let payload = json!({ "entry": [] }).to_string();

        let unsigned = app
            .clone()
            .oneshot(post_json("/webhook", json!({ "entry": [] })))
            .await
            .unwrap();
        assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

        let mut mac = Hmac::<Sha256>::new_from_slice(b"app-secret").unwrap();
        mac.update(payload.as_bytes());
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        let signed = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header("content-type", "application/json")
                    .header("x-hub-signature-256", signature)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(signed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let (_, app) = test_app(&[]);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn onboarding_creates_tenant_without_exposing_credentials() {
        let (store, app) = test_app(&[]);
        let response = app
            .clone()
            .oneshot(post_json(
                "/onboarding",
                json!({
                    "business_name": "Sharma Store",
                    "whatsapp_number": "+15550100200",
                    "phone_number_id": "pid123",
                    "access_token": "EAAG-secret-token"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["tenant"]["slug"], "sharma-store");
        assert!(body["tenant"].get("access_token_enc").is_none());
        assert_eq!(store.tenant_count().await, 1);

        let invalid = app
            .oneshot(post_json(
                "/onboarding",
                json!({
                    "whatsapp_number": "555",
                    "phone_number_id": "pid123",
                    "access_token": "EAAG-secret-token"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn webhook_acknowledges_before_reply_completes() {
        let llm = MockServer::start().await;
        let graph = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "choices": [{ "message": { "role": "assistant", "content": "We open at 9." } }]
                    }))
                    .set_delay(Duration::from_secs(2)),
            )
            .expect(1)
            .mount(&llm)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{ "id": "wamid.out" }]
            })))
            .mount(&graph)
            .await;

        let llm_url = llm.uri();
        let graph_url = graph.uri();
        let (store, app) = test_app(&[
            ("LLM_API_URL", llm_url.as_str()),
            ("LLM_API_KEY", "test-key"),
            ("LLM_MODELS", "primary"),
            ("WHATSAPP_API_URL", graph_url.as_str()),
        ]);
        let onboarded = app
            .clone()
            .oneshot(post_json(
                "/onboarding",
                json!({
                    "business_name": "Sharma Store",
                    "whatsapp_number": "+15550100200",
                    "phone_number_id": "pid123",
                    "access_token": "EAAG-secret-token"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(onboarded.status(), StatusCode::OK);

        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "metadata": { "phone_number_id": "pid123" },
                "messages": [{ "from": "15551234567", "id": "wamid.in", "type": "text", "text": { "body": "When do you open?" } }]
            } }] }]
        });
        let response = tokio::time::timeout(
            Duration::from_millis(1500),
            app.oneshot(post_json("/webhook", payload)),
        )
        .await
        .expect("webhook answered while the model was still thinking")
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["events"], 1);

        tokio::time::timeout(Duration::from_secs(10), async {
            while store.message_count().await < 2 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("reply stored in the background");
    }

    #[tokio::test]
    async fn history_routes_are_tenant_scoped() {
        let (store, app) = test_app(&[]);
        let tracker = ConversationTracker::new(store.clone());
        let messages = MessageStore::new(store.clone());

        let asha = tracker.get_or_create("t1", "c-asha", "whatsapp").await.unwrap();
        let ravi = tracker.get_or_create("t1", "c-ravi", "whatsapp").await.unwrap();
        let foreign = tracker.get_or_create("t2", "c-asha", "whatsapp").await.unwrap();

        let base = Utc::now();
        let thread = [
            (&asha, "hello"),
            (&asha, "is the shop open?"),
            (&ravi, "need rice"),
            (&asha, "thanks!"),
            (&foreign, "other tenant"),
        ];
        for (i, (conversation, text)) in thread.into_iter().enumerate() {
            let mut new = NewMessage::outbound(conversation, text);
            new.created_at = Some(base + chrono::Duration::seconds(i as i64));
            messages.insert(new).await.unwrap();
        }
        store
            .touch_conversation("t1", &asha.id, base + chrono::Duration::minutes(1))
            .await
            .unwrap();

        let inbox = body_json(
            app.clone()
                .oneshot(get_request("/tenants/t1/conversations"))
                .await
                .unwrap(),
        )
        .await;
        let inbox = inbox["conversations"].as_array().unwrap().clone();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0]["conversation"]["id"], asha.id.as_str());
        assert_eq!(inbox[0]["last_message"]["content"]["text"], "thanks!");
        assert_eq!(inbox[1]["last_message"]["content"]["text"], "need rice");

        let transcript = body_json(
            app.clone()
                .oneshot(get_request(&format!(
                    "/tenants/t1/conversations/{}/messages",
                    asha.id
                )))
                .await
                .unwrap(),
        )
        .await;
        let texts = transcript["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"]["text"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["hello", "is the shop open?", "thanks!"]);

        let cross_tenant = app
            .clone()
            .oneshot(get_request(&format!(
                "/tenants/t1/conversations/{}/messages",
                foreign.id
            )))
            .await
            .unwrap();
        assert_eq!(cross_tenant.status(), StatusCode::NOT_FOUND);

        let by_contact = body_json(
            app.clone()
                .oneshot(get_request("/tenants/t1/messages?contact_id=c-ravi&direction=outbound"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(by_contact["messages"].as_array().unwrap().len(), 1);

        let newest = body_json(
            app.oneshot(get_request("/tenants/t1/messages?limit=1"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(newest["messages"][0]["content"]["text"], "thanks!");
    }
}
