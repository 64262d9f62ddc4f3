use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::access::AccessGate;
use crate::balance::StaticBalances;
use crate::completion::registry::Registry;
use crate::completion::{CompletionBackend, FileMap, Message, Role};
use crate::config::{Config, DEFAULT_MODEL, DEFAULT_PROVIDER};
use crate::error::GatewayError;
use crate::reducer::{CompletionReducer, ContextReducer};
use crate::session::{ChatTurn, SessionConfig, StreamSession, extract_properties};
use crate::stream::annotate_stream;
use crate::tier::Tier;

/// One attached file as sent by the client. Folders and binary files carry
/// no usable text and are dropped.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FileEntry {
    Text(String),
    Entry {
        #[serde(rename = "type", default)]
        kind: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(rename = "isBinary", default)]
        is_binary: bool,
    },
}

impl FileEntry {
    fn into_content(self) -> Option<String> {
        match self {
            Self::Text(content) => Some(content),
            Self::Entry {
                kind,
                content,
                is_binary,
            } => {
                if is_binary || kind.as_deref() == Some("folder") {
                    None
                } else {
                    content
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub files: HashMap<String, Option<FileEntry>>,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub context_optimization: bool,
    #[serde(default)]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub wallet: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub tier: Tier,
    pub has_access: bool,
    pub balance: String,
    /// Unix epoch milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub wallet: Option<String>,
}

#[derive(Clone)]
pub struct GatewayServer {
    gate: Arc<AccessGate>,
    backend: Arc<dyn CompletionBackend>,
    reducer: Option<Arc<dyn ContextReducer>>,
    session: SessionConfig,
    default_model: String,
    default_provider: String,
    system_prompt: Option<String>,
}

impl GatewayServer {
    pub fn new(config: Config) -> Result<Self, GatewayError> {
        let registry = Registry::new(config.providers)?;
        let providers: Vec<&str> = registry
            .list_providers()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        tracing::info!(?providers, "provider registry ready");
        let backend: Arc<dyn CompletionBackend> = Arc::new(registry);
        let gate = AccessGate::new(
            Arc::new(config.tiers),
            Arc::new(StaticBalances::new(config.balances)),
            config.verification_timeout,
        );
        let reducer = CompletionReducer::new(backend.clone(), config.session.max_tokens);

        Ok(Self {
            gate: Arc::new(gate),
            backend,
            reducer: Some(Arc::new(reducer)),
            session: config.session,
            default_model: config.default_model,
            default_provider: config.default_provider,
            system_prompt: config.system_prompt,
        })
    }

    /// Assemble a server from ready-made parts. No context reducer is
    /// attached; see [`with_reducer`](Self::with_reducer).
    pub fn from_parts(
        gate: AccessGate,
        backend: Arc<dyn CompletionBackend>,
        session: SessionConfig,
    ) -> Self {
        Self {
            gate: Arc::new(gate),
            backend,
            reducer: None,
            session,
            default_model: DEFAULT_MODEL.to_string(),
            default_provider: DEFAULT_PROVIDER.to_string(),
            system_prompt: None,
        }
    }

    pub fn with_reducer(mut self, reducer: Arc<dyn ContextReducer>) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/api/chat", post(chat_handler))
            .route("/api/verify-wallet", get(verify_wallet_handler))
            .route("/api/fetch-balance", get(fetch_balance_handler))
            .route("/health", get(health_handler))
            .with_state(self)
    }

    /// Gate, resolve and start one chat session. Everything that can fail
    /// with a status code happens before the body starts streaming.
    pub async fn start_chat(&self, request: ChatRequest) -> Result<Response, GatewayError> {
        if let (Some(model), Some(provider)) =
            (request.model.as_deref(), request.provider.as_deref())
        {
            self.gate
                .authorize_chat(request.wallet_address.as_deref(), model, provider)
                .await?;
        }

        let (marker_model, marker_provider) = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(extract_properties)
            .unwrap_or_default();
        let model = request
            .model
            .or(marker_model)
            .unwrap_or_else(|| self.default_model.clone());
        let provider = request
            .provider
            .or(marker_provider)
            .unwrap_or_else(|| self.default_provider.clone());

        self.backend.ensure_credentials(&provider)?;

        let files: FileMap = request
            .files
            .into_iter()
            .filter_map(|(path, entry)| Some((path, entry?.into_content()?)))
            .collect();

        tracing::info!(
            model = %model,
            provider = %provider,
            messages = request.messages.len(),
            files = files.len(),
            prompt_id = request.prompt_id.as_deref().unwrap_or("default"),
            "starting chat session"
        );

        let turn = ChatTurn {
            messages: request.messages,
            files,
            context_optimization: request.context_optimization,
            model,
            provider,
            system_prompt: self.system_prompt.clone(),
        };
        let cancel = CancellationToken::new();
        let (session, rx) =
            StreamSession::channel(turn, self.session, self.backend.clone(), cancel.clone());
        let session = match &self.reducer {
            Some(reducer) => session.with_reducer(reducer.clone()),
            None => session,
        };
        tokio::spawn(session.run());

        // Dropping the body (client went away) cancels the session.
        let guard = cancel.drop_guard();
        let body = annotate_stream(ReceiverStream::new(rx)).map(move |bytes| {
            let _ = &guard;
            Ok::<_, Infallible>(bytes)
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from_stream(body))
            .map_err(|e| GatewayError::Other(format!("failed to build response: {e}")))
    }
}

async fn chat_handler(
    State(server): State<GatewayServer>,
    request: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match request {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::error!(error = %rejection.body_text(), "malformed chat request");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match server.start_chat(request).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                GatewayError::AccessDenied { model, .. } => {
                    tracing::warn!(model = %model, "chat request denied by tier gate");
                }
                other => tracing::error!(error = %other, "failed to start chat session"),
            }
            e.into_response()
        }
    }
}

fn verification_failure(error: &GatewayError) -> Response {
    let detail = match error {
        GatewayError::Verification(detail) => detail.clone(),
        other => other.user_message(),
    };
    tracing::error!(error = %error, "wallet verification failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "error": format!("Failed to verify wallet: {detail}"),
            "hasAccess": false,
        })),
    )
        .into_response()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

async fn verify_wallet_handler(
    State(server): State<GatewayServer>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    let verdict = server
        .gate
        .verify(
            query.wallet.as_deref(),
            query.model.as_deref(),
            query.provider.as_deref(),
        )
        .await;

    match verdict {
        Ok(verdict) => Json(VerifyResponse {
            tier: verdict.tier,
            has_access: verdict.decision.is_allowed(),
            balance: verdict.balance.to_string(),
            timestamp: now_millis(),
        })
        .into_response(),
        Err(e) => verification_failure(&e),
    }
}

async fn fetch_balance_handler(
    State(server): State<GatewayServer>,
    Query(query): Query<BalanceQuery>,
) -> Response {
    let Some(wallet) = query.wallet.filter(|w| !w.trim().is_empty()) else {
        return Json(serde_json::json!({ "balance": 0.0 })).into_response();
    };
    match server.gate.balance_of(&wallet).await {
        Ok(balance) => Json(serde_json::json!({ "balance": balance })).into_response(),
        Err(e) => verification_failure(&e),
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
