//! End-to-end checks of the HTTP surface with a scripted completion backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use tiergate::access::AccessGate;
use tiergate::balance::StaticBalances;
use tiergate::completion::{
    CompletionBackend, CompletionEvent, CompletionRequest, CompletionSource, FinishReason, Usage,
};
use tiergate::error::GatewayError;
use tiergate::server::GatewayServer;
use tiergate::session::SessionConfig;
use tiergate::tier::TierTable;
use tower::ServiceExt;

const TIER1_WALLET: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
const TIER2_WALLET: &str = "7EcDhSYGxXyscszYEp35KHN8vvw3svAuLKTzXwCFLtV";
const WHALE_WALLET: &str = "DRpbCBMxVnDK7maPM5tGv6MvB3v1sRMC86PZ8okm21hy";

/// Backend that replays `finishes` in order (the last one repeats), one
/// text chunk per invocation. Providers outside `keyed` have no credentials.
struct ScriptedBackend {
    finishes: Vec<FinishReason>,
    reasoning: bool,
    keyed: Vec<&'static str>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn new(finishes: Vec<FinishReason>) -> Self {
        Self {
            finishes,
            reasoning: false,
            keyed: vec!["google", "deepseek", "anthropic"],
            calls: AtomicUsize::new(0),
        }
    }
}

impl CompletionBackend for ScriptedBackend {
    fn open(
        &self,
        _req: CompletionRequest,
    ) -> BoxFuture<'_, Result<CompletionSource, GatewayError>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let finish = self.finishes[n.min(self.finishes.len() - 1)];
        let mut events = Vec::new();
        if self.reasoning {
            events.push(CompletionEvent::ReasoningDelta("thinking".to_string()));
        }
        events.push(CompletionEvent::TextDelta(format!("Hello{n}")));
        events.push(CompletionEvent::Finish(finish));
        events.push(CompletionEvent::Usage(Usage {
            prompt_tokens: Some(20),
            completion_tokens: Some(10),
            total_tokens: Some(30),
        }));
        Box::pin(async move { Ok(futures_util::stream::iter(events).boxed()) })
    }

    fn ensure_credentials(&self, provider: &str) -> Result<(), GatewayError> {
        let provider = provider.to_lowercase();
        if !["google", "deepseek", "anthropic", "openai"].contains(&provider.as_str()) {
            return Err(GatewayError::ProviderNotFound { provider });
        }
        if self.keyed.contains(&provider.as_str()) {
            Ok(())
        } else {
            Err(GatewayError::AuthFailed {
                provider,
                message: "missing API key".to_string(),
            })
        }
    }
}

fn gate() -> AccessGate {
    let balances = HashMap::from([
        (TIER1_WALLET.to_string(), 150_000.0),
        (TIER2_WALLET.to_string(), 400_000.0),
        (WHALE_WALLET.to_string(), 25_000_000.0),
    ]);
    AccessGate::new(
        Arc::new(TierTable::default()),
        Arc::new(StaticBalances::new(balances)),
        Duration::from_millis(200),
    )
}

fn app_with(backend: ScriptedBackend) -> axum::Router {
    GatewayServer::from_parts(gate(), Arc::new(backend), SessionConfig::default()).router()
}

fn app() -> axum::Router {
    app_with(ScriptedBackend::new(vec![FinishReason::Stop]))
}

fn chat_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn chat(model: &str, provider: &str, wallet: Option<&str>) -> Request<Body> {
    chat_request(serde_json::json!({
        "messages": [{"role": "user", "content": "build me a todo app"}],
        "model": model,
        "provider": provider,
        "walletAddress": wallet,
    }))
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

// ---------------------------------------------------------------------------
// /api/chat gating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn anonymous_google_streams() {
    let response = app()
        .oneshot(chat("gemini-2.0-flash", "Google", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers[header::CONTENT_TYPE],
        "text/event-stream; charset=utf-8"
    );
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers[header::CONNECTION], "keep-alive");

    let body = body_string(response).await;
    let lines: Vec<&str> = body.lines().collect();
    assert!(lines[0].starts_with("f:{\"messageId\":"));
    assert!(lines.contains(&"0:\"Hello0\""));
    assert!(lines.last().unwrap().starts_with("d:{\"finishReason\":\"stop\""));
}

#[tokio::test]
async fn anonymous_openai_is_denied() {
    let response = app()
        .oneshot(chat("gpt-4o", "OpenAI", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    let error = body["error"].as_str().unwrap();
    assert!(error.contains("gpt-4o"));
    assert!(error.contains("upgrade"));
}

#[tokio::test]
async fn tier_allowlist_applies_to_wallets() {
    let allowed = app()
        .oneshot(chat("deepseek-r1", "Deepseek", Some(TIER1_WALLET)))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    let denied = app()
        .oneshot(chat("claude-3-7-sonnet", "Anthropic", Some(TIER1_WALLET)))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let upgraded = app()
        .oneshot(chat("claude-3-7-sonnet", "Anthropic", Some(TIER2_WALLET)))
        .await
        .unwrap();
    assert_eq!(upgraded.status(), StatusCode::OK);
}

#[tokio::test]
async fn malformed_wallet_fails_open() {
    let response = app()
        .oneshot(chat("claude-3-7-sonnet", "Anthropic", Some("not-a-wallet")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_provider_key_is_401() {
    let response = app()
        .oneshot(chat("gpt-4o", "OpenAI", Some(WHALE_WALLET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_string(response).await, "Invalid or missing API key");
}

#[tokio::test]
async fn unknown_provider_is_500_with_empty_body() {
    let response = app()
        .oneshot(chat("grok", "xAI", Some(WHALE_WALLET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_string(response).await.is_empty());
}

/// Sets its flag when the source holding it is dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Each source sends one chunk and then never finishes.
struct StallingBackend {
    calls: Arc<AtomicUsize>,
    dropped: Arc<AtomicBool>,
}

impl CompletionBackend for StallingBackend {
    fn open(
        &self,
        _req: CompletionRequest,
    ) -> BoxFuture<'_, Result<CompletionSource, GatewayError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let flag = DropFlag(self.dropped.clone());
        let source = futures_util::stream::iter(vec![CompletionEvent::TextDelta("Hi".into())])
            .chain(futures_util::stream::pending())
            .map(move |event| {
                let _ = &flag;
                event
            })
            .boxed();
        Box::pin(async move { Ok(source) })
    }
}

#[tokio::test]
async fn dropping_the_body_cancels_the_session() {
    let calls = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicBool::new(false));
    let backend = StallingBackend {
        calls: calls.clone(),
        dropped: dropped.clone(),
    };
    let app =
        GatewayServer::from_parts(gate(), Arc::new(backend), SessionConfig::default()).router();

    let response = app
        .oneshot(chat("gemini-2.0-flash", "Google", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let mut seen = String::new();
    while !seen.contains("0:\"Hi\"") {
        let chunk = body.next().await.unwrap().unwrap();
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(!dropped.load(Ordering::SeqCst));
    drop(body);

    tokio::time::timeout(Duration::from_secs(2), async {
        while !dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upstream source was not released after the client went away");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_chat_body_is_500_with_empty_body() {
    let request = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from("{\"messages\": not json"))
        .unwrap();
    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(response).await, "");
}

#[tokio::test]
async fn model_and_provider_come_from_message_markers() {
    // Without explicit fields the gate is skipped and markers pick the
    // provider; OpenAI has no key so the pre-flight rejects it.
    let response = app()
        .oneshot(chat_request(serde_json::json!({
            "messages": [{
                "role": "user",
                "content": "[Model: gpt-4o]\n\n[Provider: OpenAI]\n\nhello"
            }],
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app()
        .oneshot(chat_request(serde_json::json!({
            "messages": [{"role": "user", "content": "hello"}],
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ---------------------------------------------------------------------------
// /api/chat stream content
// ---------------------------------------------------------------------------

#[tokio::test]
async fn truncation_is_continued_in_one_body() {
    let backend = ScriptedBackend::new(vec![FinishReason::Length, FinishReason::Stop]);
    let response = app_with(backend)
        .oneshot(chat("gemini-2.0-flash", "Google", None))
        .await
        .unwrap();
    let body = body_string(response).await;

    assert!(body.contains("0:\"Hello0\"\n"));
    assert!(body.contains("0:\"Hello1\"\n"));
    assert!(!body.contains("\n3:"));

    let usage: Vec<serde_json::Value> = body
        .lines()
        .filter_map(|l| l.strip_prefix("8:"))
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
        .filter(|v| v[0]["type"] == "usage")
        .collect();
    assert_eq!(usage.len(), 2);
    assert_eq!(usage[1][0]["value"]["totalTokens"], 60);
    assert_eq!(usage[1][0]["value"]["completionTokens"], 20);
}

#[tokio::test]
async fn segment_limit_sends_one_error_frame() {
    let backend = ScriptedBackend::new(vec![FinishReason::Length]);
    let response = app_with(backend)
        .oneshot(chat("gemini-2.0-flash", "Google", None))
        .await
        .unwrap();
    let body = body_string(response).await;

    let errors: Vec<&str> = body.lines().filter(|l| l.starts_with("3:")).collect();
    assert_eq!(
        errors,
        vec!["3:\"Cannot continue message: Maximum segments reached\""]
    );
    // Default of 2 continuations: three invocations reached the client.
    assert!(body.contains("0:\"Hello2\""));
    assert!(!body.contains("0:\"Hello3\""));
    assert!(!body.lines().any(|l| l.starts_with("d:")));
}

#[tokio::test]
async fn reasoning_is_wrapped_on_the_wire() {
    let mut backend = ScriptedBackend::new(vec![FinishReason::Stop]);
    backend.reasoning = true;
    let response = app_with(backend)
        .oneshot(chat("deepseek-r1", "Deepseek", Some(TIER1_WALLET)))
        .await
        .unwrap();
    let body = body_string(response).await;

    let expected = "0:\"<div class=\\\"__boltThought__\\\">\"\n0:\"thinking\"\n0:\"</div>\\n\"\n0:\"Hello0\"\n";
    assert!(body.contains(expected), "body was: {body}");
    assert!(!body.lines().any(|l| l.starts_with("g:")));
}

#[tokio::test]
async fn progress_orders_increase() {
    let response = app()
        .oneshot(chat("gemini-2.0-flash", "Google", None))
        .await
        .unwrap();
    let body = body_string(response).await;
    let orders: Vec<u64> = body
        .lines()
        .filter_map(|l| l.strip_prefix("2:"))
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()[0]["order"]
            .as_u64()
            .unwrap())
        .collect();
    assert_eq!(orders, vec![1, 2]);
}

// ---------------------------------------------------------------------------
// /api/verify-wallet and /api/fetch-balance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn verify_without_wallet() {
    let response = app()
        .oneshot(get("/api/verify-wallet?model=gemini&provider=google"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tier"], "free");
    assert_eq!(body["hasAccess"], true);
    assert_eq!(body["balance"], "0");
    assert!(body["timestamp"].as_u64().unwrap() > 0);

    let body = body_json(
        app()
            .oneshot(get("/api/verify-wallet?model=gpt-4o&provider=openai"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["hasAccess"], false);
}

#[tokio::test]
async fn verify_with_wallet() {
    let uri = format!("/api/verify-wallet?wallet={TIER2_WALLET}&model=claude&provider=Anthropic");
    let body = body_json(app().oneshot(get(&uri)).await.unwrap()).await;
    assert_eq!(body["tier"], "tier2");
    assert_eq!(body["hasAccess"], true);
    assert_eq!(body["balance"], "400000");

    let uri = format!("/api/verify-wallet?wallet={TIER2_WALLET}&model=gpt-4o&provider=OpenAI");
    let body = body_json(app().oneshot(get(&uri)).await.unwrap()).await;
    assert_eq!(body["hasAccess"], false);

    // Tier lookup only.
    let uri = format!("/api/verify-wallet?wallet={WHALE_WALLET}");
    let body = body_json(app().oneshot(get(&uri)).await.unwrap()).await;
    assert_eq!(body["tier"], "whale");
    assert_eq!(body["hasAccess"], true);
}

#[tokio::test]
async fn verify_with_malformed_wallet_is_500() {
    let response = app()
        .oneshot(get("/api/verify-wallet?wallet=0OIl"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .starts_with("Failed to verify wallet: ")
    );
    assert_eq!(body["hasAccess"], false);
}

#[tokio::test]
async fn fetch_balance() {
    let uri = format!("/api/fetch-balance?wallet={TIER1_WALLET}");
    let body = body_json(app().oneshot(get(&uri)).await.unwrap()).await;
    assert_eq!(body["balance"], 150_000.0);

    let body = body_json(app().oneshot(get("/api/fetch-balance")).await.unwrap()).await;
    assert_eq!(body["balance"], 0.0);
}

#[tokio::test]
async fn health() {
    let response = app().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}
