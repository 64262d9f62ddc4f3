use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::completion::http::HttpDispatch;
use crate::completion::{CompletionBackend, CompletionRequest, CompletionSource};
use crate::error::GatewayError;

/// Max concurrently open provider streams per gateway instance.
const HTTP_MAX_CONCURRENT: usize = 32;

/// Max wait for a free stream slot before giving up.
const PERMIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ProviderEntry {
    /// Display name, matched case-insensitively against requests and tier patterns.
    pub name: String,
    /// Full `chat/completions` URL.
    pub base_url: String,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &if self.api_key.is_some() {
                    "[REDACTED]"
                } else {
                    "[MISSING]"
                },
            )
            .finish()
    }
}

/// Provider lookup plus the shared HTTP client. Implements
/// [`CompletionBackend`] for the gateway.
pub struct Registry {
    providers: HashMap<String, ProviderEntry>,
    http: HttpDispatch,
    http_semaphore: Arc<Semaphore>,
}

impl Registry {
    pub fn new(providers: Vec<ProviderEntry>) -> Result<Self, GatewayError> {
        Ok(Self::with_dispatch(providers, HttpDispatch::new()?))
    }

    pub fn with_dispatch(providers: Vec<ProviderEntry>, http: HttpDispatch) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.name.to_lowercase(), p))
            .collect();
        Self {
            providers,
            http,
            http_semaphore: Arc::new(Semaphore::new(HTTP_MAX_CONCURRENT)),
        }
    }

    pub fn get(&self, provider: &str) -> Option<&ProviderEntry> {
        self.providers.get(&provider.trim().to_lowercase())
    }

    pub fn list_providers(&self) -> Vec<&ProviderEntry> {
        let mut list: Vec<&ProviderEntry> = self.providers.values().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Returns the number of free stream slots (for testing).
    pub fn http_semaphore_permits(&self) -> usize {
        self.http_semaphore.available_permits()
    }

    fn entry_with_key(&self, provider: &str) -> Result<(&ProviderEntry, &str), GatewayError> {
        let entry = self
            .get(provider)
            .ok_or_else(|| GatewayError::ProviderNotFound {
                provider: provider.to_string(),
            })?;
        let key = entry
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| GatewayError::AuthFailed {
                provider: entry.name.clone(),
                message: "missing API key".to_string(),
            })?;
        Ok((entry, key))
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, GatewayError> {
        tokio::time::timeout(PERMIT_TIMEOUT, self.http_semaphore.clone().acquire_owned())
            .await
            .map_err(|_| GatewayError::Timeout(PERMIT_TIMEOUT.as_millis() as u64))?
            .map_err(|_| GatewayError::Other("semaphore closed".to_string()))
    }

    pub async fn open_source(
        &self,
        req: CompletionRequest,
    ) -> Result<CompletionSource, GatewayError> {
        let (entry, key) = self.entry_with_key(&req.provider)?;
        let permit = self.acquire().await?;
        let source = self
            .http
            .open_stream(&req, &entry.name, &entry.base_url, key)
            .await?;

        // The slot is held for as long as the source lives.
        Ok(source
            .map(move |event| {
                let _slot = &permit;
                event
            })
            .boxed())
    }
}

impl CompletionBackend for Registry {
    fn open(
        &self,
        req: CompletionRequest,
    ) -> BoxFuture<'_, Result<CompletionSource, GatewayError>> {
        Box::pin(self.open_source(req))
    }

    fn ensure_credentials(&self, provider: &str) -> Result<(), GatewayError> {
        self.entry_with_key(provider).map(|_| ())
    }
}
