use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::completion::registry::ProviderEntry;
use crate::error::GatewayError;
use crate::session::{DEFAULT_MAX_RESPONSE_SEGMENTS, DEFAULT_MAX_TOKENS, SessionConfig};
use crate::tier::{Tier, TierRule, TierTable};

pub const DEFAULT_CONFIG_PATH: &str = "tiergate.toml";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:5174";
pub const DEFAULT_VERIFICATION_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_PROVIDER: &str = "Google";

/// Built-in providers: (name, chat/completions URL, API key env var).
const BUILTIN_PROVIDERS: &[(&str, &str, &str)] = &[
    (
        "Google",
        "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions",
        "GOOGLE_GENERATIVE_AI_API_KEY",
    ),
    (
        "Deepseek",
        "https://api.deepseek.com/chat/completions",
        "DEEPSEEK_API_KEY",
    ),
    (
        "Anthropic",
        "https://api.anthropic.com/v1/chat/completions",
        "ANTHROPIC_API_KEY",
    ),
    (
        "OpenAI",
        "https://api.openai.com/v1/chat/completions",
        "OPENAI_API_KEY",
    ),
    (
        "OpenRouter",
        "https://openrouter.ai/api/v1/chat/completions",
        "OPEN_ROUTER_API_KEY",
    ),
];

/// On-disk shape of `tiergate.toml`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub max_response_segments: Option<u32>,
    pub max_tokens: Option<u32>,
    pub verification_timeout_ms: Option<u64>,
    pub default_model: Option<String>,
    pub default_provider: Option<String>,
    pub system_prompt: Option<String>,
    /// Keyed by tier name (`free`, `tier1`, ...). Layered over the defaults.
    pub tiers: HashMap<String, TierRule>,
    /// Replaces the built-in provider list when non-empty.
    pub providers: Vec<ProviderFile>,
    /// Static wallet balances served by the built-in lookup.
    pub balances: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderFile {
    pub name: String,
    pub base_url: String,
    pub api_key_env: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub session: SessionConfig,
    pub verification_timeout: Duration,
    pub default_model: String,
    pub default_provider: String,
    pub system_prompt: Option<String>,
    pub tiers: TierTable,
    pub providers: Vec<ProviderEntry>,
    pub balances: HashMap<String, f64>,
}

impl Config {
    /// Read `$TIERGATE_CONFIG` (or `tiergate.toml` if present) and apply
    /// environment overrides.
    pub fn load() -> Result<Self, GatewayError> {
        let file = match env::var("TIERGATE_CONFIG") {
            Ok(path) => Self::read_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::read_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => {
                tracing::info!("no config file found, using built-in defaults");
                FileConfig::default()
            }
        };
        Self::build(file, |key| env::var(key).ok())
    }

    fn read_file(path: &Path) -> Result<FileConfig, GatewayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Self::parse_file(&raw)
    }

    pub fn parse_file(raw: &str) -> Result<FileConfig, GatewayError> {
        toml::from_str(raw).map_err(|e| GatewayError::Config(e.to_string()))
    }

    pub fn from_toml_str(
        raw: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, GatewayError> {
        Self::build(Self::parse_file(raw)?, env)
    }

    /// Merge file values, environment overrides and defaults. `env` is the
    /// variable lookup, injectable for tests.
    pub fn build(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, GatewayError> {
        let listen = env("TIERGATE_LISTEN")
            .or(file.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen_addr = listen
            .parse()
            .map_err(|e| GatewayError::Config(format!("invalid listen address {listen:?}: {e}")))?;

        let session = SessionConfig {
            max_response_segments: override_num(&env, "MAX_RESPONSE_SEGMENTS")?
                .or(file.max_response_segments)
                .unwrap_or(DEFAULT_MAX_RESPONSE_SEGMENTS),
            max_tokens: override_num(&env, "MAX_TOKENS")?
                .or(file.max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
        };
        if session.max_tokens == 0 {
            return Err(GatewayError::Config("max_tokens must be positive".to_string()));
        }

        let verification_timeout = Duration::from_millis(
            override_num(&env, "VERIFICATION_TIMEOUT_MS")?
                .or(file.verification_timeout_ms)
                .unwrap_or(DEFAULT_VERIFICATION_TIMEOUT_MS),
        );

        let tier_overrides = file
            .tiers
            .into_iter()
            .map(|(name, rule)| Ok((name.parse::<Tier>()?, rule)))
            .collect::<Result<HashMap<_, _>, GatewayError>>()?;
        let tiers = TierTable::with_overrides(tier_overrides)?;

        let providers = if file.providers.is_empty() {
            BUILTIN_PROVIDERS
                .iter()
                .map(|(name, url, key_env)| provider_entry(name, url, key_env, &env))
                .collect::<Vec<_>>()
        } else {
            file.providers
                .iter()
                .map(|p| provider_entry(&p.name, &p.base_url, &p.api_key_env, &env))
                .collect()
        };
        if providers.iter().all(|p| p.api_key.is_none()) {
            tracing::error!("no provider API keys configured, every chat request will fail");
        }

        Ok(Config {
            listen_addr,
            session,
            verification_timeout,
            default_model: file
                .default_model
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            default_provider: file
                .default_provider
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            system_prompt: file.system_prompt,
            tiers,
            providers,
            balances: file.balances,
        })
    }
}

fn provider_entry(
    name: &str,
    base_url: &str,
    key_env: &str,
    env: &impl Fn(&str) -> Option<String>,
) -> ProviderEntry {
    let api_key = env(key_env).filter(|k| !k.trim().is_empty());
    if api_key.is_none() {
        tracing::warn!("{key_env} not set, {name} models unavailable");
    }
    ProviderEntry {
        name: name.to_string(),
        base_url: base_url.to_string(),
        api_key,
    }
}

fn override_num<T>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, GatewayError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| GatewayError::Config(format!("invalid {key} {raw:?}: {e}")))
        })
        .transpose()
}
