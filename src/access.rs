//! Tier gate: decides whether a requested provider is usable at a tier, and
//! runs the wallet verification that feeds it.

use std::sync::Arc;
use std::time::Duration;

use crate::balance::{self, BalanceLookup};
use crate::error::GatewayError;
use crate::tier::{Tier, TierTable};

/// Provider granted to callers that supply no wallet at all.
pub const ANONYMOUS_PROVIDER: &str = "google";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied { reason: String },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    fn denied(model: &str) -> Self {
        Self::Denied {
            reason: format!(
                "Your wallet does not have access to the {model} model. \
                 Please upgrade to a higher tier."
            ),
        }
    }
}

/// Pure allowlist decision.
pub fn check_access(table: &TierTable, tier: Tier, model: &str, provider: &str) -> AccessDecision {
    if tier.is_unrestricted() {
        return AccessDecision::Allowed;
    }

    let allowed = table.allowed_providers(tier);
    if allowed.is_empty() {
        return AccessDecision::Allowed;
    }

    let requested = provider.to_lowercase();
    let matched = allowed.iter().any(|pattern| {
        let pattern = pattern.to_lowercase();
        requested.contains(&pattern) || pattern.contains(&requested)
    });

    if matched {
        AccessDecision::Allowed
    } else {
        AccessDecision::denied(model)
    }
}

/// Outcome of a wallet verification.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub tier: Tier,
    pub balance: f64,
    pub decision: AccessDecision,
}

pub struct AccessGate {
    tiers: Arc<TierTable>,
    balances: Arc<dyn BalanceLookup>,
    timeout: Duration,
}

impl AccessGate {
    pub fn new(tiers: Arc<TierTable>, balances: Arc<dyn BalanceLookup>, timeout: Duration) -> Self {
        Self {
            tiers,
            balances,
            timeout,
        }
    }

    pub fn check_access(&self, tier: Tier, model: &str, provider: &str) -> AccessDecision {
        check_access(&self.tiers, tier, model, provider)
    }

    /// Fetch the balance for a wallet under the configured timeout.
    pub async fn balance_of(&self, wallet: &str) -> Result<f64, GatewayError> {
        balance::validate_address(wallet)?;
        let balance = tokio::time::timeout(self.timeout, self.balances.balance_of(wallet))
            .await
            .map_err(|_| GatewayError::Timeout(self.timeout.as_millis() as u64))??;
        Ok(balance)
    }

    /// Resolve tier and access for an optional wallet.
    ///
    /// Without a wallet the caller is FREE and only [`ANONYMOUS_PROVIDER`] is
    /// usable. With a wallet but no model/provider pair, access is granted and
    /// only the tier is reported.
    pub async fn verify(
        &self,
        wallet: Option<&str>,
        model: Option<&str>,
        provider: Option<&str>,
    ) -> Result<Verdict, GatewayError> {
        let Some(wallet) = wallet.filter(|w| !w.trim().is_empty()) else {
            let anonymous_ok =
                provider.is_some_and(|p| p.eq_ignore_ascii_case(ANONYMOUS_PROVIDER));
            let decision = if anonymous_ok {
                AccessDecision::Allowed
            } else {
                AccessDecision::denied(model.unwrap_or("requested"))
            };
            return Ok(Verdict {
                tier: Tier::Free,
                balance: 0.0,
                decision,
            });
        };

        let balance = self.balance_of(wallet).await?;
        let tier = self.tiers.resolve_tier(balance);
        let decision = match (model, provider) {
            (Some(model), Some(provider)) => self.check_access(tier, model, provider),
            _ => AccessDecision::Allowed,
        };

        Ok(Verdict {
            tier,
            balance,
            decision,
        })
    }

    /// Gate a chat request.
    ///
    /// Fails open: when a wallet was supplied but verification errored or
    /// timed out, the error is logged and the request proceeds. Only an
    /// explicit denial blocks.
    pub async fn authorize_chat(
        &self,
        wallet: Option<&str>,
        model: &str,
        provider: &str,
    ) -> Result<(), GatewayError> {
        match self.verify(wallet, Some(model), Some(provider)).await {
            Ok(Verdict {
                decision: AccessDecision::Denied { reason },
                ..
            }) => Err(GatewayError::AccessDenied {
                model: model.to_string(),
                reason,
            }),
            Ok(verdict) => {
                tracing::debug!(
                    wallet = wallet.unwrap_or("none"),
                    tier = %verdict.tier,
                    model,
                    "tier access granted"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    wallet = wallet.unwrap_or("none"),
                    error = %e,
                    "error verifying wallet tier access, allowing request"
                );
                Ok(())
            }
        }
    }
}
