use serde::Serialize;

use crate::completion::Usage;

/// Running token totals for one session, summed over every invocation
/// (reducer calls included). Missing fields count as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageAccumulator {
    pub completion_tokens: u64,
    pub prompt_tokens: u64,
    pub total_tokens: u64,
}

impl UsageAccumulator {
    pub fn add(&mut self, usage: &Usage) {
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(usage.completion_tokens.unwrap_or(0));
        self.prompt_tokens = self
            .prompt_tokens
            .saturating_add(usage.prompt_tokens.unwrap_or(0));
        self.total_tokens = self
            .total_tokens
            .saturating_add(usage.total_tokens.unwrap_or(0));
    }
}
