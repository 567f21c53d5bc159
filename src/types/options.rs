//! Per-request chat options
//!
//! Options exist at three levels: the client configuration defaults, the
//! per-session defaults and the per-request values. [`ChatOptions::merged_over`]
//! layers them so the most specific non-empty value wins.

use serde::{Deserialize, Serialize};

use super::messages::ChatMessage;

// ============================================================================
// Chat Options
// ============================================================================

/// Model parameters and deprecated free-text fields for one request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatOptions {
    /// Sampling temperature
    pub temperature: Option<f64>,
    /// Nucleus sampling
    pub top_p: Option<f64>,
    /// Frequency penalty
    pub frequency_penalty: Option<f64>,
    /// Presence penalty
    pub presence_penalty: Option<f64>,
    /// Maximum tokens in the answer
    pub max_tokens: Option<u32>,
    /// Deprecated free-text prompt tip, superseded by structured messages
    pub prompt_tip: Option<String>,
    /// Deprecated free-text system tip, superseded by structured messages
    pub system_tip: Option<String>,
    /// Deprecated chat history list, superseded by structured messages
    pub history: Option<Vec<ChatMessage>>,
}

impl ChatOptions {
    /// Create a new builder for `ChatOptions`
    #[must_use]
    pub fn builder() -> ChatOptionsBuilder {
        ChatOptionsBuilder::default()
    }

    /// Layer `self` over `base`: every field set in `self` wins
    #[must_use]
    pub fn merged_over(&self, base: &Self) -> Self {
        Self {
            temperature: self.temperature.or(base.temperature),
            top_p: self.top_p.or(base.top_p),
            frequency_penalty: self.frequency_penalty.or(base.frequency_penalty),
            presence_penalty: self.presence_penalty.or(base.presence_penalty),
            max_tokens: self.max_tokens.or(base.max_tokens),
            prompt_tip: self.prompt_tip.clone().or_else(|| base.prompt_tip.clone()),
            system_tip: self.system_tip.clone().or_else(|| base.system_tip.clone()),
            history: self.history.clone().or_else(|| base.history.clone()),
        }
    }

    /// Whether any of the deprecated free-text fields is set
    #[must_use]
    pub fn has_legacy_fields(&self) -> bool {
        self.prompt_tip.is_some() || self.system_tip.is_some() || self.history.is_some()
    }

    /// Drop the deprecated free-text fields
    #[must_use]
    pub fn without_legacy_fields(mut self) -> Self {
        self.prompt_tip = None;
        self.system_tip = None;
        self.history = None;
        self
    }
}

// ============================================================================
// Builder for ChatOptions
// ============================================================================

/// Builder for `ChatOptions`
#[derive(Debug, Default)]
pub struct ChatOptionsBuilder {
    options: ChatOptions,
}

impl ChatOptionsBuilder {
    /// Set temperature
    #[must_use]
    pub const fn temperature(mut self, value: f64) -> Self {
        self.options.temperature = Some(value);
        self
    }

    /// Set top_p
    #[must_use]
    pub const fn top_p(mut self, value: f64) -> Self {
        self.options.top_p = Some(value);
        self
    }

    /// Set frequency penalty
    #[must_use]
    pub const fn frequency_penalty(mut self, value: f64) -> Self {
        self.options.frequency_penalty = Some(value);
        self
    }

    /// Set presence penalty
    #[must_use]
    pub const fn presence_penalty(mut self, value: f64) -> Self {
        self.options.presence_penalty = Some(value);
        self
    }

    /// Set max tokens
    #[must_use]
    pub const fn max_tokens(mut self, value: u32) -> Self {
        self.options.max_tokens = Some(value);
        self
    }

    /// Set the deprecated prompt tip
    #[must_use]
    pub fn prompt_tip(mut self, tip: impl Into<String>) -> Self {
        self.options.prompt_tip = Some(tip.into());
        self
    }

    /// Set the deprecated system tip
    #[must_use]
    pub fn system_tip(mut self, tip: impl Into<String>) -> Self {
        self.options.system_tip = Some(tip.into());
        self
    }

    /// Set the deprecated chat history list
    #[must_use]
    pub fn history(mut self, history: Vec<ChatMessage>) -> Self {
        self.options.history = Some(history);
        self
    }

    /// Build the options
    #[must_use]
    pub fn build(self) -> ChatOptions {
        self.options
    }
}
