//! Model identification and the static price table.

use crate::{Money, TokenCount};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Model an agent's tokens were billed against.
///
/// Parsed from the `model` field of usage events. Ids are matched by family
/// prefix so dated snapshots resolve to the same price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Model {
    ClaudeOpus,
    ClaudeSonnet,
    ClaudeHaiku,
    Gpt4o,
    Gpt4oMini,
    /// Unknown model; costs nothing until priced
    #[default]
    Unknown,
}

impl Model {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ClaudeOpus => "Claude Opus",
            Self::ClaudeSonnet => "Claude Sonnet",
            Self::ClaudeHaiku => "Claude Haiku",
            Self::Gpt4o => "GPT-4o",
            Self::Gpt4oMini => "GPT-4o mini",
            Self::Unknown => "Unknown",
        }
    }

    /// Input-token price per thousand tokens (USD).
    pub fn price_per_thousand(&self) -> f64 {
        match self {
            Self::ClaudeOpus => 0.015,
            Self::ClaudeSonnet => 0.003,
            Self::ClaudeHaiku => 0.0008,
            Self::Gpt4o => 0.0025,
            Self::Gpt4oMini => 0.00015,
            Self::Unknown => 0.0,
        }
    }

    /// `tokens * price_per_thousand / 1000`.
    pub fn cost(&self, tokens: TokenCount) -> Money {
        Money::for_tokens(tokens, self.price_per_thousand())
    }

    /// Parses a model from its id string.
    pub fn from_id(id: &str) -> Self {
        let id = id.to_lowercase();
        if id.contains("opus") {
            Self::ClaudeOpus
        } else if id.contains("sonnet") {
            Self::ClaudeSonnet
        } else if id.contains("haiku") {
            Self::ClaudeHaiku
        } else if id.starts_with("gpt-4o-mini") {
            Self::Gpt4oMini
        } else if id.starts_with("gpt-4o") {
            Self::Gpt4o
        } else {
            Self::Unknown
        }
    }

    /// Cost of `tokens` for an optional model id; unknown or missing models cost 0.
    pub fn cost_for(model: Option<&str>, tokens: TokenCount) -> Money {
        model.map(Self::from_id).unwrap_or_default().cost(tokens)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_from_id() {
        assert_eq!(Model::from_id("claude-sonnet-4-20250514"), Model::ClaudeSonnet);
        assert_eq!(Model::from_id("claude-opus-4-5-20251101"), Model::ClaudeOpus);
        assert_eq!(Model::from_id("gpt-4o-mini-2024"), Model::Gpt4oMini);
        assert_eq!(Model::from_id("gpt-4o"), Model::Gpt4o);
        assert_eq!(Model::from_id("llama-3"), Model::Unknown);
    }

    #[test]
    fn test_cost_per_thousand() {
        let cost = Model::ClaudeSonnet.cost(TokenCount::new(10_000));
        assert_eq!(cost, Money::from_usd(0.03));
    }

    #[test]
    fn test_unknown_model_is_free() {
        assert!(Model::cost_for(Some("mystery"), TokenCount::new(1_000_000)).is_zero());
        assert!(Model::cost_for(None, TokenCount::new(1_000)).is_zero());
    }
}
