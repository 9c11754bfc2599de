//! Usage records and cost calculation.

use crate::error::{ProxyError, Result};
use crate::ledger::PriceStore;
use crate::tokens::RequestSchema;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Token usage in either API's vocabulary. Which fields are populated tells
/// where the record came from; zero fields are left off the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageData {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub prompt_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub completion_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub total_tokens: u64,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub input_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub output_tokens: u64,
}

impl UsageData {
    /// Build a usage record in the vocabulary of `schema`.
    pub fn from_counts(input: u64, output: u64, schema: RequestSchema) -> Self {
        match schema {
            RequestSchema::Source => Self {
                input_tokens: input,
                output_tokens: output,
                ..Self::default()
            },
            RequestSchema::Target => Self {
                prompt_tokens: input,
                completion_tokens: output,
                total_tokens: input + output,
                ..Self::default()
            },
        }
    }

    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Guess the vocabulary: any non-zero prompt/completion count means target
    /// form. An all-zero record reads as source form.
    pub fn provenance(&self) -> RequestSchema {
        if self.prompt_tokens > 0 || self.completion_tokens > 0 {
            RequestSchema::Target
        } else {
            RequestSchema::Source
        }
    }

    /// `(input, output)` token counts according to [`provenance`](Self::provenance).
    pub fn input_output(&self) -> (u64, u64) {
        match self.provenance() {
            RequestSchema::Target => (self.prompt_tokens, self.completion_tokens),
            RequestSchema::Source => (self.input_tokens, self.output_tokens),
        }
    }
}

/// Unit prices for one model, in a single currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model_name: String,
    pub input_price: f64,
    pub output_price: f64,
}

impl ModelPrice {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 * self.input_price + output_tokens as f64 * self.output_price
    }
}

/// Turns recorded usage into money using the shared price table.
#[derive(Clone)]
pub struct CostAccountant {
    prices: Arc<dyn PriceStore>,
}

impl CostAccountant {
    pub fn new(prices: Arc<dyn PriceStore>) -> Self {
        Self { prices }
    }

    /// Cost of `usage_json` at `model`'s prices.
    ///
    /// An empty usage string costs nothing. A model with no price is an error.
    pub async fn calculate_cost(&self, model: &str, usage_json: &str) -> Result<f64> {
        if usage_json.is_empty() {
            return Ok(0.0);
        }

        let usage = UsageData::parse(usage_json)?;
        let price = self
            .prices
            .get_price(model)
            .await?
            .ok_or_else(|| ProxyError::price_not_found(model))?;

        let (input, output) = usage.input_output();
        Ok(price.cost(input, output))
    }
}
