use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Per-message token cost of one logical model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model_id: String,
    pub cost: u64,
}

impl ModelPrice {
    pub fn new(model_id: &str, cost: u64) -> Self {
        Self {
            model_id: model_id.to_string(),
            cost,
        }
    }
}

pub const DEFAULT_MESSAGE_COST: u64 = 100;

pub fn default_prices() -> Vec<ModelPrice> {
    vec![
        ModelPrice::new("gpt-4o", 500),
        ModelPrice::new("gpt-4o-mini", 50),
        ModelPrice::new("claude-3.5-sonnet", 600),
        ModelPrice::new("claude-3.5-haiku", 100),
        ModelPrice::new("gemini-pro", 400),
        ModelPrice::new("gemini-flash", 25),
        ModelPrice::new("grok-2", 300),
        ModelPrice::new("llama-3.1", 20),
        ModelPrice::new("deepseek-chat", 40),
        ModelPrice::new("deepseek-r1", 200),
        ModelPrice::new("mistral-large", 300),
        ModelPrice::new("grok-beta", 300),
    ]
}

/// Static `model id -> cost per message` lookup.
#[derive(Debug, Clone)]
pub struct PricingTable {
    default_cost: u64,
    costs: HashMap<String, u64>,
}

impl PricingTable {
    pub fn new(default_cost: u64, prices: &[ModelPrice]) -> Result<Self> {
        let mut costs = HashMap::with_capacity(prices.len());
        for price in prices {
            if costs.insert(price.model_id.clone(), price.cost).is_some() {
                return Err(Error::validation(format!(
                    "Duplicate price for model '{}'",
                    price.model_id
                )));
            }
        }
        Ok(Self { default_cost, costs })
    }

    /// Unrecognized ids cost the default amount.
    pub fn cost_for(&self, model_id: &str) -> u64 {
        self.costs.get(model_id).copied().unwrap_or(self.default_cost)
    }

    pub fn default_cost(&self) -> u64 {
        self.default_cost
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        let costs = default_prices()
            .into_iter()
            .map(|p| (p.model_id, p.cost))
            .collect();
        Self {
            default_cost: DEFAULT_MESSAGE_COST,
            costs,
        }
    }
}
