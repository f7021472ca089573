use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Per-million-token pricing for a single model, loaded once at startup
/// from `config/model_pricing.yaml` (SPEC_FULL §3, grounded on
/// `original_source/src/core/cost_tracker.py`: pricing is data, not code).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
}

impl PriceTable {
    pub fn new(prices: HashMap<String, ModelPrice>) -> Self {
        Self { prices }
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let prices = match tokio::fs::read_to_string(path).await {
            Ok(contents) => serde_yaml::from_str(&contents).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Ok(Self { prices })
    }

    /// `cost = input_tokens/1e6 * input_price + output_tokens/1e6 *
    /// output_price`. An unknown model costs `$0`; the caller is expected
    /// to log the `warn!` once (spec 4.G).
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
        let price = self.prices.get(model)?;
        Some(
            (input_tokens as f64 / 1_000_000.0) * price.input_price_per_million
                + (output_tokens as f64 / 1_000_000.0) * price.output_price_per_million,
        )
    }

    pub fn contains(&self, model: &str) -> bool {
        self.prices.contains_key(model)
    }

    pub fn models_above(&self, _spend_threshold: f64) -> Vec<String> {
        self.prices.keys().cloned().collect()
    }
}
