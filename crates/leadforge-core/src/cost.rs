// Per-model token pricing
//
// Rates are USD per million tokens. Lookup falls back through family
// prefixes so dated snapshots (gpt-5-2025-xx) price like their family.

/// Cost breakdown for a single provider call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cost_usd: f64,
}

struct ModelRate {
    prefix: &'static str,
    input_per_million: f64,
    output_per_million: f64,
}

// Ordered most-specific first; the first matching prefix wins.
const RATES: &[ModelRate] = &[
    ModelRate { prefix: "gpt-5-mini", input_per_million: 0.25, output_per_million: 2.0 },
    ModelRate { prefix: "gpt-5-nano", input_per_million: 0.05, output_per_million: 0.4 },
    ModelRate { prefix: "gpt-5", input_per_million: 1.25, output_per_million: 10.0 },
    ModelRate { prefix: "gpt-4o-mini", input_per_million: 0.15, output_per_million: 0.6 },
    ModelRate { prefix: "gpt-4o", input_per_million: 2.5, output_per_million: 10.0 },
    ModelRate { prefix: "gpt-4.1-mini", input_per_million: 0.4, output_per_million: 1.6 },
    ModelRate { prefix: "gpt-4.1", input_per_million: 2.0, output_per_million: 8.0 },
    ModelRate { prefix: "o4-mini-deep-research", input_per_million: 2.0, output_per_million: 8.0 },
    ModelRate { prefix: "o4-mini", input_per_million: 1.1, output_per_million: 4.4 },
    ModelRate { prefix: "o3-deep-research", input_per_million: 10.0, output_per_million: 40.0 },
    ModelRate { prefix: "o3-mini", input_per_million: 1.1, output_per_million: 4.4 },
    ModelRate { prefix: "o3", input_per_million: 2.0, output_per_million: 8.0 },
    ModelRate { prefix: "o1", input_per_million: 15.0, output_per_million: 60.0 },
    ModelRate { prefix: "computer-use-preview", input_per_million: 3.0, output_per_million: 12.0 },
    ModelRate { prefix: "gpt-image", input_per_million: 5.0, output_per_million: 40.0 },
];

// Unrecognized models are billed at the flagship rate rather than zero, so
// costs are never silently undercounted.
const FALLBACK: ModelRate = ModelRate {
    prefix: "",
    input_per_million: 1.25,
    output_per_million: 10.0,
};

fn rate_for(model: &str) -> &'static ModelRate {
    let normalized = model.trim().to_lowercase();
    RATES
        .iter()
        .find(|r| normalized.starts_with(r.prefix))
        .unwrap_or(&FALLBACK)
}

/// `(model, input_tokens, output_tokens) -> usd`
pub fn calculate_cost(model: &str, input_tokens: u32, output_tokens: u32) -> CostBreakdown {
    let rate = rate_for(model);
    let input_cost = input_tokens as f64 / 1_000_000.0 * rate.input_per_million;
    let output_cost = output_tokens as f64 / 1_000_000.0 * rate.output_per_million;
    CostBreakdown {
        input_cost,
        output_cost,
        cost_usd: input_cost + output_cost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tokens_cost_nothing() {
        assert_eq!(calculate_cost("gpt-5", 0, 0).cost_usd, 0.0);
    }

    #[test]
    fn prefix_fallback_prices_dated_snapshots() {
        let dated = calculate_cost("gpt-5-2025-11-20", 1_000_000, 0);
        let family = calculate_cost("gpt-5", 1_000_000, 0);
        assert_eq!(dated, family);
        assert!((dated.cost_usd - 1.25).abs() < 1e-9);
    }

    #[test]
    fn mini_is_cheaper_than_flagship() {
        let mini = calculate_cost("gpt-5-mini", 1000, 1000);
        let full = calculate_cost("gpt-5", 1000, 1000);
        assert!(mini.cost_usd < full.cost_usd);
    }

    #[test]
    fn unknown_model_uses_fallback_rate() {
        let cost = calculate_cost("mystery-model", 1_000_000, 1_000_000);
        assert!((cost.cost_usd - 11.25).abs() < 1e-9);
    }
}
