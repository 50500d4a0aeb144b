// Pricing calculations for Anthropic API usage
//
// Used to fill in the cost field of a usage record when the upstream gateway
// does not report one. Pricing data sourced from: https://www.anthropic.com/pricing

/// Pricing information for a specific model
#[derive(Debug, Clone)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_write_per_million: f64,
    pub cache_read_per_million: f64,
}

/// Get pricing for a specific model
/// Returns None for models we have no table entry for - callers should leave
/// cost unset rather than guess.
pub fn get_pricing(model: &str) -> Option<ModelPricing> {
    match model {
        // Claude 3.5 Sonnet (Latest)
        "claude-3-5-sonnet-20241022" => Some(ModelPricing {
            input_per_million: 3.00,
            output_per_million: 15.00,
            cache_write_per_million: 3.75,
            cache_read_per_million: 0.30,
        }),

        // Claude 3.5 Haiku
        "claude-3-5-haiku-20241022" => Some(ModelPricing {
            input_per_million: 1.00,
            output_per_million: 5.00,
            cache_write_per_million: 1.25,
            cache_read_per_million: 0.10,
        }),

        // Claude 3 Opus
        "claude-3-opus-20240229" => Some(ModelPricing {
            input_per_million: 15.00,
            output_per_million: 75.00,
            cache_write_per_million: 18.75,
            cache_read_per_million: 1.50,
        }),

        // Claude 3 Sonnet (older)
        "claude-3-sonnet-20240229" => Some(ModelPricing {
            input_per_million: 3.00,
            output_per_million: 15.00,
            cache_write_per_million: 3.75,
            cache_read_per_million: 0.30,
        }),

        // Claude 3 Haiku (older)
        "claude-3-haiku-20240307" => Some(ModelPricing {
            input_per_million: 0.25,
            output_per_million: 1.25,
            cache_write_per_million: 0.30,
            cache_read_per_million: 0.03,
        }),

        _ => None,
    }
}

/// Calculate cost in USD for the given token usage
/// Returns None for unknown models.
pub fn calculate_cost(
    model: &str,
    input_tokens: u64,
    output_tokens: u64,
    cache_creation_tokens: u64,
    cache_read_tokens: u64,
) -> Option<f64> {
    let pricing = get_pricing(model)?;

    let input_cost = (input_tokens as f64 / 1_000_000.0) * pricing.input_per_million;
    let output_cost = (output_tokens as f64 / 1_000_000.0) * pricing.output_per_million;
    let cache_write_cost =
        (cache_creation_tokens as f64 / 1_000_000.0) * pricing.cache_write_per_million;
    let cache_read_cost = (cache_read_tokens as f64 / 1_000_000.0) * pricing.cache_read_per_million;

    Some(input_cost + output_cost + cache_write_cost + cache_read_cost)
}
