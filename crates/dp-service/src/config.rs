use dp_preprocess::DEFAULT_MULTIPLIER;

/// Service-level knobs. The multiplier default applies when a request does
/// not carry `options.drop_outliers_percent`; the ceilings bound per-request
/// memory and are enforced before the core runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub default_multiplier: f64,
    pub max_expression_chars: usize,
    pub max_rows: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_multiplier: DEFAULT_MULTIPLIER,
            max_expression_chars: 4096,
            max_rows: 100_000,
        }
    }
}
