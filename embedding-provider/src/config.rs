use crate::embedder::HashedConfig;

/// Default settings for the hashed-feature embedder.
#[derive(Debug, Clone, Copy)]
pub struct HashedDefaults {
    pub dimension: usize,
    pub seed: u64,
    pub max_input_chars: usize,
    pub model_id: &'static str,
}

/// Shared defaults so the service, CLI and tests stay in sync.
pub const HASHED_DEFAULTS: HashedDefaults = HashedDefaults {
    dimension: 384,
    seed: 0x00c7_c7c4_c4c8_e500,
    max_input_chars: 32_768,
    model_id: "hashed-fnv1a-384",
};

/// Convenience helper to build a [`HashedConfig`] from the shared defaults.
pub fn default_hashed_config() -> HashedConfig {
    HashedConfig {
        dimension: HASHED_DEFAULTS.dimension,
        seed: HASHED_DEFAULTS.seed,
        max_input_length: HASHED_DEFAULTS.max_input_chars,
        model_id: HASHED_DEFAULTS.model_id.into(),
    }
}
