use serde::Deserialize;

/// Top-level configuration settings for the host application.
///
/// Currently only bus settings; a host embedding the bus typically nests
/// this under its own configuration tree.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub bus: BusSettings,
}

/// Configuration settings for the bus core and routing engine.
///
/// Controls resource bounds (retained store capacity, message/payload size
/// limits, rate limiting), the global-wildcard gate, the maintenance period,
/// and whether the routing engine is attached at all.
#[derive(Debug, Deserialize, Clone)]
pub struct BusSettings {
    pub max_retained: usize,
    pub max_message_size_bytes: usize,
    pub max_payload_size_bytes: usize,
    pub rate_limit_per_second: u32,
    pub allow_global_wildcard: bool,
    pub cleanup_interval_ms: u64,
    pub routing_enabled: bool,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub bus: Option<PartialBusSettings>,
}

/// Partial bus settings.
///
/// Used for bus configuration from external sources with optional values.
#[derive(Debug, Deserialize)]
pub struct PartialBusSettings {
    pub max_retained: Option<usize>,
    pub max_message_size_bytes: Option<usize>,
    pub max_payload_size_bytes: Option<usize>,
    pub rate_limit_per_second: Option<u32>,
    pub allow_global_wildcard: Option<bool>,
    pub cleanup_interval_ms: Option<u64>,
    pub routing_enabled: Option<bool>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            bus: BusSettings::default(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            max_retained: 128,
            max_message_size_bytes: 262_144,
            max_payload_size_bytes: 65_536,
            rate_limit_per_second: 100,
            allow_global_wildcard: false,
            cleanup_interval_ms: 30_000,
            routing_enabled: true,
        }
    }
}
