use serial_test::serial;

use super::load_config;
use super::settings::Settings;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.bus.max_retained, 128);
    assert_eq!(settings.bus.max_message_size_bytes, 262_144);
    assert_eq!(settings.bus.max_payload_size_bytes, 65_536);
    assert_eq!(settings.bus.rate_limit_per_second, 100);
    assert!(!settings.bus.allow_global_wildcard);
    assert_eq!(settings.bus.cleanup_interval_ms, 30_000);
    assert!(settings.bus.routing_enabled);
}

#[test]
#[serial]
fn test_load_config_falls_back_to_defaults() {
    let settings = load_config().expect("load_config should succeed with no sources");
    assert_eq!(settings.bus.max_retained, Settings::default().bus.max_retained);
}

#[test]
#[serial]
fn test_env_overrides_defaults() {
    temp_env::with_vars(
        [
            ("BUS__MAX_RETAINED", Some("7")),
            ("BUS__RATE_LIMIT_PER_SECOND", Some("3")),
        ],
        || {
            let settings = load_config().expect("load_config should succeed");
            assert_eq!(settings.bus.max_retained, 7);
            assert_eq!(settings.bus.rate_limit_per_second, 3);
            // Untouched keys keep their defaults
            assert_eq!(settings.bus.cleanup_interval_ms, 30_000);
        },
    );
}
