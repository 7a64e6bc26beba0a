//! Integration tests for snakepit-config

use snakepit_config::*;
use std::io::Write;
use std::time::Duration;
use temp_env::with_vars;

#[test]
fn test_default_config_validation() {
    let config = SnakepitConfig::default();
    assert!(config.validate_all().is_ok());
}

#[test]
fn test_config_loader_from_env() {
    let vars = vec![
        ("SNAKEPIT_POOL_SIZE", Some("3")),
        ("SNAKEPIT_CHECKOUT_TIMEOUT_MS", Some("750")),
        ("SNAKEPIT_LOG_LEVEL", Some("debug")),
        ("SNAKEPIT_LOG_FORMAT", Some("json")),
        ("SNAKEPIT_CIRCUIT_FAILURE_THRESHOLD", Some("2")),
    ];

    with_vars(vars, || {
        let config = ConfigLoader::new().from_env().unwrap();

        assert_eq!(config.pool.size, 3);
        assert_eq!(config.pool.checkout_timeout, Duration::from_millis(750));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
    });
}

#[test]
fn test_comprehensive_config_file() {
    let yaml = r#"
pool:
  size: 2
  max_overflow: 1
  min_ready: 1
  checkout_timeout: 2s
  operation_timeout: 500ms

worker:
  command: "/usr/bin/python3"
  args: ["-u", "bridge.py"]
  env:
    PYTHONUNBUFFERED: "1"
  handshake_timeout: 3s

affinity:
  ttl: 200ms

circuit_breaker:
  failure_threshold: 3
  cooldown: 1s

health:
  enabled: false

logging:
  level: warn
  format: compact
"#;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let config = with_vars([("SNAKEPIT_POOL_SIZE", None::<&str>)], || {
        ConfigLoader::new().from_file(file.path()).unwrap()
    });

    assert_eq!(config.pool.size, 2);
    assert_eq!(config.pool.capacity(), 3);
    assert_eq!(config.pool.operation_timeout, Duration::from_millis(500));
    assert_eq!(config.worker.command, "/usr/bin/python3");
    assert_eq!(config.worker.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
    assert_eq!(config.affinity.ttl, Duration::from_millis(200));
    assert!(config.affinity.enabled);
    assert_eq!(config.circuit_breaker.cooldown, Duration::from_secs(1));
    assert!(!config.health.enabled);
    assert_eq!(config.logging.level, LogLevel::Warn);
}

#[test]
fn test_env_overrides_file_values() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"pool:\n  size: 2\n").unwrap();

    with_vars([("SNAKEPIT_POOL_SIZE", Some("5"))], || {
        let config = ConfigLoader::new().load(Some(file.path())).unwrap();
        assert_eq!(config.pool.size, 5);
    });
}

#[test]
fn test_invalid_file_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"pool:\n  size: 0\n").unwrap();

    let err = with_vars([("SNAKEPIT_POOL_SIZE", None::<&str>)], || {
        ConfigLoader::new().from_file(file.path()).unwrap_err()
    });
    assert!(matches!(err, ConfigError::DomainError { .. }));
    assert_eq!(err.domain(), Some("pool"));
}

#[test]
fn test_json_file_is_accepted() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(br#"{"pool": {"size": 3, "checkout_timeout": "250ms"}}"#)
        .unwrap();

    let config = with_vars([("SNAKEPIT_POOL_SIZE", None::<&str>)], || {
        ConfigLoader::new().from_file(file.path()).unwrap()
    });
    assert_eq!(config.pool.size, 3);
    assert_eq!(config.pool.checkout_timeout, Duration::from_millis(250));
}

#[test]
fn test_missing_file_names_the_path() {
    let err = ConfigLoader::new()
        .from_file("/nonexistent/snakepit.yaml")
        .unwrap_err();
    assert!(matches!(err, ConfigError::FileReadError { .. }));
    assert!(err.to_string().contains("/nonexistent/snakepit.yaml"));
}

#[test]
fn test_handle_shares_updates() {
    let handle = ConfigHandle::new(SnakepitConfig::default()).unwrap();
    let reader = handle.clone();

    handle.update(|c| c.pool.checkout_timeout = Duration::from_millis(10)).unwrap();

    assert_eq!(reader.current().pool.checkout_timeout, Duration::from_millis(10));
}
