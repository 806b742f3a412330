use super::*;

#[test]
fn test_empty_config_uses_defaults() {
    let config = AppConfig::from_toml_str("").unwrap();
    assert_eq!(config, AppConfig::default());
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.stream.sse_sentinel, "[DONE]");
}

#[test]
fn test_partial_sections() {
    let config = AppConfig::from_toml_str(
        r#"
[stream]
chunk_timeout_ms = 5000
sse_sentinel = "[END]"

[logging]
level = "debug"
"#,
    )
    .unwrap();

    assert_eq!(config.stream.chunk_timeout_ms, 5000);
    assert_eq!(config.stream.sse_sentinel, "[END]");
    assert_eq!(config.stream.timeout_ms, 300_000);
    assert!(config.stream.validate_tool_calls);
    assert_eq!(config.logging.level, "debug");
    assert!(!config.logging.with_target);
}

#[test]
fn test_invalid_toml() {
    let err = AppConfig::from_toml_str("[stream\nbuffer_size = 1").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)));
}

#[test]
fn test_load_missing_file() {
    let err = load_config("/nonexistent/streamcast.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn test_load_from_file() {
    let path = std::env::temp_dir().join(format!("streamcast-{}.toml", uuid::Uuid::new_v4()));
    std::fs::write(&path, "[stream]\nbuffer_size = 4096\n").unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config.stream.buffer_size, 4096);

    std::fs::remove_file(&path).unwrap();
}
