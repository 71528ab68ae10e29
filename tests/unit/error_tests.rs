//! Unit tests for `AppError` display format and conversions.

use fleet_relay::AppError;

#[test]
fn display_prefixes_category() {
    let cases = [
        (AppError::Config("x".into()), "config: x"),
        (AppError::Db("x".into()), "db: x"),
        (AppError::Validation("x".into()), "validation: x"),
        (AppError::Transport("x".into()), "transport: x"),
        (AppError::AgentLogic("x".into()), "agent logic: x"),
        (AppError::CircuitOpen("x".into()), "circuit open: x"),
        (AppError::SessionNotFound("x".into()), "session not found: x"),
        (AppError::ArchiveNotFound("x".into()), "archive not found: x"),
        (AppError::RecoveryExhausted("x".into()), "recovery exhausted: x"),
        (AppError::Io("x".into()), "io: x"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn kind_is_snake_case() {
    assert_eq!(AppError::AgentLogic(String::new()).kind(), "agent_logic");
    assert_eq!(AppError::CircuitOpen(String::new()).kind(), "circuit_open");
    assert_eq!(
        AppError::SessionNotFound(String::new()).kind(),
        "session_not_found"
    );
    assert_eq!(
        AppError::RecoveryExhausted(String::new()).kind(),
        "recovery_exhausted"
    );
}

#[test]
fn error_message_has_no_trailing_period() {
    let err = AppError::Transport("connection refused".into());
    let s = err.to_string();
    assert!(!s.ends_with('.'), "error message must not end with a period: {s}");
}

#[test]
fn json_errors_become_validation_errors() {
    let err: AppError = serde_json::from_str::<serde_json::Value>("{")
        .expect_err("invalid json")
        .into();
    assert!(matches!(err, AppError::Validation(msg) if msg.starts_with("invalid json")));
}

#[test]
fn toml_errors_become_config_errors() {
    let err: AppError = toml::from_str::<toml::Value>("= nope")
        .expect_err("invalid toml")
        .into();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn io_errors_become_io_errors() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert_eq!(err.to_string(), "io: gone");
}
