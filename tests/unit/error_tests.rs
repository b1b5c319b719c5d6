//! Unit tests for error classification and messages.

use term_supervisor::errors::{
    ConflictError, CrashError, ProtocolError, StartupError,
};
use term_supervisor::supervisor::ExitClass;
use term_supervisor::AppError;

/// Only repeated crashes and foreign port owners reach the user.
#[test]
fn user_visible_errors() {
    let visible: Vec<AppError> = vec![
        CrashError::RepeatedCrashes(4).into(),
        ConflictError::PortOccupiedByForeignApp {
            name: "OtherApp".into(),
            port: 4020,
            alternatives: vec![4021],
        }
        .into(),
    ];
    for err in &visible {
        assert!(err.is_user_visible(), "{err} should be visible");
    }

    let silent: Vec<AppError> = vec![
        ConflictError::PortStillUnavailableAfterRetries {
            port: 4020,
            attempts: 4,
        }
        .into(),
        StartupError::ProcessFailedToStart {
            code: Some(9),
            class: ExitClass::PortInUse,
            detail: "exited".into(),
        }
        .into(),
        ProtocolError::NotConnected.into(),
        AppError::Io("boom".into()),
    ];
    for err in &silent {
        assert!(!err.is_user_visible(), "{err} should be silent");
    }
}

/// Foreign conflicts name the owner and the alternatives.
#[test]
fn foreign_conflict_message() {
    let err = AppError::from(ConflictError::PortOccupiedByForeignApp {
        name: "OtherApp".into(),
        port: 4020,
        alternatives: vec![4021, 4022, 4023],
    });
    let text = err.to_string();
    assert!(text.contains("OtherApp"));
    assert!(text.contains("4020"));
    assert!(text.contains("[4021, 4022, 4023]"));
}

/// Startup failures carry the exit classification.
#[test]
fn startup_failure_message() {
    let err = StartupError::ProcessFailedToStart {
        code: Some(9),
        class: ExitClass::PortInUse,
        detail: "exit code 9".into(),
    };
    assert_eq!(
        err.to_string(),
        "server failed to start (port already in use): exit code 9"
    );
}

/// TOML errors become configuration errors.
#[test]
fn toml_error_maps_to_config() {
    let parse = toml::from_str::<toml::Value>("= broken").expect_err("invalid toml");
    assert!(matches!(AppError::from(parse), AppError::Config(_)));
}

/// JSON errors become malformed-message errors.
#[test]
fn json_error_maps_to_protocol() {
    let parse = serde_json::from_str::<serde_json::Value>("{").expect_err("invalid json");
    assert!(matches!(
        AppError::from(parse),
        AppError::Protocol(ProtocolError::MalformedMessage(_))
    ));
}
