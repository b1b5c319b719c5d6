//! Unit tests for the control envelope and typed command decoding.

use serde_json::json;

use term_supervisor::control::{
    Category, ControlCommand, ControlMessage, MessageType, SpawnRequest, SystemCommand,
    TerminalCommand,
};
use term_supervisor::errors::ProtocolError;
use term_supervisor::AppError;

/// Request builders mint a fresh id each time.
#[test]
fn requests_get_fresh_ids() {
    let a = ControlMessage::request(Category::Terminal, "spawn", None);
    let b = ControlMessage::request(Category::Terminal, "spawn", None);
    assert_ne!(a.id, b.id);
    assert_eq!(a.kind, MessageType::Request);
    assert_eq!(a.category, "terminal");
    assert!(uuid::Uuid::parse_str(&a.id).is_ok());
}

/// Responses copy id, action and session id from their request.
#[test]
fn response_copies_correlation_fields() {
    let request = ControlMessage::request(Category::System, "ping", None).with_session("sess-42");
    let response = ControlMessage::response_to(&request, Some(json!({"pong": true})));

    assert_eq!(response.id, request.id);
    assert_eq!(response.session_id.as_deref(), Some("sess-42"));
    assert_eq!(response.action, "ping");
    assert_eq!(response.kind, MessageType::Response);
    assert!(response.error.is_none());
}

/// A response survives the wire with id and session id unchanged.
#[test]
fn response_round_trips_over_the_wire() {
    let request = ControlMessage::request(Category::Git, "status", None).with_session("s-9");
    let response = ControlMessage::response_to(&request, Some(json!({"branch": "main"})));

    let bytes = response.encode().expect("encode");
    let decoded = ControlMessage::decode(&bytes).expect("decode");
    assert_eq!(decoded, response);
    assert_eq!(decoded.id, request.id);
    assert_eq!(decoded.session_id, request.session_id);
}

/// Protocol errors live at the top level; action errors live in the payload.
#[test]
fn two_error_channels_are_distinct() {
    let request = ControlMessage::request(Category::Terminal, "spawn", None);

    let protocol = ControlMessage::error_response(&request, "no handler");
    assert_eq!(protocol.error.as_deref(), Some("no handler"));
    assert!(protocol.payload_error().is_none());

    let application = ControlMessage::response_to(
        &request,
        Some(json!({"success": false, "error": "permission denied"})),
    );
    assert!(application.error.is_none());
    assert_eq!(application.payload_error(), Some("permission denied"));
}

/// Missing required fields are a malformed message.
#[test]
fn decode_rejects_missing_fields() {
    let err = ControlMessage::decode(br#"{"id":"1","type":"request"}"#).expect_err("missing fields");
    assert!(matches!(
        err,
        AppError::Protocol(ProtocolError::MalformedMessage(_))
    ));
}

/// Spawn payloads decode with `camelCase` fields and inherit the envelope session.
#[test]
fn spawn_command_decodes_payload() {
    let message = ControlMessage::request(
        Category::Terminal,
        "spawn",
        Some(json!({
            "command": "htop",
            "args": ["-d", "10"],
            "workingDirectory": "/tmp/work",
        })),
    )
    .with_session("sess-1");

    let command = ControlCommand::from_message(&message).expect("decode");
    let ControlCommand::Terminal(TerminalCommand::Spawn(request)) = command else {
        panic!("expected spawn, got {command:?}");
    };
    assert_eq!(
        request,
        SpawnRequest {
            command: Some("htop".into()),
            args: vec!["-d".into(), "10".into()],
            working_directory: Some("/tmp/work".into()),
            title: None,
            session_id: Some("sess-1".into()),
        }
    );
}

/// System actions decode to their variants.
#[test]
fn system_commands_decode() {
    let ping = ControlMessage::request(Category::System, "ping", None);
    let ready = ControlMessage::event(Category::System, "ready", None);
    assert_eq!(
        ControlCommand::from_message(&ping).expect("ping"),
        ControlCommand::System(SystemCommand::Ping)
    );
    assert_eq!(
        ControlCommand::from_message(&ready).expect("ready"),
        ControlCommand::System(SystemCommand::Ready)
    );
}

/// Unknown actions and categories are rejected.
#[test]
fn unknown_actions_and_categories_fail() {
    let reboot = ControlMessage::request(Category::System, "reboot", None);
    assert!(matches!(
        ControlCommand::from_message(&reboot),
        Err(AppError::Protocol(ProtocolError::MalformedMessage(_)))
    ));

    let mut weather = ControlMessage::request(Category::System, "ping", None);
    weather.category = "weather".into();
    assert!(matches!(
        ControlCommand::from_message(&weather),
        Err(AppError::Protocol(ProtocolError::NoHandlerForCategory(ref c))) if c == "weather"
    ));
}

/// External categories pass their action and payload through untouched.
#[test]
fn external_categories_pass_through() {
    let message = ControlMessage::event(Category::Notification, "show", Some(json!({"title": "hi"})));
    assert_eq!(
        ControlCommand::from_message(&message).expect("decode"),
        ControlCommand::Notification {
            action: "show".into(),
            payload: Some(json!({"title": "hi"})),
        }
    );
}

/// Category names parse from their wire form.
#[test]
fn category_wire_names() {
    for category in [
        Category::Terminal,
        Category::System,
        Category::Notification,
        Category::Git,
    ] {
        assert_eq!(category.as_str().parse::<Category>().expect("parse"), category);
    }
}
