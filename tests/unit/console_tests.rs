//! Unit tests for operator console parsing.

use serde_json::json;

use pipelink::console::{CommandError, OperatorCommand};

#[test]
fn parses_simple_commands() {
    assert_eq!(OperatorCommand::parse("ping"), Ok(OperatorCommand::Ping));
    assert_eq!(OperatorCommand::parse("  PING \n"), Ok(OperatorCommand::Ping));
    assert_eq!(OperatorCommand::parse("shutdown"), Ok(OperatorCommand::Shutdown));
    assert_eq!(OperatorCommand::parse("Quit"), Ok(OperatorCommand::Quit));
}

/// Arguments keep their inner spacing and case.
#[test]
fn parses_arguments() {
    assert_eq!(
        OperatorCommand::parse("echo Hello  World"),
        Ok(OperatorCommand::Echo("Hello  World".into()))
    );
    assert_eq!(
        OperatorCommand::parse("calc (2 + 3) * 4"),
        Ok(OperatorCommand::Calc("(2 + 3) * 4".into()))
    );
}

#[test]
fn rejects_bad_input() {
    assert_eq!(OperatorCommand::parse("   "), Err(CommandError::Empty));
    assert_eq!(
        OperatorCommand::parse("echo"),
        Err(CommandError::MissingArgument("echo"))
    );
    assert_eq!(
        OperatorCommand::parse("calc  "),
        Err(CommandError::MissingArgument("calc"))
    );
    assert!(matches!(
        OperatorCommand::parse("ping now"),
        Err(CommandError::Unknown(_))
    ));
    assert!(matches!(
        OperatorCommand::parse("launch"),
        Err(CommandError::Unknown(_))
    ));
}

#[test]
fn builds_protocol_messages() {
    assert_eq!(
        OperatorCommand::Ping.to_message(12.5),
        Some(json!({"type": "ping", "timestamp": 12.5}))
    );
    assert_eq!(
        OperatorCommand::Echo("hi".into()).to_message(0.0),
        Some(json!({"type": "echo", "message": "hi"}))
    );
    assert_eq!(
        OperatorCommand::Calc("1+1".into()).to_message(0.0),
        Some(json!({"type": "calculate", "expression": "1+1"}))
    );
}

/// Leaving the console goes through the supervisor's stop, not a raw send.
#[test]
fn shutdown_and_quit_send_nothing() {
    assert!(OperatorCommand::Shutdown.to_message(0.0).is_none());
    assert!(OperatorCommand::Quit.to_message(0.0).is_none());
}

#[test]
fn error_messages_are_readable() {
    assert_eq!(
        CommandError::MissingArgument("calc").to_string(),
        "`calc` needs an argument"
    );
    assert!(CommandError::Unknown("x".into())
        .to_string()
        .contains("ping, echo <text>"));
}
