//! Command dispatch tests
//!
//! Inbound payloads come from the network and are untrusted; whatever they
//! contain, the dispatcher reports an outcome and keeps going.


use std::io;
use std::sync::{Arc, Mutex};
use telemetry_agent::agent::{CommandDispatcher, DispatchOutcome, FnHandler};
use telemetry_agent::observability::LinkStats;
use telemetry_agent::testing::mocks::RecordingHandler;
use telemetry_agent::AgentError;
use test_helpers::COMMAND_TOPIC;

fn dispatcher_with(handler: &RecordingHandler) -> (CommandDispatcher, Arc<LinkStats>) {
    let stats = Arc::new(LinkStats::new());
    let mut dispatcher = CommandDispatcher::new(stats.clone());
    dispatcher
        .register(COMMAND_TOPIC, "OPEN_GATE", Arc::new(handler.clone()))
        .unwrap();
    (dispatcher, stats)
}

#[tokio::test]
async fn test_open_gate_invokes_handler_once() {
    let handler = RecordingHandler::new();
    let (dispatcher, stats) = dispatcher_with(&handler);

    let outcome = dispatcher
        .on_raw_message(COMMAND_TOPIC, br#"{"message":"OPEN_GATE","gate":2}"#)
        .await;

    assert_eq!(
        outcome,
        DispatchOutcome::Handled {
            command: "OPEN_GATE".to_string()
        }
    );
    let commands = handler.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].argument("gate"), Some(&serde_json::json!(2)));
    assert_eq!(stats.snapshot().commands_dispatched, 1);
}

#[tokio::test]
async fn test_unknown_command_is_ignored() {
    let handler = RecordingHandler::new();
    let (dispatcher, stats) = dispatcher_with(&handler);

    let outcome = dispatcher
        .on_raw_message(COMMAND_TOPIC, br#"{"message":"UNKNOWN"}"#)
        .await;

    assert!(matches!(outcome, DispatchOutcome::Unmatched { command } if command == "UNKNOWN"));
    assert_eq!(handler.call_count(), 0);
    assert_eq!(stats.snapshot().commands_unmatched, 1);
}

#[tokio::test]
async fn test_malformed_payloads_counted_and_dropped() {
    let handler = RecordingHandler::new();
    let (dispatcher, stats) = dispatcher_with(&handler);

    let payloads: [&[u8]; 4] = [
        b"{not json",
        br#"["OPEN_GATE"]"#,
        br#"{"command":"OPEN_GATE"}"#,
        &[0xff, 0xfe, 0x00],
    ];
    for payload in payloads {
        assert_eq!(
            dispatcher.on_raw_message(COMMAND_TOPIC, payload).await,
            DispatchOutcome::Malformed
        );
    }

    assert_eq!(handler.call_count(), 0);
    assert_eq!(stats.snapshot().payloads_malformed, 4);
}

/// In-memory sink for formatted log lines
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "current_thread")]
async fn test_malformed_payload_warns_exactly_once() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let handler = RecordingHandler::new();
    let (dispatcher, _stats) = dispatcher_with(&handler);

    dispatcher
        .on_raw_message(COMMAND_TOPIC, br#"{"message":"OPEN_GATE"}"#)
        .await;
    assert_eq!(logs.contents().matches("Dropping malformed payload").count(), 0);

    let outcome = dispatcher.on_raw_message(COMMAND_TOPIC, b"{not json").await;
    assert_eq!(outcome, DispatchOutcome::Malformed);

    let output = logs.contents();
    let warnings: Vec<&str> = output
        .lines()
        .filter(|line| line.contains("Dropping malformed payload"))
        .collect();
    assert_eq!(warnings.len(), 1, "captured logs:\n{output}");
    assert!(warnings[0].contains("WARN"));
    assert!(warnings[0].contains(COMMAND_TOPIC));
}

#[tokio::test]
async fn test_command_on_foreign_topic_is_unmatched() {
    let handler = RecordingHandler::new();
    let (dispatcher, _stats) = dispatcher_with(&handler);

    let outcome = dispatcher
        .on_raw_message("esp32/OtherDevice/commands", br#"{"message":"OPEN_GATE"}"#)
        .await;

    assert!(matches!(outcome, DispatchOutcome::Unmatched { .. }));
    assert_eq!(handler.call_count(), 0);
}

#[tokio::test]
async fn test_wildcard_route_matches_every_device() {
    let handler = RecordingHandler::new();
    let mut dispatcher = CommandDispatcher::new(Arc::new(LinkStats::new()));
    dispatcher
        .register("esp32/+/commands", "REBOOT", Arc::new(handler.clone()))
        .unwrap();

    for device in ["SmartParking", "Gate7"] {
        let topic = format!("esp32/{device}/commands");
        let outcome = dispatcher
            .on_raw_message(&topic, br#"{"message":"REBOOT"}"#)
            .await;
        assert!(matches!(outcome, DispatchOutcome::Handled { .. }));
    }

    assert_eq!(handler.call_count(), 2);
}

#[tokio::test]
async fn test_failing_handler_does_not_poison_dispatcher() {
    let failing = RecordingHandler::failing();
    let healthy = RecordingHandler::new();
    let stats = Arc::new(LinkStats::new());
    let mut dispatcher = CommandDispatcher::new(stats.clone());
    dispatcher
        .register(COMMAND_TOPIC, "CLOSE_GATE", Arc::new(failing.clone()))
        .unwrap();
    dispatcher
        .register(COMMAND_TOPIC, "OPEN_GATE", Arc::new(healthy.clone()))
        .unwrap();

    let failed = dispatcher
        .on_raw_message(COMMAND_TOPIC, br#"{"message":"CLOSE_GATE"}"#)
        .await;
    let handled = dispatcher
        .on_raw_message(COMMAND_TOPIC, br#"{"message":"OPEN_GATE"}"#)
        .await;

    assert!(matches!(failed, DispatchOutcome::HandlerFailed { .. }));
    assert!(matches!(handled, DispatchOutcome::Handled { .. }));
    assert_eq!(stats.snapshot().handler_failures, 1);
    assert_eq!(stats.snapshot().commands_dispatched, 1);
}

#[tokio::test]
async fn test_reregistering_replaces_handler() {
    let first = RecordingHandler::new();
    let second = RecordingHandler::new();
    let mut dispatcher = CommandDispatcher::new(Arc::new(LinkStats::new()));
    dispatcher
        .register(COMMAND_TOPIC, "OPEN_GATE", Arc::new(first.clone()))
        .unwrap();
    dispatcher
        .register(COMMAND_TOPIC, "OPEN_GATE", Arc::new(second.clone()))
        .unwrap();

    dispatcher
        .on_raw_message(COMMAND_TOPIC, br#"{"message":"OPEN_GATE"}"#)
        .await;

    assert_eq!(dispatcher.route_count(), 1);
    assert_eq!(first.call_count(), 0);
    assert_eq!(second.call_count(), 1);
}

#[tokio::test]
async fn test_closure_handler_and_invalid_registration() {
    let mut dispatcher = CommandDispatcher::new(Arc::new(LinkStats::new()));
    let handler = FnHandler::new(|command: &telemetry_agent::protocol::Command| {
        if command.argument("gate").is_some() {
            Ok(())
        } else {
            Err(AgentError::handler("gate argument required"))
        }
    });
    dispatcher
        .register(COMMAND_TOPIC, "OPEN_GATE", Arc::new(handler))
        .unwrap();

    assert!(dispatcher
        .register("esp32/#/commands", "OPEN_GATE", Arc::new(RecordingHandler::new()))
        .is_err());
    assert!(matches!(
        dispatcher
            .on_raw_message(COMMAND_TOPIC, br#"{"message":"OPEN_GATE"}"#)
            .await,
        DispatchOutcome::HandlerFailed { .. }
    ));
}
