//! Command dispatcher: decodes inbound payloads and routes commands
//!
//! Nothing that arrives from the broker can take the agent down. Malformed
//! payloads, unmatched commands and handler failures are logged, counted and
//! dropped.

use crate::error::{AgentError, AgentResult};
use crate::observability::LinkStats;
use crate::protocol::{topic_matches, validate_topic_filter, Command};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Handler for one named command
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command) -> AgentResult<()>;
}

/// Adapts a closure into a [`CommandHandler`]
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Command) -> AgentResult<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait::async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&Command) -> AgentResult<()> + Send + Sync,
{
    async fn handle(&self, command: &Command) -> AgentResult<()> {
        (self.f)(command)
    }
}

/// Acknowledges a command by logging it
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait::async_trait]
impl CommandHandler for LogHandler {
    async fn handle(&self, command: &Command) -> AgentResult<()> {
        info!(
            command = %command.name,
            arguments = %serde_json::Value::Object(command.arguments.clone()),
            "Command received"
        );
        Ok(())
    }
}

/// Result of dispatching one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran to completion
    Handled { command: String },
    /// Valid command with no registered handler
    Unmatched { command: String },
    /// Payload could not be decoded
    Malformed,
    /// The handler returned an error
    HandlerFailed { command: String },
}

struct Route {
    filter: String,
    name: String,
    handler: Arc<dyn CommandHandler>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("filter", &self.filter)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct CommandDispatcher {
    routes: Vec<Route>,
    stats: Arc<LinkStats>,
}

impl CommandDispatcher {
    pub fn new(stats: Arc<LinkStats>) -> Self {
        Self {
            routes: Vec::new(),
            stats,
        }
    }

    /// Register a handler for `name` on topics matching `filter`
    ///
    /// A later registration for the same filter and name replaces the earlier one.
    pub fn register(
        &mut self,
        filter: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> AgentResult<()> {
        let filter = filter.into();
        let name = name.into();
        validate_topic_filter(&filter)?;
        if name.is_empty() {
            return Err(AgentError::handler("command name must not be empty"));
        }

        match self
            .routes
            .iter_mut()
            .find(|r| r.filter == filter && r.name == name)
        {
            Some(route) => route.handler = handler,
            None => self.routes.push(Route {
                filter,
                name,
                handler,
            }),
        }
        Ok(())
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    fn find_handler(&self, topic: &str, name: &str) -> Option<&Arc<dyn CommandHandler>> {
        self.routes
            .iter()
            .find(|r| r.name == name && topic_matches(&r.filter, topic))
            .map(|r| &r.handler)
    }

    /// Decode and route one inbound message; never fails
    pub async fn on_raw_message(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let command = match Command::decode(topic, payload) {
            Ok(command) => command,
            Err(e) => {
                self.stats.record_payload_malformed();
                warn!(
                    topic = %topic,
                    payload_len = payload.len(),
                    error = %e.log_message(),
                    "Dropping malformed payload"
                );
                return DispatchOutcome::Malformed;
            }
        };

        info!(
            topic = %topic,
            payload_len = payload.len(),
            command = %command.name,
            "Inbound command"
        );

        let Some(handler) = self.find_handler(topic, &command.name) else {
            self.stats.record_command_unmatched();
            debug!(topic = %topic, command = %command.name, "No handler registered, ignoring");
            return DispatchOutcome::Unmatched {
                command: command.name,
            };
        };

        let span = crate::command_span!(command = %command.name, topic = %topic);
        match handler.handle(&command).instrument(span).await {
            Ok(()) => {
                self.stats.record_command_dispatched();
                DispatchOutcome::Handled {
                    command: command.name,
                }
            }
            Err(e) => {
                self.stats.record_handler_failure();
                warn!(
                    command = %command.name,
                    error = %e.log_message(),
                    "Command handler failed"
                );
                DispatchOutcome::HandlerFailed {
                    command: command.name,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::RecordingHandler;

    const COMMANDS: &str = "esp32/SmartParking/commands";

    fn dispatcher() -> (CommandDispatcher, Arc<LinkStats>) {
        let stats = Arc::new(LinkStats::new());
        (CommandDispatcher::new(stats.clone()), stats)
    }

    #[tokio::test]
    async fn test_registered_command_is_handled_once() {
        let (mut dispatcher, stats) = dispatcher();
        let handler = RecordingHandler::new();
        dispatcher
            .register(COMMANDS, "OPEN_GATE", Arc::new(handler.clone()))
            .unwrap();

        let outcome = dispatcher
            .on_raw_message(COMMANDS, br#"{"message":"OPEN_GATE","gate":2}"#)
            .await;

        assert_eq!(
            outcome,
            DispatchOutcome::Handled {
                command: "OPEN_GATE".to_string()
            }
        );
        assert_eq!(handler.call_count(), 1);
        assert_eq!(
            handler.commands()[0].argument("gate"),
            Some(&serde_json::json!(2))
        );
        assert_eq!(stats.snapshot().commands_dispatched, 1);
    }

    #[tokio::test]
    async fn test_unknown_command_is_ignored() {
        let (mut dispatcher, stats) = dispatcher();
        let handler = RecordingHandler::new();
        dispatcher
            .register(COMMANDS, "OPEN_GATE", Arc::new(handler.clone()))
            .unwrap();

        let outcome = dispatcher
            .on_raw_message(COMMANDS, br#"{"message":"UNKNOWN"}"#)
            .await;

        assert!(matches!(outcome, DispatchOutcome::Unmatched { .. }));
        assert_eq!(handler.call_count(), 0);
        assert_eq!(stats.snapshot().commands_unmatched, 1);
    }

    #[tokio::test]
    async fn test_routing_is_per_topic() {
        let (mut dispatcher, _) = dispatcher();
        let handler = RecordingHandler::new();
        dispatcher
            .register(COMMANDS, "OPEN_GATE", Arc::new(handler.clone()))
            .unwrap();

        let outcome = dispatcher
            .on_raw_message("esp32/Other/commands", br#"{"message":"OPEN_GATE"}"#)
            .await;
        assert!(matches!(outcome, DispatchOutcome::Unmatched { .. }));
        assert_eq!(handler.call_count(), 0);
    }

    #[tokio::test]
    async fn test_wildcard_filter_routes() {
        let (mut dispatcher, _) = dispatcher();
        let handler = RecordingHandler::new();
        dispatcher
            .register("esp32/+/commands", "OPEN_GATE", Arc::new(handler.clone()))
            .unwrap();

        dispatcher
            .on_raw_message(COMMANDS, br#"{"message":"OPEN_GATE"}"#)
            .await;
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payloads_counted_once_each() {
        let (dispatcher, stats) = dispatcher();

        assert_eq!(
            dispatcher.on_raw_message(COMMANDS, b"\x00\xffgarbage").await,
            DispatchOutcome::Malformed
        );
        assert_eq!(
            dispatcher
                .on_raw_message(COMMANDS, br#"{"gate":1}"#)
                .await,
            DispatchOutcome::Malformed
        );
        assert_eq!(stats.snapshot().payloads_malformed, 2);
    }

    #[tokio::test]
    async fn test_handler_failure_is_not_fatal() {
        let (mut dispatcher, stats) = dispatcher();
        let handler = RecordingHandler::failing();
        dispatcher
            .register(COMMANDS, "OPEN_GATE", Arc::new(handler.clone()))
            .unwrap();

        let outcome = dispatcher
            .on_raw_message(COMMANDS, br#"{"message":"OPEN_GATE"}"#)
            .await;
        assert!(matches!(outcome, DispatchOutcome::HandlerFailed { .. }));
        assert_eq!(stats.snapshot().handler_failures, 1);

        let again = dispatcher
            .on_raw_message(COMMANDS, br#"{"message":"OPEN_GATE"}"#)
            .await;
        assert!(matches!(again, DispatchOutcome::HandlerFailed { .. }));
        assert_eq!(handler.call_count(), 2);
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let (mut dispatcher, _) = dispatcher();
        dispatcher
            .register(
                COMMANDS,
                "CLOSE_GATE",
                Arc::new(FnHandler::new(|command: &Command| {
                    if command.argument("force").is_some() {
                        Ok(())
                    } else {
                        Err(AgentError::handler("force flag required"))
                    }
                })),
            )
            .unwrap();

        assert!(matches!(
            dispatcher
                .on_raw_message(COMMANDS, br#"{"message":"CLOSE_GATE","force":true}"#)
                .await,
            DispatchOutcome::Handled { .. }
        ));
        assert!(matches!(
            dispatcher
                .on_raw_message(COMMANDS, br#"{"message":"CLOSE_GATE"}"#)
                .await,
            DispatchOutcome::HandlerFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_reregistration_replaces_handler() {
        let (mut dispatcher, _) = dispatcher();
        let first = RecordingHandler::new();
        let second = RecordingHandler::new();
        dispatcher
            .register(COMMANDS, "OPEN_GATE", Arc::new(first.clone()))
            .unwrap();
        dispatcher
            .register(COMMANDS, "OPEN_GATE", Arc::new(second.clone()))
            .unwrap();
        assert_eq!(dispatcher.route_count(), 1);

        dispatcher
            .on_raw_message(COMMANDS, br#"{"message":"OPEN_GATE"}"#)
            .await;
        assert_eq!(first.call_count(), 0);
        assert_eq!(second.call_count(), 1);
    }

    #[test]
    fn test_register_rejects_invalid_filter() {
        let (mut dispatcher, _) = dispatcher();
        assert!(dispatcher
            .register("esp32/#/commands", "OPEN_GATE", Arc::new(LogHandler))
            .is_err());
        assert!(dispatcher
            .register(COMMANDS, "", Arc::new(LogHandler))
            .is_err());
    }
}
