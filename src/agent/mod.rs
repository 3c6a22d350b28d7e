//! Agent components above the transport layer
//!
//! The supervisor keeps the link alive, the dispatcher turns inbound payloads
//! into handler calls, the telemetry publisher emits samples read from a
//! metric source, and the runtime drives all of them from one loop.

pub mod dispatcher;
pub mod lifecycle;
pub mod source;
pub mod supervisor;
pub mod telemetry;

pub use dispatcher::{CommandDispatcher, CommandHandler, DispatchOutcome, FnHandler, LogHandler};
pub use lifecycle::{AgentRuntime, CycleReport, RuntimeSettings};
pub use source::{source_from_config, ConstantSource, FileSource, MetricSource};
pub use supervisor::ReconnectionSupervisor;
pub use telemetry::{PublishOutcome, TelemetryPublisher};
