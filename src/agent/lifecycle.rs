//! Agent runtime: the single cooperative loop
//!
//! One task owns the supervisor, dispatcher, telemetry publisher and metric
//! source. Every iteration publishes a sample when one is due, advances the
//! supervisor by one bounded step and dispatches whatever message the step
//! produced before anything else happens.

use super::dispatcher::{CommandDispatcher, DispatchOutcome};
use super::source::MetricSource;
use super::supervisor::ReconnectionSupervisor;
use super::telemetry::{PublishOutcome, TelemetryPublisher};
use crate::config::AgentConfig;
use crate::error::AgentResult;
use crate::observability::LinkStats;
use crate::transport::mqtt::ConnectionState;
use crate::transport::{MqttBackend, NetworkDriver};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn, Instrument};

/// Loop timing
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    /// Upper bound for one link poll
    pub poll_interval: Duration,
    pub telemetry_interval: Duration,
    /// Filter subscribed at startup
    pub subscribe_topic: String,
}

impl RuntimeSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            telemetry_interval: config.telemetry_interval(),
            subscribe_topic: config.subscribe_topic(),
        }
    }
}

/// What one loop iteration did
#[derive(Debug, Default)]
pub struct CycleReport {
    pub published: Option<PublishOutcome>,
    pub dispatched: Option<DispatchOutcome>,
}

pub struct AgentRuntime<B, N> {
    supervisor: ReconnectionSupervisor<B, N>,
    dispatcher: CommandDispatcher,
    publisher: TelemetryPublisher,
    source: Box<dyn MetricSource>,
    settings: RuntimeSettings,
    next_tick: Instant,
    stats: Arc<LinkStats>,
    started: bool,
}

impl<B: MqttBackend, N: NetworkDriver> AgentRuntime<B, N> {
    pub fn new(
        supervisor: ReconnectionSupervisor<B, N>,
        dispatcher: CommandDispatcher,
        publisher: TelemetryPublisher,
        source: Box<dyn MetricSource>,
        settings: RuntimeSettings,
        stats: Arc<LinkStats>,
    ) -> Self {
        Self {
            supervisor,
            dispatcher,
            publisher,
            source,
            settings,
            next_tick: Instant::now(),
            stats,
            started: false,
        }
    }

    /// Register the command subscription; applied on the first connect
    pub async fn start(&mut self) -> AgentResult<()> {
        if self.started {
            return Ok(());
        }
        let topic = self.settings.subscribe_topic.clone();
        self.supervisor.link_mut().subscribe(&topic).await?;
        self.next_tick = Instant::now() + self.settings.telemetry_interval;
        self.started = true;
        info!(
            subscribe = %topic,
            publish = %self.publisher.topic(),
            telemetry_interval_secs = self.settings.telemetry_interval.as_secs(),
            "Agent runtime started"
        );
        Ok(())
    }

    /// One iteration of the loop
    pub async fn cycle(&mut self, now: Instant) -> CycleReport {
        let mut report = CycleReport::default();

        if now >= self.next_tick {
            report.published = self.publish_due_sample().await;
            self.next_tick += self.settings.telemetry_interval;
            if self.next_tick <= now {
                // Fell behind (e.g. a long connection attempt); skip missed ticks
                self.next_tick = now + self.settings.telemetry_interval;
            }
        }

        if let Some(message) = self.supervisor.step(now, self.settings.poll_interval).await {
            report.dispatched = Some(
                self.dispatcher
                    .on_raw_message(&message.topic, &message.payload)
                    .await,
            );
        }

        report
    }

    async fn publish_due_sample(&mut self) -> Option<PublishOutcome> {
        match self.source.read().await {
            Ok(value) => Some(self.publisher.tick(self.supervisor.link_mut(), value)),
            Err(e) => {
                warn!(error = %e.log_message(), "Metric source failed, skipping tick");
                None
            }
        }
    }

    /// When the loop next has something to do
    pub fn next_wakeup(&self) -> Instant {
        let state = self.supervisor.state();
        match (state.is_idle(), self.supervisor.next_attempt_at()) {
            (true, Some(at)) => at.min(self.next_tick),
            (true, None) => Instant::now(),
            // A live link waits inside its poll
            (false, _) => Instant::now(),
        }
    }

    /// Run until `shutdown` flips to true, then close the link
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> AgentResult<()> {
        self.start().await?;

        let span = crate::lifecycle_span!(event = "run");
        async {
            loop {
                if *shutdown.borrow() {
                    break;
                }

                self.cycle(Instant::now()).await;

                let wake = self.next_wakeup();
                if wake > Instant::now() {
                    tokio::select! {
                        biased;
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = sleep_until(wake) => {}
                    }
                }
            }
        }
        .instrument(span)
        .await;

        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        info!(stats = ?self.stats.snapshot(), "Agent runtime stopping");
        self.supervisor.shutdown().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn supervisor(&self) -> &ReconnectionSupervisor<B, N> {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut ReconnectionSupervisor<B, N> {
        &mut self.supervisor
    }

    pub fn dispatcher_mut(&mut self) -> &mut CommandDispatcher {
        &mut self.dispatcher
    }

    pub fn stats(&self) -> &Arc<LinkStats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::source::ConstantSource;
    use crate::testing::mocks::{
        test_credentials, MockBackend, MockBroker, MockNetwork, RecordingHandler,
    };
    use crate::transport::mqtt::ReconnectConfig;

    const COMMANDS: &str = "esp32/SmartParking/commands";
    const STATUS: &str = "esp32/SmartParking/status";

    fn runtime(broker: &MockBroker) -> AgentRuntime<MockBackend, MockNetwork> {
        let stats = Arc::new(LinkStats::new());
        let supervisor = ReconnectionSupervisor::new(
            MockBackend::new(broker.clone()),
            MockNetwork::new(),
            Arc::new(test_credentials()),
            ReconnectConfig::default(),
            stats.clone(),
        );
        AgentRuntime::new(
            supervisor,
            CommandDispatcher::new(stats.clone()),
            TelemetryPublisher::new(STATUS, "metrics", 256, stats.clone()),
            Box::new(ConstantSource::new(42)),
            RuntimeSettings {
                poll_interval: Duration::from_millis(100),
                telemetry_interval: Duration::from_secs(5),
                subscribe_topic: COMMANDS.to_string(),
            },
            stats,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_defers_subscription_until_connect() {
        let broker = MockBroker::new();
        let mut runtime = runtime(&broker);
        runtime.start().await.unwrap();
        assert!(broker.subscribe_log().is_empty());

        runtime.cycle(Instant::now()).await;
        assert_eq!(runtime.state(), ConnectionState::BrokerConnected);
        assert_eq!(broker.subscribe_log(), vec![COMMANDS.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_dispatches_inbound_command() {
        let broker = MockBroker::new();
        let mut runtime = runtime(&broker);
        let handler = RecordingHandler::new();
        runtime
            .dispatcher_mut()
            .register(COMMANDS, "OPEN_GATE", Arc::new(handler.clone()))
            .unwrap();
        runtime.start().await.unwrap();
        runtime.cycle(Instant::now()).await;

        broker.push_inbound(COMMANDS, r#"{"message":"OPEN_GATE"}"#);
        let report = runtime.cycle(Instant::now()).await;

        assert!(matches!(
            report.dispatched,
            Some(DispatchOutcome::Handled { .. })
        ));
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_publishes_on_interval() {
        let broker = MockBroker::new();
        let mut runtime = runtime(&broker);
        runtime.start().await.unwrap();
        runtime.cycle(Instant::now()).await;
        assert!(broker.published().is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        let report = runtime.cycle(Instant::now()).await;
        assert!(report.published.unwrap().is_published());
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let broker = MockBroker::new();
        let mut runtime = runtime(&broker);
        let (tx, rx) = watch::channel(false);

        let stopper = async {
            tokio::time::sleep(Duration::from_secs(12)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(runtime.run(rx), stopper);

        assert!(result.is_ok());
        assert_eq!(runtime.state(), ConnectionState::Disconnected);
        assert!(!broker.is_connected());
        assert_eq!(broker.published().len(), 2);
    }
}
