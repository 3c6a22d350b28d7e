//! Reconnection behavior against a simulated broker and access point
//!
//! Time is paused, so backoff delays elapse instantly and deterministically.


use proptest::prelude::*;
use std::time::Duration;
use telemetry_agent::testing::mocks::{MockBackend, MockBroker, MockNetwork};
use telemetry_agent::transport::mqtt::{ConnectionState, ReconnectConfig};
use telemetry_agent::ReconnectionSupervisor;
use test_helpers::{test_supervisor, COMMAND_TOPIC};
use tokio::time::Instant;

const BUDGET: Duration = Duration::from_millis(100);

type Supervisor = ReconnectionSupervisor<MockBackend, MockNetwork>;

/// Step the supervisor, jumping the clock to each scheduled retry
async fn drive_until_connected(supervisor: &mut Supervisor, max_steps: usize) -> Vec<Duration> {
    let mut delays = Vec::new();
    for _ in 0..max_steps {
        if supervisor.state() == ConnectionState::BrokerConnected {
            break;
        }
        if let Some(at) = supervisor.next_attempt_at() {
            let now = Instant::now();
            if at > now {
                tokio::time::advance(at - now).await;
            }
        }
        supervisor.step(Instant::now(), BUDGET).await;
        delays.extend(supervisor.current_delay());
    }
    delays
}

#[tokio::test(start_paused = true)]
async fn test_drop_then_recover_with_base_delay() {
    let broker = MockBroker::new();
    let network = MockNetwork::new();
    let mut supervisor = test_supervisor(&broker, &network, ReconnectConfig::default());
    supervisor.link_mut().subscribe(COMMAND_TOPIC).await.unwrap();

    supervisor.step(Instant::now(), BUDGET).await;
    assert_eq!(supervisor.state(), ConnectionState::BrokerConnected);

    broker.inject_drop();
    supervisor.step(Instant::now(), BUDGET).await;
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    assert_eq!(supervisor.current_delay(), Some(Duration::from_secs(1)));

    // Not yet due
    supervisor.step(Instant::now(), BUDGET).await;
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);

    tokio::time::advance(Duration::from_secs(1)).await;
    supervisor.step(Instant::now(), BUDGET).await;
    assert_eq!(supervisor.state(), ConnectionState::BrokerConnected);
    assert_eq!(broker.handshakes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_restored_before_connected() {
    let broker = MockBroker::new();
    let network = MockNetwork::new();
    let mut supervisor = test_supervisor(&broker, &network, ReconnectConfig::default());
    supervisor.link_mut().subscribe(COMMAND_TOPIC).await.unwrap();
    supervisor.step(Instant::now(), BUDGET).await;

    broker.inject_drop();
    supervisor.step(Instant::now(), BUDGET).await;
    broker.clear_history();

    drive_until_connected(&mut supervisor, 5).await;

    assert_eq!(supervisor.state(), ConnectionState::BrokerConnected);
    assert_eq!(
        broker.event_log(),
        vec![
            "open".to_string(),
            "handshake".to_string(),
            format!("subscribe:{COMMAND_TOPIC}"),
        ]
    );
    assert_eq!(supervisor.link().subscriptions(), [COMMAND_TOPIC.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_backs_off_to_cap() {
    let broker = MockBroker::new();
    broker.set_reachable(false);
    let network = MockNetwork::new();
    let config = ReconnectConfig {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        ..ReconnectConfig::default()
    };
    let mut supervisor = test_supervisor(&broker, &network, config);

    let delays = drive_until_connected(&mut supervisor, 7).await;

    let millis: Vec<u64> = delays.iter().map(|d| d.as_millis() as u64).collect();
    assert_eq!(millis, vec![100, 200, 400, 800, 1000, 1000, 1000]);
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);

    broker.set_reachable(true);
    drive_until_connected(&mut supervisor, 2).await;
    assert_eq!(supervisor.state(), ConnectionState::BrokerConnected);
}

#[tokio::test(start_paused = true)]
async fn test_network_outage_reassociates() {
    let broker = MockBroker::new();
    let network = MockNetwork::new();
    let mut supervisor = test_supervisor(&broker, &network, ReconnectConfig::default());
    supervisor.step(Instant::now(), BUDGET).await;
    assert_eq!(network.associations(), 1);

    network.set_available(false);
    supervisor.step(Instant::now(), BUDGET).await;
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    assert!(!broker.is_connected());

    network.set_available(true);
    drive_until_connected(&mut supervisor, 3).await;
    assert_eq!(supervisor.state(), ConnectionState::BrokerConnected);
    assert_eq!(network.associations(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_auth_rejection_is_retried_not_fatal() {
    let broker = MockBroker::new();
    broker.set_reject_auth(true);
    let network = MockNetwork::new();
    let mut supervisor = test_supervisor(&broker, &network, ReconnectConfig::default());

    supervisor.step(Instant::now(), BUDGET).await;
    assert_eq!(supervisor.state(), ConnectionState::Failed);
    assert!(supervisor.next_attempt_at().is_some());

    // Certificate rotated on the broker side
    broker.set_reject_auth(false);
    drive_until_connected(&mut supervisor, 3).await;
    assert_eq!(supervisor.state(), ConnectionState::BrokerConnected);
    assert_eq!(supervisor.health(Instant::now()).consecutive_failures, 1);
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Drop,
    NetworkDown,
    BrokerUnreachable,
    AuthRejected,
}

fn fault_strategy() -> impl Strategy<Value = Fault> {
    prop_oneof![
        Just(Fault::Drop),
        Just(Fault::NetworkDown),
        Just(Fault::BrokerUnreachable),
        Just(Fault::AuthRejected),
    ]
}

async fn apply_faults(faults: Vec<(Fault, u8)>) -> (ConnectionState, Vec<Duration>, Vec<String>) {
    let broker = MockBroker::new();
    let network = MockNetwork::new();
    let config = ReconnectConfig::default();
    let max_delay = config.max_delay;
    let mut supervisor = test_supervisor(&broker, &network, config);
    supervisor.link_mut().subscribe(COMMAND_TOPIC).await.unwrap();
    supervisor.step(Instant::now(), BUDGET).await;

    let mut delays = Vec::new();
    for (fault, outage_steps) in faults {
        match fault {
            Fault::Drop => broker.inject_drop(),
            Fault::NetworkDown => network.set_available(false),
            Fault::BrokerUnreachable => broker.set_reachable(false),
            Fault::AuthRejected => {
                broker.set_reject_auth(true);
                broker.inject_drop();
            }
        }

        for _ in 0..outage_steps {
            if let Some(at) = supervisor.next_attempt_at() {
                let now = Instant::now();
                if at > now {
                    tokio::time::advance(at - now).await;
                }
            }
            supervisor.step(Instant::now(), BUDGET).await;
            delays.extend(supervisor.current_delay());
        }

        broker.set_reachable(true);
        broker.set_reject_auth(false);
        network.set_available(true);
        delays.extend(drive_until_connected(&mut supervisor, 4).await);
    }

    assert!(delays.iter().all(|d| *d <= max_delay));
    let subscriptions = supervisor.link().subscriptions().to_vec();
    (supervisor.state(), delays, subscriptions)
}

#[tokio::test(start_paused = true)]
async fn test_broker_keepalive_override_sets_deadline() {
    let broker = MockBroker::new();
    broker.set_silent(true);
    broker.set_server_keep_alive(Some(Duration::from_secs(30)));
    let network = MockNetwork::new();
    let config = ReconnectConfig {
        keep_alive: Duration::from_secs(10),
        ..ReconnectConfig::default()
    };
    let mut supervisor = test_supervisor(&broker, &network, config);

    supervisor.step(Instant::now(), BUDGET).await;
    assert_eq!(supervisor.state(), ConnectionState::BrokerConnected);
    assert_eq!(supervisor.link().keep_alive(), Duration::from_secs(30));
    let connected_at = supervisor.link().last_activity().unwrap();

    // Past 1.5x the requested 10s but inside 1.5x the broker's 30s
    supervisor.step(connected_at + Duration::from_secs(20), BUDGET).await;
    assert_eq!(supervisor.state(), ConnectionState::BrokerConnected);

    supervisor.step(connected_at + Duration::from_secs(45), BUDGET).await;
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_any_fault_sequence_recovers(
        faults in prop::collection::vec((fault_strategy(), 0u8..12), 1..8)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let (state, delays, subscriptions) = runtime.block_on(apply_faults(faults));

        prop_assert_eq!(state, ConnectionState::BrokerConnected);
        prop_assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
        prop_assert_eq!(subscriptions, vec![COMMAND_TOPIC.to_string()]);
    }
}
