//! End-to-end scenarios: the real service, connection manager, timer, poll
//! scheduler and event bus driving the virtual controller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use valvehub_adapter_virtual::{Faults, VirtualController};
use valvehub_app::cache::CacheStore;
use valvehub_app::connection::{ConnectionConfig, ConnectionManager};
use valvehub_app::discovery::discover_controllers;
use valvehub_app::event_bus::InProcessEventBus;
use valvehub_app::ports::DeviceFound;
use valvehub_app::scheduler::PollScheduler;
use valvehub_app::services::valve_service::{ValveConfig, ValveService};
use valvehub_domain::command::{Command, IrrigationMinutes};
use valvehub_domain::error::{ConnError, FailureReason, StateError, ValveError};
use valvehub_domain::event::ValveEvent;
use valvehub_domain::identity::DeviceIdentity;
use valvehub_domain::state::OperationState::{
    Closing, Confirmed, Connecting, Error, Idle, Opening,
};
use valvehub_domain::state::OperationState;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

struct Harness {
    controller: VirtualController,
    service: ValveService<VirtualController, Arc<InProcessEventBus>>,
    events: broadcast::Receiver<ValveEvent>,
}

fn harness(config: ValveConfig) -> Harness {
    let identity = DeviceIdentity::new("AA:BB:CC:DD:EE:FF".parse().unwrap(), "GL9001A-garden");
    let controller = VirtualController::new(identity.clone());
    let bus = Arc::new(InProcessEventBus::new(4_096));
    let events = bus.subscribe();
    let service = ValveService::new(
        identity,
        ConnectionManager::new(controller.clone(), ConnectionConfig::default()),
        bus,
        CacheStore::new(),
        config,
    );
    Harness {
        controller,
        service,
        events,
    }
}

fn quiet() -> ValveConfig {
    ValveConfig {
        scanning: false,
        ..ValveConfig::default()
    }
}

fn drain(events: &mut broadcast::Receiver<ValveEvent>) -> Vec<ValveEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn states(events: &[ValveEvent]) -> Vec<OperationState> {
    events
        .iter()
        .filter_map(|event| match event {
            ValveEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

fn minutes(value: u32) -> IrrigationMinutes {
    IrrigationMinutes::new(value).unwrap()
}

#[tokio::test(start_paused = true)]
async fn should_run_timed_irrigation_through_auto_close() {
    let mut h = harness(quiet());

    h.service.open_for(10).await.unwrap();
    let mut events = drain(&mut h.events);
    assert_eq!(states(&events), [Connecting, Opening, Confirmed, Idle]);
    assert!(h.controller.is_open());
    let started_at = h.service.snapshot().session.unwrap().started_at;

    tokio::time::sleep(Duration::from_secs(601)).await;

    let closing = drain(&mut h.events);
    assert_eq!(states(&closing), [Connecting, Closing, Confirmed, Idle]);
    events.extend(closing);
    let ticks: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            ValveEvent::Tick {
                remaining_seconds, ..
            } => Some(*remaining_seconds),
            _ => None,
        })
        .collect();
    assert_eq!(ticks.len(), 600);
    assert_eq!(ticks.first(), Some(&599));
    assert_eq!(ticks.last(), Some(&0));

    let snapshot = h.service.snapshot();
    assert_eq!(snapshot.state, Idle);
    assert!(snapshot.session.is_none());
    assert_eq!(snapshot.remaining(), "00:00");
    let record = snapshot.last_irrigation.unwrap().value;
    assert_eq!(record.duration, minutes(10));
    assert_eq!(record.ended_at, started_at + chrono::Duration::seconds(600));
    assert!(!h.controller.is_open());

    assert_eq!(
        h.controller.counters().commands,
        [
            Command::OpenValveTimed(minutes(10)),
            Command::QueryStatus,
            Command::QueryBattery,
            Command::CloseValve,
            Command::QueryStatus,
            Command::QueryBattery,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn should_report_unreachable_after_three_timed_out_connects() {
    let mut h = harness(quiet());
    h.controller
        .inject(|faults| faults.connect_delay = Duration::from_secs(120));

    let started = tokio::time::Instant::now();
    let err = h.service.open_for(10).await.unwrap_err();

    // 3 x 30 s timeouts plus 1 s and 2 s of backoff
    assert_eq!(started.elapsed(), Duration::from_secs(93));
    assert!(matches!(
        err,
        ValveError::Conn(ConnError::Unreachable { attempts: 3 })
    ));
    assert_eq!(states(&drain(&mut h.events)), [Connecting, Error]);
    assert_eq!(h.controller.counters().connects, 3);

    let snapshot = h.service.snapshot();
    assert_eq!(snapshot.last_failure, Some(FailureReason::Unreachable));
    assert!(snapshot.session.is_none());

    h.controller.heal();
    h.service.close().await.unwrap();
    assert_eq!(
        states(&drain(&mut h.events)),
        [Connecting, Closing, Confirmed, Idle]
    );
    assert_eq!(h.service.snapshot().last_failure, None);
}

#[tokio::test(start_paused = true)]
async fn should_flag_mismatch_when_ack_is_not_reflected() {
    let mut h = harness(quiet());
    h.controller.inject(|faults| faults.stuck = true);

    let err = h.service.open_for(10).await.unwrap_err();

    assert!(matches!(
        err,
        ValveError::State(StateError::ConfirmationMismatch {
            expected_open: true,
            reported_open: false
        })
    ));
    assert_eq!(
        states(&drain(&mut h.events)),
        [Connecting, Opening, Error]
    );
    let snapshot = h.service.snapshot();
    assert_eq!(
        snapshot.last_failure,
        Some(FailureReason::ConfirmationMismatch)
    );
    assert!(snapshot.session.is_none());
    // the command is sent once, then read back
    assert_eq!(
        h.controller.counters().commands,
        [
            Command::OpenValveTimed(minutes(10)),
            Command::QueryStatus,
            Command::QueryStatus,
            Command::QueryStatus,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn should_enter_error_with_a_distinct_reason_per_failure() {
    let cases: [(fn(&mut Faults), FailureReason); 4] = [
        (
            |faults: &mut Faults| faults.raw_response = Some(vec![0xA5, 0x90, 0x01, 0x01, 0x5A]),
            FailureReason::Malformed,
        ),
        (
            |faults: &mut Faults| {
                faults.raw_response = Some(vec![0xA5, 0x92, 0x02, 0x03, 0x01, 0x5A]);
            },
            FailureReason::Unsupported,
        ),
        (
            |faults: &mut Faults| faults.command_delay = Duration::from_secs(20),
            FailureReason::Timeout,
        ),
        (
            |faults: &mut Faults| faults.dropped_exchanges = 1,
            FailureReason::LinkDropped,
        ),
    ];

    for (fault, reason) in cases {
        let mut h = harness(quiet());
        h.controller.inject(fault);

        let err = h.service.open_for(10).await.unwrap_err();

        assert_eq!(FailureReason::from(&err), reason);
        assert_eq!(
            states(&drain(&mut h.events)),
            [Connecting, Opening, Error],
            "{reason}"
        );
        let snapshot = h.service.snapshot();
        assert_eq!(snapshot.state, Error);
        assert_eq!(snapshot.last_failure, Some(reason));
        assert!(snapshot.session.is_none());

        let counters = h.controller.counters();
        assert_eq!(counters.connects, 1, "{reason}");
        assert_eq!(counters.open_links, 0, "{reason}");
        assert!(!h.controller.is_open());
    }
}

#[tokio::test(start_paused = true)]
async fn should_never_hold_two_links_at_once() {
    let h = harness(ValveConfig::default());
    h.controller
        .inject(|faults| faults.command_delay = Duration::from_secs(2));
    let scheduler = PollScheduler::start(h.service.clone(), CHECK_INTERVAL);

    let (opened, closed) = tokio::join!(h.service.open_for(5), h.service.close());
    opened.unwrap();
    closed.unwrap();
    tokio::time::sleep(Duration::from_secs(700)).await;
    scheduler.abort();

    let counters = h.controller.counters();
    assert_eq!(counters.max_open_links, 1);
    assert_eq!(counters.open_links, 0);
    assert!(counters.connects >= 3);
    assert!(!h.controller.is_open());
    assert_eq!(h.service.state(), Idle);
}

#[tokio::test(start_paused = true)]
async fn should_poll_five_times_in_a_window_when_scanning() {
    let h = harness(ValveConfig::default());
    let scheduler = PollScheduler::start(h.service.clone(), CHECK_INTERVAL);

    tokio::time::sleep(Duration::from_secs(1_490)).await;
    scheduler.abort();

    let counters = h.controller.counters();
    assert_eq!(counters.connects, 5);
    assert_eq!(
        counters.commands,
        [Command::QueryStatus, Command::QueryBattery].repeat(5)
    );
    let snapshot = h.service.snapshot();
    assert!(snapshot.last_poll.is_some());
    assert_eq!(snapshot.battery_percent.unwrap().value, 100);
}

#[tokio::test(start_paused = true)]
async fn should_not_poll_when_scanning_disabled() {
    let h = harness(quiet());
    let scheduler = PollScheduler::start(h.service.clone(), CHECK_INTERVAL);

    tokio::time::sleep(Duration::from_secs(24 * 3_600)).await;
    scheduler.abort();

    assert_eq!(h.controller.counters().connects, 0);
}

#[tokio::test(start_paused = true)]
async fn should_close_idempotently() {
    let mut h = harness(quiet());

    h.service.close().await.unwrap();
    h.service.close().await.unwrap();

    let events = drain(&mut h.events);
    assert_eq!(
        states(&events),
        [
            Connecting, Closing, Confirmed, Idle, Connecting, Closing, Confirmed, Idle
        ]
    );
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, ValveEvent::IrrigationFinished { .. }))
    );
    assert!(!h.controller.is_open());
    assert!(h.service.snapshot().last_irrigation.is_none());
}

#[tokio::test(start_paused = true)]
async fn should_confirm_close_after_failed_auto_close() {
    let h = harness(quiet());
    let scheduler = PollScheduler::start(h.service.clone(), CHECK_INTERVAL);

    h.service.open_for(1).await.unwrap();
    let started_at = h.service.snapshot().session.unwrap().started_at;
    h.controller
        .inject(|faults| faults.unreachable_connects = 3);

    tokio::time::sleep(Duration::from_secs(63)).await;
    assert_eq!(h.service.state(), Error);
    assert!(h.service.snapshot().session.is_none());
    assert!(h.service.snapshot().last_irrigation.is_none());

    // scanning is off, but the pending close is still confirmed
    tokio::time::sleep(Duration::from_secs(10)).await;
    scheduler.abort();

    let snapshot = h.service.snapshot();
    assert_eq!(snapshot.state, Idle);
    let record = snapshot.last_irrigation.unwrap().value;
    assert_eq!(record.duration, minutes(1));
    assert_eq!(record.ended_at, started_at + chrono::Duration::seconds(60));
    assert!(!h.controller.is_open());
}

#[tokio::test(start_paused = true)]
async fn should_end_session_when_valve_closed_at_the_unit() {
    let h = harness(ValveConfig::default());

    h.service.open_for(30).await.unwrap();
    let scheduler = PollScheduler::start(h.service.clone(), CHECK_INTERVAL);
    h.controller.operate_locally(Command::CloseValve);

    tokio::time::sleep(Duration::from_secs(310)).await;
    scheduler.abort();

    let snapshot = h.service.snapshot();
    assert!(snapshot.session.is_none());
    assert_eq!(
        snapshot.last_irrigation.unwrap().value.duration,
        minutes(30)
    );
}

#[tokio::test(start_paused = true)]
async fn should_serialise_status_snapshot() {
    let h = harness(quiet());
    h.controller.set_battery(64);

    h.service.open_for(10).await.unwrap();
    let json = serde_json::to_value(h.service.snapshot()).unwrap();

    assert_eq!(json["name"], "GL9001A-garden");
    assert_eq!(json["address"], "AA:BB:CC:DD:EE:FF");
    assert_eq!(json["state"], "Idle");
    assert_eq!(json["battery_percent"]["value"], 64);
    assert_eq!(json["scanning"], false);
    assert_eq!(json["session"]["requested"], 10);
    assert_eq!(json["reachable"], true);
}

#[tokio::test(start_paused = true)]
async fn should_discover_only_supported_controllers() {
    let h = harness(quiet());
    h.controller.advertise(DeviceFound {
        address: "11:22:33:44:55:66".to_string(),
        name: Some("LYWSD03MMC".to_string()),
    });
    h.controller.advertise(DeviceFound {
        address: "aa:bb:cc:00:11:22".to_string(),
        name: Some("gl9001a-patio".to_string()),
    });

    let found = discover_controllers(&h.controller, Duration::from_secs(10))
        .await
        .unwrap();
    let addresses: Vec<String> = found.iter().map(|id| id.address().to_string()).collect();

    assert_eq!(addresses, ["AA:BB:CC:DD:EE:FF", "AA:BB:CC:00:11:22"]);
}
