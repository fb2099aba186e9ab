//! Valve service — drives the operation state machine for one controller.
//!
//! Every hardware contact follows the same shape while holding the
//! connection slot:
//!
//! 1. `Idle | Error -> Connecting`
//! 2. open a session (connect with retries)
//! 3. `Connecting -> Opening | Closing`, send the valve command, require Ack
//! 4. read the status back until it agrees (bounded), read the battery
//! 5. `-> Confirmed` or `-> Error` while the link is still open, then close it
//! 6. bookkeeping (session, cache, health), settle, `Confirmed -> Idle`
//!
//! Query-only polls skip step 3 and go `Connecting -> Confirmed`.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use valvehub_domain::cache::{CachedStatus, ValveReading};
use valvehub_domain::command::{Command, IrrigationMinutes};
use valvehub_domain::error::{FailureReason, ProtocolError, StateError, ValveError};
use valvehub_domain::event::ValveEvent;
use valvehub_domain::identity::DeviceIdentity;
use valvehub_domain::protocol::Response;
use valvehub_domain::scan::{PollDecision, ScanPolicy};
use valvehub_domain::session::{IrrigationRecord, IrrigationSession, SessionId};
use valvehub_domain::state::{OperationState, StateMachine, Transition};
use valvehub_domain::status::{SessionView, StatusSnapshot};
use valvehub_domain::time::{Timestamp, now};

use crate::cache::CacheStore;
use crate::connection::{ConnectionManager, Session, Slot};
use crate::ports::{EventPublisher, LinkConnector};
use crate::timer::{CountdownTarget, IrrigationTimer, TickOutcome};

/// Behaviour knobs for the valve service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValveConfig {
    /// Duration used by a plain open; `None` opens untimed.
    pub default_duration: Option<IrrigationMinutes>,
    /// Whether background polling starts enabled.
    pub scanning: bool,
    /// Hold in Confirmed before Idle while a session is running.
    pub settle_delay: Duration,
    pub verify_reads: u32,
    pub verify_delay: Duration,
    pub poll_interval: Duration,
    pub confirm_retry: Duration,
    pub max_consecutive_failures: u32,
    /// Turn scanning off whenever an irrigation ends.
    pub scan_off_after_irrigation: bool,
}

impl Default for ValveConfig {
    fn default() -> Self {
        Self {
            default_duration: IrrigationMinutes::new(20).ok(),
            scanning: true,
            settle_delay: Duration::from_millis(1500),
            verify_reads: 3,
            verify_delay: Duration::from_millis(1500),
            poll_interval: Duration::from_secs(300),
            confirm_retry: Duration::from_secs(30),
            max_consecutive_failures: 5,
            scan_off_after_irrigation: false,
        }
    }
}

/// What a single hardware contact is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Contact {
    Open(Option<IrrigationMinutes>),
    Close,
    Refresh,
    ConfirmClose,
}

/// A close that could not be confirmed when the session expired.
struct PendingClose {
    due: Instant,
    record: IrrigationRecord,
}

#[derive(Default)]
struct Health {
    consecutive_failures: u32,
    last_seen: Option<Timestamp>,
}

struct Shared {
    scan: ScanPolicy,
    session: Option<IrrigationSession>,
    pending_close: Option<PendingClose>,
    timer: Option<JoinHandle<()>>,
    default_duration: Option<IrrigationMinutes>,
    health: Health,
    error_since: Option<Instant>,
}

impl Shared {
    fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }
}

struct Inner<C, P> {
    identity: DeviceIdentity,
    connections: ConnectionManager<C>,
    publisher: P,
    cache: CacheStore,
    config: ValveConfig,
    machine: Mutex<StateMachine>,
    shared: Mutex<Shared>,
}

/// Application service for one valve controller. Cheap to clone.
pub struct ValveService<C, P> {
    inner: Arc<Inner<C, P>>,
}

impl<C, P> Clone for ValveService<C, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C, P> ValveService<C, P>
where
    C: LinkConnector,
    P: EventPublisher + 'static,
{
    pub fn new(
        identity: DeviceIdentity,
        connections: ConnectionManager<C>,
        publisher: P,
        cache: CacheStore,
        config: ValveConfig,
    ) -> Self {
        let shared = Shared {
            scan: ScanPolicy::new(config.scanning, config.poll_interval, config.confirm_retry),
            session: None,
            pending_close: None,
            timer: None,
            default_duration: config.default_duration,
            health: Health::default(),
            error_since: None,
        };
        Self {
            inner: Arc::new(Inner {
                identity,
                connections,
                publisher,
                cache,
                config,
                machine: Mutex::new(StateMachine::new()),
                shared: Mutex::new(shared),
            }),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn state(&self) -> OperationState {
        lock(&self.inner.machine).current()
    }

    /// Cached device data, for persisting across restarts.
    pub fn cache(&self) -> CachedStatus {
        self.inner.cache.snapshot()
    }

    pub fn restore_cache(&self, cached: CachedStatus) {
        self.inner.cache.restore(cached);
    }

    /// Open for the default duration, or untimed when it is zero.
    ///
    /// # Errors
    ///
    /// Returns the connection, protocol, or state error that moved the
    /// machine to Error.
    #[tracing::instrument(skip(self))]
    pub async fn open(&self) -> Result<(), ValveError> {
        let duration = lock(&self.inner.shared).default_duration;
        self.operate_queued(Contact::Open(duration)).await
    }

    /// Open for `minutes` (1..=240) and start the countdown.
    ///
    /// # Errors
    ///
    /// Returns [`ValveError::Validation`] outside the device range, otherwise
    /// as [`open`](Self::open).
    #[tracing::instrument(skip(self))]
    pub async fn open_for(&self, minutes: u32) -> Result<(), ValveError> {
        let minutes = IrrigationMinutes::new(minutes)?;
        self.operate_queued(Contact::Open(Some(minutes))).await
    }

    /// Open with no countdown.
    ///
    /// # Errors
    ///
    /// As [`open`](Self::open).
    #[tracing::instrument(skip(self))]
    pub async fn open_untimed(&self) -> Result<(), ValveError> {
        self.operate_queued(Contact::Open(None)).await
    }

    /// Close the valve and cancel any countdown once the device confirms.
    ///
    /// # Errors
    ///
    /// As [`open`](Self::open).
    #[tracing::instrument(skip(self))]
    pub async fn close(&self) -> Result<(), ValveError> {
        self.operate_queued(Contact::Close).await
    }

    /// Enable or disable background polling.
    ///
    /// Enabling resets the failure counter and makes the next scheduler check
    /// poll straight away.
    #[tracing::instrument(skip(self))]
    pub async fn set_scanning(&self, enabled: bool) {
        let changed = {
            let mut shared = lock(&self.inner.shared);
            let changed = shared.scan.set_enabled(enabled);
            if changed && enabled {
                shared.health.consecutive_failures = 0;
            }
            changed
        };
        if changed {
            tracing::info!(enabled, "scanning changed");
            self.publish(ValveEvent::ScanningChanged { enabled }).await;
        }
    }

    /// Change the default duration; `0` means untimed.
    ///
    /// # Errors
    ///
    /// Returns [`ValveError::Validation`] above 240 minutes.
    pub fn set_duration(&self, minutes: u32) -> Result<(), ValveError> {
        let duration = IrrigationMinutes::optional(minutes)?;
        lock(&self.inner.shared).default_duration = duration;
        tracing::info!(minutes, "default duration changed");
        Ok(())
    }

    /// Everything the status display needs. Never touches the device.
    pub fn snapshot(&self) -> StatusSnapshot {
        let (state, last_failure) = {
            let machine = lock(&self.inner.machine);
            (machine.current(), machine.last_failure())
        };
        let cache = self.inner.cache.snapshot();
        let shared = lock(&self.inner.shared);
        StatusSnapshot {
            name: self.inner.identity.name().to_owned(),
            address: self.inner.identity.address().to_string(),
            state,
            last_failure,
            session: shared.session.as_ref().map(SessionView::from),
            valve: cache.valve,
            battery_percent: cache.battery_percent,
            last_irrigation: cache.last_irrigation,
            scanning: shared.scan.enabled(),
            default_duration: shared.default_duration,
            consecutive_failures: shared.health.consecutive_failures,
            reachable: shared.health.consecutive_failures
                < self.inner.config.max_consecutive_failures,
            last_seen: shared.health.last_seen,
            last_poll: shared.scan.last_success(),
        }
    }

    /// One scheduler check. Never waits for the slot: if a command holds it,
    /// the check is skipped.
    pub async fn poll_tick(&self) -> PollDecision {
        let Some(slot) = self.inner.connections.try_acquire() else {
            tracing::trace!("hardware busy, poll check skipped");
            return PollDecision::Skip;
        };
        let at = Instant::now();
        let (decision, clear_error) = {
            let mut shared = lock(&self.inner.shared);
            let close_due = shared
                .pending_close
                .as_ref()
                .is_some_and(|pending| pending.due <= at);
            let decision = shared.scan.decide(at.into_std(), close_due);
            shared.scan.record_attempt(decision, at.into_std());
            let clear_error = shared
                .error_since
                .is_some_and(|since| at.duration_since(since) >= self.inner.config.poll_interval);
            (decision, clear_error)
        };
        match decision {
            PollDecision::Skip => {
                if clear_error {
                    self.clear_error().await;
                }
            }
            PollDecision::Refresh => {
                tracing::debug!("scheduled refresh");
                let _ = self.operate(&slot, Contact::Refresh).await;
            }
            PollDecision::ConfirmClose => {
                tracing::info!("confirming close of expired irrigation");
                let _ = self.operate(&slot, Contact::ConfirmClose).await;
            }
        }
        decision
    }

    async fn operate_queued(&self, contact: Contact) -> Result<(), ValveError> {
        let slot = self.inner.connections.acquire().await;
        self.operate(&slot, contact).await.map(|_| ())
    }

    /// One full hardware contact under an already held slot.
    async fn operate(
        &self,
        slot: &Slot<'_, C>,
        contact: Contact,
    ) -> Result<ValveReading, ValveError> {
        self.begin().await?;
        let result = self.contact(slot, contact).await;
        match &result {
            Ok(reading) => self.on_success(contact, *reading).await,
            Err(err) => self.on_failure(contact, err),
        }
        result
    }

    async fn contact(
        &self,
        slot: &Slot<'_, C>,
        contact: Contact,
    ) -> Result<ValveReading, ValveError> {
        let mut session = match slot.open(&self.inner.identity).await {
            Ok(session) => session,
            Err(err) => {
                let err = ValveError::from(err);
                self.fail(&err).await;
                return Err(err);
            }
        };
        let result = self.converse(&mut session, contact).await;
        match &result {
            Ok(_) => {
                if let Err(err) = self.transition(OperationState::Confirmed).await {
                    tracing::warn!(error = %err, "could not confirm");
                }
            }
            Err(err) => self.fail(err).await,
        }
        session.close().await;
        result
    }

    async fn converse(
        &self,
        session: &mut Session<C::Link>,
        contact: Contact,
    ) -> Result<ValveReading, ValveError> {
        match contact {
            Contact::Open(Some(minutes)) => {
                self.valve_command(session, Command::OpenValveTimed(minutes))
                    .await
            }
            Contact::Open(None) => self.valve_command(session, Command::OpenValve).await,
            Contact::Close => self.valve_command(session, Command::CloseValve).await,
            Contact::Refresh => {
                let reading = self.read_status(session).await?;
                self.read_battery(session).await;
                Ok(reading)
            }
            Contact::ConfirmClose => {
                let reading = self.read_status(session).await?;
                if reading.open {
                    tracing::warn!("valve still open after expiry, re-sending close");
                    self.valve_command(session, Command::CloseValve).await
                } else {
                    self.read_battery(session).await;
                    Ok(reading)
                }
            }
        }
    }

    /// Send a valve command once, then read back until the device agrees.
    async fn valve_command(
        &self,
        session: &mut Session<C::Link>,
        command: Command,
    ) -> Result<ValveReading, ValveError> {
        let expected_open = command.expected_open().unwrap_or(false);
        let target = if expected_open {
            OperationState::Opening
        } else {
            OperationState::Closing
        };
        self.transition(target).await?;

        match session.exchange(&command).await? {
            Response::Ack => {}
            Response::Nack(reason) => {
                tracing::warn!(%command, %reason, "device rejected command");
                return Err(ProtocolError::Nack(reason).into());
            }
            _ => return Err(ProtocolError::Unexpected { expected: "ack" }.into()),
        }

        let reads = self.inner.config.verify_reads.max(1);
        let mut reported_open = !expected_open;
        for read in 1..=reads {
            if read > 1 {
                sleep(self.inner.config.verify_delay).await;
            }
            let reading = self.read_status(session).await?;
            if reading.open == expected_open {
                self.read_battery(session).await;
                return Ok(reading);
            }
            reported_open = reading.open;
            tracing::debug!(read, expected_open, "valve not in requested state yet");
        }
        tracing::warn!(%command, "device acknowledged but reports otherwise");
        Err(StateError::ConfirmationMismatch {
            expected_open,
            reported_open,
        }
        .into())
    }

    async fn read_status(
        &self,
        session: &mut Session<C::Link>,
    ) -> Result<ValveReading, ValveError> {
        match session.exchange(&Command::QueryStatus).await? {
            Response::StatusReport {
                open,
                remaining_seconds,
            } => {
                let reading = ValveReading {
                    open,
                    remaining_seconds,
                };
                self.inner.cache.set_valve(reading, now());
                Ok(reading)
            }
            _ => Err(ProtocolError::Unexpected {
                expected: "status report",
            }
            .into()),
        }
    }

    /// Battery is informational; failures are logged only.
    async fn read_battery(&self, session: &mut Session<C::Link>) {
        match session.exchange(&Command::QueryBattery).await {
            Ok(Response::BatteryReport { percent }) => {
                tracing::debug!(percent, "battery");
                self.inner.cache.set_battery(percent, now());
            }
            Ok(other) => tracing::warn!(?other, "unexpected reply to battery query"),
            Err(err) => tracing::warn!(error = %err, "battery read failed"),
        }
    }

    async fn on_success(&self, contact: Contact, reading: ValveReading) {
        let at = now();
        let mut started = None;
        let mut finished = None;
        let mut scan_off = false;
        let settle = {
            let mut shared = lock(&self.inner.shared);
            shared.health.consecutive_failures = 0;
            shared.health.last_seen = Some(at);
            shared.error_since = None;

            match contact {
                Contact::Open(duration) => {
                    shared.cancel_timer();
                    finished = shared.pending_close.take().map(|pending| pending.record);
                    shared.session = duration.map(|minutes| IrrigationSession::start(minutes, at));
                    started = shared.session.as_ref().map(IrrigationSession::id);
                }
                Contact::Close | Contact::ConfirmClose => {
                    shared.cancel_timer();
                    finished = shared
                        .session
                        .take()
                        .map(|session| session.finish())
                        .or_else(|| shared.pending_close.take().map(|pending| pending.record));
                    shared.pending_close = None;
                    shared.scan.clear_confirm();
                }
                Contact::Refresh => {}
            }

            if matches!(contact, Contact::Refresh | Contact::ConfirmClose) {
                shared.scan.record_success(at);
            }
            if contact == Contact::Refresh {
                finished = reconcile(&mut shared, reading);
            }

            if finished.is_some() && self.inner.config.scan_off_after_irrigation {
                scan_off = shared.scan.set_enabled(false);
            }
            shared.session.is_some()
        };

        if let Some(id) = started {
            tracing::info!(session = %id, "irrigation started");
            let handle = IrrigationTimer::start(self.clone(), id);
            lock(&self.inner.shared).timer = Some(handle);
        }
        if let Some(record) = finished {
            tracing::info!(duration = %record.duration, ended_at = %record.ended_at, "irrigation finished");
            self.inner.cache.set_last_irrigation(record, at);
            self.publish(ValveEvent::IrrigationFinished { record }).await;
        }
        if scan_off {
            tracing::info!("scanning disabled after irrigation");
            self.publish(ValveEvent::ScanningChanged { enabled: false })
                .await;
        }
        self.publish(ValveEvent::CacheUpdated {
            cache: self.inner.cache.snapshot(),
        })
        .await;

        if settle {
            sleep(self.inner.config.settle_delay).await;
        }
        if let Err(err) = self.transition(OperationState::Idle).await {
            tracing::warn!(error = %err, "could not return to idle");
        }
    }

    fn on_failure(&self, contact: Contact, err: &ValveError) {
        let mut shared = lock(&self.inner.shared);
        shared.health.consecutive_failures = shared.health.consecutive_failures.saturating_add(1);
        shared.error_since = Some(Instant::now());
        let failures = shared.health.consecutive_failures;
        if failures >= self.inner.config.max_consecutive_failures {
            tracing::warn!(failures, ?contact, error = %err, "device unreachable");
        } else {
            tracing::warn!(failures, ?contact, error = %err, "device contact failed");
        }
    }

    async fn begin(&self) -> Result<(), ValveError> {
        let transition = lock(&self.inner.machine).begin()?;
        self.announce(transition, None).await;
        Ok(())
    }

    async fn transition(&self, to: OperationState) -> Result<(), ValveError> {
        let transition = lock(&self.inner.machine).transition(to)?;
        self.announce(transition, None).await;
        Ok(())
    }

    async fn fail(&self, err: &ValveError) {
        let reason = FailureReason::from(err);
        let result = lock(&self.inner.machine).fail(reason);
        match result {
            Ok(transition) => self.announce(transition, Some(reason)).await,
            Err(state_err) => tracing::warn!(error = %state_err, %reason, "could not record failure"),
        }
    }

    async fn clear_error(&self) {
        let cleared = lock(&self.inner.machine).clear_error();
        if let Some(transition) = cleared {
            lock(&self.inner.shared).error_since = None;
            self.announce(transition, None).await;
        }
    }

    async fn announce(&self, transition: Transition, reason: Option<FailureReason>) {
        let Transition { from, to } = transition;
        tracing::debug!(%from, %to, "state transition");
        if matches!(to, OperationState::Confirmed | OperationState::Error) {
            self.inner.cache.set_status(to, now());
        }
        self.publish(ValveEvent::StateChanged { from, to, reason })
            .await;
    }

    async fn publish(&self, event: ValveEvent) {
        self.inner.publisher.publish(event).await;
    }

    /// Countdown tick for `id`.
    async fn tick_session(&self, id: SessionId) -> TickOutcome {
        let outcome = {
            let mut shared = lock(&self.inner.shared);
            match shared.session.as_mut() {
                Some(session) if session.id() == id => match session.tick() {
                    0 => TickOutcome::Expired,
                    remaining_seconds => TickOutcome::Running { remaining_seconds },
                },
                _ => TickOutcome::Gone,
            }
        };
        let remaining_seconds = match outcome {
            TickOutcome::Running { remaining_seconds } => remaining_seconds,
            TickOutcome::Expired => 0,
            TickOutcome::Gone => return outcome,
        };
        self.publish(ValveEvent::Tick {
            session: id,
            remaining_seconds,
        })
        .await;
        outcome
    }

    /// Auto-close at the end of a session.
    ///
    /// The session is checked again once the slot is held: a command queued
    /// ahead of the close may have replaced it, and then nothing is sent.
    ///
    /// On failure the session is dropped locally and a pending close is left
    /// for the scheduler, which overrides a disabled scan policy to confirm it.
    async fn expire_session(&self, id: SessionId) {
        let slot = self.inner.connections.acquire().await;
        {
            let mut shared = lock(&self.inner.shared);
            if shared.session.as_ref().map(IrrigationSession::id) != Some(id) {
                tracing::debug!(session = %id, "session replaced before auto-close");
                return;
            }
            // Detach without aborting: this runs on the timer task itself.
            drop(shared.timer.take());
        }
        if let Err(err) = self.operate(&slot, Contact::Close).await {
            let mut shared = lock(&self.inner.shared);
            let session = shared
                .session
                .take_if(|session| session.id() == id);
            if let Some(session) = session {
                tracing::warn!(error = %err, "auto-close failed, next poll will confirm");
                shared.pending_close = Some(PendingClose {
                    due: Instant::now(),
                    record: session.finish(),
                });
            }
        }
    }
}

/// Fold a poll reading into the active session. Returns the finished
/// irrigation if the device reports the valve closed.
fn reconcile(shared: &mut Shared, reading: ValveReading) -> Option<IrrigationRecord> {
    if reading.open {
        if let (Some(session), Some(remaining)) =
            (shared.session.as_mut(), reading.remaining_seconds)
        {
            tracing::debug!(
                local = session.remaining_seconds(),
                device = remaining,
                "countdown resynced"
            );
            session.resync(remaining);
        }
        return None;
    }
    if let Some(session) = shared.session.take() {
        shared.cancel_timer();
        return Some(session.finish());
    }
    let pending = shared.pending_close.take()?;
    shared.scan.clear_confirm();
    Some(pending.record)
}

impl<C, P> CountdownTarget for ValveService<C, P>
where
    C: LinkConnector,
    P: EventPublisher + 'static,
{
    fn tick(&self, session: SessionId) -> impl Future<Output = TickOutcome> + Send {
        self.tick_session(session)
    }

    fn expire(&self, session: SessionId) -> impl Future<Output = ()> + Send {
        self.expire_session(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tokio::sync::broadcast;
    use valvehub_domain::protocol::NackReason;

    use crate::connection::ConnectionConfig;
    use crate::event_bus::InProcessEventBus;
    use crate::testing::SimConnector;

    type Service = ValveService<SimConnector, Arc<InProcessEventBus>>;

    fn service_with(sim: &SimConnector, config: ValveConfig) -> (Service, broadcast::Receiver<ValveEvent>) {
        let bus = Arc::new(InProcessEventBus::new(4096));
        let rx = bus.subscribe();
        let identity = DeviceIdentity::new("AA:BB:CC:DD:EE:FF".parse().unwrap(), "GL9001A");
        let connections = ConnectionManager::new(sim.clone(), ConnectionConfig::default());
        let service = ValveService::new(identity, connections, bus, CacheStore::new(), config);
        (service, rx)
    }

    fn service(sim: &SimConnector) -> (Service, broadcast::Receiver<ValveEvent>) {
        service_with(sim, ValveConfig::default())
    }

    fn transitions(rx: &mut broadcast::Receiver<ValveEvent>) -> Vec<(OperationState, OperationState)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ValveEvent::StateChanged { from, to, .. } = event {
                out.push((from, to));
            }
        }
        out
    }

    use valvehub_domain::state::OperationState::{
        Closing, Confirmed, Connecting, Error, Idle, Opening,
    };

    #[tokio::test(start_paused = true)]
    async fn should_confirm_timed_open_and_start_countdown() {
        let sim = SimConnector::default();
        let (service, mut rx) = service(&sim);

        service.open_for(10).await.unwrap();

        assert_eq!(
            transitions(&mut rx),
            [
                (Idle, Connecting),
                (Connecting, Opening),
                (Opening, Confirmed),
                (Confirmed, Idle)
            ]
        );
        let snap = service.snapshot();
        assert_eq!(snap.state, Idle);
        let session = snap.session.unwrap();
        assert_eq!(session.requested.get(), 10);
        assert!(session.remaining_seconds <= 600 && session.remaining_seconds >= 598);
        assert_eq!(snap.battery_percent.unwrap().value, 87);
        assert!(sim.state().open);
    }

    #[tokio::test(start_paused = true)]
    async fn should_auto_close_at_expiry_and_record_irrigation() {
        let sim = SimConnector::default();
        let (service, _rx) = service(&sim);

        service.open_for(1).await.unwrap();
        let started_at = service.snapshot().session.unwrap().started_at;
        sleep(Duration::from_secs(120)).await;

        let snap = service.snapshot();
        assert!(snap.session.is_none());
        assert_eq!(snap.state, Idle);
        let record = snap.last_irrigation.unwrap().value;
        assert_eq!(record.duration.get(), 1);
        assert_eq!(record.ended_at, started_at + ChronoDuration::seconds(60));
        assert!(!sim.state().open);
        assert_eq!(
            sim.state().log,
            [
                Command::OpenValveTimed(IrrigationMinutes::new(1).unwrap()),
                Command::QueryStatus,
                Command::QueryBattery,
                Command::CloseValve,
                Command::QueryStatus,
                Command::QueryBattery,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_auto_close_a_session_opened_while_expiry_waited() {
        let sim = SimConnector::default();
        let (service, _rx) = service(&sim);

        service.open_for(1).await.unwrap();
        let busy = service.inner.connections.acquire().await;
        let reopen = tokio::spawn({
            let service = service.clone();
            async move { service.open_for(5).await }
        });
        // the first session expires while the reopen is queued ahead of it
        sleep(Duration::from_secs(70)).await;
        drop(busy);
        reopen.await.unwrap().unwrap();
        sleep(Duration::from_secs(10)).await;

        let snap = service.snapshot();
        assert_eq!(snap.state, Idle);
        assert_eq!(snap.session.unwrap().requested.get(), 5);
        assert!(sim.state().open);
        assert_eq!(
            sim.state().log,
            [
                Command::OpenValveTimed(IrrigationMinutes::new(1).unwrap()),
                Command::QueryStatus,
                Command::QueryBattery,
                Command::OpenValveTimed(IrrigationMinutes::new(5).unwrap()),
                Command::QueryStatus,
                Command::QueryBattery,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_fail_with_mismatch_when_device_ignores_command() {
        let sim = SimConnector::default();
        sim.state_mut().stuck = true;
        let (service, mut rx) = service(&sim);

        let err = service.open_for(5).await.unwrap_err();

        assert!(matches!(
            err,
            ValveError::State(StateError::ConfirmationMismatch {
                expected_open: true,
                reported_open: false
            })
        ));
        assert_eq!(
            transitions(&mut rx),
            [(Idle, Connecting), (Connecting, Opening), (Opening, Error)]
        );
        let snap = service.snapshot();
        assert_eq!(snap.last_failure, Some(FailureReason::ConfirmationMismatch));
        assert!(snap.session.is_none());
        let reads = sim
            .state()
            .log
            .iter()
            .filter(|c| **c == Command::QueryStatus)
            .count();
        assert_eq!(reads, 3);
        assert_eq!(sim.state().open_links, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_surface_nack_as_distinct_failure() {
        let sim = SimConnector::default();
        sim.state_mut().nack = Some(NackReason::NOT_PERMITTED);
        let (service, _rx) = service(&sim);

        let err = service.open_untimed().await.unwrap_err();

        assert!(matches!(
            err,
            ValveError::Protocol(ProtocolError::Nack(NackReason::NOT_PERMITTED))
        ));
        assert_eq!(service.snapshot().last_failure, Some(FailureReason::Nack));
    }

    #[tokio::test(start_paused = true)]
    async fn should_leave_error_on_next_command() {
        let sim = SimConnector::default();
        sim.state_mut().unreachable = 3;
        let (service, mut rx) = service(&sim);

        let err = service.open_for(5).await.unwrap_err();
        assert!(matches!(
            err,
            ValveError::Conn(valvehub_domain::error::ConnError::Unreachable { attempts: 3 })
        ));
        assert_eq!(service.state(), Error);
        assert_eq!(service.snapshot().consecutive_failures, 1);

        service.close().await.unwrap();
        let seen = transitions(&mut rx);
        assert!(seen.contains(&(Error, Connecting)));
        assert_eq!(seen.last(), Some(&(Confirmed, Idle)));
        assert_eq!(service.snapshot().last_failure, None);
        assert_eq!(service.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_cancel_countdown_on_manual_close() {
        let sim = SimConnector::default();
        let (service, _rx) = service(&sim);

        service.open_for(10).await.unwrap();
        sleep(Duration::from_secs(30)).await;
        service.close().await.unwrap();
        assert!(service.snapshot().session.is_none());
        assert!(service.snapshot().last_irrigation.is_some());

        sleep(Duration::from_secs(900)).await;
        let closes = sim
            .state()
            .log
            .iter()
            .filter(|c| **c == Command::CloseValve)
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_close_idempotently_when_already_closed() {
        let sim = SimConnector::default();
        let (service, mut rx) = service(&sim);

        service.close().await.unwrap();

        assert_eq!(
            transitions(&mut rx),
            [
                (Idle, Connecting),
                (Connecting, Closing),
                (Closing, Confirmed),
                (Confirmed, Idle)
            ]
        );
        assert_eq!(sim.state().connects, 1);
        assert_eq!(
            sim.state().log,
            [Command::CloseValve, Command::QueryStatus, Command::QueryBattery]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_queue_concurrent_commands() {
        let sim = SimConnector::default();
        let (service, _rx) = service(&sim);

        let (opened, closed) = tokio::join!(service.open_untimed(), service.close());

        assert!(opened.is_ok());
        assert!(closed.is_ok());
        assert_eq!(sim.state().max_open_links, 1);
        assert_eq!(sim.state().log.first(), Some(&Command::OpenValve));
        assert!(!sim.state().open);
    }

    #[tokio::test]
    async fn should_reject_durations_outside_device_range() {
        let sim = SimConnector::default();
        let (service, _rx) = service(&sim);

        for minutes in [0, 241] {
            let err = service.open_for(minutes).await.unwrap_err();
            assert!(matches!(err, ValveError::Validation(_)));
        }
        assert!(service.set_duration(300).is_err());
        assert_eq!(sim.state().connects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_open_untimed_when_default_duration_is_zero() {
        let sim = SimConnector::default();
        let (service, _rx) = service(&sim);

        service.set_duration(0).unwrap();
        service.open().await.unwrap();

        assert_eq!(sim.state().log.first(), Some(&Command::OpenValve));
        assert!(service.snapshot().session.is_none());
        assert_eq!(service.snapshot().default_duration, None);
    }

    #[tokio::test(start_paused = true)]
    async fn should_use_default_duration_for_plain_open() {
        let sim = SimConnector::default();
        let (service, _rx) = service(&sim);

        service.open().await.unwrap();

        assert_eq!(
            sim.state().log.first(),
            Some(&Command::OpenValveTimed(IrrigationMinutes::new(20).unwrap()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_refresh_cache_on_poll_when_scanning() {
        let sim = SimConnector::default();
        let (service, mut rx) = service(&sim);

        assert_eq!(service.poll_tick().await, PollDecision::Refresh);
        assert_eq!(service.poll_tick().await, PollDecision::Skip);

        let snap = service.snapshot();
        assert_eq!(snap.battery_percent.unwrap().value, 87);
        assert!(snap.last_poll.is_some());
        assert!(snap.last_seen.is_some());
        assert_eq!(
            transitions(&mut rx),
            [(Idle, Connecting), (Connecting, Confirmed), (Confirmed, Idle)]
        );
        assert_eq!(sim.state().connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_poll_when_scanning_disabled() {
        let sim = SimConnector::default();
        let config = ValveConfig {
            scanning: false,
            ..ValveConfig::default()
        };
        let (service, _rx) = service_with(&sim, config);

        for _ in 0..100 {
            assert_eq!(service.poll_tick().await, PollDecision::Skip);
            sleep(Duration::from_secs(60)).await;
        }
        assert_eq!(sim.state().connects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_resync_countdown_from_device() {
        let sim = SimConnector::default();
        let (service, _rx) = service(&sim);

        service.open_for(10).await.unwrap();
        sim.state_mut().remaining = 300;
        assert_eq!(service.poll_tick().await, PollDecision::Refresh);

        let remaining = service.snapshot().session.unwrap().remaining_seconds;
        assert!((298..=300).contains(&remaining));
    }

    #[tokio::test(start_paused = true)]
    async fn should_end_session_when_poll_reads_closed() {
        let sim = SimConnector::default();
        let (service, _rx) = service(&sim);

        service.open_for(10).await.unwrap();
        sim.state_mut().open = false;
        service.poll_tick().await;

        let snap = service.snapshot();
        assert!(snap.session.is_none());
        assert_eq!(snap.last_irrigation.unwrap().value.duration.get(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn should_confirm_close_after_failed_expiry_even_when_not_scanning() {
        let sim = SimConnector::default();
        let config = ValveConfig {
            scanning: false,
            ..ValveConfig::default()
        };
        let (service, _rx) = service_with(&sim, config);

        service.open_for(1).await.unwrap();
        sim.state_mut().unreachable = 3;
        sleep(Duration::from_secs(120)).await;

        let snap = service.snapshot();
        assert_eq!(snap.state, Error);
        assert_eq!(snap.last_failure, Some(FailureReason::Unreachable));
        assert!(snap.session.is_none());
        assert!(snap.last_irrigation.is_none());
        assert!(sim.state().open);

        assert_eq!(service.poll_tick().await, PollDecision::ConfirmClose);

        let snap = service.snapshot();
        assert!(!sim.state().open);
        assert_eq!(snap.state, Idle);
        assert_eq!(snap.last_irrigation.unwrap().value.duration.get(), 1);
        assert_eq!(service.poll_tick().await, PollDecision::Skip);
    }

    #[tokio::test(start_paused = true)]
    async fn should_disable_scanning_after_irrigation_when_configured() {
        let sim = SimConnector::default();
        let config = ValveConfig {
            scan_off_after_irrigation: true,
            ..ValveConfig::default()
        };
        let (service, _rx) = service_with(&sim, config);

        service.open_for(1).await.unwrap();
        assert!(service.snapshot().scanning);
        sleep(Duration::from_secs(120)).await;

        assert!(!service.snapshot().scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn should_report_unreachable_after_max_consecutive_failures() {
        let sim = SimConnector::default();
        sim.state_mut().unreachable = u32::MAX;
        let (service, _rx) = service(&sim);

        for _ in 0..5 {
            assert!(service.close().await.is_err());
        }
        assert!(!service.snapshot().reachable);

        service.set_scanning(false).await;
        service.set_scanning(true).await;
        let snap = service.snapshot();
        assert!(snap.reachable);
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_clear_error_after_one_poll_interval() {
        let sim = SimConnector::default();
        sim.state_mut().unreachable = 3;
        let config = ValveConfig {
            scanning: false,
            ..ValveConfig::default()
        };
        let (service, _rx) = service_with(&sim, config);

        assert!(service.close().await.is_err());
        service.poll_tick().await;
        assert_eq!(service.state(), Error);

        sleep(Duration::from_secs(300)).await;
        service.poll_tick().await;
        assert_eq!(service.state(), Idle);
        assert_eq!(service.snapshot().last_failure, Some(FailureReason::Unreachable));
    }
}
