//! Connection supervision with exponential backoff.
//!
//! A [`ReconnectManager`] owns one transport at a time and drives it through
//! connect, monitor and backoff cycles until stopped:
//!
//! ```text
//! Disconnected ─> Connecting ─┬─> Connected ──(poll sees drop)──┐
//!                      ^      └─> Retrying <────────────────────┘
//!                      └──(backoff)──┘
//! ```
//!
//! Every visible state change is published on the event bus and offered to a
//! bounded state channel; a full channel drops the notice, never the state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{Event, EventBus};
use crate::transport::{BoxFuture, Endpoint, Transport};

/// Default first retry delay.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default cap on the retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default delay growth factor.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Default jitter, as a fraction of the delay.
pub const DEFAULT_JITTER_FRACTION: f64 = 0.2;

/// Default connected time after which the backoff resets.
pub const DEFAULT_STABLE_THRESHOLD: Duration = Duration::from_secs(60);

/// Default liveness poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default state channel depth.
pub const DEFAULT_STATE_QUEUE: usize = 16;

/// Default bound on a single connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `stop` waits for the loop before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not running, or stopped.
    #[default]
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The transport is up.
    Connected,
    /// Waiting out the backoff before the next attempt.
    Retrying,
}

impl ConnectionState {
    /// Lower-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconnection tunables.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// First retry delay.
    pub initial_delay: Duration,
    /// Upper bound on the retry delay.
    pub max_delay: Duration,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Random spread applied to each wait, as a fraction of the delay.
    pub jitter_fraction: f64,
    /// Connected time after which the delay resets.
    pub stable_threshold: Duration,
    /// Liveness poll interval.
    pub poll_interval: Duration,
    /// State channel depth.
    pub state_queue: usize,
    /// Bound on one connection attempt.
    pub connect_timeout: Duration,
}

impl ReconnectConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            stable_threshold: DEFAULT_STABLE_THRESHOLD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state_queue: DEFAULT_STATE_QUEUE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the first retry delay.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter fraction.
    #[must_use]
    pub const fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    /// Sets the stability threshold.
    #[must_use]
    pub const fn stable_threshold(mut self, threshold: Duration) -> Self {
        self.stable_threshold = threshold;
        self
    }

    /// Sets the liveness poll interval.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the state channel depth.
    #[must_use]
    pub const fn state_queue(mut self, depth: usize) -> Self {
        self.state_queue = depth;
        self
    }

    /// Sets the per-attempt connect bound.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Rejects settings the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay.is_zero() {
            return Err(Error::config("initial delay must be non-zero"));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::config("max delay is below initial delay"));
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(Error::config("multiplier must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err(Error::config("jitter fraction must be in [0, 1)"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll interval must be non-zero"));
        }
        if self.state_queue == 0 {
            return Err(Error::config("state queue depth must be non-zero"));
        }
        Ok(())
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    stable_threshold: Duration,
    current: Duration,
}

impl Backoff {
    /// Creates a backoff starting at the configured initial delay.
    #[must_use]
    pub const fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: config.initial_delay,
            max: config.max_delay,
            multiplier: config.multiplier,
            jitter: config.jitter_fraction,
            stable_threshold: config.stable_threshold,
            current: config.initial_delay,
        }
    }

    /// The delay the next wait is based on, before jitter.
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Returns the next pre-jitter delay and grows the following one.
    pub fn next_base(&mut self) -> Duration {
        let base = self.current;
        let grown = Duration::try_from_secs_f64(base.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = grown.min(self.max);
        base
    }

    /// Returns the next wait, jittered and never below the initial delay.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_base();
        self.jittered(base)
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return base.max(self.initial);
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let scaled = Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + spread))
            .unwrap_or(self.initial);
        scaled.max(self.initial)
    }

    /// Resets to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Resets if a connection stayed up past the stability threshold.
    ///
    /// Returns true if the delay was reset.
    pub fn settle(&mut self, connected_for: Duration) -> bool {
        if connected_for >= self.stable_threshold && self.current != self.initial {
            self.reset();
            return true;
        }
        false
    }
}

/// A state change notice sent on the state channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// New state.
    pub state: ConnectionState,
    /// Human-readable status.
    pub status: String,
    /// Error that caused the change, if any.
    pub error: Option<String>,
}

/// Point-in-time view of the manager for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Current state.
    pub state: ConnectionState,
    /// Last status line.
    pub status: String,
    /// Most recent error, cleared once connected.
    pub last_error: Option<String>,
    /// Transport target, if one is attached.
    pub target: Option<String>,
}

/// Hook invoked as connections come and go.
pub trait ConnectionObserver: Send + Sync {
    /// Called once the transport is connected.
    ///
    /// `session` is cancelled when this connection ends. An error fails the
    /// connection and schedules a retry.
    fn on_connected(
        &self,
        transport: Arc<dyn Transport>,
        session: CancelToken,
    ) -> BoxFuture<'_, Result<()>>;

    /// Called after a connection ends, before any retry.
    fn on_disconnected(&self);
}

#[derive(Default)]
struct Shared {
    state: ConnectionState,
    status: String,
    last_error: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    loop_cancel: Option<CancelToken>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    config: ReconnectConfig,
    bus: EventBus,
    shared: Mutex<Shared>,
    state_tx: mpsc::Sender<StateChange>,
    state_rx: Mutex<Option<mpsc::Receiver<StateChange>>>,
    wake: Notify,
    reset_requested: AtomicBool,
}

impl Inner {
    fn transition(&self, state: ConnectionState, status: String, error: Option<String>) {
        let changed = {
            let mut shared = self.shared.lock();
            let changed = shared.state != state;
            shared.state = state;
            shared.status.clone_from(&status);
            if error.is_some() {
                shared.last_error.clone_from(&error);
            } else if state == ConnectionState::Connected {
                shared.last_error = None;
            }
            changed
        };
        if !changed {
            return;
        }

        match &error {
            Some(e) => tracing::info!("connection {}: {} ({})", state, status, e),
            None => tracing::info!("connection {}: {}", state, status),
        }
        self.bus.publish(Event::ConnectionStateChanged {
            state,
            status: status.clone(),
            error: error.clone(),
        });
        if let Err(mpsc::error::TrySendError::Full(_)) = self.state_tx.try_send(StateChange {
            state,
            status,
            error,
        }) {
            tracing::warn!("state channel full, dropped {} notice", state);
        }
    }

    fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.shared.lock().observer.clone()
    }
}

/// Supervises one transport with reconnection.
#[derive(Clone)]
pub struct ReconnectManager {
    inner: Arc<Inner>,
}

impl ReconnectManager {
    /// Creates a stopped manager publishing on `bus`.
    #[must_use]
    pub fn new(config: ReconnectConfig, bus: EventBus) -> Self {
        let (state_tx, state_rx) = mpsc::channel(config.state_queue.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                bus,
                shared: Mutex::new(Shared {
                    status: "idle".to_string(),
                    ..Shared::default()
                }),
                state_tx,
                state_rx: Mutex::new(Some(state_rx)),
                wake: Notify::new(),
                reset_requested: AtomicBool::new(false),
            }),
        }
    }

    /// Installs the connection hook. Takes effect on the next connection.
    pub fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.inner.shared.lock().observer = Some(observer);
    }

    /// Takes the bounded state channel receiver. Returns `None` after the
    /// first call.
    pub fn take_state_changes(&self) -> Option<mpsc::Receiver<StateChange>> {
        self.inner.state_rx.lock().take()
    }

    /// Validates `endpoint`, builds its transport and starts the loop.
    pub fn start(&self, endpoint: &Endpoint) -> Result<()> {
        self.inner.config.validate()?;
        let transport = endpoint.open()?;
        tracing::debug!("starting connection loop for {}", endpoint);
        self.start_with_transport(transport)
    }

    /// Starts the loop over an already built transport.
    ///
    /// If the loop is already running this is a no-op; call
    /// [`stop`](Self::stop) first to switch transports. A loop that ended on
    /// a configuration error is replaced.
    pub fn start_with_transport(&self, transport: Arc<dyn Transport>) -> Result<()> {
        self.inner.config.validate()?;
        let mut shared = self.inner.shared.lock();
        if shared.task.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::warn!("connection loop already running");
            return Ok(());
        }
        if shared.task.take().is_some() {
            tracing::debug!("replacing finished connection loop");
        }
        let cancel = CancelToken::new();
        shared.transport = Some(Arc::clone(&transport));
        shared.loop_cancel = Some(cancel.clone());
        shared.task = Some(tokio::spawn(run_loop(
            Arc::clone(&self.inner),
            transport,
            cancel,
        )));
        Ok(())
    }

    /// Stops the loop, closes the transport and moves to `Disconnected`.
    ///
    /// Idempotent.
    pub async fn stop(&self) {
        let (cancel, task, transport) = {
            let mut shared = self.inner.shared.lock();
            (
                shared.loop_cancel.take(),
                shared.task.take(),
                shared.transport.take(),
            )
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(mut task) = task {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                tracing::warn!("connection loop did not stop in time, aborting");
                task.abort();
                // the aborted loop skipped its session teardown
                if let Some(observer) = self.inner.observer() {
                    observer.on_disconnected();
                }
            }
        }
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                tracing::warn!("error closing transport: {}", e);
            }
        }
        self.inner
            .transition(ConnectionState::Disconnected, "stopped".to_string(), None);
    }

    /// Resets the backoff and cuts short any pending wait.
    pub fn reconnect_now(&self) {
        self.inner.reset_requested.store(true, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// Current state, status, last error and target.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let shared = self.inner.shared.lock();
        ConnectionSnapshot {
            state: shared.state,
            status: shared.status.clone(),
            last_error: shared.last_error.clone(),
            target: shared.transport.as_ref().map(|t| t.status_target()),
        }
    }

    /// The supervised transport, if running.
    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.shared.lock().transport.clone()
    }
}

enum AttemptOutcome {
    /// The connection ended; retry after backoff.
    Dropped(String),
    /// Configuration error; the loop ends.
    Fatal(String),
    /// The loop was cancelled.
    Stopped,
}

async fn run_loop(inner: Arc<Inner>, transport: Arc<dyn Transport>, cancel: CancelToken) {
    let mut backoff = Backoff::new(&inner.config);
    let target = transport.status_target();

    loop {
        if inner.reset_requested.swap(false, Ordering::AcqRel) {
            backoff.reset();
        }

        match attempt(&inner, &transport, &cancel, &target, &mut backoff).await {
            AttemptOutcome::Stopped => break,
            AttemptOutcome::Fatal(error) => {
                inner.transition(
                    ConnectionState::Disconnected,
                    format!("cannot connect to {target}"),
                    Some(error),
                );
                break;
            }
            AttemptOutcome::Dropped(error) => {
                if inner.reset_requested.swap(false, Ordering::AcqRel) {
                    backoff.reset();
                }
                let delay = backoff.next_delay();
                inner.transition(
                    ConnectionState::Retrying,
                    format!("retrying in {:.1}s", delay.as_secs_f64()),
                    Some(error),
                );
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                    () = inner.wake.notified() => {
                        tracing::debug!("immediate reconnect requested");
                        inner.reset_requested.store(false, Ordering::Release);
                        backoff.reset();
                    }
                }
            }
        }
    }
    tracing::debug!("connection loop for {} exited", target);
}

async fn attempt(
    inner: &Inner,
    transport: &Arc<dyn Transport>,
    cancel: &CancelToken,
    target: &str,
    backoff: &mut Backoff,
) -> AttemptOutcome {
    if cancel.is_cancelled() {
        return AttemptOutcome::Stopped;
    }
    inner.transition(
        ConnectionState::Connecting,
        format!("connecting to {target}"),
        None,
    );

    let attempt_cancel = cancel.with_timeout(inner.config.connect_timeout);
    if let Err(e) = transport.connect(&attempt_cancel).await {
        if cancel.is_cancelled() {
            return AttemptOutcome::Stopped;
        }
        // Leave nothing half-open between attempts
        if let Err(close_err) = transport.close().await {
            tracing::warn!("error closing {} after failed connect: {}", target, close_err);
        }
        return match e.kind() {
            ErrorKind::Configuration => AttemptOutcome::Fatal(e.to_string()),
            _ => {
                tracing::warn!("connect to {} failed: {}", target, e);
                AttemptOutcome::Dropped(e.to_string())
            }
        };
    }

    inner.transition(
        ConnectionState::Connected,
        format!("connected to {target}"),
        None,
    );
    let connected_at = Instant::now();
    let session = CancelToken::new();
    let observer = inner.observer();

    let handoff = match &observer {
        Some(observer) => {
            cancel
                .run(observer.on_connected(Arc::clone(transport), session.clone()))
                .await
        }
        None => Ok(()),
    };

    let outcome = match handoff {
        Err(Error::Cancelled) => AttemptOutcome::Stopped,
        Err(e) => AttemptOutcome::Dropped(format!("session setup failed: {e}")),
        Ok(()) => monitor(inner, transport, cancel, connected_at, backoff).await,
    };

    session.cancel();
    if let Some(observer) = &observer {
        observer.on_disconnected();
    }
    if backoff.settle(connected_at.elapsed()) {
        tracing::debug!("connection was stable, backoff reset");
    }
    if !matches!(outcome, AttemptOutcome::Stopped) {
        if let Err(e) = transport.close().await {
            tracing::warn!("error closing {}: {}", target, e);
        }
    }
    outcome
}

async fn monitor(
    inner: &Inner,
    transport: &Arc<dyn Transport>,
    cancel: &CancelToken,
    connected_at: Instant,
    backoff: &mut Backoff,
) -> AttemptOutcome {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return AttemptOutcome::Stopped,
            () = tokio::time::sleep(inner.config.poll_interval) => {}
        }
        if !transport.is_connected() {
            tracing::warn!("liveness poll: {} is down", transport.status_target());
            return AttemptOutcome::Dropped("connection lost".to_string());
        }
        backoff.settle(connected_at.elapsed());
    }
}
