//! Per add-on lifecycle supervision.
//!
//! An [`AddonInstance`] owns at most one [`RpcTransport`] at a time. It
//! starts the process lazily, restarts it when it dies or misbehaves, and
//! refuses to restart more than the configured number of times per minute.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AddonError;
use super::descriptor::{DescriptorResolver, LaunchDescriptor};
use super::manifest::AddonManifest;
use super::transport::{RpcTransport, StderrPump};

/// Length of the rolling restart window.
pub const RESTART_WINDOW: Duration = Duration::from_secs(60);

/// Default number of start attempts allowed per window.
pub const DEFAULT_RESTART_LIMIT: u32 = 3;

/// Default number of stderr lines kept per add-on.
pub const DEFAULT_STDERR_CAPACITY: usize = 50;

/// Default time to wait for a response.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// How long a torn-down process gets to flush its last stderr lines.
const STDERR_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Produces a fresh launch descriptor for every start attempt.
pub trait LaunchSource: Send + Sync {
    /// Resolves the descriptor for the next start attempt.
    fn launch_descriptor(&self) -> Result<LaunchDescriptor, AddonError>;
}

impl LaunchSource for LaunchDescriptor {
    fn launch_descriptor(&self) -> Result<LaunchDescriptor, AddonError> {
        Ok(self.clone())
    }
}

/// Re-resolves a manifest on every start attempt.
#[derive(Debug, Clone)]
pub struct ManifestLaunch {
    manifest: AddonManifest,
    resolver: DescriptorResolver,
}

impl ManifestLaunch {
    #[must_use]
    pub fn new(manifest: AddonManifest, resolver: DescriptorResolver) -> Self {
        Self { manifest, resolver }
    }
}

impl LaunchSource for ManifestLaunch {
    fn launch_descriptor(&self) -> Result<LaunchDescriptor, AddonError> {
        self.resolver.resolve(&self.manifest)
    }
}

/// Tunables for one add-on instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceOptions {
    /// Start attempts allowed per restart window.
    pub restart_limit: u32,
    /// Stderr lines kept for diagnostics.
    pub stderr_capacity: usize,
    /// Time to wait for each response.
    pub invoke_timeout: Duration,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            restart_limit: DEFAULT_RESTART_LIMIT,
            stderr_capacity: DEFAULT_STDERR_CAPACITY,
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }
}

/// Lifecycle phase of an add-on instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    /// No process; never started or the last start failed.
    Stopped,
    /// A start attempt is in progress.
    Starting,
    /// A process is up.
    Running,
    /// The process died or stopped answering and was torn down.
    Crashed,
    /// Stopped on request.
    StoppedExplicitly,
}

/// Rolling-window limit on start attempts.
#[derive(Debug, Clone)]
pub struct RestartBudget {
    limit: u32,
    window: Duration,
    window_start: Option<Instant>,
    attempts: u32,
}

impl RestartBudget {
    /// Creates a budget with the standard one-minute window.
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self::with_window(limit, RESTART_WINDOW)
    }

    /// Creates a budget with a custom window.
    #[must_use]
    pub fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            window_start: None,
            attempts: 0,
        }
    }

    /// Records one start attempt at `now`.
    ///
    /// Fails once more than `limit` attempts fall inside the current window.
    pub fn try_consume(&mut self, now: Instant) -> Result<(), AddonError> {
        let expired = self
            .window_start
            .is_none_or(|start| now.saturating_duration_since(start) >= self.window);
        if expired {
            self.window_start = Some(now);
            self.attempts = 0;
        }

        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > self.limit {
            return Err(AddonError::RestartLimitExceeded { limit: self.limit });
        }
        Ok(())
    }

    /// Attempts recorded in the window that is current at `now`.
    #[must_use]
    pub fn attempts_in_window(&self, now: Instant) -> u32 {
        match self.window_start {
            Some(start) if now.saturating_duration_since(start) < self.window => self.attempts,
            _ => 0,
        }
    }

    /// Configured limit.
    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit
    }
}

/// Bounded FIFO of recent stderr lines.
#[derive(Debug, Clone)]
pub struct StderrTail {
    capacity: usize,
    lines: VecDeque<String>,
}

impl StderrTail {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_STDERR_CAPACITY)),
        }
    }

    /// Appends a line, evicting the oldest once full.
    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Lines in emission order.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Read-only copy of an instance's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub addon_id: String,
    pub running: bool,
    pub phase: InstancePhase,
    pub last_start: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stderr_tail: Vec<String>,
    pub start_attempts_in_window: u32,
}

/// Bookkeeping read by snapshots; held only briefly.
struct Status {
    phase: InstancePhase,
    budget: RestartBudget,
    last_start: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Live process state; held for the length of a call.
#[derive(Default)]
struct Session {
    transport: Option<RpcTransport>,
    pump: Option<StderrPump>,
}

/// Supervisor for one add-on id.
pub struct AddonInstance {
    addon_id: String,
    source: Box<dyn LaunchSource>,
    options: InstanceOptions,
    session: tokio::sync::Mutex<Session>,
    status: Mutex<Status>,
    tail: Arc<Mutex<StderrTail>>,
}

impl AddonInstance {
    /// Creates a stopped instance.
    pub fn new(
        addon_id: impl Into<String>,
        source: impl LaunchSource + 'static,
        options: InstanceOptions,
    ) -> Self {
        Self {
            addon_id: addon_id.into(),
            source: Box::new(source),
            options,
            session: tokio::sync::Mutex::new(Session::default()),
            status: Mutex::new(Status {
                phase: InstancePhase::Stopped,
                budget: RestartBudget::new(options.restart_limit),
                last_start: None,
                last_error: None,
            }),
            tail: Arc::new(Mutex::new(StderrTail::new(options.stderr_capacity))),
        }
    }

    /// Add-on id.
    #[must_use]
    pub fn addon_id(&self) -> &str {
        &self.addon_id
    }

    /// Starts the process unless a usable one is already running.
    ///
    /// Returns `true` if a new process was started.
    pub async fn ensure_started(&self) -> Result<bool, AddonError> {
        let mut session = self.session.lock().await;
        self.ensure_started_locked(&mut session).await
    }

    /// Calls `method`, restarting the add-on and retrying once if the
    /// transport fails.
    pub async fn try_invoke(&self, method: &str, params: Value) -> Result<Value, AddonError> {
        let mut session = self.session.lock().await;
        self.ensure_started_locked(&mut session).await?;
        self.invoke_with_retry_locked(&mut session, method, params).await
    }

    /// Like [`ensure_started`](Self::ensure_started), but a process started
    /// by this call must also answer `method` before the call succeeds.
    ///
    /// The session stays locked from spawn to answer, so a process that
    /// dies straight away is handled by the retry path.
    pub async fn start_and_probe(&self, method: &str, params: Value) -> Result<bool, AddonError> {
        let mut session = self.session.lock().await;
        let started = self.ensure_started_locked(&mut session).await?;
        if started {
            self.invoke_with_retry_locked(&mut session, method, params).await?;
        }
        Ok(started)
    }

    async fn invoke_with_retry_locked(
        &self,
        session: &mut Session,
        method: &str,
        params: Value,
    ) -> Result<Value, AddonError> {
        let first_error = match self.invoke_locked(session, method, params.clone()).await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transport_failure() => {
                self.record_error(&e);
                return Err(e);
            }
            Err(e) => e,
        };

        warn!(
            addon = %self.addon_id,
            "Call '{}' failed: {}; restarting add-on and retrying once",
            method,
            first_error
        );
        self.record_error(&first_error);
        self.teardown_locked(session, InstancePhase::Crashed).await;
        self.start_locked(session).await?;

        match self.invoke_locked(session, method, params).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(addon = %self.addon_id, "Retry of '{}' failed: {}", method, e);
                self.record_error(&e);
                if e.is_transport_failure() {
                    self.teardown_locked(session, InstancePhase::Crashed).await;
                }
                Err(e)
            }
        }
    }

    /// Stops the process. A crashed instance is marked as stopped on
    /// request; otherwise does nothing if already stopped.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        if session.transport.is_none() && session.pump.is_none() {
            let mut status = self.lock_status();
            if status.phase == InstancePhase::Crashed {
                status.phase = InstancePhase::StoppedExplicitly;
                info!(addon = %self.addon_id, "Stopped crashed add-on");
            }
            return;
        }

        if let Some(pump) = session.pump.take() {
            pump.shutdown().await;
        }
        if let Some(mut transport) = session.transport.take() {
            transport.dispose().await;
        }
        self.lock_status().phase = InstancePhase::StoppedExplicitly;
        info!(addon = %self.addon_id, "Stopped add-on");
    }

    /// Copies the current state.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        // A call in flight holds the session; trust the recorded phase then.
        let process_alive = match self.session.try_lock() {
            Ok(mut session) => session
                .transport
                .as_mut()
                .is_some_and(|t| !t.has_exited()),
            Err(_) => true,
        };

        let status = self.lock_status();
        let stderr_tail = lock(&self.tail).lines();
        StatusSnapshot {
            addon_id: self.addon_id.clone(),
            running: status.phase == InstancePhase::Running && process_alive,
            phase: status.phase,
            last_start: status.last_start,
            last_error: status.last_error.clone(),
            stderr_tail,
            start_attempts_in_window: status.budget.attempts_in_window(Instant::now()),
        }
    }

    async fn ensure_started_locked(&self, session: &mut Session) -> Result<bool, AddonError> {
        if let Some(transport) = session.transport.as_mut() {
            let exited = transport.has_exited();
            if !exited && !transport.is_poisoned() {
                return Ok(false);
            }
            warn!(
                addon = %self.addon_id,
                "Add-on process is {}, restarting",
                if exited { "gone" } else { "unusable" }
            );
            self.teardown_locked(session, InstancePhase::Crashed).await;
        }

        self.start_locked(session).await.map(|()| true)
    }

    async fn start_locked(&self, session: &mut Session) -> Result<(), AddonError> {
        {
            let mut status = self.lock_status();
            status.phase = InstancePhase::Starting;
            if let Err(e) = status.budget.try_consume(Instant::now()) {
                warn!(addon = %self.addon_id, "Refusing to start: {}", e);
                status.phase = InstancePhase::Stopped;
                status.last_error = Some(e.to_string());
                return Err(e);
            }
        }

        let spawned = self
            .source
            .launch_descriptor()
            .and_then(|descriptor| RpcTransport::spawn(&descriptor));
        let mut transport = match spawned {
            Ok(transport) => transport,
            Err(e) => {
                warn!(addon = %self.addon_id, "Failed to start add-on: {}", e);
                let mut status = self.lock_status();
                status.phase = InstancePhase::Stopped;
                status.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let tail = Arc::clone(&self.tail);
        let addon_id = self.addon_id.clone();
        let pump = transport.start_stderr_pump(
            move |line| {
                debug!(target: "addon_host::stderr", addon = %addon_id, "{}", line);
                lock(&tail).push(line);
            },
            CancellationToken::new(),
        );

        info!(
            addon = %self.addon_id,
            pid = ?transport.pid(),
            "Started add-on process"
        );
        session.transport = Some(transport);
        session.pump = pump;

        let mut status = self.lock_status();
        status.phase = InstancePhase::Running;
        status.last_start = Some(Utc::now());
        Ok(())
    }

    async fn invoke_locked(
        &self,
        session: &mut Session,
        method: &str,
        params: Value,
    ) -> Result<Value, AddonError> {
        let transport = session
            .transport
            .as_mut()
            .ok_or_else(|| AddonError::NotStarted(self.addon_id.clone()))?;
        transport
            .invoke(method, params, self.options.invoke_timeout)
            .await
    }

    /// Disposes the transport, then lets the pump drain what the dying
    /// process already wrote.
    async fn teardown_locked(&self, session: &mut Session, phase: InstancePhase) {
        if let Some(mut transport) = session.transport.take() {
            transport.dispose().await;
        }
        if let Some(pump) = session.pump.take() {
            pump.drain(STDERR_DRAIN_GRACE).await;
        }
        self.lock_status().phase = phase;
    }

    fn record_error(&self, error: &AddonError) {
        self.lock_status().last_error = Some(error.to_string());
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        lock(&self.status)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
