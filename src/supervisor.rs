//! Orchestrates one server process: lifecycle state machine, output
//! draining, resource sampling and event fan-out.
//!
//! Locking: `control` serializes start/stop/restart and is held across the
//! whole operation, including a stop's timeout window. `slot` guards the
//! state and the current handle and is only ever held briefly, so the drain
//! and sampler tasks never wait on a control operation. Observers are never
//! invoked while `slot` or `telemetry` is held, so they may query state.

use crate::broadcast::{
    ChannelObserver, ConsoleBroadcaster, OBSERVER_BUFFER, Observer, SubscriptionId, TelemetryEvent,
};
use crate::config::ServerConfig;
use crate::console::{Channel, ConsoleHistory, ConsoleLine};
use crate::launch::{LaunchError, LaunchSpec};
use crate::parser::{self, ParsedEvent};
use crate::process::{ExitInfo, OutputStream, ProcessError, ProcessHandle, RawOutput};
use crate::sampler::ResourceSampler;
use crate::state::ProcessState;
use crate::store::HistoryStore;
use crate::telemetry::{MetricSample, MetricsHistory, TelemetryAggregator, TpsBand};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Console command that makes the server print its TPS report.
pub const TPS_COMMAND: &str = "tps";

// ---------------------------------------------------------------------------
// Error / outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("server is already {0}")]
    AlreadyActive(ProcessState),
    #[error("server is {0}, not running")]
    NotRunning(ProcessState),
    #[error("command is empty")]
    EmptyCommand,
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub exit: ExitInfo,
    /// The graceful command timed out and the process was killed.
    pub escalated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestartOutcome {
    /// `None` when nothing was running.
    pub stop: Option<StopOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    pub players: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<MetricSample>,
    pub tps_band: TpsBand,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_tps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_cpu: Option<f64>,
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Slot {
    state: ProcessState,
    handle: Option<Arc<ProcessHandle>>,
    run_id: u64,
    started_at: Option<Instant>,
    crash_reported: bool,
}

struct Inner {
    config: RwLock<ServerConfig>,
    control: tokio::sync::Mutex<()>,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<ProcessState>,
    broadcaster: ConsoleBroadcaster,
    telemetry: Mutex<TelemetryAggregator>,
    store: Option<HistoryStore>,
    persist: Arc<Notify>,
    persist_lock: tokio::sync::Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Inner {
    fn config(&self) -> ServerConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_telemetry(&self) -> MutexGuard<'_, TelemetryAggregator> {
        self.telemetry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callers hold the slot lock, which keeps state events in order. The
    /// event is only queued; call `flush_events` after releasing the slot.
    fn transition(&self, slot: &mut Slot, next: ProcessState) {
        if slot.state == next {
            return;
        }
        info!(from = %slot.state, to = %next, "server state changed");
        slot.state = next;
        self.state_tx.send_replace(next);
        self.broadcaster.enqueue(TelemetryEvent::State(next));
    }

    fn flush_events(&self) {
        self.broadcaster.flush();
    }

    fn system_line(&self, text: impl Into<String>) {
        self.broadcaster
            .publish(TelemetryEvent::Console(ConsoleLine::system(text)));
    }

    fn is_current(&self, run_id: u64) -> bool {
        self.lock_slot().run_id == run_id
    }

    fn handle_line(&self, run_id: u64, channel: Channel, text: String) {
        let event = parser::parse(&text);
        self.broadcaster
            .publish(TelemetryEvent::Console(ConsoleLine::output(channel, text)));

        if !self.is_current(run_id) {
            return;
        }
        match event {
            ParsedEvent::TpsSample(tps) => self.lock_telemetry().record_tps(tps),
            ParsedEvent::ReadyMarker => {
                {
                    let mut slot = self.lock_slot();
                    if slot.run_id == run_id && slot.state == ProcessState::Starting {
                        self.transition(&mut slot, ProcessState::Running);
                    }
                }
                self.flush_events();
            }
            ParsedEvent::CrashMarker => {
                let first = {
                    let mut slot = self.lock_slot();
                    !std::mem::replace(&mut slot.crash_reported, true)
                };
                if first {
                    warn!("server reported a fatal error");
                    self.system_line("Server reported a fatal error");
                }
            }
            ParsedEvent::PlayerJoined(name) => self.lock_telemetry().player_joined(name),
            ParsedEvent::PlayerLeft(name) => self.lock_telemetry().player_left(&name),
            ParsedEvent::GenericLine => {}
        }
    }

    /// Clear the slot for `run_id` once its process has exited. Only the
    /// first call per run has an effect.
    fn finish_run(&self, run_id: u64, exit: ExitInfo) {
        let mut slot = self.lock_slot();
        if slot.run_id != run_id || slot.handle.is_none() {
            return;
        }
        slot.handle = None;
        slot.started_at = None;

        let next = slot.state.after_exit();
        let message = if next == ProcessState::Crashed {
            warn!(%exit, "server exited unexpectedly");
            format!("Server crashed ({exit})")
        } else {
            info!(%exit, "server stopped");
            format!("Server stopped ({exit})")
        };
        self.transition(&mut slot, next);
        drop(slot);
        self.flush_events();
        self.system_line(message);
    }

    async fn flush_history(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.persist_lock.lock().await;

        if let Some(lines) = self.broadcaster.take_dirty()
            && let Err(e) = store.save_console(&lines).await
        {
            warn!(error = %e, "failed to persist console history");
        }

        let samples = self.lock_telemetry().take_dirty();
        if let Some(samples) = samples
            && let Err(e) = store.save_metrics(&samples).await
        {
            warn!(error = %e, "failed to persist metrics history");
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// In-memory supervisor with empty history and no persistence.
    pub fn new(config: ServerConfig) -> Self {
        let console = ConsoleHistory::new(config.supervisor.console_history_capacity);
        let metrics = MetricsHistory::new(config.supervisor.metrics_history_capacity);
        Self::build(config, console, metrics, None)
    }

    /// Load persisted history from `store` and keep writing it back on a
    /// debounced schedule.
    pub async fn with_store(config: ServerConfig, store: HistoryStore) -> Self {
        let console = store
            .load_console(config.supervisor.console_history_capacity)
            .await;
        let metrics = store
            .load_metrics(config.supervisor.metrics_history_capacity)
            .await;
        debug!(
            console = console.len(),
            metrics = metrics.len(),
            "loaded history"
        );
        let supervisor = Self::build(config, console, metrics, Some(store));
        supervisor.spawn_persistence();
        supervisor
    }

    fn build(
        config: ServerConfig,
        console: ConsoleHistory,
        metrics: MetricsHistory,
        store: Option<HistoryStore>,
    ) -> Self {
        let persist = Arc::new(Notify::new());
        let (state_tx, _) = watch::channel(ProcessState::Stopped);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                control: tokio::sync::Mutex::new(()),
                slot: Mutex::new(Slot::default()),
                state_tx,
                broadcaster: ConsoleBroadcaster::new(console, persist.clone()),
                telemetry: Mutex::new(TelemetryAggregator::new(metrics)),
                store,
                persist,
                persist_lock: tokio::sync::Mutex::new(()),
                shutdown_tx,
            }),
        }
    }

    fn spawn_persistence(&self) {
        let weak = Arc::downgrade(&self.inner);
        let notify = self.inner.persist.clone();
        let debounce = self.inner.config().supervisor.persist_debounce();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = shutdown_rx.changed() => return,
                }
                tokio::select! {
                    _ = tokio::time::sleep(debounce) => {}
                    _ = shutdown_rx.changed() => return,
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.flush_history().await;
            }
        });
    }

    pub fn config(&self) -> ServerConfig {
        self.inner.config()
    }

    /// Takes effect on the next start.
    pub fn update_config(&self, config: ServerConfig) {
        *self
            .inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
    }

    // -- control operations ------------------------------------------------

    pub async fn start(&self) -> Result<(), SupervisorError> {
        let _control = self.inner.control.lock().await;
        self.start_locked()
    }

    fn start_locked(&self) -> Result<(), SupervisorError> {
        let inner = &self.inner;
        let state = inner.lock_slot().state;
        if !state.can_start() {
            return Err(SupervisorError::AlreadyActive(state));
        }

        let config = inner.config();
        let spec = LaunchSpec::from_config(&config.server)?;

        let (run_id, pid, output) = {
            let mut slot = inner.lock_slot();
            inner.transition(&mut slot, ProcessState::Starting);
            let (handle, output) = match ProcessHandle::start(&spec) {
                Ok(pair) => pair,
                Err(e) => {
                    inner.transition(&mut slot, ProcessState::Stopped);
                    drop(slot);
                    inner.flush_events();
                    warn!(error = %e, "failed to start server");
                    inner.system_line(format!("Failed to start server: {e}"));
                    return Err(e.into());
                }
            };
            let pid = handle.pid();
            slot.run_id += 1;
            slot.handle = Some(Arc::new(handle));
            slot.started_at = Some(Instant::now());
            slot.crash_reported = false;
            (slot.run_id, pid, output)
        };
        inner.flush_events();

        inner.lock_telemetry().reset_run();
        info!(?pid, run_id, "server process started");
        inner.system_line(format!("Starting server: {}", spec.display_command()));

        tokio::spawn(drain_output(Arc::clone(inner), run_id, output));
        tokio::spawn(sample_resources(Arc::clone(inner), run_id, pid));
        Ok(())
    }

    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let _control = self.inner.control.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<StopOutcome, SupervisorError> {
        let inner = &self.inner;
        let (handle, run_id) = {
            let mut slot = inner.lock_slot();
            let state = slot.state;
            let Some(handle) = slot.handle.clone().filter(|_| state.can_stop()) else {
                return Err(SupervisorError::NotRunning(state));
            };
            inner.transition(&mut slot, ProcessState::Stopping);
            (handle, slot.run_id)
        };
        inner.flush_events();

        let supervisor = inner.config().supervisor;
        let timeout = supervisor.stop_timeout();
        info!(command = %supervisor.stop_command, ?timeout, "stopping server");
        inner.system_line("Stopping server...");

        let (exit, escalated) = match handle
            .request_stop(&supervisor.stop_command, timeout)
            .await
        {
            Ok(exit) => (exit, false),
            Err(e) => {
                warn!(error = %e, "graceful stop timed out, killing server");
                inner.system_line(format!(
                    "Server did not stop within {}s, killing it",
                    timeout.as_secs()
                ));
                (handle.kill().await, true)
            }
        };

        inner.finish_run(run_id, exit);
        Ok(StopOutcome { exit, escalated })
    }

    /// Stop (waiting out any escalation) and start again. A restart issued
    /// during another stop waits for that stop to finish first.
    pub async fn restart(&self) -> Result<RestartOutcome, SupervisorError> {
        let _control = self.inner.control.lock().await;
        let stop = if self.get_state().can_stop() {
            Some(self.stop_locked().await?)
        } else {
            None
        };
        self.start_locked()?;
        Ok(RestartOutcome { stop })
    }

    /// Send operator input. Text starting with the command prefix goes to
    /// the console verbatim minus the prefix; anything else becomes a chat
    /// broadcast. Returns the line written.
    pub async fn send_command(&self, text: &str) -> Result<String, SupervisorError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SupervisorError::EmptyCommand);
        }
        let supervisor = self.inner.config().supervisor;
        let line = format_command(text, &supervisor.command_prefix, &supervisor.chat_label);
        if line.is_empty() {
            return Err(SupervisorError::EmptyCommand);
        }
        self.write_to_server(line, true).await
    }

    /// Ask the server to reload its properties.
    pub async fn reload(&self) -> Result<String, SupervisorError> {
        let command = self.inner.config().supervisor.reload_command;
        self.write_to_server(command, true).await
    }

    async fn write_to_server(&self, line: String, echo: bool) -> Result<String, SupervisorError> {
        let handle = {
            let slot = self.inner.lock_slot();
            let state = slot.state;
            match slot.handle.clone() {
                Some(handle) if state == ProcessState::Running => handle,
                _ => return Err(SupervisorError::NotRunning(state)),
            }
        };
        handle.write_line(&line).await?;
        if echo {
            self.inner
                .broadcaster
                .publish(TelemetryEvent::Console(ConsoleLine::input(line.clone())));
        }
        Ok(line)
    }

    /// Stop a live server and flush pending history writes.
    pub async fn shutdown(&self) {
        match self.stop().await {
            Ok(outcome) => info!(exit = %outcome.exit, escalated = outcome.escalated, "server stopped for shutdown"),
            Err(SupervisorError::NotRunning(_)) => {}
            Err(e) => warn!(error = %e, "failed to stop server during shutdown"),
        }
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.flush_history().await;
    }

    // -- queries -----------------------------------------------------------

    pub fn get_state(&self) -> ProcessState {
        self.inner.lock_slot().state
    }

    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.inner.state_tx.subscribe()
    }

    pub fn get_latest_metrics(&self) -> Option<MetricSample> {
        self.inner.lock_telemetry().latest()
    }

    pub fn get_console_tail(&self, n: usize) -> Vec<ConsoleLine> {
        self.inner.broadcaster.tail(n)
    }

    pub fn metrics_history(&self) -> Vec<MetricSample> {
        self.inner.lock_telemetry().history().snapshot()
    }

    pub fn status(&self) -> ServerStatus {
        let (state, pid, uptime_secs) = {
            let slot = self.inner.lock_slot();
            (
                slot.state,
                slot.handle.as_ref().and_then(|h| h.pid()),
                slot.started_at.map(|t| t.elapsed().as_secs()),
            )
        };
        let telemetry = self.inner.lock_telemetry();
        let latest = telemetry.latest();
        ServerStatus {
            state,
            pid,
            uptime_secs,
            players: telemetry.players(),
            tps_band: TpsBand::from_tps(latest.as_ref().and_then(|s| s.tps)),
            latest,
            average_tps: telemetry.history().average_tps(),
            average_cpu: telemetry.history().average_cpu(),
        }
    }

    // -- observers ---------------------------------------------------------

    pub fn register_observer(&self, observer: Arc<dyn Observer>) -> SubscriptionId {
        self.inner.broadcaster.register(observer)
    }

    pub fn unregister_observer(&self, id: SubscriptionId) -> bool {
        self.inner.broadcaster.unregister(id)
    }

    /// Register a channel observer and hand back its receiving end.
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::Receiver<TelemetryEvent>) {
        let (observer, rx) = ChannelObserver::channel(OBSERVER_BUFFER);
        (self.register_observer(Arc::new(observer)), rx)
    }
}

pub fn format_command(text: &str, prefix: &str, chat_label: &str) -> String {
    match text.strip_prefix(prefix) {
        Some(command) if !prefix.is_empty() => command.trim_start().to_string(),
        _ => format!("say [{chat_label}] {text}"),
    }
}

// ---------------------------------------------------------------------------
// Per-run tasks
// ---------------------------------------------------------------------------

async fn drain_output(inner: Arc<Inner>, run_id: u64, mut output: OutputStream) {
    let mut exit = None;
    while let Some(item) = output.next().await {
        match item {
            RawOutput::Line { channel, text } => inner.handle_line(run_id, channel, text),
            RawOutput::Exited(info) => {
                exit = Some(info);
                break;
            }
        }
    }
    // A stream that closes without an exit event still ends the run.
    inner.finish_run(run_id, exit.unwrap_or_else(ExitInfo::unknown));
}

enum Tick {
    Sample,
    PollTps,
}

async fn next_poll(poller: &mut Option<Interval>) {
    match poller {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sample_resources(inner: Arc<Inner>, run_id: u64, pid: Option<u32>) {
    let supervisor = inner.config().supervisor;

    let mut ticker = tokio::time::interval(supervisor.sample_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut poller = supervisor.tps_poll_interval().map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    let mut sampler = Some(ResourceSampler::new());

    loop {
        let tick = tokio::select! {
            _ = ticker.tick() => Tick::Sample,
            _ = next_poll(&mut poller) => Tick::PollTps,
        };

        let handle = {
            let slot = inner.lock_slot();
            if slot.run_id != run_id || !matches!(slot.state, ProcessState::Starting | ProcessState::Running) {
                return;
            }
            if slot.state == ProcessState::Starting {
                continue;
            }
            slot.handle.clone()
        };

        match tick {
            Tick::PollTps => {
                if let Some(handle) = handle
                    && let Err(e) = handle.write_line(TPS_COMMAND).await
                {
                    debug!(error = %e, "tps poll not delivered");
                }
            }
            Tick::Sample => {
                let reading = match pid {
                    Some(pid) => {
                        let mut current = sampler.take().unwrap_or_default();
                        // Awaited inline: ticks that fire meanwhile are skipped.
                        match tokio::task::spawn_blocking(move || {
                            let result = current.sample(pid);
                            (current, result)
                        })
                        .await
                        {
                            Ok((current, result)) => {
                                sampler = Some(current);
                                result
                                    .map_err(|e| debug!(error = %e, "resource sample missed"))
                                    .ok()
                            }
                            Err(e) => {
                                warn!(error = %e, "resource sampler task failed");
                                None
                            }
                        }
                    }
                    None => None,
                };

                {
                    let slot = inner.lock_slot();
                    if slot.run_id != run_id || slot.state != ProcessState::Running {
                        return;
                    }
                }
                let sample = inner.lock_telemetry().record_tick(reading);
                inner.persist.notify_one();
                inner.broadcaster.publish(TelemetryEvent::Metrics(sample));
            }
        }
    }
}
