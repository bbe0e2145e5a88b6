//! The monitor loop: a tokio task that owns the settings and the timer.
//!
//! Callers talk to it through `Monitor`, a cloneable handle that sends
//! commands over a channel and waits for the reply. Each tick runs one cycle
//! on the blocking pool; a tick that fires while the previous one is still
//! running is skipped, never queued.

use crate::collector::ProcessSampler;
use crate::config::{clamp_interval, Rule, Settings, Thresholds};
use crate::error::{Error, Result};
use crate::executor::Enforcer;
use crate::monitor::{Engine, ERROR_STATUS};
use crate::protocol::{Event, StatusData};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 100;

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub interval_seconds: u64,
    /// Delay before the first check after `start`.
    pub first_check_delay: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            interval_seconds: 5,
            first_check_delay: Duration::from_secs(1),
        }
    }
}

enum Command {
    Start(oneshot::Sender<bool>),
    Stop(oneshot::Sender<bool>),
    SetInterval(u64, oneshot::Sender<u64>),
    AddRule(Rule, oneshot::Sender<Result<Uuid>>),
    RemoveRule(Uuid, oneshot::Sender<Result<Rule>>),
    SetRuleEnabled(Uuid, bool, oneshot::Sender<Result<()>>),
    SetRuleThresholds(Uuid, Option<Thresholds>, oneshot::Sender<Result<()>>),
    SetGlobalThresholds(Thresholds, oneshot::Sender<()>),
    Settings(oneshot::Sender<Settings>),
    Status(oneshot::Sender<StatusData>),
}

/// Handle to a running monitor task.
#[derive(Clone)]
pub struct Monitor {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<Event>,
    status: watch::Receiver<String>,
}

impl Monitor {
    /// Spawn the monitor task. Must be called inside a tokio runtime.
    ///
    /// The monitor starts stopped; call `start` to arm the timer.
    pub fn spawn(
        settings: Settings,
        sampler: Arc<dyn ProcessSampler>,
        enforcer: Arc<dyn Enforcer>,
        options: MonitorOptions,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (status_tx, status) = watch::channel(String::from("idle"));

        let task = MonitorLoop {
            settings,
            interval_seconds: clamp_interval(options.interval_seconds),
            first_check_delay: options.first_check_delay,
            ticker: None,
            engine: Arc::new(Engine::new(sampler, enforcer)),
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicBool::new(false)),
            events: events.clone(),
            status: Arc::new(status_tx),
        };
        tokio::spawn(task.run(command_rx));

        Self {
            commands,
            events,
            status,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::MonitorGone)?;
        reply_rx.await.map_err(|_| Error::MonitorGone)
    }

    /// `Ok(false)` when already running; no second timer is created.
    pub async fn start(&self) -> Result<bool> {
        self.request(Command::Start).await
    }

    /// `Ok(false)` when not running. An in-flight tick still completes.
    pub async fn stop(&self) -> Result<bool> {
        self.request(Command::Stop).await
    }

    /// Returns the interval actually applied, clamped to `[1, 3600]`.
    pub async fn set_interval(&self, seconds: u64) -> Result<u64> {
        self.request(|tx| Command::SetInterval(seconds, tx)).await
    }

    pub async fn add_rule(&self, rule: Rule) -> Result<Uuid> {
        self.request(|tx| Command::AddRule(rule, tx)).await?
    }

    pub async fn remove_rule(&self, id: Uuid) -> Result<Rule> {
        self.request(|tx| Command::RemoveRule(id, tx)).await?
    }

    pub async fn set_rule_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        self.request(|tx| Command::SetRuleEnabled(id, enabled, tx))
            .await?
    }

    /// `None` switches the rule back to the global thresholds.
    pub async fn set_rule_thresholds(&self, id: Uuid, thresholds: Option<Thresholds>) -> Result<()> {
        self.request(|tx| Command::SetRuleThresholds(id, thresholds, tx))
            .await?
    }

    pub async fn set_global_thresholds(&self, thresholds: Thresholds) -> Result<()> {
        self.request(|tx| Command::SetGlobalThresholds(thresholds, tx))
            .await
    }

    /// Snapshot of the current settings, for the caller to persist.
    pub async fn settings(&self) -> Result<Settings> {
        self.request(Command::Settings).await
    }

    pub async fn status(&self) -> Result<StatusData> {
        self.request(Command::Status).await
    }

    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.status().await?.running)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Receiver for the status line; changes once per tick.
    pub fn watch_status(&self) -> watch::Receiver<String> {
        self.status.clone()
    }

    pub fn status_line(&self) -> String {
        self.status.borrow().clone()
    }
}

struct MonitorLoop {
    settings: Settings,
    interval_seconds: u64,
    first_check_delay: Duration,
    ticker: Option<Interval>,
    engine: Arc<Engine>,
    /// Mirrors `ticker.is_some()` for ticks finishing after a stop.
    running: Arc<AtomicBool>,
    in_flight: Arc<AtomicBool>,
    events: broadcast::Sender<Event>,
    status: Arc<watch::Sender<String>>,
}

enum Step {
    Command(Option<Command>),
    Tick,
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl MonitorLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                _ = next_tick(&mut self.ticker) => Step::Tick,
            };
            match step {
                Step::Command(Some(command)) => self.handle(command),
                Step::Command(None) => break,
                Step::Tick => self.on_tick(),
            }
        }
        debug!("All monitor handles dropped, monitor task exiting");
    }

    fn publish(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn arm(&mut self, first_tick_in: Duration) {
        let period = Duration::from_secs(self.interval_seconds);
        let mut ticker = tokio::time::interval_at(Instant::now() + first_tick_in, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Command::Stop(reply) => {
                let _ = reply.send(self.stop());
            }
            Command::SetInterval(seconds, reply) => {
                let _ = reply.send(self.set_interval(seconds));
            }
            Command::AddRule(rule, reply) => {
                let name = rule.process_name.clone();
                let result = self.settings.add_rule(rule);
                match &result {
                    Ok(id) => info!("Added rule for '{}' ({})", name, id),
                    Err(e) => warn!("Rejected rule for '{}': {}", name, e),
                }
                let _ = reply.send(result);
            }
            Command::RemoveRule(id, reply) => {
                let result = self.settings.remove_rule(id);
                if let Ok(rule) = &result {
                    info!("Removed rule for '{}'", rule.process_name);
                }
                let _ = reply.send(result);
            }
            Command::SetRuleEnabled(id, enabled, reply) => {
                let result = self.settings.rule_mut(id).map(|rule| {
                    rule.enabled = enabled;
                    info!("Rule '{}' enabled={}", rule.process_name, enabled);
                });
                let _ = reply.send(result);
            }
            Command::SetRuleThresholds(id, thresholds, reply) => {
                let result = self.settings.rule_mut(id).map(|rule| {
                    rule.use_global_thresholds = thresholds.is_none();
                    if let Some(th) = thresholds {
                        rule.thresholds = Some(th.normalized());
                    }
                    info!(
                        "Rule '{}' now uses {} thresholds",
                        rule.process_name,
                        if rule.use_global_thresholds { "global" } else { "private" }
                    );
                });
                let _ = reply.send(result);
            }
            Command::SetGlobalThresholds(thresholds, reply) => {
                self.settings.global_thresholds = thresholds.normalized();
                info!("Global thresholds updated");
                let _ = reply.send(());
            }
            Command::Settings(reply) => {
                let _ = reply.send(self.settings.clone());
            }
            Command::Status(reply) => {
                let _ = reply.send(StatusData {
                    running: self.ticker.is_some(),
                    interval_seconds: self.interval_seconds,
                    tick_in_flight: self.in_flight.load(Ordering::Acquire),
                    enabled_rules: self.settings.enabled_rules().count(),
                    status: self.status.borrow().clone(),
                });
            }
        }
    }

    fn start(&mut self) -> bool {
        if self.ticker.is_some() {
            warn!("Monitoring is already running");
            return false;
        }
        self.arm(self.first_check_delay);
        self.running.store(true, Ordering::Release);
        info!("Monitoring started, interval {}s", self.interval_seconds);
        self.status.send_replace("monitoring started".to_string());
        self.publish(Event::Started {
            interval_seconds: self.interval_seconds,
        });
        true
    }

    fn stop(&mut self) -> bool {
        if self.ticker.take().is_none() {
            warn!("Monitoring is not running");
            return false;
        }
        self.running.store(false, Ordering::Release);
        info!("Monitoring stopped");
        self.status.send_replace("monitoring stopped".to_string());
        self.publish(Event::Stopped);
        true
    }

    fn set_interval(&mut self, seconds: u64) -> u64 {
        let clamped = clamp_interval(seconds);
        if clamped != seconds {
            warn!("Interval {}s out of range, using {}s", seconds, clamped);
        }
        self.interval_seconds = clamped;
        if self.ticker.is_some() {
            self.arm(Duration::from_secs(clamped));
        }
        info!("Monitoring interval set to {}s", clamped);
        self.publish(Event::IntervalChanged {
            interval_seconds: clamped,
        });
        clamped
    }

    fn on_tick(&mut self) {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            warn!("Previous check still running, skipping this tick");
            self.publish(Event::TickSkipped);
            return;
        }

        let snapshot = self.settings.clone();
        let engine = Arc::clone(&self.engine);
        let in_flight = Arc::clone(&self.in_flight);
        let running = Arc::clone(&self.running);
        let events = self.events.clone();
        let status = Arc::clone(&self.status);

        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let result =
                tokio::task::spawn_blocking(move || engine.run_cycle(&snapshot, Utc::now())).await;
            match result {
                Ok(report) => {
                    debug!("Check finished in {:?}", report.elapsed);
                    let line = report.status_line();
                    info!("{}", line);
                    // A stopped monitor keeps its "stopped" status.
                    if running.load(Ordering::Acquire) {
                        status.send_replace(line);
                    }
                    for event in report.events() {
                        let _ = events.send(event);
                    }
                }
                Err(e) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    error!("Check failed after {}ms: {}", elapsed_ms, e);
                    if running.load(Ordering::Acquire) {
                        status.send_replace(ERROR_STATUS.to_string());
                    }
                    let _ = events.send(Event::TickFailed {
                        message: e.to_string(),
                        elapsed_ms,
                    });
                }
            }
            in_flight.store(false, Ordering::Release);
        });
    }
}
