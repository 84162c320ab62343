// tunnelkeep - Session Supervisor
// Serialized control loop deciding when to connect, retry, and refuse

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tunnelkeep_common::{
    Config, ErrorClass, LogLine, LogSink, MetricsSnapshot, SessionState, StatusSnapshot,
    TriggerReason,
};

use crate::backoff::Backoff;
use crate::classify::classify;
use crate::known_hosts::HostKeyVerifier;
use crate::transport::{ConnectFailure, Transport, TunnelSession};

type AttemptTask = tokio::task::JoinHandle<Result<Box<dyn TunnelSession>, ConnectFailure>>;

/// Where the control loop is parked between events. Owns the single
/// in-flight attempt or live session; at most one exists at any time.
enum Phase {
    Stopped,
    /// Connecting, retry timer armed.
    Waiting { deadline: Instant },
    /// Connecting, attempt in flight.
    Attempting { task: AttemptTask },
    Running { session: Box<dyn TunnelSession> },
}

/// The session supervisor. All state mutation happens on the control loop
/// in `run`; producers only ever post triggers through the debouncer.
pub struct Supervisor {
    config: Config,
    transport: Arc<dyn Transport>,
    verifier: Arc<dyn HostKeyVerifier>,
    log: Arc<dyn LogSink>,
    trigger_rx: mpsc::UnboundedReceiver<TriggerReason>,
    status_tx: watch::Sender<StatusSnapshot>,
    backoff: Backoff,
    /// Where the most recent classified failure is recorded for a later
    /// doctor sweep. Best-effort; absent in tests.
    error_class_file: Option<PathBuf>,
    /// Consecutive failed connection attempts. Reset only on success.
    attempt: u32,
    state: SessionState,
    metrics: MetricsSnapshot,
}

impl Supervisor {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        verifier: Arc<dyn HostKeyVerifier>,
        log: Arc<dyn LogSink>,
        trigger_rx: mpsc::UnboundedReceiver<TriggerReason>,
    ) -> (Self, watch::Receiver<StatusSnapshot>) {
        // seed with the same "-" sentinels every published snapshot uses
        let (status_tx, status_rx) = watch::channel(StatusSnapshot {
            state: SessionState::Stopped,
            detail: "stopped".to_string(),
            metrics: MetricsSnapshot::new(),
        });
        let backoff = Backoff::new(&config.restart);
        let supervisor = Self {
            config,
            transport,
            verifier,
            log,
            trigger_rx,
            status_tx,
            backoff,
            error_class_file: None,
            attempt: 0,
            state: SessionState::Stopped,
            metrics: MetricsSnapshot::new(),
        };
        (supervisor, status_rx)
    }

    /// Replace the backoff policy (deterministic jitter in tests).
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Record classified failures at `path` so `doctor` can report the
    /// last one after this process exits.
    pub fn with_error_class_file(mut self, path: PathBuf) -> Self {
        self.error_class_file = Some(path);
        self
    }

    /// Run the control loop until the trigger channel closes.
    pub async fn run(mut self) {
        let mut phase = Phase::Stopped;
        loop {
            let next = match phase {
                Phase::Stopped => match self.trigger_rx.recv().await {
                    None => None,
                    Some(trigger) => Some(self.on_stopped_trigger(trigger)),
                },
                Phase::Waiting { deadline } => {
                    tokio::select! {
                        trigger = self.trigger_rx.recv() => match trigger {
                            None => None,
                            Some(TriggerReason::ManualStop) => Some(self.stop_session(TriggerReason::ManualStop)),
                            Some(trigger) => {
                                // a fresh trigger supersedes the pending timer
                                self.record_trigger(trigger);
                                Some(self.begin_attempt())
                            }
                        },
                        _ = tokio::time::sleep_until(deadline) => Some(self.begin_attempt()),
                    }
                }
                Phase::Attempting { mut task } => {
                    tokio::select! {
                        trigger = self.trigger_rx.recv() => {
                            // a new decision always cancels the in-flight attempt
                            task.abort();
                            match trigger {
                                None => None,
                                Some(TriggerReason::ManualStop) => Some(self.stop_session(TriggerReason::ManualStop)),
                                Some(trigger) => {
                                    self.record_trigger(trigger);
                                    Some(self.begin_attempt())
                                }
                            }
                        },
                        result = &mut task => Some(self.on_attempt_finished(result)),
                    }
                }
                Phase::Running { mut session } => {
                    enum RunEvent {
                        Trigger(Option<TriggerReason>),
                        Died(String),
                    }
                    let event = tokio::select! {
                        trigger = self.trigger_rx.recv() => RunEvent::Trigger(trigger),
                        reason = session.wait() => RunEvent::Died(reason),
                    };
                    match event {
                        RunEvent::Trigger(None) => {
                            session.close().await;
                            None
                        }
                        RunEvent::Trigger(Some(TriggerReason::ManualStop)) => {
                            session.close().await;
                            Some(self.stop_session(TriggerReason::ManualStop))
                        }
                        RunEvent::Trigger(Some(trigger)) => {
                            Some(self.on_running_trigger(trigger, session).await)
                        }
                        RunEvent::Died(reason) => {
                            session.close().await;
                            Some(self.on_connection_failed(reason))
                        }
                    }
                }
            };

            match next {
                Some(p) => phase = p,
                None => break,
            }
        }
        debug!("supervisor control loop stopped");
    }

    fn on_stopped_trigger(&mut self, trigger: TriggerReason) -> Phase {
        match trigger {
            TriggerReason::ManualStart => {
                self.record_trigger(trigger);
                self.begin_attempt()
            }
            TriggerReason::ManualStop => Phase::Stopped,
            other => {
                debug!("ignoring {other} while stopped");
                Phase::Stopped
            }
        }
    }

    async fn on_running_trigger(
        &mut self,
        trigger: TriggerReason,
        mut session: Box<dyn TunnelSession>,
    ) -> Phase {
        match trigger {
            TriggerReason::NetworkChanged
            | TriggerReason::NetworkDegraded
            | TriggerReason::SleepWake
            | TriggerReason::PeriodicRefresh => {
                // planned refresh: tear down and reconnect without touching
                // the failure attempt counter
                self.record_trigger(trigger);
                self.metrics.restart_total += 1;
                self.log_line("INFO", format!("reconnecting: {trigger}"));
                session.close().await;
                self.begin_attempt()
            }
            other => {
                debug!("ignoring {other} while running");
                Phase::Running { session }
            }
        }
    }

    /// Start a connection attempt immediately, superseding anything that
    /// came before it.
    fn begin_attempt(&mut self) -> Phase {
        self.state = SessionState::Connecting;
        self.metrics.state = self.state;
        self.metrics.start_attempt_total += 1;
        self.metrics.backoff_ms = None;
        self.publish("connecting");

        let transport = self.transport.clone();
        let remote = self.config.remote.clone();
        let forwards = self.config.forwards();
        let verifier = self.verifier.clone();
        let task = tokio::spawn(async move {
            transport.open_session(&remote, &forwards, verifier).await
        });
        Phase::Attempting { task }
    }

    fn on_attempt_finished(
        &mut self,
        result: Result<Result<Box<dyn TunnelSession>, ConnectFailure>, tokio::task::JoinError>,
    ) -> Phase {
        match result {
            Ok(Ok(session)) => {
                self.attempt = 0;
                self.state = SessionState::Running;
                self.metrics.state = self.state;
                self.metrics.start_success_total += 1;
                self.metrics.last_trigger = TriggerReason::ConnectionSucceeded.to_string();
                self.metrics.backoff_ms = None;
                self.metrics.uptime_start = Some(chrono::Utc::now().timestamp());
                if let Some(path) = &self.error_class_file {
                    crate::last_error::clear(path);
                }
                self.log_line(
                    "INFO",
                    format!(
                        "tunnel up: {}@{}:{}",
                        self.config.remote.user, self.config.remote.host, self.config.remote.port
                    ),
                );
                self.publish("running");
                Phase::Running { session }
            }
            Ok(Err(failure)) if failure.trust_rejected => {
                // security-significant: halt rather than retry into a
                // possible man-in-the-middle
                self.state = SessionState::Stopped;
                self.metrics.state = self.state;
                self.metrics.start_failure_total += 1;
                self.metrics.last_error_class = ErrorClass::HostKey.to_string();
                self.metrics.last_exit = failure.message.clone();
                self.metrics.backoff_ms = None;
                if let Some(path) = &self.error_class_file {
                    crate::last_error::record(path, ErrorClass::HostKey);
                }
                error!("{} - not retrying, operator action required", failure.message);
                self.log_line("ERROR", format!("{} (stopped)", failure.message));
                self.publish("trust rejected");
                Phase::Stopped
            }
            Ok(Err(failure)) => {
                let class = classify(Some(&failure.message));
                self.metrics.start_failure_total += 1;
                self.fail_and_schedule_retry(class, failure.message)
            }
            Err(join_error) => {
                let message = format!("connection task failed: {join_error}");
                let class = classify(Some(&message));
                self.metrics.start_failure_total += 1;
                self.fail_and_schedule_retry(class, message)
            }
        }
    }

    fn on_connection_failed(&mut self, reason: String) -> Phase {
        let class = classify(Some(&reason));
        self.metrics.exit_failure_total += 1;
        self.fail_and_schedule_retry(class, reason)
    }

    /// Record a classified failure, then arm the retry timer. The metrics
    /// update and log line always precede the retry decision.
    fn fail_and_schedule_retry(&mut self, class: ErrorClass, message: String) -> Phase {
        self.metrics.last_error_class = class.to_string();
        self.metrics.last_exit = message.clone();
        self.metrics.last_trigger = TriggerReason::ConnectionFailed(class).to_string();
        if let Some(path) = &self.error_class_file {
            crate::last_error::record(path, class);
        }
        self.log_line("WARN", format!("connection failed ({class}): {message}"));

        self.attempt += 1;
        let delay = self.backoff.next_delay(self.attempt);
        self.state = SessionState::Connecting;
        self.metrics.state = self.state;
        self.metrics.backoff_ms = Some(delay.as_millis() as u64);
        info!("retry {} scheduled in {:?}", self.attempt, delay);
        self.publish("waiting to retry");

        Phase::Waiting {
            deadline: Instant::now() + delay,
        }
    }

    /// Manual stop from any state: cancel whatever is pending and park.
    fn stop_session(&mut self, trigger: TriggerReason) -> Phase {
        self.record_trigger(trigger);
        self.state = SessionState::Stopped;
        self.metrics.state = self.state;
        self.metrics.exit_success_total += 1;
        self.metrics.last_exit = "stopped".to_string();
        self.metrics.backoff_ms = None;
        self.metrics.uptime_start = None;
        self.log_line("INFO", "tunnel stopped");
        self.publish("stopped");
        Phase::Stopped
    }

    fn record_trigger(&mut self, trigger: TriggerReason) {
        self.metrics.last_trigger = trigger.to_string();
    }

    fn publish(&self, detail: &str) {
        self.status_tx.send_replace(StatusSnapshot {
            state: self.state,
            detail: detail.to_string(),
            metrics: self.metrics.clone(),
        });
    }

    fn log_line(&self, level: &str, message: impl Into<String>) {
        let line = LogLine::now(level, message);
        match level {
            "ERROR" => error!("{}", line.message),
            "WARN" => warn!("{}", line.message),
            _ => info!("{}", line.message),
        }
        self.log.append(&line.format());
    }
}
