//! Background probe loops and their reconciliation.
//!
//! Each loop runs one iteration immediately, then sleeps for its configured
//! interval. A stop request is only observed while sleeping, so an in-flight
//! probe pass always completes.

use crate::config::{SchedulerPolicy, SharedSettings};
use crate::metrics_defs::{LOOP_ITERATION, LOOPS_RUNNING};
use egress::Keepalive;
use keypool::health::HealthChecker;
use parking_lot::Mutex;
use shared::clock::Clock;
use shared::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoopKind {
    HealthCheck,
    ProxyKeepalive,
}

impl LoopKind {
    pub const ALL: [LoopKind; 2] = [LoopKind::HealthCheck, LoopKind::ProxyKeepalive];

    pub const fn as_str(&self) -> &'static str {
        match self {
            LoopKind::HealthCheck => "health_check",
            LoopKind::ProxyKeepalive => "proxy_keepalive",
        }
    }

    fn should_run(&self, policy: &SchedulerPolicy) -> bool {
        match self {
            LoopKind::HealthCheck => policy.should_run_health_check(),
            LoopKind::ProxyKeepalive => policy.should_run_keepalive(),
        }
    }

    fn interval(&self, policy: &SchedulerPolicy) -> Duration {
        match self {
            LoopKind::HealthCheck => policy.health_check_interval(),
            LoopKind::ProxyKeepalive => policy.keepalive_interval(),
        }
    }
}

/// Everything a loop iteration needs.
pub struct LoopContext {
    pub settings: Arc<SharedSettings>,
    pub health: Arc<HealthChecker>,
    pub keepalive: Arc<Keepalive>,
    pub clock: Arc<dyn Clock>,
}

impl LoopContext {
    /// One iteration. Failures are logged, never returned.
    pub async fn run_once(&self, kind: LoopKind) {
        let settings = self.settings.current();
        let now = || self.clock.now();

        let result = match kind {
            LoopKind::HealthCheck => self
                .health
                .check_all(&settings.keys, &settings.health, now)
                .await
                .map_err(|e| e.to_string()),
            LoopKind::ProxyKeepalive => Ok(self.keepalive.probe_all(&settings.egress, now).await),
        };

        match result {
            Ok(count) => {
                counter!(LOOP_ITERATION, "task" => kind.as_str(), "result" => "ok").increment(1);
                tracing::info!(task = kind.as_str(), count, "Background iteration completed");
            }
            Err(error) => {
                counter!(LOOP_ITERATION, "task" => kind.as_str(), "result" => "error").increment(1);
                tracing::warn!(task = kind.as_str(), error = %error, "Background iteration failed");
            }
        }
    }
}

struct RunningLoop {
    handle: JoinHandle<()>,
    stop: oneshot::Sender<()>,
}

/// What a call to [`Scheduler::reconcile`] changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<LoopKind>,
    pub stopped: Vec<LoopKind>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

pub struct Scheduler {
    context: Arc<LoopContext>,
    running: Mutex<HashMap<LoopKind, RunningLoop>>,
}

impl Scheduler {
    pub fn new(context: Arc<LoopContext>) -> Self {
        Scheduler {
            context,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Starts loops that should run but don't and stops loops that shouldn't
    /// run. Loops already in the right state are left alone. Must be called
    /// from within a tokio runtime.
    pub fn reconcile(&self) -> ReconcileReport {
        let settings = self.context.settings.current();
        let policy = &settings.scheduler;
        let mut report = ReconcileReport::default();
        let mut running = self.running.lock();

        for kind in LoopKind::ALL {
            let desired = kind.should_run(policy);
            let alive = running
                .get(&kind)
                .is_some_and(|task| !task.handle.is_finished());

            if desired && !alive {
                running.insert(kind, self.spawn(kind));
                report.started.push(kind);
                tracing::info!(task = kind.as_str(), node_id = %policy.node_id, "Started background loop");
            } else if !desired {
                if let Some(task) = running.remove(&kind) {
                    // The receiver is gone if the loop already exited.
                    let _ = task.stop.send(());
                    if alive {
                        report.stopped.push(kind);
                        tracing::info!(task = kind.as_str(), node_id = %policy.node_id, "Stopping background loop");
                    }
                }
            }
        }

        gauge!(LOOPS_RUNNING).set(running.len() as f64);
        report
    }

    pub fn is_running(&self, kind: LoopKind) -> bool {
        self.running
            .lock()
            .get(&kind)
            .is_some_and(|task| !task.handle.is_finished())
    }

    fn spawn(&self, kind: LoopKind) -> RunningLoop {
        let (stop, mut stop_rx) = oneshot::channel();
        let context = self.context.clone();

        let handle = tokio::spawn(async move {
            loop {
                context.run_once(kind).await;

                let interval = kind.interval(&context.settings.current().scheduler);
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!(task = kind.as_str(), "Background loop stopped");
        });

        RunningLoop { handle, stop }
    }

    /// Stops every loop and waits for in-flight iterations to finish.
    pub async fn shutdown(&self) {
        let tasks: Vec<(LoopKind, RunningLoop)> = self.running.lock().drain().collect();
        for (kind, task) in tasks {
            let _ = task.stop.send(());
            if let Err(e) = task.handle.await {
                tracing::error!(task = kind.as_str(), error = %e, "Background loop panicked");
            }
        }
        gauge!(LOOPS_RUNNING).set(0.0);
    }
}
