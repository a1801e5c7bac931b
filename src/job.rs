//! Recurring aggregation sweep.
//!
//! Every tick recomputes all three windows for every active class and then
//! for each of the class's active students. The whole sweep reruns on each
//! tick, so its cost grows linearly with the number of entities.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::StatsEngine;
use crate::error::StatsError;
use crate::models::{MetricGroup, StudentRecord, Subject};
use crate::period::{PeriodKind, PeriodSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TickOutcome {
    Completed,
    /// A previous sweep was still running.
    Skipped,
    /// Stop was requested mid-sweep.
    Interrupted,
    /// Active classes could not be listed; nothing was swept.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub at: DateTime<Utc>,
    pub outcome: TickOutcome,
    pub classes: u32,
    pub students: u32,
    pub written: u32,
    pub failed: u32,
}

impl TickReport {
    fn new(at: DateTime<Utc>, outcome: TickOutcome) -> Self {
        Self {
            at,
            outcome,
            classes: 0,
            students: 0,
            written: 0,
            failed: 0,
        }
    }
}

/// Clears the running flag when the sweep ends, even on panic.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    engine: StatsEngine,
    running: AtomicBool,
    stop: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

impl JobRunner {
    pub fn new(engine: StatsEngine) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                engine,
                running: AtomicBool::new(false),
                stop,
            }),
        }
    }

    pub fn engine(&self) -> &StatsEngine {
        &self.inner.engine
    }

    pub fn state(&self) -> RunnerState {
        if self.inner.running.load(Ordering::Acquire) {
            RunnerState::Running
        } else {
            RunnerState::Idle
        }
    }

    /// Ask the current and future sweeps to stop after the entity in flight.
    pub fn request_stop(&self) {
        self.inner.stop.send_replace(true);
    }

    pub fn stop_requested(&self) -> bool {
        *self.inner.stop.borrow()
    }

    /// Run one sweep for reference instant `at`.
    pub async fn tick(&self, at: DateTime<Utc>) -> TickReport {
        let Some(_guard) = RunGuard::acquire(&self.inner.running) else {
            warn!(%at, "previous sweep still running, tick skipped");
            return TickReport::new(at, TickOutcome::Skipped);
        };

        let windows = self.engine().calculator().windows(at);
        let mut report = TickReport::new(at, TickOutcome::Completed);

        let classes = match self.engine().active_classes().await {
            Ok(classes) => classes,
            Err(err) => {
                warn!(%at, error = %err, "failed to enumerate active classes, sweep aborted");
                report.failed += 1;
                report.outcome = TickOutcome::Aborted;
                return report;
            }
        };

        'classes: for class in classes {
            if self.stop_requested() {
                report.outcome = TickOutcome::Interrupted;
                break;
            }
            debug!(class_id = %class.id, name = %class.name, "aggregating class");
            report.classes += 1;

            let roster = match self.engine().active_students(class.id).await {
                Ok(roster) => roster,
                Err(err) => {
                    warn!(class_id = %class.id, error = %err, "failed to read class roster, class skipped");
                    report.failed += 1;
                    continue;
                }
            };
            self.sweep_class(class.id, &roster, &windows, &mut report)
                .await;

            for student in &roster {
                if self.stop_requested() {
                    report.outcome = TickOutcome::Interrupted;
                    break 'classes;
                }
                report.students += 1;
                self.sweep_student(student, &windows, &mut report).await;
            }
        }

        info!(
            %at,
            outcome = ?report.outcome,
            classes = report.classes,
            students = report.students,
            written = report.written,
            failed = report.failed,
            "aggregation sweep finished"
        );
        report
    }

    async fn sweep_class(
        &self,
        class_id: Uuid,
        roster: &[StudentRecord],
        windows: &PeriodSet,
        report: &mut TickReport,
    ) {
        for window in windows.iter() {
            for group in MetricGroup::ALL {
                let result = match self
                    .engine()
                    .compute_class(class_id, roster, group, &window)
                    .await
                {
                    Ok(stat) => self.engine().store().upsert(&stat).await,
                    Err(err) => Err(err),
                };
                self.record(report, Subject::Class(class_id), group, window.kind, result);
            }
        }
    }

    async fn sweep_student(
        &self,
        student: &StudentRecord,
        windows: &PeriodSet,
        report: &mut TickReport,
    ) {
        for window in windows.iter() {
            for group in MetricGroup::ALL {
                let result = match self.engine().compute_student(student, group, &window).await {
                    Ok(stat) => self.engine().store().upsert(&stat).await,
                    Err(err) => Err(err),
                };
                self.record(report, Subject::Student(student.id), group, window.kind, result);
            }
        }
    }

    fn record(
        &self,
        report: &mut TickReport,
        subject: Subject,
        group: MetricGroup,
        period: PeriodKind,
        result: Result<(), StatsError>,
    ) {
        match result {
            Ok(()) => report.written += 1,
            Err(err) => {
                warn!(%subject, %group, %period, error = %err, "aggregation failed, skipping");
                report.failed += 1;
            }
        }
    }

    /// Spawn the recurring sweep. Overlapping ticks are skipped, never queued.
    pub fn start(&self, every: Duration) -> JobHandle {
        let runner = self.clone();
        let mut stop = self.inner.stop.subscribe();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut in_flight: Option<JoinHandle<TickReport>> = None;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match &in_flight {
                            Some(sweep) if !sweep.is_finished() => {
                                runner.tick(Utc::now()).await;
                            }
                            _ => {
                                let sweeper = runner.clone();
                                in_flight = Some(tokio::spawn(async move {
                                    sweeper.tick(Utc::now()).await
                                }));
                            }
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            if let Some(sweep) = in_flight {
                if let Err(err) = sweep.await {
                    warn!(error = %err, "sweep task ended abnormally");
                }
            }
            info!("job runner stopped");
        });

        JobHandle {
            runner: self.clone(),
            task,
        }
    }
}

pub struct JobHandle {
    runner: JobRunner,
    task: JoinHandle<()>,
}

impl JobHandle {
    /// Stop scheduling, let the entity in flight finish and wait for the sweep.
    pub async fn stop(self) {
        self.runner.request_stop();
        if let Err(err) = self.task.await {
            warn!(error = %err, "job runner task ended abnormally");
        }
    }
}
