//! The durable dispatch loop.
//!
//! Tasks live in the store; the scheduler is a stateless pump over them.
//! Each tick it pulls the due pending tasks and dispatches them one by
//! one, serialized per target through the lock manager so two processes
//! never poke the same pane at once. Dispatch failures back off
//! exponentially until the retry budget is spent, then the task is
//! disabled with a notification rather than retried forever. Recovery
//! dispatches are counted per project; past the breaker threshold the
//! project's recovery traffic is suspended and escalated instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentRole;
use crate::config::Config;
use crate::core::{CycleAction, ScheduleEvent, Task, TaskId, TaskStatus, TaskTarget, TriggerKind};
use crate::orchestration::cycles::CycleDetector;
use crate::orchestration::locks::{Acquire, LockManager};
use crate::orchestration::messaging::{
    AgentMessenger, CompletionOracle, Delivery, SessionLiveness,
};
use crate::orchestration::notify::{NotificationRouter, Priority};
use crate::store::Store;
use crate::{mlog, mlog_debug, mlog_error, mlog_warn, Error, Result};

/// Lines of pane tail handed to the completion oracle.
const ORACLE_CAPTURE_LINES: u16 = 50;

/// Marker appended to a task note once it has been flagged as a possible
/// phantom, so it is flagged once, not every tick.
const PHANTOM_NOTE_TAG: &str = "[flagged: possible phantom]";

/// What the loop announces to whoever is listening (the run command logs
/// these; tests assert on them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Dispatched { task_id: TaskId, target: String },
    Completed { task_id: TaskId },
    Disabled { task_id: TaskId, reason: String },
    PhantomFlagged { task_id: TaskId, target: String },
    BreakerOpen { project_id: String },
}

pub struct TaskScheduler {
    store: Arc<Store>,
    config: Config,
    messenger: Arc<dyn AgentMessenger>,
    oracle: Arc<dyn CompletionOracle>,
    liveness: Arc<dyn SessionLiveness>,
    locks: LockManager,
    router: Arc<NotificationRouter>,
    detector: CycleDetector,
    event_tx: mpsc::UnboundedSender<SchedulerEvent>,
    /// Lock holder identity for this process.
    holder_id: String,
}

impl TaskScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        config: Config,
        messenger: Arc<dyn AgentMessenger>,
        oracle: Arc<dyn CompletionOracle>,
        liveness: Arc<dyn SessionLiveness>,
        router: Arc<NotificationRouter>,
        event_tx: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        let locks = LockManager::new(store.clone(), config.lock_ttl());
        let detector = CycleDetector::new(store.clone(), router.clone(), config.clone());
        Self {
            store,
            config,
            messenger,
            oracle,
            liveness,
            locks,
            router,
            detector,
            event_tx,
            holder_id: format!("marshal-{}", std::process::id()),
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        // Receiver gone just means nobody is watching.
        let _ = self.event_tx.send(event);
    }

    // ---------- queue operations ----------

    /// Enqueue a task. If a pending task already targets the same
    /// (project, agent, window) within the dedup window, its id comes
    /// back instead and nothing is inserted.
    pub fn enqueue(
        &self,
        target: TaskTarget,
        scheduled_at: chrono::DateTime<Utc>,
        interval_secs: Option<u64>,
        note: &str,
    ) -> Result<TaskId> {
        if let Some(existing) =
            self.store
                .find_pending_duplicate(&target, scheduled_at, self.config.dedup_window())?
        {
            mlog_debug!(
                "Enqueue deduplicated against task {} for {}",
                existing.id.short(),
                target
            );
            return Ok(existing.id);
        }

        let task = Task::new(
            target,
            scheduled_at,
            interval_secs,
            note,
            self.config.default_max_retries,
        );
        self.store.insert_task(&task)?;
        mlog!(
            "Task {} enqueued: {} at {} interval={:?}",
            task.id.short(),
            task.target,
            scheduled_at.to_rfc3339(),
            interval_secs
        );
        Ok(task.id)
    }

    /// The due pending tasks, oldest first.
    pub fn dequeue_due(&self) -> Result<Vec<Task>> {
        self.store.due_tasks(Utc::now())
    }

    /// Mark a dispatched task finished.
    pub fn complete(&self, task_id: TaskId) -> Result<()> {
        let mut task = self.store.get_task(task_id)?;
        task.complete();
        self.store.update_task(&task)?;
        mlog!("Task {} completed", task_id.short());
        self.emit(SchedulerEvent::Completed { task_id });
        Ok(())
    }

    /// Record a dispatch failure and apply the retry policy: exponential
    /// backoff while budget remains, disable plus a failure notification
    /// once `retry_count` exceeds `max_retries`.
    pub fn fail(&self, task_id: TaskId, error: &str) -> Result<()> {
        let mut task = self.store.get_task(task_id)?;
        task.record_failure(error);

        if task.retries_exhausted() {
            let reason = format!(
                "retry budget exhausted after {} attempts: {}",
                task.retry_count, error
            );
            task.disable(&reason);
            self.store.update_task(&task)?;
            mlog_warn!("Task {} disabled: {}", task_id.short(), reason);
            self.router.notify(
                &task.target.project_id,
                &[task
                    .target
                    .agent_role
                    .escalation_target()
                    .unwrap_or(AgentRole::Orchestrator)],
                Priority::High,
                &format!("Task for {} disabled: {}", task.target, reason),
            )?;
            self.emit(SchedulerEvent::Disabled { task_id, reason });
            return Ok(());
        }

        let delay = self.backoff_delay(task.retry_count);
        task.reschedule(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self.store.update_task(&task)?;
        mlog_debug!(
            "Task {} failed (attempt {}), retrying in {}s: {}",
            task_id.short(),
            task.retry_count,
            delay.as_secs(),
            error
        );
        Ok(())
    }

    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64
            .saturating_pow(attempt.saturating_sub(1))
            .min(u32::MAX as u64) as u32;
        self.config
            .base_delay()
            .saturating_mul(factor)
            .min(self.config.max_delay())
    }

    pub fn list(&self, status: Option<&str>, project_id: Option<&str>) -> Result<Vec<Task>> {
        self.store.list_tasks(status, project_id)
    }

    // ---------- the loop ----------

    /// Run until cancelled. A store error is fatal: the loop stops with
    /// the cause rather than dispatch against guessed state.
    pub async fn run_loop(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        mlog!(
            "Scheduler loop started (poll every {}s, holder {})",
            self.config.poll_interval_secs,
            self.holder_id
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    mlog!("Scheduler loop cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        mlog_error!("Scheduler loop stopping: {}", e);
                        return Err(e);
                    }
                }
            }
        }
    }

    /// One pass over the due tasks.
    pub fn tick(&self) -> Result<()> {
        for task in self.dequeue_due()? {
            let task_id = task.id;
            match self.dispatch_one(task) {
                Ok(()) => {}
                Err(Error::RecoverySuspended {
                    project_id,
                    recoveries,
                    window_secs,
                }) => {
                    self.park_for_breaker(task_id, &project_id, recoveries, window_secs)?;
                }
                // Store failure is fatal; everything else is a failed
                // dispatch for this one task.
                Err(Error::Sqlite(e)) => return Err(Error::Sqlite(e)),
                Err(e) => {
                    mlog_error!("Dispatch of {} failed: {}", task_id.short(), e);
                    self.fail(task_id, &e.to_string())?;
                }
            }
        }
        Ok(())
    }

    /// Dispatch one due task, serialized per target.
    fn dispatch_one(&self, task: Task) -> Result<()> {
        let key = task.target.key();
        let lock = match self.locks.acquire(&key, &self.holder_id)? {
            Acquire::Acquired(lock) => lock,
            Acquire::Busy { holder_id, .. } => {
                // Another process owns this target; a later tick retries.
                mlog_debug!("Target {} busy (held by {}), skipping", key, holder_id);
                return Ok(());
            }
        };

        let result = self.dispatch_locked(task);
        self.locks.release(&lock.resource_key, &self.holder_id)?;
        result
    }

    fn dispatch_locked(&self, task: Task) -> Result<()> {
        // Reload under the lock: a concurrent disable or completion wins.
        let mut task = self.store.get_task(task.id)?;
        if task.status != TaskStatus::Pending {
            mlog_debug!(
                "Task {} no longer pending ({}), skipping",
                task.id.short(),
                task.status
            );
            return Ok(());
        }

        let trigger_kind = if task.retry_count > 0 {
            TriggerKind::Recovery
        } else {
            TriggerKind::Normal
        };
        if trigger_kind == TriggerKind::Recovery {
            self.check_breaker(&task.target.project_id)?;
        }

        // Recurring targets get a completion check before being poked
        // again; a confidently finished project ends the recurrence.
        if task.is_recurring() && self.completion_check(&mut task)? {
            task.complete();
            self.store.update_task(&task)?;
            mlog!(
                "Task {} completed by oracle verdict for {}",
                task.id.short(),
                task.target
            );
            self.emit(SchedulerEvent::Completed { task_id: task.id });
            return Ok(());
        }

        task.dispatch();
        self.store.update_task(&task)?;

        let delivery = self.messenger.send(
            &task.target.project_id,
            task.target.agent_role,
            task.target.window,
            &task.note,
            self.config.send_timeout(),
        )?;
        match delivery {
            Delivery::Ack => self.after_dispatch(task, trigger_kind),
            Delivery::Timeout => {
                self.fail(
                    task.id,
                    &Error::SendTimeout {
                        target: task.target.to_string(),
                        timeout: self.config.send_timeout(),
                    }
                    .to_string(),
                )?;
                Ok(())
            }
        }
    }

    /// Bookkeeping after a delivered dispatch: record the schedule event,
    /// feed the cycle detector, and re-enqueue a recurring task.
    fn after_dispatch(&self, mut task: Task, trigger_kind: TriggerKind) -> Result<()> {
        self.emit(SchedulerEvent::Dispatched {
            task_id: task.id,
            target: task.target.key(),
        });
        let event = ScheduleEvent::new(
            &task.target.project_id,
            task.target.agent_role,
            task.interval_secs,
            trigger_kind,
        );
        self.store.append_schedule_event(&event)?;

        let detections = self.detector.observe(&event)?;
        let jittered = detections.iter().find_map(|d| match d.action_taken {
            CycleAction::JitteredInterval { to_secs, .. } => Some(to_secs),
            _ => None,
        });

        if !task.is_recurring() {
            // One-shot tasks stay dispatched until completed explicitly.
            return Ok(());
        }

        // Reload before re-enqueue: a disable or completion that landed
        // during the send must stick, and the dispatch itself must not
        // resurrect the task.
        let current = self.store.get_task(task.id)?;
        if current.is_terminal() {
            mlog_debug!(
                "Task {} reached {} mid-flight, not re-enqueued",
                task.id.short(),
                current.status.kind_str()
            );
            return Ok(());
        }

        if let Some(to_secs) = jittered {
            task.interval_secs = Some(to_secs);
        }
        let interval = task
            .interval()
            .ok_or_else(|| Error::Validation("recurring task without interval".into()))?;
        // Delivered means the agent is reachable again; the retry budget
        // starts fresh for the next recurrence.
        task.retry_count = 0;
        let next = (task.scheduled_at + interval).max(Utc::now());
        task.reschedule(next);
        self.store.update_task(&task)?;
        mlog_debug!(
            "Task {} re-enqueued for {} (interval {}s)",
            task.id.short(),
            next.to_rfc3339(),
            interval.num_seconds()
        );
        Ok(())
    }

    /// Oracle-driven completion and phantom check for a recurring task.
    ///
    /// Returns true when the project is confidently complete. A live but
    /// idle session with a NO/UNKNOWN verdict past the grace period gets
    /// flagged (note + notification), once.
    fn completion_check(&self, task: &mut Task) -> Result<bool> {
        let session = task
            .target
            .agent_role
            .session_name(&task.target.project_id);
        if !self.liveness.is_session_alive(&session) {
            // Dead session: let the send fail and the retry policy decide.
            return Ok(false);
        }

        let output = self.liveness.capture_tail(&session, ORACLE_CAPTURE_LINES)?;
        let assessment = self
            .oracle
            .is_project_complete(&task.target.project_id, &output)?;
        if assessment.is_complete() {
            return Ok(true);
        }

        if let Some(activity) = self.liveness.last_activity(&session)? {
            let idle_secs = Utc::now().timestamp().saturating_sub(activity as i64);
            if idle_secs > self.config.phantom_grace().num_seconds()
                && !task.note.contains(PHANTOM_NOTE_TAG)
            {
                task.note = format!("{} {}", task.note, PHANTOM_NOTE_TAG);
                mlog_warn!(
                    "Phantom suspected: {} session alive but idle {}s with verdict {:?}",
                    task.target,
                    idle_secs,
                    assessment.verdict
                );
                self.router.notify(
                    &task.target.project_id,
                    &[task
                        .target
                        .agent_role
                        .escalation_target()
                        .unwrap_or(AgentRole::Orchestrator)],
                    Priority::High,
                    &format!(
                        "{} looks like a phantom: session alive, no activity for {}s, \
                         completion unconfirmed",
                        task.target, idle_secs
                    ),
                )?;
                self.emit(SchedulerEvent::PhantomFlagged {
                    task_id: task.id,
                    target: task.target.key(),
                });
            }
        }
        Ok(false)
    }

    /// Refuse a recovery dispatch when the project has recovered too many
    /// times inside the breaker window.
    fn check_breaker(&self, project_id: &str) -> Result<()> {
        let window = self.config.breaker_window();
        let recoveries = self
            .store
            .recovery_count_since(project_id, Utc::now() - window)?;
        if recoveries >= self.config.breaker_max_recoveries {
            return Err(Error::RecoverySuspended {
                project_id: project_id.to_string(),
                recoveries,
                window_secs: self.config.breaker_window_secs,
            });
        }
        Ok(())
    }

    /// Park a task past the breaker window and escalate.
    fn park_for_breaker(
        &self,
        task_id: TaskId,
        project_id: &str,
        recoveries: usize,
        window_secs: u64,
    ) -> Result<()> {
        let mut task = self.store.get_task(task_id)?;
        task.reschedule(Utc::now() + self.config.breaker_window());
        self.store.update_task(&task)?;
        mlog_warn!(
            "Recovery breaker open for {}: {} recoveries in {}s, task {} parked",
            project_id,
            recoveries,
            window_secs,
            task_id.short()
        );
        self.router.notify(
            project_id,
            &[AgentRole::Orchestrator],
            Priority::Emergency,
            &format!(
                "Recovery suspended for project {}: {} recovery dispatches within {}s; \
                 the root cause is not being fixed by recovery",
                project_id, recoveries, window_secs
            ),
        )?;
        self.emit(SchedulerEvent::BreakerOpen {
            project_id: project_id.to_string(),
        });
        Ok(())
    }
}
