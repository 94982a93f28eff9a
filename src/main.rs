use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use marshal::agent::AgentRole;
use marshal::config::Config;
use marshal::core::{ConflictId, ReportCategory, ReportOutcome, StatusReport, TaskTarget};
use marshal::orchestration::{
    ConflictResolver, LockManager, MarkerOracle, NotificationRouter, RolePrecedence,
    SchedulerEvent, StatusStore, TaskScheduler, TmuxMessenger, TmuxSessions,
};
use marshal::store::Store;
use marshal::tmux::Tmux;
use marshal::{mlog, mlog_error, Error, Result, TaskId};

/// Marshal - durable control plane for tmux-hosted agent crews
#[derive(Parser, Debug)]
#[command(name = "marshal")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MARSHAL_DEBUG=1     Enable debug logging (alternative to --debug)")]
struct Cli {
    /// Enable debug logging (writes to ~/.marshal/marshal.log)
    #[arg(short = 'd', long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run the dispatch loop and conflict monitor until interrupted
    Run,

    /// List tasks
    Tasks {
        /// Filter by status kind (pending, dispatched, completed, failed, disabled)
        #[arg(long)]
        status: Option<String>,

        /// Filter by project
        #[arg(long)]
        project: Option<String>,
    },

    /// Enqueue a task for an agent
    Enqueue {
        /// Project the agent belongs to
        project: String,

        /// Agent role (orchestrator, project_manager, developer, tester, ops)
        role: String,

        /// Message delivered to the agent's pane
        note: String,

        /// Window index within the agent's session
        #[arg(long, default_value_t = 0)]
        window: u32,

        /// Delay before the first dispatch, in seconds
        #[arg(long = "in", default_value_t = 0)]
        delay_secs: u64,

        /// Repeat every N seconds after a successful dispatch
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Mark a dispatched task as finished
    Complete {
        /// Task id (full UUID)
        task_id: String,
    },

    /// Record a status report on behalf of an agent
    Report {
        project: String,

        /// Reporting agent role
        role: String,

        /// Category (deployment, testing, integration, resource, timeline)
        category: String,

        /// Outcome (success, failure, blocked, in_progress)
        outcome: String,

        /// What the report is about (deliverable name, resource id, role)
        #[arg(long)]
        subject: Option<String>,

        /// Free-form detail
        #[arg(long, default_value = "")]
        detail: String,
    },

    /// List unresolved conflicts, or resolve one
    Conflicts {
        /// Resolve the given conflict id
        #[arg(long)]
        resolve: Option<String>,
    },

    /// Show recent cycle detections
    Cycles {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// List held resource locks
    Locks,

    /// Force-release a resource lock
    Release {
        /// Resource key of the lock to drop
        resource_key: String,
    },

    /// Show the recent notification audit log
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// List live marshal tmux sessions
    Sessions,

    /// Start an agent's tmux session
    Spawn {
        project: String,

        /// Agent role (orchestrator, project_manager, developer, tester, ops)
        role: String,

        /// Working directory for the session
        #[arg(long, default_value = ".")]
        cwd: PathBuf,

        /// Command to run inside the session
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },

    /// Kill an agent's tmux session
    Kill {
        project: String,

        /// Agent role (orchestrator, project_manager, developer, tester, ops)
        role: String,
    },
}

struct Services {
    store: Arc<Store>,
    config: Config,
    router: Arc<NotificationRouter>,
}

impl Services {
    fn init() -> Result<Self> {
        Config::ensure_dirs()?;
        let config = Config::load()?;
        if !marshal::log::is_debug() {
            marshal::log::set_level(config.log_level()?);
        }
        let store = Arc::new(Store::open(&Config::db_path()?)?);
        let router = Arc::new(NotificationRouter::new(
            store.clone(),
            Arc::new(TmuxMessenger),
            config.ack_timeout(),
        ));
        Ok(Self {
            store,
            config,
            router,
        })
    }

    fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(
            self.store.clone(),
            Box::new(RolePrecedence),
            self.router.clone(),
        )
    }

    fn scheduler(&self) -> (TaskScheduler, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = TaskScheduler::new(
            self.store.clone(),
            self.config.clone(),
            Arc::new(TmuxMessenger),
            Arc::new(MarkerOracle),
            Arc::new(TmuxSessions),
            self.router.clone(),
            tx,
        );
        (scheduler, rx)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    marshal::log::init_with_debug(cli.debug);

    if let Err(e) = dispatch(cli.command).await {
        mlog_error!("Command failed: {}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(command: Command) -> Result<()> {
    let services = Services::init()?;
    match command {
        Command::Run => run(services).await,
        Command::Tasks { status, project } => {
            let (scheduler, _rx) = services.scheduler();
            let tasks = scheduler.list(status.as_deref(), project.as_deref())?;
            if tasks.is_empty() {
                println!("No tasks.");
                return Ok(());
            }
            for task in tasks {
                println!(
                    "{}  {}  {}  at {}  retries {}/{}  {}{}",
                    task.id,
                    task.target,
                    task.status,
                    task.scheduled_at.format("%Y-%m-%d %H:%M:%S"),
                    task.retry_count,
                    task.max_retries,
                    task.note,
                    task.interval_secs
                        .map(|s| format!("  (every {}s)", s))
                        .unwrap_or_default(),
                );
            }
            Ok(())
        }
        Command::Enqueue {
            project,
            role,
            note,
            window,
            delay_secs,
            interval,
        } => {
            let role: AgentRole = role.parse()?;
            let target = TaskTarget::new(&project, role, window);
            let at = chrono::Utc::now() + chrono::Duration::seconds(delay_secs as i64);
            let (scheduler, _rx) = services.scheduler();
            let id = scheduler.enqueue(target, at, interval, &note)?;
            println!("Enqueued task {}", id);
            Ok(())
        }
        Command::Complete { task_id } => {
            let id: TaskId = task_id.parse()?;
            let (scheduler, _rx) = services.scheduler();
            scheduler.complete(id)?;
            println!("Task {} completed", id.short());
            Ok(())
        }
        Command::Report {
            project,
            role,
            category,
            outcome,
            subject,
            detail,
        } => {
            let report = StatusReport::new(
                &project,
                role.parse()?,
                category.parse::<ReportCategory>()?,
                outcome.parse::<ReportOutcome>()?,
                subject.as_deref(),
                &detail,
            );
            let reports = StatusStore::new(services.store.clone());
            let id = reports.record_report(&report)?;
            println!("Recorded report #{}", id);

            // New information may have just created or ended a dispute.
            let resolver = services.resolver();
            for conflict in resolver.detect_conflicts(&project)? {
                println!(
                    "Conflict {}: {} reports {:?}",
                    conflict.id.short(),
                    conflict.category,
                    conflict.report_ids
                );
            }
            Ok(())
        }
        Command::Conflicts { resolve } => {
            let resolver = services.resolver();
            if let Some(id) = resolve {
                let id: ConflictId = id.parse()?;
                let resolution = resolver.resolve(id)?;
                println!("Conflict {} -> {}", id.short(), resolution.summary());
                return Ok(());
            }
            let open = resolver.open_conflicts()?;
            if open.is_empty() {
                println!("No unresolved conflicts.");
                return Ok(());
            }
            for conflict in open {
                println!(
                    "{}  {}  {}  reports {:?}  since {}",
                    conflict.id,
                    conflict.project_id,
                    conflict.category,
                    conflict.report_ids,
                    conflict.detected_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
            Ok(())
        }
        Command::Cycles { limit } => {
            let events = services.store.recent_cycle_events(limit)?;
            if events.is_empty() {
                println!("No cycle detections.");
                return Ok(());
            }
            for event in events {
                println!(
                    "{}  {}  {}  {}  action {:?}",
                    event.detected_at.format("%Y-%m-%d %H:%M:%S"),
                    event.kind,
                    event.project_id,
                    event.evidence,
                    event.action_taken,
                );
            }
            Ok(())
        }
        Command::Locks => {
            let locks = services.store.list_locks()?;
            if locks.is_empty() {
                println!("No locks held.");
                return Ok(());
            }
            let now = chrono::Utc::now();
            for lock in locks {
                println!(
                    "{}  held by {}  expires in {}s{}",
                    lock.resource_key,
                    lock.holder_id,
                    lock.remaining(now).num_seconds(),
                    if lock.is_stale(now) { "  (stale)" } else { "" },
                );
            }
            Ok(())
        }
        Command::Release { resource_key } => {
            let locks = LockManager::new(services.store.clone(), services.config.lock_ttl());
            if locks.force_release(&resource_key)? {
                println!("Released {}", resource_key);
            } else {
                println!("No lock held on {}", resource_key);
            }
            Ok(())
        }
        Command::Audit { limit } => {
            for line in services.store.recent_notifications(limit)? {
                println!("{}", line);
            }
            Ok(())
        }
        Command::Sessions => {
            let sessions = Tmux::list_marshal_sessions()?;
            if sessions.is_empty() {
                println!("No marshal sessions.");
                return Ok(());
            }
            for session in sessions {
                println!("{}", session);
            }
            Ok(())
        }
        Command::Spawn {
            project,
            role,
            cwd,
            cmd,
        } => {
            let role: AgentRole = role.parse()?;
            let session = role.session_name(&project);
            Tmux::create_session(&session, &cwd, &cmd)?;
            println!("Started {}", session);
            Ok(())
        }
        Command::Kill { project, role } => {
            let role: AgentRole = role.parse()?;
            let session = role.session_name(&project);
            Tmux::kill_session(&session)?;
            println!("Killed {}", session);
            Ok(())
        }
    }
}

/// The daemon: dispatch loop, conflict monitor, and event logger, all
/// cancelled together on Ctrl-C.
async fn run(services: Services) -> Result<()> {
    if !Tmux::is_available() {
        return Err(Error::Tmux("tmux is not installed or not on PATH".to_string()));
    }
    mlog!("Dispatching through {}", Tmux::version()?);

    let (scheduler, mut events) = services.scheduler();
    let cancel = CancellationToken::new();

    let event_logger = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => log_scheduler_event(&event),
                        None => break,
                    },
                }
            }
        }
    });

    let monitor = tokio::spawn({
        let store = services.store.clone();
        let resolver = services.resolver();
        let cancel = cancel.clone();
        let interval = services.config.poll_interval();
        async move {
            if let Err(e) = conflict_monitor(store, resolver, interval, cancel).await {
                mlog_error!("Conflict monitor stopped: {}", e);
            }
        }
    });

    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                mlog!("Interrupt received, shutting down");
                cancel.cancel();
            }
        })
    };

    println!("marshal running (Ctrl-C to stop)");
    let result = scheduler.run_loop(cancel.clone()).await;
    cancel.cancel();
    let _ = event_logger.await;
    let _ = monitor.await;
    ctrl_c.abort();
    result
}

/// Periodically re-run conflict detection and resolution for every
/// project that has tasks.
async fn conflict_monitor(
    store: Arc<Store>,
    resolver: ConflictResolver,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                let mut projects: Vec<String> = store
                    .list_tasks(None, None)?
                    .into_iter()
                    .map(|t| t.target.project_id)
                    .collect();
                projects.sort();
                projects.dedup();

                for project in projects {
                    for conflict in resolver.detect_conflicts(&project)? {
                        match resolver.resolve(conflict.id) {
                            Ok(resolution) => mlog!(
                                "Conflict {} auto-resolved: {}",
                                conflict.id.short(),
                                resolution.summary()
                            ),
                            Err(Error::ConflictNotFound(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }
    }
}

fn log_scheduler_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::Dispatched { task_id, target } => {
            mlog!("Dispatched {} -> {}", task_id.short(), target)
        }
        SchedulerEvent::Completed { task_id } => mlog!("Completed {}", task_id.short()),
        SchedulerEvent::Disabled { task_id, reason } => {
            mlog!("Disabled {}: {}", task_id.short(), reason)
        }
        SchedulerEvent::PhantomFlagged { task_id, target } => {
            mlog!("Phantom flagged {} on {}", task_id.short(), target)
        }
        SchedulerEvent::BreakerOpen { project_id } => {
            mlog!("Recovery breaker open for {}", project_id)
        }
    }
}
