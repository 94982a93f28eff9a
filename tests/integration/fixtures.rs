//! Shared harness for the integration suite: a file-backed store in a
//! temp directory plus scripted stand-ins for the tmux-facing seams.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use marshal::agent::AgentRole;
use marshal::config::Config;
use marshal::core::TaskTarget;
use marshal::orchestration::{
    AgentMessenger, Assessment, CompletionOracle, ConflictResolver, Delivery, NotificationRouter,
    RolePrecedence, SchedulerEvent, SessionLiveness, StatusStore, TaskScheduler, Verdict,
};
use marshal::store::Store;
use marshal::Result;

/// Messenger that records every send and times out for selected roles.
pub struct RecordingMessenger {
    sends: Mutex<Vec<(AgentRole, String)>>,
    timeout_roles: Mutex<Vec<AgentRole>>,
    on_send: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl RecordingMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sends: Mutex::new(Vec::new()),
            timeout_roles: Mutex::new(Vec::new()),
            on_send: Mutex::new(None),
        })
    }

    /// Run `hook` once, while the next send is in flight.
    pub fn on_next_send(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_send.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn timeout_for(&self, role: AgentRole) {
        self.timeout_roles.lock().unwrap().push(role);
    }

    pub fn respond_for(&self, role: AgentRole) {
        self.timeout_roles.lock().unwrap().retain(|r| *r != role);
    }

    pub fn sent(&self) -> Vec<(AgentRole, String)> {
        self.sends.lock().unwrap().clone()
    }

    pub fn sent_to(&self, role: AgentRole) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, text)| text)
            .collect()
    }
}

impl AgentMessenger for RecordingMessenger {
    fn send(
        &self,
        _project_id: &str,
        role: AgentRole,
        _window: u32,
        text: &str,
        _timeout: Duration,
    ) -> Result<Delivery> {
        self.sends.lock().unwrap().push((role, text.to_string()));
        if let Some(hook) = self.on_send.lock().unwrap().take() {
            hook();
        }
        if self.timeout_roles.lock().unwrap().contains(&role) {
            Ok(Delivery::Timeout)
        } else {
            Ok(Delivery::Ack)
        }
    }
}

/// Oracle with a settable verdict.
pub struct ScriptedOracle {
    state: Mutex<(Verdict, f64)>,
}

impl ScriptedOracle {
    pub fn unknown() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new((Verdict::Unknown, 0.0)),
        })
    }

    pub fn set(&self, verdict: Verdict, confidence: f64) {
        *self.state.lock().unwrap() = (verdict, confidence);
    }
}

impl CompletionOracle for ScriptedOracle {
    fn is_project_complete(&self, _project_id: &str, _recent_output: &str) -> Result<Assessment> {
        let (verdict, confidence) = *self.state.lock().unwrap();
        Ok(Assessment::new(verdict, confidence))
    }
}

/// Liveness double: every session alive with recent activity unless told
/// otherwise.
pub struct ScriptedLiveness {
    pub alive: bool,
    pub idle_secs: i64,
}

impl SessionLiveness for ScriptedLiveness {
    fn is_session_alive(&self, _session: &str) -> bool {
        self.alive
    }

    fn last_activity(&self, _session: &str) -> Result<Option<u64>> {
        if !self.alive {
            return Ok(None);
        }
        Ok(Some(
            (chrono::Utc::now().timestamp() - self.idle_secs) as u64,
        ))
    }

    fn capture_tail(&self, _session: &str, _lines: u16) -> Result<String> {
        Ok("$ ".to_string())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<Store>,
    pub config: Config,
    pub messenger: Arc<RecordingMessenger>,
    pub oracle: Arc<ScriptedOracle>,
    pub router: Arc<NotificationRouter>,
    pub scheduler: TaskScheduler,
    pub events: mpsc::UnboundedReceiver<SchedulerEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(Store::open(&dir.path().join("marshal.db")).expect("store"));
        let mut config = Config::default();
        tweak(&mut config);

        let messenger = RecordingMessenger::new();
        let oracle = ScriptedOracle::unknown();
        let router = Arc::new(NotificationRouter::new(
            store.clone(),
            messenger.clone(),
            config.send_timeout(),
        ));
        let (tx, events) = mpsc::unbounded_channel();
        let scheduler = TaskScheduler::new(
            store.clone(),
            config.clone(),
            messenger.clone(),
            oracle.clone(),
            Arc::new(ScriptedLiveness {
                alive: true,
                idle_secs: 0,
            }),
            router.clone(),
            tx,
        );
        Self {
            dir,
            store,
            config,
            messenger,
            oracle,
            router,
            scheduler,
            events,
        }
    }

    pub fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(
            self.store.clone(),
            Box::new(RolePrecedence),
            self.router.clone(),
        )
    }

    pub fn reports(&self) -> StatusStore {
        StatusStore::new(self.store.clone())
    }

    /// Reopen the store from disk, as a restarted process would.
    pub fn reopen(&self) -> Arc<Store> {
        Arc::new(Store::open(&self.dir.path().join("marshal.db")).expect("reopen"))
    }

    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn target(project: &str, role: AgentRole) -> TaskTarget {
    TaskTarget::new(project, role, 0)
}
