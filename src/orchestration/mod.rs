//! Orchestration: the coordinating components on top of the store.
//!
//! `scheduler` runs the durable dispatch loop, `status` keeps the report
//! ledger and resolves contradictions, `cycles` watches the event stream
//! for scheduling pathologies, `locks` arbitrates exclusive resources, and
//! `notify` fans messages out by priority. `messaging` holds the seams to
//! the outside world (tmux send, completion judgment, liveness) so every
//! component above it can be driven by test doubles.

pub mod cycles;
pub mod locks;
pub mod messaging;
pub mod notify;
pub mod scheduler;
pub mod status;

pub use cycles::CycleDetector;
pub use locks::{Acquire, Lock, LockManager};
pub use messaging::{
    AgentMessenger, Assessment, CompletionOracle, Delivery, MarkerOracle, SessionLiveness,
    TmuxMessenger, TmuxSessions, Verdict,
};
pub use notify::{NotificationRouter, Priority};
pub use scheduler::{SchedulerEvent, TaskScheduler};
pub use status::{ConflictResolver, PrecedencePolicy, RolePrecedence, StatusStore};
