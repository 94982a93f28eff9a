//! Core data model: tasks, status reports, and the schedule-event log.

pub mod event;
pub mod report;
pub mod task;

pub use event::{CycleAction, CycleEvent, CycleKind, ScheduleEvent, TriggerKind};
pub use report::{Conflict, ConflictId, ReportCategory, ReportOutcome, Resolution, StatusReport};
pub use task::{Task, TaskId, TaskStatus, TaskTarget};
