mod fixtures;

mod conflict_resolution;
mod cycle_detection;
mod locking;
mod scheduler_flow;
