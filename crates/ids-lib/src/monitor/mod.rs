//! Continuous monitoring of the record stream
//!
//! A single background task tails the record source, classifies every new
//! record, appends the verdicts to the ledger and refreshes the cached live
//! statistics after each batch. The supervisor is the start/stop control
//! surface over that task.

mod supervisor;


pub use supervisor::{
    ControlAction, MonitorConfig, MonitorState, MonitoringSupervisor, MonitoringSupervisorBuilder,
    RecordOutcome,
};
