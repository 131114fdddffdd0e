//! The build engine: ties the persistent node/job graph (component A,
//! `record_store`) and rule-match index (component B, `rule_match`) to the
//! make state machine (component F), backend dispatch (component G), and
//! the Req controller a caller actually drives (component H).
//!
//! `cli` is the only consumer of this crate; everything below is plain
//! library code with no process-level concerns of its own (no argv
//! parsing, no stdout/stderr wiring) beyond what `logging`/`task_executor`
//! already centralize for every crate in the workspace.

pub mod backend;
pub mod config;
pub mod error;
pub mod graph;
pub mod make;
pub mod reason;
pub mod req;
pub mod rules;
pub mod state;

pub use config::Config;
pub use error::{EngineError, ExitCode};
pub use graph::Graph;
pub use make::{JobRunResult, JobRunner, MakeEngine};
pub use req::{ReqController, ReqSummary, TargetOutcome, TargetStatus};
pub use state::{Action, ReqId};
