//! Autonomous browser task planning and execution.
//!
//! A [`Controller`] owns one browsing session. It perceives the page into a
//! [`PageSnapshot`], interprets commands into [`Action`]s, executes them
//! through a [`BrowserDriver`], verifies the result and, for multi-step
//! tasks, keeps a [`Plan`] moving with bounded retries and replanning.

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod interpreter;
pub mod oracle;
pub mod perception;
pub mod plan;
pub mod planner;
pub mod report;
pub mod session;
pub mod snapshot;
pub mod testing;
pub mod types;
pub mod vision;

pub use config::Config;
pub use controller::Controller;
pub use driver::BrowserDriver;
pub use error::ControlError;
pub use oracle::Oracle;
pub use plan::{Plan, PlanStatus, PlanStep, StepStatus};
pub use report::{ActionReport, ControllerEvent, Outcome, PlanReport};
pub use snapshot::PageSnapshot;
pub use types::{Action, TargetSpec};
