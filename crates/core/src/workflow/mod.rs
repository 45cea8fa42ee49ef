pub mod action;
pub mod clean;
pub mod dag;
pub mod executor;
pub mod node_runner;
pub mod report;
pub mod staleness;

pub use action::{Action, Invocation, ShellAction};
pub use clean::clean;
pub use dag::{DependencyGraph, Node};
pub use executor::Executor;
pub use node_runner::{NodeResult, NodeRunner};
pub use report::{ExecutionReport, NodeReport};
pub use staleness::{Staleness, StalenessPlan, StalenessTracker};
