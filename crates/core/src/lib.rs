// Core engine for ruleflow, a dependency-graph rule executor

pub mod config;
pub mod error;
pub mod events;
pub mod paths;
pub mod registry;
pub mod resolver;
pub mod rulefile;
pub mod storage;
pub mod template;
pub mod types;
pub mod workflow;

pub use config::{EngineConfig, StalenessMode, WorkflowConfig};
pub use error::{ActionError, ConfigurationError, EngineError, EngineResult, GraphError};
pub use registry::TargetRegistry;
pub use resolver::ReferenceResolver;
pub use rulefile::Workflow;
pub use types::*;
