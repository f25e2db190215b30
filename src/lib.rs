pub mod apply;
pub mod config;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod reporter;
pub mod workspace;

pub use apply::{ApplyEngine, ApplyFlags, ApplyOutcome};
pub use config::{ApplyLayout, ToolchainConfig};
pub use error::{PipelineError, WorkspaceError};
pub use pipeline::{Pipeline, PipelineRunResult, RunOptions};
pub use reporter::{Reporter, TracingReporter};
pub use workspace::Workspace;
