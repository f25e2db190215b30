use thiserror::Error;

use crate::pipeline::HelperKind;

/// Failures raised while registering, ordering or running pipeline helpers.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{kind} helper '{key}' is already registered")]
    DuplicateHelperKey { kind: HelperKind, key: String },

    #[error("helper '{key}' has kind {actual} but was registered as {expected}")]
    HelperKindMismatch {
        key: String,
        expected: HelperKind,
        actual: HelperKind,
    },

    #[error("dependency cycle detected among {kind} helpers: {}", members.join(", "))]
    CyclicDependency {
        kind: HelperKind,
        members: Vec<String>,
    },

    #[error("{kind} helper '{key}' failed")]
    HelperExecution { kind: HelperKind, key: String },
}

/// Failures raised by the transactional workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("a workspace transaction is already active")]
    TransactionActive,

    #[error("no workspace transaction is active")]
    NoActiveTransaction,

    #[error("path '{0}' resolves outside the workspace root")]
    OutsideRoot(String),

    #[error("transaction failed: {message}")]
    Transaction { message: String },
}
