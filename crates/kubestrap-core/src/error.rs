use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrapError {
    // Transport errors
    #[error("Connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    #[error("Command timed out after {timeout_ms}ms on {host}")]
    Timeout { host: String, timeout_ms: u64 },

    #[error("Command exited with code {exit_code} on {host}")]
    CommandFailed {
        host: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Run cancelled")]
    Cancelled,

    // Fact errors
    #[error("Fact already set: {0}")]
    DuplicateFact(String),

    #[error("Fact not available: {0}")]
    MissingFact(String),

    // Plan errors
    #[error("Step '{step}' consumes unknown fact '{fact}'")]
    UnknownFact { step: String, fact: String },

    #[error("Cyclic dependency between steps: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownStep { step: String, dependency: String },

    #[error("Step '{step}' targets unknown host '{host}'")]
    UnknownHost { step: String, host: String },

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Duplicate host name in inventory: {0}")]
    DuplicateHost(String),

    #[error("Step '{step}' references unknown check '{check}'")]
    UnknownCheck { step: String, check: String },

    #[error("Fact '{fact}' is produced by step '{step}' on {hosts} hosts but is not overwritable")]
    AmbiguousProducer {
        step: String,
        fact: String,
        hosts: usize,
    },

    #[error("Plan has no steps")]
    EmptyPlan,

    #[error("Template error in step '{step}': {message}")]
    Template { step: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrapError {
    /// Transient errors are retried by the engine; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StrapError::Connection { .. } | StrapError::Timeout { .. }
        )
    }

    /// Errors raised while loading or validating a plan, before anything runs.
    pub fn is_plan_error(&self) -> bool {
        matches!(
            self,
            StrapError::UnknownFact { .. }
                | StrapError::CyclicDependency(_)
                | StrapError::UnknownStep { .. }
                | StrapError::UnknownHost { .. }
                | StrapError::DuplicateStep(_)
                | StrapError::DuplicateHost(_)
                | StrapError::UnknownCheck { .. }
                | StrapError::AmbiguousProducer { .. }
                | StrapError::EmptyPlan
                | StrapError::Template { .. }
                | StrapError::Config(_)
                | StrapError::ConfigNotFound(_)
        )
    }

    /// Short machine-readable name used in reports and run logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StrapError::Connection { .. } => "connection",
            StrapError::Timeout { .. } => "timeout",
            StrapError::CommandFailed { .. } => "command",
            StrapError::Cancelled => "cancelled",
            StrapError::DuplicateFact(_) => "duplicate_fact",
            StrapError::MissingFact(_) => "missing_fact",
            StrapError::UnknownFact { .. } => "unknown_fact",
            StrapError::CyclicDependency(_) => "cyclic_dependency",
            StrapError::UnknownStep { .. } => "unknown_step",
            StrapError::UnknownHost { .. } => "unknown_host",
            StrapError::DuplicateStep(_) => "duplicate_step",
            StrapError::DuplicateHost(_) => "duplicate_host",
            StrapError::UnknownCheck { .. } => "unknown_check",
            StrapError::AmbiguousProducer { .. } => "ambiguous_producer",
            StrapError::EmptyPlan => "empty_plan",
            StrapError::Template { .. } => "template",
            StrapError::Config(_) => "config",
            StrapError::ConfigNotFound(_) => "config_not_found",
            StrapError::Io(_) => "io",
            StrapError::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, StrapError>;
