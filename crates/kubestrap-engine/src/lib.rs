pub mod actions;
pub mod checks;
pub mod engine;
pub mod executor;
pub mod facts;
pub mod plan;
pub mod report;
pub mod retry;
pub mod run_log;
pub mod template;

pub use checks::{CheckRegistry, CommandCheck};
pub use engine::{Engine, EngineOptions};
pub use executor::RemoteExecutor;
pub use facts::{FactKey, FactStore};
pub use plan::{ConsumedFact, Phase, Plan, Step};
pub use report::{HostSummary, RunReport};
pub use run_log::RunLogger;
