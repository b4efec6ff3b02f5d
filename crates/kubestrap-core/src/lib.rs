pub mod config;
pub mod error;
pub mod event;
pub mod inventory;
pub mod shell;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, StrapError};
pub use event::{EventBus, RunEvent};
pub use inventory::{ConnectionKind, Host, HostGroup, Inventory};
pub use types::*;
