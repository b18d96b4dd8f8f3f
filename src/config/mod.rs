//! Engine settings loaded from `config.toml`.

mod loader;
mod types;

pub use loader::ConfigError;
pub use types::{
    Config, RestartSection, ScrollbackSection, StoreSection, SupervisorSection, TerminalSection,
};
