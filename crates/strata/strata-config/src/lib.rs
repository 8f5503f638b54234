mod config;

pub use config::{ConfigError, MboxConfig};
