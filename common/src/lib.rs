pub mod config;
pub mod progress;
pub mod token;

pub use config::{ClusterConfig, ConfigError};
pub use token::DiscoveryToken;

#[macro_export]
macro_rules! exit {
    ($err:expr, $($arg:tt)*) => {
        {
            tracing::error!($($arg)*);
            anyhow::bail!($err)
        }
    };
}
