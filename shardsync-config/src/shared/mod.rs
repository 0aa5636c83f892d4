mod base;
mod connection;

pub use base::ValidationError;
pub use connection::{IntoConnectOptions, MySqlConnectionConfig, TlsConfig};
