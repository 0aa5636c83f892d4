use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlSslMode};

use crate::SerializableSecretString;
use crate::shared::ValidationError;

/// The charset applied to all downstream MySQL connections.
const DEFAULT_CHARSET: &str = "utf8mb4";

/// Configuration for connecting to a MySQL database.
///
/// This struct holds all necessary connection parameters and settings. It is
/// the `db_config` half of the downstream metadata a task resolves before its
/// coordinated DDLs can be applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MySqlConnectionConfig {
    /// Hostname or IP address of the MySQL server.
    pub host: String,
    /// Port number on which the MySQL server is listening.
    pub port: u16,
    /// Name of the MySQL database to connect to.
    pub name: String,
    /// Username for authenticating with the MySQL server.
    pub username: String,
    /// Password for the specified user. This field is sensitive and redacted in debug output.
    pub password: Option<SerializableSecretString>,
    /// TLS configuration for secure connections.
    pub tls: TlsConfig,
}

impl MySqlConnectionConfig {
    /// Validates the [`MySqlConnectionConfig`].
    ///
    /// Checks the host and port fields and delegates TLS validation to
    /// [`TlsConfig::validate`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "host",
                reason: "cannot be empty".to_string(),
            });
        }
        if self.port == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "port",
                reason: "cannot be zero".to_string(),
            });
        }

        self.tls.validate()
    }
}

/// TLS settings for secure MySQL connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TlsConfig {
    /// PEM-encoded trusted root certificates.
    pub trusted_root_certs: String,
    /// Whether TLS is enabled for the connection.
    pub enabled: bool,
}

impl TlsConfig {
    /// Validates the [`TlsConfig`].
    ///
    /// If [`TlsConfig::enabled`] is true, this method checks that
    /// [`TlsConfig::trusted_root_certs`] is not empty.
    ///
    /// Returns [`ValidationError::MissingTrustedRootCerts`] if TLS is enabled but no
    /// certificates are provided.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.trusted_root_certs.is_empty() {
            return Err(ValidationError::MissingTrustedRootCerts);
        }

        Ok(())
    }
}

/// A trait which can be used to convert the implementation into crate
/// specific connect options. Connection parameters stay centralized in
/// [`MySqlConnectionConfig`] and each client crate gets its own impl.
pub trait IntoConnectOptions<Output> {
    /// Creates connection options for connecting to the MySQL server without
    /// specifying a database.
    ///
    /// Returns [`Output`] configured with the host, port, username, SSL mode
    /// and optional password from this instance. Useful for administrative
    /// operations that must be performed before connecting to a specific
    /// database, like database creation.
    fn without_db(&self) -> Output;

    /// Creates connection options for connecting to a specific database.
    ///
    /// Returns [`Output`] configured with all connection parameters including
    /// the database name from this instance.
    fn with_db(&self) -> Output;
}

impl IntoConnectOptions<MySqlConnectOptions> for MySqlConnectionConfig {
    fn without_db(&self) -> MySqlConnectOptions {
        let ssl_mode = if self.tls.enabled {
            MySqlSslMode::VerifyIdentity
        } else {
            MySqlSslMode::Preferred
        };
        let mut options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .charset(DEFAULT_CHARSET)
            .ssl_mode(ssl_mode)
            .ssl_ca_from_pem(self.tls.trusted_root_certs.clone().into_bytes());

        if let Some(password) = &self.password {
            options = options.password(password.expose_secret());
        }

        options
    }

    fn with_db(&self) -> MySqlConnectOptions {
        let options: MySqlConnectOptions = self.without_db();
        options.database(&self.name)
    }
}
