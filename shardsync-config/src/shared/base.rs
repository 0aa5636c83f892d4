use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
    /// A required field holds an unusable value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidFieldValue { field: &'static str, reason: String },
}
