//! Error types for the interception proxy

/// Errors from certificate management and relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("root authority error: {0}")]
    Authority(String),

    #[error("certificate mint failed for {host}: {message}")]
    Mint { host: String, message: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("upstream connect to {addr} failed: {message}")]
    Upstream { addr: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for interception operations.
pub type Result<T> = std::result::Result<T, Error>;
