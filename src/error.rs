use thiserror::Error;

/// Result type for trafficmirror operations.
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Errors that can occur while configuring or running the proxy.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// The password file could not be read.
    #[error("failed to read password file {path}: {source}")]
    PasswordFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The password file was read but did not contain a `username:password` line.
    #[error("failed to parse username/password from {path}: expected 'username:password'")]
    PasswordFileFormat { path: String },

    /// A configured URL (primary or mirror target) failed to parse.
    #[error("invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// Building the shared reqwest client failed.
    #[error("failed to construct HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Binding a listener socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
