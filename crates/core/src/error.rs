//! Error types for the staging/launch pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Exit code reported when invocation arguments fail validation
pub const EXIT_CONFIG: i32 = 220;
/// Exit code reported when `VCAP_PLATFORM_OPTIONS` cannot be decoded
pub const EXIT_PLATFORM_OPTIONS: i32 = 221;
/// Exit code reported when secret interpolation fails
pub const EXIT_INTERPOLATION: i32 = 222;
/// Exit code reported when a required document cannot be parsed
pub const EXIT_PARSE: i32 = 223;
/// Exit code reported when staging outputs cannot be produced
pub const EXIT_MANIFEST: i32 = 224;
/// Exit code reported when the target process image could not be started
pub const EXIT_LAUNCH: i32 = 225;

/// Error types for the staging/launch pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid invocation arguments
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Platform options payload present but undecodable
    #[error("Invalid platform options: {0}")]
    PlatformOptions(String),

    /// Client certificate, key or trust roots missing for the secret manager
    #[error("Missing secret manager credentials: {0}")]
    MissingCredentialMaterial(String),

    /// Secret manager call failed (transport, status or body)
    #[error("Unable to interpolate credential references: {0}")]
    Interpolation(String),

    /// A document the pipeline depends on is malformed
    #[error("Failed to parse {what}: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Launch manifest or staging result could not be produced
    #[error("Invalid launch manifest: {0}")]
    Manifest(String),

    /// Replacing the process image failed
    #[error("Failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Process exit code for this error.
    ///
    /// All codes sit in a reserved band so an orchestrator can tell a
    /// pipeline failure (the app never started) apart from the exit status
    /// of the launched application itself.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => EXIT_CONFIG,
            Error::PlatformOptions(_) => EXIT_PLATFORM_OPTIONS,
            Error::MissingCredentialMaterial(_) | Error::Interpolation(_) => EXIT_INTERPOLATION,
            Error::Parse { .. } => EXIT_PARSE,
            Error::Manifest(_) | Error::Io(_) | Error::Yaml(_) => EXIT_MANIFEST,
            Error::Launch { .. } => EXIT_LAUNCH,
        }
    }

    pub(crate) fn parse(what: &'static str, source: serde_json::Error) -> Self {
        Error::Parse { what, source }
    }
}
