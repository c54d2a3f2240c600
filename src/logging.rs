//! Logging bootstrap.
//!
//! Grounded in the teacher's `lib.rs` `init()`/`shutdown()` pair, which
//! gates a `nebula-log`/`tracing` call behind a `logging` feature. Here the
//! `UMF_LOG_LEVEL` environment variable from spec §6 drives a
//! `tracing_subscriber::EnvFilter`.

/// Log verbosity levels from spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    /// Parses `UMF_LOG_LEVEL`-style values, defaulting to `Info` on an
    /// unset or unrecognized value.
    #[must_use]
    pub fn from_env_str(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "DEBUG" => Self::Debug,
            "WARNING" | "WARN" => Self::Warning,
            "ERROR" => Self::Error,
            "FATAL" => Self::Fatal,
            _ => Self::Info,
        }
    }

    #[cfg(feature = "logging")]
    fn as_tracing_level(self) -> tracing::Level {
        match self {
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warning => tracing::Level::WARN,
            Self::Error | Self::Fatal => tracing::Level::ERROR,
        }
    }
}

/// Installs a process-wide `tracing` subscriber reading `UMF_LOG_LEVEL`.
///
/// Idempotent: a second call after a subscriber is already installed is a
/// no-op, mirroring the teacher's `init()` being safe to call more than
/// once during test setup.
#[cfg(feature = "logging")]
pub fn init() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let level = std::env::var("UMF_LOG_LEVEL")
            .map(|v| LogLevel::from_env_str(&v))
            .unwrap_or(LogLevel::Info);
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(level.as_tracing_level())
            .finish();
        // A binary embedding this library may already have installed its
        // own subscriber; that's not an error for us.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

#[cfg(not(feature = "logging"))]
pub fn init() {}
