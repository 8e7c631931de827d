pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("coherence error: {0}")]
    Coherence(String),

    #[error("device {device} failed during {op}: {message}")]
    Device {
        device: usize,
        op: &'static str,
        message: String,
    },

    #[error("queue error: {0}")]
    Queue(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn scheduler<S: Into<String>>(msg: S) -> Self {
        Error::Scheduler(msg.into())
    }

    pub fn coherence<S: Into<String>>(msg: S) -> Self {
        Error::Coherence(msg.into())
    }

    pub fn device<S: Into<String>>(device: usize, op: &'static str, msg: S) -> Self {
        Error::Device {
            device,
            op,
            message: msg.into(),
        }
    }

    pub fn queue<S: Into<String>>(msg: S) -> Self {
        Error::Queue(msg.into())
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Configuration mistakes and device failures have no recovery path.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Device { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// Print a diagnostic and terminate with a non-zero status.
pub fn fatal(err: &Error) -> ! {
    tracing::error!(error = %err, "unrecoverable error, terminating");
    eprintln!("vdev: fatal: {}", err);
    std::process::exit(1)
}

/// Extension for call sites at the interception boundary, where fatal errors
/// terminate the process instead of propagating.
pub trait OrExit<T> {
    fn or_exit(self) -> Result<T>;
}

impl<T> OrExit<T> for Result<T> {
    fn or_exit(self) -> Result<T> {
        match self {
            Err(err) if err.is_fatal() => fatal(&err),
            other => other,
        }
    }
}
