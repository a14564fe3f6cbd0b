/// Result alias that carries the custom [`MetrodroneError`] type.
pub type Result<T> = std::result::Result<T, MetrodroneError>;

/// Common error type for the core crate.
///
/// Nothing in the scheduling core is fatal: a trigger on a resource that is
/// still loading is a defined no-op rather than an error, so this type mostly
/// surfaces bad configuration and I/O problems to the caller.
#[derive(Debug, thiserror::Error)]
pub enum MetrodroneError {
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Input rejected before it reached any shared state.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// The requested sound id was never registered with the pool.
    #[error("unknown sound resource `{0}`")]
    UnknownSound(String),
    /// A component lock was poisoned by a panicking callback.
    #[error("{0} lock has been poisoned")]
    Poisoned(&'static str),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// WAV decoding or encoding failure.
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
    /// Malformed configuration document.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl MetrodroneError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for MetrodroneError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for MetrodroneError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
