use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChorusError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Chat store error: {0}")]
    ChatStore(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Engine stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ChorusError {
    /// Whether a bounded retry at the call site is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Gateway(_)
                | Self::ChatStore(_)
                | Self::Subscription(_)
                | Self::Timeout(_)
                | Self::Io(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

pub type Result<T> = std::result::Result<T, ChorusError>;
