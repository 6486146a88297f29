use thiserror::Error;

/// Top-level error for the update agent
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    #[error("flash error: {0}")]
    Flash(#[from] FlashError),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("extension error: {0}")]
    Extension(#[from] ExtensionError),

    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Errors from the persistent channel client (WebSocket + topic multiplexing)
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("join rejected on topic {topic}: {reason}")]
    JoinRejected { topic: String, reason: String },

    #[error("too many redirects (max {max})")]
    TooManyRedirects { max: u8 },

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("message parsing error: {0}")]
    MessageParsing(String),

    #[error("timeout waiting for {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    #[error("channel closed")]
    Closed,
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors from the resumable HTTP downloader
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("http error: status {0}")]
    HttpStatus(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("max disconnects reached ({0})")]
    MaxDisconnectsReached(u32),

    #[error("max timeout reached")]
    MaxTimeoutReached,

    #[error("idle timeout")]
    IdleTimeout,

    #[error("handler aborted download: {0}")]
    HandlerAborted(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors from the firmware flasher adapter
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("flasher process failed (code {code:?}): {message}")]
    Process { code: Option<i32>, message: String },

    #[error("flasher already running")]
    AlreadyRunning,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FlashResult<T> = Result<T, FlashError>;

/// Errors from the archive manager
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Errors from the extensions registry
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("unknown extension: {0}")]
    Unknown(String),

    #[error("extension not in allow-list: {0}")]
    NotAllowed(String),

    #[error("extension already attached: {0}")]
    AlreadyAttached(String),

    #[error("extension not attached: {0}")]
    NotAttached(String),
}

pub type ExtensionResult<T> = Result<T, ExtensionError>;

/// Errors from bounded script execution
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("timeout")]
    Timeout,

    #[error("execution failed: {0}")]
    Failed(String),
}

pub type ScriptResult<T> = Result<T, ScriptError>;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
