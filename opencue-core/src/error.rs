use thiserror::Error;

/// All errors produced by opencue-core.
#[derive(Debug, Error)]
pub enum OpenCueError {
    #[error("audio capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("transient capture error: {0}")]
    CaptureTransient(String),

    #[error("resample error: {0}")]
    Resample(String),

    #[error("no transcriber configured")]
    TranscriberUnavailable,

    #[error("transcription failed: {0}")]
    TranscriberFailed(String),

    #[error("cue file not found: {0}")]
    CueFileNotFound(String),

    #[error("cue file corrupt: {0}")]
    CueFileCorrupt(String),

    #[error("lexicon corrupt: {0}")]
    LexiconCorrupt(String),

    #[error("invalid lexicon pattern for '{word}': {reason}")]
    PatternInvalid { word: String, reason: String },

    #[error("persistence IO error: {0}")]
    PersistIo(#[from] std::io::Error),

    #[error("client channel send failed: {0}")]
    ChannelSendFailed(String),

    #[error("advisor timed out")]
    AdvisorTimeout,

    #[error("advisor returned an unusable reply: {0}")]
    AdvisorBadReply(String),

    #[error("bad protocol message: {0}")]
    ProtocolBadMessage(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OpenCueError>;
