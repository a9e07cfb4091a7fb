use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("child process has no piped {0}")]
    MissingPipe(&'static str),
    #[error("debug session {0} is closed")]
    SessionClosed(u64),
    #[error("dip switch index {0} is out of range")]
    SwitchIndex(usize),
    #[error("panel channel is disconnected")]
    ChannelClosed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
