use thiserror::Error;

/// Result alias carrying the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serial error: {0}")]
    Serial(String),
    #[error("MIDI error: {0}")]
    Midi(String),
    #[error("Audio error: {0}")]
    Audio(String),
    #[error("Invalid show document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid channel: {0}. Must be between 1 and 512")]
    InvalidChannel(usize),
    #[error("Unknown {kind}: {name}")]
    UnknownItem { kind: &'static str, name: String },
    #[error("No {0} selected")]
    NothingSelected(&'static str),
    #[error("{0} is not running")]
    NotRunning(&'static str),
}

impl From<serialport::Error> for Error {
    fn from(value: serialport::Error) -> Self {
        Self::Serial(value.to_string())
    }
}
