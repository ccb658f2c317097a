//! Error taxonomy shared by both roles. Every variant is fatal to a run.

use std::io;
use std::path::PathBuf;

use crate::wire::FramingError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket create, join, bind, send or receive failed.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
    /// A datagram violated the wire layout.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    /// Source or staging file open, seek, read, write or rename failed.
    #[error("file error on {}: {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn file_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::FileIo {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
