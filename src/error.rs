use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("header needs {len} bytes, only {max} fit")]
    Encoding { len: usize, max: usize },
    #[error("storage {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("connection: {0}")]
    Connection(#[from] std::io::Error),
    #[error("file {0} not found")]
    MissingFile(String),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("invalid file name {0:?}")]
    InvalidFileName(String),
}

impl Error {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
