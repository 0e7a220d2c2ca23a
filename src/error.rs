use flatbuffers::InvalidFlatbuffer;
use geozero::error::GeozeroError;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum Error {
    MissingMagicBytes,
    IllegalHeaderSize(usize),
    InvalidArgument(String),
    CorruptData(String),
    UnsupportedGeometry(u8),
    UnsupportedType(String),
    NoIndex,
    #[cfg(feature = "http")]
    HttpClient(http_range_client::HttpError),
    InvalidFlatbuffer(InvalidFlatbuffer),
    Geozero(GeozeroError),
    IO(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [Error].
///
/// `Io` failures may succeed when retried, every other kind describes a
/// problem with the data or the call itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidFormat,
    InvalidArgument,
    CorruptData,
    UnsupportedGeometry,
    UnsupportedType,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingMagicBytes
            | Error::IllegalHeaderSize(_)
            | Error::NoIndex
            | Error::InvalidFlatbuffer(_) => ErrorKind::InvalidFormat,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::CorruptData(_) => ErrorKind::CorruptData,
            Error::UnsupportedGeometry(_) => ErrorKind::UnsupportedGeometry,
            Error::UnsupportedType(_) => ErrorKind::UnsupportedType,
            Error::Geozero(GeozeroError::IoError(_)) => ErrorKind::Io,
            Error::Geozero(_) => ErrorKind::InvalidArgument,
            #[cfg(feature = "http")]
            Error::HttpClient(_) => ErrorKind::Io,
            Error::IO(_) => ErrorKind::Io,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::MissingMagicBytes => "Missing magic bytes. Is this an fgb file?".fmt(f),
            Error::IllegalHeaderSize(size) => write!(f, "Illegal header size: {size}"),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            Error::CorruptData(msg) => write!(f, "Corrupt data: {msg}"),
            Error::UnsupportedGeometry(tag) => write!(f, "Unsupported geometry type: {tag}"),
            Error::UnsupportedType(msg) => write!(f, "Unsupported type: {msg}"),
            Error::NoIndex => "Index missing".fmt(f),
            #[cfg(feature = "http")]
            Error::HttpClient(http_client) => http_client.fmt(f),
            Error::InvalidFlatbuffer(invalid_flatbuffer) => invalid_flatbuffer.fmt(f),
            Error::Geozero(geozero) => geozero.fmt(f),
            Error::IO(io) => io.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<InvalidFlatbuffer> for Error {
    fn from(value: InvalidFlatbuffer) -> Self {
        Error::InvalidFlatbuffer(value)
    }
}

impl From<GeozeroError> for Error {
    fn from(value: GeozeroError) -> Self {
        Error::Geozero(value)
    }
}

#[cfg(feature = "http")]
impl From<http_range_client::HttpError> for Error {
    fn from(value: http_range_client::HttpError) -> Self {
        Error::HttpClient(value)
    }
}

/// Lets geozero processors driven by this crate report codec failures.
impl From<Error> for GeozeroError {
    fn from(value: Error) -> Self {
        match value {
            Error::Geozero(e) => e,
            Error::IO(e) => GeozeroError::IoError(e),
            Error::UnsupportedGeometry(_) | Error::CorruptData(_) => {
                GeozeroError::Geometry(value.to_string())
            }
            Error::UnsupportedType(_) => GeozeroError::Property(value.to_string()),
            e => GeozeroError::Feature(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds() {
        assert_eq!(Error::MissingMagicBytes.kind(), ErrorKind::InvalidFormat);
        assert_eq!(Error::IllegalHeaderSize(4).kind(), ErrorKind::InvalidFormat);
        assert_eq!(
            Error::CorruptData("short read".to_string()).kind(),
            ErrorKind::CorruptData
        );
        assert_eq!(Error::UnsupportedGeometry(8).kind(), ErrorKind::UnsupportedGeometry);
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(Error::from(io).kind(), ErrorKind::Io);
    }

    #[test]
    fn display() {
        assert_eq!(
            Error::IllegalHeaderSize(4).to_string(),
            "Illegal header size: 4"
        );
        assert_eq!(
            Error::UnsupportedGeometry(9).to_string(),
            "Unsupported geometry type: 9"
        );
    }
}
