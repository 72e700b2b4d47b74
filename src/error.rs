use std::str::Utf8Error;

use packed_struct::PackingError;

/// When things go awry
#[derive(Debug)]
pub enum HerdNsError {
    BytePackingError(String),
    InvalidName,
    InvalidHeader(String),
    IoError(std::io::Error),
    /// Something failed in the start up of the platform
    StartupError(String),
    ConfigError(String),
    FileError(String),
    EmptyFile,
    /// Failed to send something across a tokio channel
    SendError(String),
    Utf8Error(Utf8Error),
    /// A TSIG RR was present but did not validate
    TsigInvalid,
    /// The script pool had no free interpreter to lease
    NoFreeInterpreter,
    /// A plugin chain handler returned an error
    PluginError(String),
    Generic(String),
    Regex(String),
    InvalidValue(String),
}

impl From<regex::Error> for HerdNsError {
    fn from(error: regex::Error) -> Self {
        HerdNsError::Regex(error.to_string())
    }
}

impl From<std::io::Error> for HerdNsError {
    fn from(error: std::io::Error) -> Self {
        HerdNsError::IoError(error)
    }
}

impl From<PackingError> for HerdNsError {
    fn from(error: PackingError) -> Self {
        HerdNsError::BytePackingError(error.to_string())
    }
}

impl From<Utf8Error> for HerdNsError {
    fn from(error: Utf8Error) -> Self {
        HerdNsError::Utf8Error(error)
    }
}

impl From<config::ConfigError> for HerdNsError {
    fn from(error: config::ConfigError) -> Self {
        HerdNsError::ConfigError(error.to_string())
    }
}

impl From<toml::de::Error> for HerdNsError {
    fn from(error: toml::de::Error) -> Self {
        HerdNsError::ConfigError(error.to_string())
    }
}

impl std::fmt::Display for HerdNsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for HerdNsError {}

impl From<HerdNsError> for std::io::Error {
    fn from(error: HerdNsError) -> Self {
        match error {
            HerdNsError::IoError(err) => err,
            HerdNsError::StartupError(err) => {
                std::io::Error::new(std::io::ErrorKind::Other, err)
            }
            HerdNsError::ConfigError(err) => std::io::Error::new(std::io::ErrorKind::Other, err),
            HerdNsError::FileError(err) => std::io::Error::new(std::io::ErrorKind::Other, err),
            HerdNsError::EmptyFile => {
                std::io::Error::new(std::io::ErrorKind::Other, "Empty file")
            }
            HerdNsError::SendError(err) => std::io::Error::new(std::io::ErrorKind::Other, err),
            _ => std::io::Error::new(std::io::ErrorKind::Other, format!("{:?}", error)),
        }
    }
}
