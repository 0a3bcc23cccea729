use std::fmt;
use std::path::PathBuf;

/// A protocol line that could not be turned into an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(line: &str, reason: impl Into<String>) -> Self {
        ParseError {
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error parsing command: [{}]: {}", self.line.escape_default(), self.reason)
    }
}

impl std::error::Error for ParseError {}

/// An action that named a ground atom which cannot take the requested transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomStateError {
    UnknownAtom(String),
    AlreadyObserved(String),
}

impl fmt::Display for AtomStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomStateError::UnknownAtom(atom) => write!(f, "Atom does not exist: {}", atom),
            AtomStateError::AlreadyObserved(atom) => {
                write!(f, "Atom is not a random variable: {}", atom)
            }
        }
    }
}

impl std::error::Error for AtomStateError {}

#[derive(Debug)]
pub enum InferenceError {
    Parse(ParseError),
    AtomState(AtomStateError),
    /// Short read or write against a cache page. Never retried.
    PageIo {
        path: PathBuf,
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    MissingPage(PathBuf),
    Config(String),
    Protocol(String),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Json(serde_json::Error),
    Io(std::io::Error),
    Other(String),
}

impl InferenceError {
    /// Fatal errors stop the optimizer; the rest are reported back to a client.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, InferenceError::Parse(_) | InferenceError::AtomState(_))
    }
}

impl fmt::Display for InferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceError::Parse(e) => write!(f, "{}", e),
            InferenceError::AtomState(e) => write!(f, "{}", e),
            InferenceError::PageIo { path, what, expected, actual } => write!(
                f,
                "Short read for {}. Page: [{}], expected size: {}, read size: {}.",
                what,
                path.display(),
                expected,
                actual
            ),
            InferenceError::MissingPage(path) => {
                write!(f, "Unable to read cache page: [{}].", path.display())
            }
            InferenceError::Config(e) => write!(f, "Config error: {}", e),
            InferenceError::Protocol(e) => write!(f, "Protocol error: {}", e),
            InferenceError::Serialization(e) => write!(f, "Serialization error: {}", e),
            InferenceError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            InferenceError::Json(e) => write!(f, "JSON error: {}", e),
            InferenceError::Io(e) => write!(f, "IO error: {}", e),
            InferenceError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for InferenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InferenceError::Io(e) => Some(e),
            InferenceError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ParseError> for InferenceError {
    fn from(err: ParseError) -> Self {
        InferenceError::Parse(err)
    }
}

impl From<AtomStateError> for InferenceError {
    fn from(err: AtomStateError) -> Self {
        InferenceError::AtomState(err)
    }
}

impl From<bincode::error::EncodeError> for InferenceError {
    fn from(err: bincode::error::EncodeError) -> Self {
        InferenceError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for InferenceError {
    fn from(err: bincode::error::DecodeError) -> Self {
        InferenceError::Deserialization(Box::new(err))
    }
}

impl From<serde_json::Error> for InferenceError {
    fn from(err: serde_json::Error) -> Self {
        InferenceError::Json(err)
    }
}

impl From<std::io::Error> for InferenceError {
    fn from(err: std::io::Error) -> Self {
        InferenceError::Io(err)
    }
}

impl From<String> for InferenceError {
    fn from(err: String) -> Self {
        InferenceError::Other(err)
    }
}

impl From<&str> for InferenceError {
    fn from(err: &str) -> Self {
        InferenceError::Other(err.to_string())
    }
}
