//! Error types shared across the crate
//!
//! Expected failures (validation, structural, capacity) come back as `Err`
//! values. Nothing in here is fatal to the process.

/// A dot-path that cannot address anything
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path `{0}` contains an empty segment")]
    EmptySegment(String),
    /// A sequence index that does not name an existing element
    #[error("segment `{segment}` is not an index of a sequence of {len}")]
    IndexOutOfRange { segment: String, len: usize },
    /// A segment below a number, string or bool
    #[error("cannot descend into a {kind} at `{segment}`")]
    NotTraversable { segment: String, kind: &'static str },
}

/// A write rejected before touching the tree
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Path(#[from] PathError),
    /// A registered rule returned an error description
    #[error("validation failed at `{path}`: {message}")]
    Rule { path: String, message: String },
    /// NaN or infinity somewhere in the written value
    #[error("non-finite number written to `{0}`")]
    NonFinite(String),
}

/// Durable storage backend failure
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend unavailable")]
    Unavailable,
    #[error("storage read of `{key}` failed: {message}")]
    Read { key: String, message: String },
    #[error("storage write of `{key}` failed: {message}")]
    Write { key: String, message: String },
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Save/load pipeline failures
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Blob lacks required shape
    #[error("save is structurally invalid: {0}")]
    Structural(String),
    /// A registered migration transform failed
    #[error("migration {from} -> {to} failed: {message}")]
    Migration {
        from: String,
        to: String,
        message: String,
    },
    /// Serialized save exceeds the configured ceiling
    #[error("save is {size} bytes, limit is {limit}")]
    Capacity { size: usize, limit: usize },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("a save is already in progress")]
    SaveInProgress,
    #[error("no save found under `{0}`")]
    NotFound(String),
    /// A subsystem rejected its snapshot during load
    #[error("subsystem `{name}` rejected its state: {source}")]
    Subsystem {
        name: String,
        #[source]
        source: StateError,
    },
}

/// A scheduler system reported a runtime failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SystemError(pub String);

impl SystemError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<ValidationError> for SystemError {
    fn from(err: ValidationError) -> Self {
        Self(err.to_string())
    }
}

/// Gate failure for a timeline ability
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AbilityError {
    #[error("ability `{0}` is locked")]
    Locked(&'static str),
    #[error("ability `{ability}` needs {cost} energy, {available} available")]
    InsufficientEnergy {
        ability: &'static str,
        cost: f64,
        available: f64,
    },
}

/// A subsystem snapshot that cannot be applied
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("malformed state: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("state out of range: {0}")]
    OutOfRange(String),
    #[error("state root must be a map, got {0}")]
    NotAMap(&'static str),
}
