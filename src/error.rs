//! Error types for rust-keyblob

use std::fmt;
use thiserror::Error;

/// Custom `Result` type
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed caller input
    InvalidArgument,
    /// Output or input buffer too small for the declared content
    BufferTooSmall,
    /// Allocation failed
    InsufficientMemory,
    /// Stored blob or key store file is structurally malformed
    InvalidKeyFile,
    /// Key material header or sizes are inconsistent
    InvalidKeyInfo,
    /// AEAD tag or auth token signature did not verify
    KeyAuthVerifyFailed,
    /// Requested item does not exist
    NotExist,
    /// Item already exists
    AlreadyExists,
    /// Underlying cryptographic primitive failed
    CryptoEngineError,
    /// A tag appears twice in one parameter set
    DuplicateTag,
    /// A tag has an unknown kind or does not match its value
    InvalidTag,
    /// A tag is absent from a parameter set
    ParamNotExist,
    /// A parameter is present but cannot be interpreted
    ParamMalformed,
    /// Stored and requested parameter values disagree
    MismatchedTag,
    /// A mandatory parameter is missing
    MissingRequired,
    /// Algorithm or mode not supported
    NotSupported,
    /// Signature verification failed
    VerificationFailed,
    /// Component is not in a state that allows the operation
    BadState,
    /// Too many concurrent sessions
    SessionReachedLimit,
    /// Storage backend error
    StorageFailure,
    /// I/O error
    IoFailure,
    /// Configuration error
    ConfigurationError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            Self::BufferTooSmall => write!(f, "BUFFER_TOO_SMALL"),
            Self::InsufficientMemory => write!(f, "INSUFFICIENT_MEMORY"),
            Self::InvalidKeyFile => write!(f, "INVALID_KEY_FILE"),
            Self::InvalidKeyInfo => write!(f, "INVALID_KEY_INFO"),
            Self::KeyAuthVerifyFailed => write!(f, "KEY_AUTH_VERIFY_FAILED"),
            Self::NotExist => write!(f, "NOT_EXIST"),
            Self::AlreadyExists => write!(f, "ALREADY_EXISTS"),
            Self::CryptoEngineError => write!(f, "CRYPTO_ENGINE_ERROR"),
            Self::DuplicateTag => write!(f, "DUPLICATE_TAG"),
            Self::InvalidTag => write!(f, "INVALID_TAG"),
            Self::ParamNotExist => write!(f, "PARAM_NOT_EXIST"),
            Self::ParamMalformed => write!(f, "PARAM_MALFORMED"),
            Self::MismatchedTag => write!(f, "MISMATCHED_TAG"),
            Self::MissingRequired => write!(f, "MISSING_REQUIRED"),
            Self::NotSupported => write!(f, "NOT_SUPPORTED"),
            Self::VerificationFailed => write!(f, "VERIFICATION_FAILED"),
            Self::BadState => write!(f, "BAD_STATE"),
            Self::SessionReachedLimit => write!(f, "SESSION_REACHED_LIMIT"),
            Self::StorageFailure => write!(f, "STORAGE_FAILURE"),
            Self::IoFailure => write!(f, "IO_FAILURE"),
            Self::ConfigurationError => write!(f, "CONFIGURATION_ERROR"),
        }
    }
}

impl ErrorCode {
    /// Numeric status code reported to callers.
    ///
    /// Values are stable and negative; `0` is reserved for success.
    pub const fn status(&self) -> i32 {
        match self {
            Self::InvalidArgument => -3,
            Self::BufferTooSmall => -4,
            Self::InsufficientMemory => -5,
            Self::InvalidKeyFile => -27,
            Self::InvalidKeyInfo => -11,
            Self::KeyAuthVerifyFailed => -30,
            Self::NotExist => -13,
            Self::AlreadyExists => -14,
            Self::CryptoEngineError => -31,
            Self::DuplicateTag => -40,
            Self::InvalidTag => -41,
            Self::ParamNotExist => -42,
            Self::ParamMalformed => -43,
            Self::MismatchedTag => -44,
            Self::MissingRequired => -45,
            Self::NotSupported => -6,
            Self::VerificationFailed => -38,
            Self::BadState => -2,
            Self::SessionReachedLimit => -127,
            Self::StorageFailure => -20,
            Self::IoFailure => -21,
            Self::ConfigurationError => -22,
        }
    }
}

/// `rust-keyblob` error type with operation context
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed caller input
    #[error("invalid argument during {operation}: {message}")]
    InvalidArgument {
        /// The operation that rejected the input
        operation: String,
        /// What was wrong with the input
        message: String,
    },

    /// A buffer is too small for the declared content
    #[error("buffer too small during {operation}: need {needed}, have {available}")]
    BufferTooSmall {
        /// The operation that ran out of room
        operation: String,
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Allocation or size limit exceeded
    #[error("insufficient memory during {operation}")]
    InsufficientMemory {
        /// The operation that failed to allocate
        operation: String,
    },

    /// A stored file is structurally malformed and must not be trusted
    #[error("invalid key file: {message}")]
    InvalidKeyFile {
        /// Detailed error message
        message: String,
    },

    /// Key material header or size fields are inconsistent
    #[error("invalid key info: {message}")]
    InvalidKeyInfo {
        /// Detailed error message
        message: String,
    },

    /// Authentication of stored key material or an auth token failed
    ///
    /// Deliberately carries no detail about which check failed.
    #[error("key auth verify failed")]
    KeyAuthVerifyFailed,

    /// The requested key, file or session does not exist
    #[error("{what} does not exist")]
    NotExist {
        /// Description of the missing item
        what: String,
    },

    /// The item already exists
    #[error("{what} already exists")]
    AlreadyExists {
        /// Description of the existing item
        what: String,
    },

    /// Cryptographic primitive failed
    #[error("cryptographic error during {operation}: {message}")]
    CryptoEngineError {
        /// The operation that was being performed when the error occurred
        operation: String,
        /// Detailed error message
        message: String,
    },

    /// The same tag was added twice
    #[error("duplicate tag {tag:#010x}")]
    DuplicateTag {
        /// Raw tag value
        tag: u32,
    },

    /// The tag kind is unknown or does not match the value
    #[error("invalid tag {tag:#010x}")]
    InvalidTag {
        /// Raw tag value
        tag: u32,
    },

    /// The tag is not present in the parameter set
    #[error("param {tag:#010x} not present")]
    ParamNotExist {
        /// Raw tag value
        tag: u32,
    },

    /// The parameter is present but cannot be interpreted
    #[error("param {tag:#010x} malformed: {message}")]
    ParamMalformed {
        /// Raw tag value
        tag: u32,
        /// Detailed error message
        message: String,
    },

    /// Stored and requested parameter values disagree
    #[error("tag {tag:#010x} mismatch: expected {expected}, got {actual}")]
    MismatchedTag {
        /// Raw tag value
        tag: u32,
        /// Value fixed in the key's policy
        expected: String,
        /// Value supplied by the request
        actual: String,
    },

    /// A mandatory parameter is missing from the policy or the request
    #[error("required tag {tag:#010x} missing from {location}")]
    MissingRequired {
        /// Raw tag value
        tag: u32,
        /// Where it was expected ("key policy" or "request")
        location: String,
    },

    /// Algorithm, mode or operation not supported
    #[error("not supported: {message}")]
    NotSupported {
        /// What was requested
        message: String,
    },

    /// Signature did not verify
    #[error("signature verification failed")]
    VerificationFailed,

    /// Component is in the wrong state
    #[error("bad state during {operation}: {message}")]
    BadState {
        /// The operation that was attempted
        operation: String,
        /// Current state description
        message: String,
    },

    /// Session table is full
    #[error("session limit of {limit} reached")]
    SessionReachedLimit {
        /// Configured limit
        limit: usize,
    },

    /// Storage backend failed
    #[error("storage error during {operation}: {message}")]
    StorageError {
        /// The operation that was being performed when the error occurred
        operation: String,
        /// Detailed error message
        message: String,
        /// Optional filesystem path involved in the operation
        path: Option<String>,
    },

    /// I/O error with context
    #[error("I/O error during {operation}: {source}")]
    IoError {
        /// The I/O operation that failed
        operation: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    ConfigurationError {
        /// Description of the configuration problem
        message: String,
    },
}

impl Error {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::BufferTooSmall { .. } => ErrorCode::BufferTooSmall,
            Self::InsufficientMemory { .. } => ErrorCode::InsufficientMemory,
            Self::InvalidKeyFile { .. } => ErrorCode::InvalidKeyFile,
            Self::InvalidKeyInfo { .. } => ErrorCode::InvalidKeyInfo,
            Self::KeyAuthVerifyFailed => ErrorCode::KeyAuthVerifyFailed,
            Self::NotExist { .. } => ErrorCode::NotExist,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::CryptoEngineError { .. } => ErrorCode::CryptoEngineError,
            Self::DuplicateTag { .. } => ErrorCode::DuplicateTag,
            Self::InvalidTag { .. } => ErrorCode::InvalidTag,
            Self::ParamNotExist { .. } => ErrorCode::ParamNotExist,
            Self::ParamMalformed { .. } => ErrorCode::ParamMalformed,
            Self::MismatchedTag { .. } => ErrorCode::MismatchedTag,
            Self::MissingRequired { .. } => ErrorCode::MissingRequired,
            Self::NotSupported { .. } => ErrorCode::NotSupported,
            Self::VerificationFailed => ErrorCode::VerificationFailed,
            Self::BadState { .. } => ErrorCode::BadState,
            Self::SessionReachedLimit { .. } => ErrorCode::SessionReachedLimit,
            Self::StorageError { .. } => ErrorCode::StorageFailure,
            Self::IoError { .. } => ErrorCode::IoFailure,
            Self::ConfigurationError { .. } => ErrorCode::ConfigurationError,
        }
    }

    /// Status code as seen by a caller
    pub fn status(&self) -> i32 {
        self.code().status()
    }

    /// Create an invalid argument error
    pub fn invalid_argument<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::InvalidArgument {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a crypto error with context
    pub fn crypto<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::CryptoEngineError {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a storage error with context
    pub fn storage<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::StorageError {
            operation: operation.into(),
            message: message.into(),
            path: None,
        }
    }

    /// Create a storage error with path context
    pub fn storage_with_path<O: Into<String>, M: Into<String>, P: Into<String>>(
        operation: O,
        message: M,
        path: P,
    ) -> Self {
        Self::StorageError {
            operation: operation.into(),
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Create an invalid key file error
    pub fn invalid_key_file<M: Into<String>>(message: M) -> Self {
        Self::InvalidKeyFile {
            message: message.into(),
        }
    }

    /// Create an invalid key info error
    pub fn invalid_key_info<M: Into<String>>(message: M) -> Self {
        Self::InvalidKeyInfo {
            message: message.into(),
        }
    }

    /// Create a not-exist error
    pub fn not_exist<W: Into<String>>(what: W) -> Self {
        Self::NotExist { what: what.into() }
    }

    /// Create a not-supported error
    pub fn not_supported<M: Into<String>>(message: M) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    /// Create an I/O error with the operation that failed
    pub fn io<O: Into<String>>(operation: O, source: std::io::Error) -> Self {
        Self::IoError {
            operation: operation.into(),
            source,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageError { .. }
                | Self::IoError { .. }
                | Self::BufferTooSmall { .. }
                | Self::InsufficientMemory { .. }
        )
    }

    /// Check if the error means stored data could not be authenticated
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::KeyAuthVerifyFailed)
    }

    /// Check if the error means a stored blob is structurally unusable
    pub fn is_corrupt_blob(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::InvalidKeyFile
                | ErrorCode::InvalidKeyInfo
                | ErrorCode::KeyAuthVerifyFailed
                | ErrorCode::BufferTooSmall
                | ErrorCode::InvalidArgument
                | ErrorCode::DuplicateTag
                | ErrorCode::InvalidTag
                | ErrorCode::ParamMalformed
                | ErrorCode::ParamNotExist
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            operation: "unknown".to_string(),
            source: err,
        }
    }
}
