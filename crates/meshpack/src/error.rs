//! Error types for encoding, decoding and optimization.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error returned by every fallible entry point.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The encoded bytes can not be decoded with the caller's parameters.
    #[error("corrupt stream: {0}")]
    CorruptStream(#[from] StreamError),
    /// The caller passed arguments that break a documented precondition.
    #[error("precondition violated: {0}")]
    PreconditionViolation(#[from] Precondition),
}

impl Error {
    /// Returns `true` for decode-time stream corruption.
    #[must_use]
    pub fn is_corrupt_stream(&self) -> bool {
        matches!(self, Self::CorruptStream(_))
    }

    /// Returns `true` for caller-side precondition violations.
    #[must_use]
    pub fn is_precondition_violation(&self) -> bool {
        matches!(self, Self::PreconditionViolation(_))
    }
}

/// Reasons an encoded blob is rejected by a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("unknown header tag {found:#04x}, expected {expected:#04x}")]
    UnknownTag { expected: u8, found: u8 },
    #[error("unsupported format version {found} (newest known is {newest})")]
    UnsupportedVersion { newest: u8, found: u8 },
    #[error("element count mismatch: caller expects {expected}, stream holds {found}")]
    CountMismatch { expected: usize, found: usize },
    #[error("stride mismatch: caller expects {expected}, stream holds {found}")]
    StrideMismatch { expected: usize, found: usize },
    #[error("unexpected end of stream at byte {position}")]
    UnexpectedEof { position: usize },
    #[error("{count} unexpected bytes before the stream tail")]
    TrailingBytes { count: usize },
    #[error("decoded index {index} is out of range for {vertex_count} vertices")]
    IndexOutOfRange { index: u32, vertex_count: usize },
    #[error("auxiliary code table references escaped indices")]
    InvalidCodeTable,
    #[error("unknown vertex channel mode {mode}")]
    InvalidChannelMode { mode: u8 },
    #[error("triangle {triangle} has an invalid rotation code")]
    InvalidRotation { triangle: usize },
    #[error("stream tail holds a non-zero byte at offset {position}")]
    NonZeroPadding { position: usize },
    #[error("malformed varint at byte {position}")]
    MalformedVarint { position: usize },
}

/// Caller contract violations detected before any work is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Precondition {
    #[error("index count {0} is not a multiple of 3")]
    IndexCountNotTriangles(usize),
    #[error("index {index} is out of range for {vertex_count} vertices")]
    IndexOutOfRange { index: u32, vertex_count: usize },
    #[error("stride {0} is not supported here")]
    InvalidStride(usize),
    #[error("buffer holds {actual} bytes, expected {expected}")]
    BufferSizeMismatch { expected: usize, actual: usize },
    #[error("destination holds {actual} bytes, at least {required} are required")]
    DestinationTooSmall { required: usize, actual: usize },
    #[error("bit count {0} is out of range")]
    InvalidBits(u32),
    #[error("cache size {0} is out of range")]
    InvalidCacheSize(usize),
    #[error("{count} indices exceed the supported maximum of {max}")]
    TooManyIndices { count: usize, max: usize },
}
