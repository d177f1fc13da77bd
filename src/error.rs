use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// Header failed validation on open; names the rejected field.
    InvalidHeader(&'static str),
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    /// Structural invariant violated on disk; fail closed, never patch.
    Corrupted(String),
    /// The file was written by a provider with a different schema version.
    IncompatibleVersion {
        expected: u32,
        found: u32,
    },
    /// Caller broke the non-decreasing start-time insertion contract.
    OutOfOrderInsertion {
        last: i64,
        got: i64,
    },
    /// A single interval does not fit in an empty block.
    IntervalTooLarge {
        size: usize,
        capacity: usize,
    },
    /// A string or custom payload overflows its u16 length prefix.
    PayloadTooLarge {
        len: usize,
        max: usize,
    },
    InvalidInterval {
        start: i64,
        end: i64,
    },
    /// Query timestamp outside the tree's time range.
    TimeOutOfRange {
        time: i64,
        start: i64,
        end: i64,
    },
    /// No interval for the requested attribute at the requested time.
    NotFound,
    InvalidOperation(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::InvalidHeader(field) => write!(f, "Invalid header: {}", field),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::Corrupted(msg) => write!(f, "Corrupted tree file: {}", msg),
            Error::IncompatibleVersion { expected, found } => write!(
                f,
                "Incompatible provider version: expected {}, found {}",
                expected, found
            ),
            Error::OutOfOrderInsertion { last, got } => write!(
                f,
                "Out-of-order insertion: start {} is before previous start {}",
                got, last
            ),
            Error::IntervalTooLarge { size, capacity } => write!(
                f,
                "Interval of {} bytes exceeds block capacity of {} bytes",
                size, capacity
            ),
            Error::PayloadTooLarge { len, max } => write!(
                f,
                "Value payload of {} bytes exceeds maximum of {} bytes",
                len, max
            ),
            Error::InvalidInterval { start, end } => {
                write!(f, "Invalid interval: start {} is after end {}", start, end)
            }
            Error::TimeOutOfRange { time, start, end } => write!(
                f,
                "Timestamp {} outside tree range [{}, {}]",
                time, start, end
            ),
            Error::NotFound => write!(f, "Attribute not found"),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
