use core::fmt;

/// An error while creating, opening or using a pool.
#[derive(Debug)]
#[non_exhaustive]
pub enum PoolError {
    /// The backing file could not be created, opened, mapped or flushed.
    Io(std::io::Error),
    /// The backing file is smaller than the minimum pool size.
    TooSmall { size: u64, min: u64 },
    /// The file does not start with a pool header.
    BadMagic,
    /// The header was written by an incompatible format version.
    VersionMismatch { found: u32 },
    /// The layout name does not fit into the header.
    LayoutTooLong { len: usize },
    /// The pool was created with a different layout name.
    LayoutMismatch { expected: String, found: String },
    /// The file is already mapped as a pool, by this process or by another one.
    Busy,
    /// The heap has no room for the requested allocation.
    OutOfSpace { requested: usize },
    /// The type requires a stricter alignment than the heap provides.
    Alignment { align: usize },
    /// The root object exists with a smaller size than requested.
    RootSizeMismatch { requested: usize, found: u64 },
    /// The pointer does not refer to a live allocation of this pool.
    InvalidPointer { offset: u64 },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Io(err) => write!(f, "pool i/o failed: {err}"),
            PoolError::TooSmall { size, min } => {
                write!(f, "pool size {size} is below the minimum of {min} bytes")
            }
            PoolError::BadMagic => write!(f, "not a pool file"),
            PoolError::VersionMismatch { found } => {
                write!(f, "unsupported pool format version {found}")
            }
            PoolError::LayoutTooLong { len } => write!(f, "layout name of {len} bytes is too long"),
            PoolError::LayoutMismatch { expected, found } => {
                write!(f, "wrong pool layout, expected {expected:?} but found {found:?}")
            }
            PoolError::Busy => write!(f, "pool is already mapped by this or another process"),
            PoolError::OutOfSpace { requested } => {
                write!(f, "no space left in pool for {requested} bytes")
            }
            PoolError::Alignment { align } => write!(f, "alignment {align} is not supported"),
            PoolError::RootSizeMismatch { requested, found } => {
                write!(f, "root object has {found} bytes, {requested} requested")
            }
            PoolError::InvalidPointer { offset } => {
                write!(f, "offset {offset:#x} is not a live allocation")
            }
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::Io(err)
    }
}
