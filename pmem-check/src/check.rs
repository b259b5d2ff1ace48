//! Failures of a verification run.
use core::fmt;

use pmem_mutex::LockError;
use pmem_pool::PoolError;

/// A post-condition that did not hold.
#[derive(Debug)]
pub struct CheckFailure {
    pub expr: &'static str,
    pub location: &'static str,
    pub detail: String,
}

#[derive(Debug)]
pub enum Failure {
    Pool(PoolError),
    Lock(LockError),
    Check(CheckFailure),
}

/// Fail the run unless `$cond` holds.
macro_rules! ensure {
    ($cond:expr, $($ctx:tt)+) => {
        if !$cond {
            return Err($crate::check::Failure::Check($crate::check::CheckFailure {
                expr: stringify!($cond),
                location: concat!(file!(), ":", line!()),
                detail: format!($($ctx)+),
            }));
        }
    };
}

/// Fail the run unless both sides compare equal.
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        let (left, right) = (&$left, &$right);
        if left != right {
            return Err($crate::check::Failure::Check($crate::check::CheckFailure {
                expr: concat!(stringify!($left), " == ", stringify!($right)),
                location: concat!(file!(), ":", line!()),
                detail: format!("{left:?} != {right:?}"),
            }));
        }
    }};
}

pub(crate) use {ensure, ensure_eq};

impl From<PoolError> for Failure {
    fn from(err: PoolError) -> Self {
        Failure::Pool(err)
    }
}

impl From<LockError> for Failure {
    fn from(err: LockError) -> Self {
        Failure::Lock(err)
    }
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: check `{}` failed: {}", self.location, self.expr, self.detail)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Pool(err) => write!(f, "pool: {err}"),
            Failure::Lock(err) => write!(f, "lock: {err}"),
            Failure::Check(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Failure::Pool(err) => Some(err),
            Failure::Lock(err) => Some(err),
            Failure::Check(_) => None,
        }
    }
}
