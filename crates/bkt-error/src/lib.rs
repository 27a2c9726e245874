#![forbid(unsafe_code)]
//! Error types for the bucket accounting engine.
//!
//! # Error Taxonomy
//!
//! | Class | Handling | Variant(s) |
//! |-------|----------|------------|
//! | Capacity exhaustion | Returned to the caller, retryable once space frees up | `NoSpace` |
//! | Accounting anomaly | Logged at WARN, clamped to a safe value, never returned | n/a |
//! | Structural misuse | `assert!` panic (out-of-range bucket, misuse of a ticket) | n/a |
//! | Unsupported operation | Rejected before any state changes | `ShrinkNotSupported` |
//! | Inconsistent key | Whole mark update rolled back | `Inconsistent`, `SectorOverflow` |
//!
//! `bkt-error` does not depend on `bkt-types`; `ParseError` from the member
//! table codec is converted into [`BktError::Parse`] by `bkt-buckets`.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one errno via [`BktError::to_errno`]. The
//! match is exhaustive so a new variant is a compile error until mapped.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `NoSpace` | `ENOSPC` |
//! | `ShrinkNotSupported` | `EOPNOTSUPP` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `Inconsistent` | `EIO` |
//! | `SectorOverflow` | `EOVERFLOW` |
//! | `InsufficientDevices` | `EBUSY` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Unified error type for engine operations and the CLI.
#[derive(Debug, Error)]
pub enum BktError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A reservation could not be satisfied from available replicated space.
    #[error("no space left on device")]
    NoSpace,

    /// Resizing a device to fewer buckets than it has.
    #[error("shrinking not supported: device has {current} buckets, requested {requested}")]
    ShrinkNotSupported { current: u64, requested: u64 },

    /// Device geometry is unusable (zero bucket size, no usable buckets).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Structurally invalid input that is not a parse failure.
    #[error("invalid format: {0}")]
    Format(String),

    /// Member-table decoding failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Device index is not a member.
    #[error("not found: {0}")]
    NotFound(String),

    /// A key's pointer disagrees with the bucket it points into.
    ///
    /// The mark update that detected this is rolled back in full.
    #[error("inconsistent bucket {dev}:{bucket}: {detail}")]
    Inconsistent {
        dev: u32,
        bucket: u64,
        detail: String,
    },

    /// A bucket's 16-bit sector counter would overflow.
    #[error("bucket {dev}:{bucket} sector count overflow")]
    SectorOverflow { dev: u32, bucket: u64 },

    /// A state change would leave data without enough live replicas.
    #[error("insufficient devices: {0}")]
    InsufficientDevices(String),

    /// Allocation was requested from a device that is not read-write.
    #[error("device is not read-write")]
    ReadOnly,
}

impl BktError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NoSpace => libc::ENOSPC,
            Self::ShrinkNotSupported { .. } => libc::EOPNOTSUPP,
            Self::InvalidGeometry(_) | Self::Format(_) | Self::Parse(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::Inconsistent { .. } => libc::EIO,
            Self::SectorOverflow { .. } => libc::EOVERFLOW,
            Self::InsufficientDevices(_) => libc::EBUSY,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Capacity errors are expected under space pressure and may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoSpace)
    }
}

/// Result alias using `BktError`.
pub type Result<T> = std::result::Result<T, BktError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(BktError, libc::c_int)> = vec![
            (BktError::Io(std::io::Error::other("test")), libc::EIO),
            (BktError::NoSpace, libc::ENOSPC),
            (
                BktError::ShrinkNotSupported {
                    current: 10,
                    requested: 5,
                },
                libc::EOPNOTSUPP,
            ),
            (BktError::InvalidGeometry("bucket_size=0".into()), libc::EINVAL),
            (BktError::Format("test".into()), libc::EINVAL),
            (BktError::Parse("test".into()), libc::EINVAL),
            (BktError::NotFound("device 3".into()), libc::ENOENT),
            (
                BktError::Inconsistent {
                    dev: 0,
                    bucket: 1,
                    detail: "stale dirty pointer".into(),
                },
                libc::EIO,
            ),
            (BktError::SectorOverflow { dev: 0, bucket: 1 }, libc::EOVERFLOW),
            (BktError::InsufficientDevices("test".into()), libc::EBUSY),
            (BktError::ReadOnly, libc::EROFS),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(BktError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = BktError::ShrinkNotSupported {
            current: 1000,
            requested: 900,
        };
        assert_eq!(
            err.to_string(),
            "shrinking not supported: device has 1000 buckets, requested 900"
        );

        let err = BktError::Inconsistent {
            dev: 2,
            bucket: 17,
            detail: "ptr gen 6 newer than bucket gen 5".into(),
        };
        assert_eq!(
            err.to_string(),
            "inconsistent bucket 2:17: ptr gen 6 newer than bucket gen 5"
        );

        assert_eq!(BktError::NoSpace.to_string(), "no space left on device");
    }

    #[test]
    fn only_capacity_errors_are_retryable() {
        assert!(BktError::NoSpace.is_retryable());
        assert!(!BktError::ReadOnly.is_retryable());
        assert!(!BktError::SectorOverflow { dev: 0, bucket: 0 }.is_retryable());
    }
}
