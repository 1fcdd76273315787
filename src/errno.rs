//! Names the handful of error kinds every `Module` operation can fail with
//! onto concrete `libc` errno values, since each reply uses the same
//! negated-errno convention as `fuser::Errno`/classic FUSE `Filesystem`
//! impls: `-ENOENT`, `-ENOTSUP`, `-EPERM` and friends, given names here so
//! the rest of the crate reads in terms of policy, not raw numbers.

pub type OpResult<T> = Result<T, i32>;

pub fn not_found() -> i32 {
    libc::ENOENT
}

pub fn not_permitted() -> i32 {
    libc::EPERM
}

pub fn not_supported() -> i32 {
    libc::ENOTSUP
}

pub fn invalid_argument() -> i32 {
    libc::EINVAL
}

pub fn no_memory() -> i32 {
    libc::ENOMEM
}

pub fn busy() -> i32 {
    libc::EBUSY
}

/// Maps the calling thread's `errno` to the negated-return convention used
/// throughout `Module`.
pub fn from_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

pub fn from_io_error(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}
