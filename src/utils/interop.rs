use std::io;

/// Convert a C return value (0 on success, errno otherwise) into an
/// `io::Result`.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        _ => Err(io::Error::from_raw_os_error(ret)),
    }
}

/// Same as [`from_c_ret`], but map well-known error codes to a readable
/// message through `f`.
#[inline(always)]
pub(crate) fn from_c_ret_explained(
    ret: i32,
    f: impl FnOnce(i32) -> Option<&'static str>,
) -> io::Result<()> {
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::from_raw_os_error(ret);
    match f(ret) {
        Some(msg) => Err(io::Error::new(err.kind(), msg)),
        None => Err(err),
    }
}

/// Convert a non-zero C return value into an `io::Error`.
#[inline(always)]
pub(crate) fn from_c_err<T>(code: i32) -> io::Result<T> {
    Err(io::Error::from_raw_os_error(code))
}

/// Convert a C-style `-1 + errno` return value into an `io::Result`.
#[inline(always)]
pub(crate) fn from_c_errno(ret: i32) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explain(ret: i32) -> Option<&'static str> {
        match ret {
            libc::ENOMEM => Some("queue is full"),
            _ => None,
        }
    }

    #[test]
    fn zero_is_ok() {
        assert!(from_c_ret(0).is_ok());
        assert!(from_c_ret_explained(0, explain).is_ok());
        assert!(from_c_errno(0).is_ok());
    }

    #[test]
    fn errno_is_preserved() {
        let err = from_c_ret(libc::EINVAL).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));

        let err = from_c_err::<()>(libc::EFAULT).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EFAULT));
    }

    #[test]
    fn explained_errors_carry_message() {
        let err = from_c_ret_explained(libc::ENOMEM, explain).unwrap_err();
        assert_eq!(err.to_string(), "queue is full");
        assert_eq!(err.kind(), io::Error::from_raw_os_error(libc::ENOMEM).kind());

        let err = from_c_ret_explained(libc::EINVAL, explain).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }
}
