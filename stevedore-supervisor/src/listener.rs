//! Listening socket shared between the supervisor and its children.
//!
//! The supervisor binds once and leaves the descriptor open across `exec`;
//! each child finds its number in [`LISTEN_FD_VAR`] and accepts on it.

use crate::error::{Result, SupervisorError};
use std::net::{TcpListener, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Environment variable carrying the inherited descriptor number.
pub const LISTEN_FD_VAR: &str = "STEVEDORE_LISTEN_FD";

/// Environment variable carrying the child's slot index.
pub const WORKER_SLOT_VAR: &str = "STEVEDORE_WORKER_SLOT";

/// Bind a listener that survives `exec` into child processes.
pub fn bind_inheritable(addr: impl ToSocketAddrs) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).map_err(|e| SupervisorError::Listener(e.to_string()))?;
    clear_cloexec(listener.as_raw_fd())?;
    Ok(listener)
}

fn clear_cloexec(fd: RawFd) -> Result<()> {
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};

    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
        .map(|_| ())
        .map_err(|e| SupervisorError::Listener(format!("clearing close-on-exec: {e}")))
}

/// Parse the descriptor number handed down by the supervisor.
pub fn parse_listen_fd(value: &str) -> Result<RawFd> {
    match value.trim().parse::<RawFd>() {
        Ok(fd) if fd >= 0 => Ok(fd),
        _ => Err(SupervisorError::Listener(format!(
            "{LISTEN_FD_VAR} is not a descriptor: {value:?}"
        ))),
    }
}

/// Take over the listener named by [`LISTEN_FD_VAR`], if set.
///
/// Must be called at most once per process: the descriptor is owned by the
/// returned listener.
pub fn inherited_listener() -> Result<Option<TcpListener>> {
    let Ok(value) = std::env::var(LISTEN_FD_VAR) else {
        return Ok(None);
    };
    let fd = parse_listen_fd(&value)?;

    // SAFETY: the supervisor passes a bound TCP socket it opened for this
    // process and nothing else in this process owns that descriptor.
    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    listener
        .local_addr()
        .map_err(|e| SupervisorError::Listener(format!("descriptor {fd} is not a socket: {e}")))?;
    Ok(Some(listener))
}

/// Slot index assigned by the supervisor, if any.
pub fn worker_slot() -> Option<usize> {
    std::env::var(WORKER_SLOT_VAR).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};

    #[test]
    fn test_bind_inheritable_clears_cloexec() {
        let listener = bind_inheritable("127.0.0.1:0").unwrap();
        let flags = fcntl(listener.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(!FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_parse_listen_fd() {
        assert_eq!(parse_listen_fd("3").unwrap(), 3);
        assert_eq!(parse_listen_fd(" 7\n").unwrap(), 7);
        assert!(parse_listen_fd("-1").is_err());
        assert!(parse_listen_fd("three").is_err());
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let first = bind_inheritable("127.0.0.1:0").unwrap();
        let addr = first.local_addr().unwrap();
        assert!(matches!(
            bind_inheritable(addr),
            Err(SupervisorError::Listener(_))
        ));
    }
}
