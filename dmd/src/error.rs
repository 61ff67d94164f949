//! The daemon's error hierarchy. Variants map directly onto the recovery
//! kinds: `config_error` and `privilege_error` are fatal for the whole
//! process; everything else is absorbed locally by a Display or a Seat.

use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed or unreadable configuration file. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A Display failed to bring up its server or session. Display-local,
    /// retried up to 3 times before the Display gives up.
    #[error("spawn error: {0}")]
    Spawn(String),

    /// The authenticator reported a definite authentication failure
    /// (wrong credentials, expired account, etc). Reported to the
    /// greeter; the Display continues.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// The authenticator could not complete a conversation due to a
    /// backend fault (PAM module crash, database unreachable). Reported
    /// to the greeter and logged; the Display continues.
    #[error("authentication system error: {0}")]
    AuthSystemError(String),

    /// The greeter violated the protocol (bad tag, message out of
    /// sequence, truncated frame). The connection is closed and the
    /// Display moves to STOPPING.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A child process (greeter or session) crashed. Policy depends on
    /// which Display state it crashed in (see state machine).
    #[error("child process crashed: {0}")]
    ChildCrash(String),

    /// A privileged operation (uid/gid switch, privileged file write)
    /// could not be completed or — worse — could not be verified as
    /// undone. The process cannot be trusted to continue and must exit.
    #[error("privilege error: {0}")]
    Privilege(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error kind should terminate the whole daemon process
    /// rather than being absorbed by the owning Display/Seat.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Privilege(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Spawn(e.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Error {
        Error::Privilege(e.to_string())
    }
}

impl From<inish::ParseError> for Error {
    fn from(e: inish::ParseError) -> Error {
        Error::Config(e.to_string())
    }
}

impl From<dmipc::Error> for Error {
    fn from(e: dmipc::Error) -> Error {
        Error::Protocol(e.to_string())
    }
}

impl From<zbus::Error> for Error {
    fn from(e: zbus::Error) -> Error {
        Error::Spawn(format!("D-Bus: {}", e))
    }
}

impl fmt::Display for PamCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Wraps a raw `pam_sys` return code so it can carry a `Display` impl
/// without taking a dependency edge from `error.rs` back into `pam::ffi`.
#[derive(Debug)]
pub struct PamCode(pub pam_sys::PamReturnCode);

impl From<PamCode> for Error {
    fn from(code: PamCode) -> Error {
        use pam_sys::PamReturnCode::*;
        match code.0 {
            AUTH_ERR | USER_UNKNOWN | CRED_INSUFFICIENT | PERM_DENIED => {
                Error::AuthFailure(code.to_string())
            }
            ACCT_EXPIRED | NEW_AUTHTOK_REQD => Error::AuthFailure(code.to_string()),
            _ => Error::AuthSystemError(code.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_config_and_privilege_are_fatal() {
        assert!(Error::Config("x".into()).is_fatal());
        assert!(Error::Privilege("x".into()).is_fatal());
        assert!(!Error::Spawn("x".into()).is_fatal());
        assert!(!Error::AuthFailure("x".into()).is_fatal());
        assert!(!Error::AuthSystemError("x".into()).is_fatal());
        assert!(!Error::Protocol("x".into()).is_fatal());
        assert!(!Error::ChildCrash("x".into()).is_fatal());
    }
}
