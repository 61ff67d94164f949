//! Scoped UID/GID switching for filesystem operations done on behalf of a
//! user: writing `$HOME/.Xauthority`, `$HOME/.dmrc`, reading `~/.face`.
//!
//! Order matters: GID is set before UID, because once we drop the UID we
//! may no longer have permission to change the GID. Restoration reverses
//! the order. Failing to restore is not a recoverable condition — we
//! would otherwise continue running with a uid we didn't intend to keep
//! — so it aborts the process rather than returning an error.

use nix::unistd::{self, Gid, Uid};

use crate::error::{Error, Result};

pub struct PrivilegeGuard {
    original_uid: Uid,
    original_gid: Gid,
}

impl PrivilegeGuard {
    /// Switches the real and effective UID/GID to `uid`/`gid`. The
    /// returned guard restores the caller's original identity on drop.
    pub fn enter(uid: Uid, gid: Gid) -> Result<PrivilegeGuard> {
        let original_uid = unistd::getuid();
        let original_gid = unistd::getgid();

        set_ids(gid, uid)?;

        Ok(PrivilegeGuard {
            original_uid,
            original_gid,
        })
    }
}

impl Drop for PrivilegeGuard {
    fn drop(&mut self) {
        if let Err(e) = set_ids(self.original_gid, self.original_uid) {
            tracing::error!("failed to restore privileges to uid {}: {e} — aborting", self.original_uid);
            std::process::abort();
        }
    }
}

fn set_ids(gid: Gid, uid: Uid) -> Result<()> {
    unistd::setresgid(gid, gid, gid).map_err(|e| {
        Error::Privilege(format!("setresgid({gid}) failed: {e}"))
    })?;
    unistd::setresuid(uid, uid, uid).map_err(|e| {
        Error::Privilege(format!("setresuid({uid}) failed: {e}"))
    })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn enter_as_current_identity_is_a_no_op() {
        let uid = unistd::getuid();
        let gid = unistd::getgid();
        let guard = PrivilegeGuard::enter(uid, gid).unwrap();
        assert_eq!(unistd::getuid(), uid);
        drop(guard);
        assert_eq!(unistd::getuid(), uid);
    }
}
