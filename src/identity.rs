//! User identity and scoped privilege transitions.
//!
//! The launcher may run setuid-root. Everything that does not require
//! privilege (image expansion, key generation, rendezvous markers) runs with
//! the invoking user's effective ids, switched through [`PrivilegeGuard`] so
//! that root is restored on every exit path, including errors.

use nix::unistd::{Gid, Uid, getegid, geteuid, getgid, getgroups, getuid, setegid, seteuid};
use tracing::warn;

use crate::error::{Error, Result};

/// The invoking user's real identity, captured at process entry.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub uid: Uid,
    pub gid: Gid,
    pub supplementary_gids: Vec<Gid>,
}

impl UserIdentity {
    /// Captures the real uid/gid of the calling process.
    pub fn from_process() -> Result<Self> {
        let supplementary_gids = getgroups()
            .map_err(|e| Error::ConfigInvalid(format!("failed to read groups: {}", e)))?;
        Ok(Self {
            uid: getuid(),
            gid: getgid(),
            supplementary_gids,
        })
    }

    /// Whether the process currently holds root privilege to return to.
    pub fn process_is_privileged() -> bool {
        geteuid().is_root()
    }
}

/// Scoped drop to the invoking user's effective ids.
///
/// Construction switches egid then euid; drop restores the previous pair in
/// reverse order. The guard is a no-op when the process never had privilege.
pub struct PrivilegeGuard {
    saved_euid: Uid,
    saved_egid: Gid,
    active: bool,
}

impl PrivilegeGuard {
    /// Lowers the effective ids to `identity` for the guard's lifetime.
    pub fn lower_to(identity: &UserIdentity) -> Result<Self> {
        let saved_euid = geteuid();
        let saved_egid = getegid();

        if saved_euid == identity.uid && saved_egid == identity.gid {
            return Ok(Self {
                saved_euid,
                saved_egid,
                active: false,
            });
        }

        // gid first: once euid is unprivileged, setegid would fail.
        setegid(identity.gid)
            .map_err(|e| Error::ConfigInvalid(format!("failed to drop egid: {}", e)))?;
        if let Err(e) = seteuid(identity.uid) {
            // Roll back the gid switch before reporting.
            let _ = setegid(saved_egid);
            return Err(Error::ConfigInvalid(format!("failed to drop euid: {}", e)));
        }

        Ok(Self {
            saved_euid,
            saved_egid,
            active: true,
        })
    }
}

impl Drop for PrivilegeGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(e) = seteuid(self.saved_euid) {
            warn!("failed to restore euid: {}", e);
            return;
        }
        if let Err(e) = setegid(self.saved_egid) {
            warn!("failed to restore egid: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_is_noop_for_current_identity() {
        let identity = UserIdentity::from_process().unwrap();
        let before = (geteuid(), getegid());
        {
            let _guard = PrivilegeGuard::lower_to(&identity).unwrap();
            assert_eq!((geteuid(), getegid()), before);
        }
        assert_eq!((geteuid(), getegid()), before);
    }
}
