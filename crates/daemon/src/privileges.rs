//! Dropping and restoring root privileges.
//!
//! The supervisor starts as root, drops to the configured user while
//! setting up logging (so log files get the right owner), restores root to
//! bind privileged ports and join multicast groups, and finally drops
//! permanently. When not started as root the drops degrade to a warning,
//! which keeps unprivileged development setups working.

use std::io;

use nix::sys::stat::{Mode, umask};
use nix::unistd::{
    Gid, Group, Uid, User, setegid, seteuid, setgid, setgroups, setuid,
};
use tracing::{debug, warn};

/// Drops root privileges to the given user and group: supplementary
/// groups are cleared and the umask is set to `0o077`. A temporary drop
/// only changes the effective ids so [`restore_privileges`] can undo it;
/// a permanent drop is irreversible.
pub fn drop_privileges(user: &User, group: &Group, permanent: bool) -> io::Result<()> {
    // Restore euid 0 first if a previous temporary drop is still active.
    if !Uid::effective().is_root() && Uid::current().is_root() {
        restore_privileges()?;
    }

    if !Uid::effective().is_root() {
        warn!(
            "Not running as root: cannot change uid/gid to {user}/{group}",
            user = user.name,
            group = group.name,
        );
        return Ok(());
    }

    setgroups(&[]).map_err(io::Error::from)?;

    if permanent {
        setgid(group.gid).map_err(io::Error::from)?;
        setuid(user.uid).map_err(io::Error::from)?;
    } else {
        setegid(group.gid).map_err(io::Error::from)?;
        seteuid(user.uid).map_err(io::Error::from)?;
    }

    umask(Mode::from_bits_truncate(0o077));

    if permanent {
        debug!(
            "Permanently dropped privileges to {user}/{group}",
            user = user.name,
            group = group.name,
        );
    } else {
        debug!(
            "Dropped privileges to {user}/{group}",
            user = user.name,
            group = group.name,
        );
    }

    Ok(())
}

/// Restores root privileges after a temporary drop. A no-op when the
/// process never was root; an error when the drop was permanent.
pub fn restore_privileges() -> io::Result<()> {
    if !Uid::current().is_root() {
        if Uid::effective().is_root() {
            return Ok(());
        }
        warn!("Not running as root: no privileges to restore");
        return Ok(());
    }

    seteuid(Uid::from_raw(0)).map_err(io::Error::from)?;
    setegid(Gid::from_raw(0)).map_err(io::Error::from)?;

    debug!("Restored root privileges");
    Ok(())
}
