//! Daemon startup: cache trees, privileges, and the listening socket.

use std::{
    ffi::CString,
    os::{
        fd::{FromRawFd as _, RawFd},
        linux::net::SocketAddrExt as _,
        unix::{
            fs::{DirBuilderExt as _, MetadataExt as _},
            net::{SocketAddr, UnixListener},
        },
    },
    path::Path,
};

use color_eyre::{
    Result,
    eyre::{Context as _, bail},
};
use tracing::{info, warn};

use crate::{config, proto};

/// The resolved service account the daemon runs as.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct ServiceUser {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

impl ServiceUser {
    /// Resolve the service account, staying with root when the user
    /// database has no such entry.
    pub fn lookup() -> Self {
        match getpwnam(config::SERVICE_USER) {
            Some(user) => user,
            None => {
                warn!(
                    user = config::SERVICE_USER,
                    "service account missing, staying with uid 0"
                );
                Self { uid: 0, gid: 0 }
            }
        }
    }
}

fn getpwnam(name: &str) -> Option<ServiceUser> {
    let name = CString::new(name).ok()?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; 4096];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    // The reentrant form; plain getpwnam hands back a shared static.
    let rc = unsafe {
        libc::getpwnam_r(
            name.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    Some(ServiceUser {
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
    })
}

/// Make sure every per-tree cache root exists with the expected mode and
/// owner.
///
/// A pre-existing tree owned by someone other than the service user is
/// removed and recreated: the one-time migration from the era when the
/// caches were populated as root.
pub fn prepare_cache_trees(cache_root: &Path, user: ServiceUser) -> Result<()> {
    let privileged = unsafe { libc::geteuid() } == 0;
    for prefix in proto::Prefix::ALL {
        let tree = cache_root.join(prefix.as_ref());
        if privileged {
            if let Ok(meta) = std::fs::symlink_metadata(&tree) {
                if meta.uid() != user.uid {
                    info!(?tree, "removing cache tree with stale ownership");
                    std::fs::remove_dir_all(&tree)
                        .with_context(|| format!("remove cache tree {tree:?}"))?;
                }
            }
        }
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&tree)
            .with_context(|| format!("create cache tree {tree:?}"))?;
        if privileged {
            std::os::unix::fs::chown(&tree, Some(user.uid), Some(user.gid))
                .with_context(|| format!("chown cache tree {tree:?}"))?;
        }
    }
    Ok(())
}

/// Shed what the daemon does not need before accepting requests: core
/// dumps off, CAP_SYS_ADMIN out of the bounding set, and the service
/// account's uid/gid when started as root.
pub fn drop_privileges(user: ServiceUser) -> Result<()> {
    // Not among libc's exported constants.
    const CAP_SYS_ADMIN: libc::c_ulong = 21;

    if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) } != 0 {
        warn!(
            error = %std::io::Error::last_os_error(),
            "failed to disable dumpability; do not attach a debugger to this process"
        );
    }

    if unsafe { libc::geteuid() } != 0 {
        return Ok(());
    }

    if unsafe { libc::prctl(libc::PR_CAPBSET_DROP, CAP_SYS_ADMIN, 0, 0, 0) } != 0 {
        warn!(
            error = %std::io::Error::last_os_error(),
            "failed to drop CAP_SYS_ADMIN from the bounding set"
        );
    }

    if unsafe { libc::setgid(user.gid) } != 0 {
        bail!("setgid({}): {}", user.gid, std::io::Error::last_os_error());
    }
    if unsafe { libc::setgroups(1, &user.gid) } != 0 {
        bail!("setgroups: {}", std::io::Error::last_os_error());
    }
    if unsafe { libc::setuid(user.uid) } != 0 {
        bail!("setuid({}): {}", user.uid, std::io::Error::last_os_error());
    }
    Ok(())
}

/// The listening socket: the first inherited descriptor when the service
/// manager passed exactly one, otherwise a fresh socket bound to the
/// abstract address.
pub fn acquire_listener() -> Result<UnixListener> {
    const SD_LISTEN_FDS_START: RawFd = 3;

    let inherited = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|fds| fds.parse::<i32>().ok())
        .unwrap_or(0);
    let for_us = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|pid| pid.parse::<u32>().ok())
        .is_some_and(|pid| pid == std::process::id());

    if inherited > 0 && for_us {
        if inherited != 1 {
            bail!("received {inherited} file descriptors, expected only the listening socket");
        }
        info!("using socket-activated listener");
        // SAFETY: the service manager passed exactly one descriptor, and
        // inherited descriptors start at fd 3 per the sd_listen_fds
        // contract; nothing else owns it.
        return Ok(unsafe { UnixListener::from_raw_fd(SD_LISTEN_FDS_START) });
    }

    let addr =
        SocketAddr::from_abstract_name(proto::SOCKET_NAME).context("abstract socket address")?;
    UnixListener::bind_addr(&addr).context("bind abstract socket")
}
