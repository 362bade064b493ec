//! Debug trees, mirror selection, and the tuning constants of the fetch
//! pipeline.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use color_eyre::{
    Result,
    eyre::{Context as _, bail},
};
use tap::Pipe as _;
use tracing::info;
use url::Url;

use crate::proto::Prefix;

/// Maximum concurrent fetch workers in the daemon.
pub const MAX_CONNECTIONS: usize = 16;

/// The listener exits after this long with no connections; socket
/// activation brings it back on the next request.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// A fetch for an artifact URL claimed within this window is answered
/// without any work.
pub const DEDUP_TTL: Duration = Duration::from_secs(600);

/// First-connection timeout for artifact downloads.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transfers averaging below [`LOW_SPEED_LIMIT`] over this window abort.
pub const LOW_SPEED_WINDOW: Duration = Duration::from_secs(30);

/// Minimum acceptable transfer rate, bytes per second.
pub const LOW_SPEED_LIMIT: u64 = 1024;

/// Byte-range parts a sized download is split into.
pub const DOWNLOAD_PARTS: u64 = 2;

/// Downloads smaller than this are fetched in one piece.
pub const PART_SPLIT_MIN: u64 = 64 * 1024;

/// How long a synchronous (timestamp zero) lookup waits for the daemon. A
/// local cache hit answers well within this; a network fetch may not.
pub const SYNC_DEADLINE: Duration = Duration::from_millis(75);

/// Lookup wait while a recent timeout is in effect, so a burst of slow
/// lookups does not serialize.
pub const SHORT_DEADLINE: Duration = Duration::from_micros(1500);

/// How long a timeout keeps subsequent lookups on [`SHORT_DEADLINE`].
pub const DEADTIME_WINDOW: Duration = Duration::from_secs(4);

/// Longest request line the daemon will read.
pub const MAX_REQUEST_LEN: usize = libc::PATH_MAX as usize + 8;

/// Environment variable holding a whitespace-separated mirror list. When
/// set and non-empty it replaces the compiled defaults entirely.
pub const MIRROR_ENV: &str = "CLR_DEBUGINFO_URLS";

/// Service account that owns the cache and runs the daemon workers.
pub const SERVICE_USER: &str = "dbginfo";

/// Parent of the per-tree cache roots.
pub const CACHE_ROOT: &str = "/var/cache/debuginfo";

/// Mirror bases used when [`MIRROR_ENV`] is unset.
pub const DEFAULT_MIRRORS: &[&str] = &[
    "https://cdn.download.clearlinux.org/debuginfo/",
    "https://cdn-alt.download.clearlinux.org/debuginfo/",
];

/// A debug tree pairs the mount point debuggers look under with the cache
/// root that actually holds the files.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DebugTree {
    pub prefix: Prefix,
    pub mountpoint: PathBuf,
    pub cache_root: PathBuf,
}

impl DebugTree {
    /// The fixed tree for a prefix tag.
    pub fn of(prefix: Prefix) -> Self {
        let mountpoint = match prefix {
            Prefix::Lib => "/usr/lib/debug",
            Prefix::Src => "/usr/src/debug",
        };
        Self {
            prefix,
            mountpoint: PathBuf::from(mountpoint),
            cache_root: Path::new(CACHE_ROOT).join(prefix.as_ref()),
        }
    }
}

/// The mirror bases plus the demotion counter that biases fetches away
/// from a failing mirror.
///
/// The counter only ever advances; this is a soft, eventually-self-healing
/// preference rather than health tracking.
#[derive(Debug)]
pub struct Mirrors {
    bases: Vec<Url>,
    demoted: AtomicUsize,
}

impl Mirrors {
    /// Build from the environment override when set, the compiled defaults
    /// otherwise.
    pub fn from_env() -> Result<Self> {
        match std::env::var(MIRROR_ENV) {
            Ok(list) if !list.trim().is_empty() => {
                let mirrors = Self::parse(&list).context("parse mirror urls from environment")?;
                info!(count = mirrors.len(), "using mirror urls from environment");
                Ok(mirrors)
            }
            _ => {
                let mirrors = Self::parse(&DEFAULT_MIRRORS.join(" "))
                    .context("parse compiled default mirror urls")?;
                info!("using compiled default mirror urls");
                Ok(mirrors)
            }
        }
    }

    /// Parse a whitespace-separated list of base URLs.
    pub fn parse(list: &str) -> Result<Self> {
        let bases = list
            .split_whitespace()
            .map(|base| Url::parse(base).with_context(|| format!("parse mirror url {base:?}")))
            .collect::<Result<Vec<_>>>()?;
        if bases.is_empty() {
            bail!("no mirror urls configured");
        }
        Self {
            bases,
            demoted: AtomicUsize::new(0),
        }
        .pipe(Ok)
    }

    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    /// The currently preferred base.
    pub fn preferred(&self) -> &Url {
        &self.bases[self.demoted.load(Ordering::Relaxed) % self.bases.len()]
    }

    /// Shift preference away from the current mirror.
    pub fn demote(&self) {
        self.demoted.fetch_add(1, Ordering::Relaxed);
    }

    /// Compose the artifact URL for a tree path against the preferred
    /// mirror.
    ///
    /// Plain concatenation: the origin stores artifacts at exactly
    /// `<base><prefix><path>.tar`, including any doubled slash.
    pub fn artifact_url(&self, prefix: Prefix, path: &str) -> Result<Url> {
        let base = self.preferred();
        let composed = format!("{base}{prefix}{path}.tar");
        Url::parse(&composed).with_context(|| format!("compose artifact url {composed:?}"))
    }
}
