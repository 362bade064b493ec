//! The fetch daemon: one abstract-socket listener in front of a bounded
//! pool of per-connection workers.
//!
//! Each accepted connection carries exactly one fetch request. A worker
//! parses and validates it, runs the fetch procedure against the preferred
//! mirror, and answers `"ok"` regardless of the outcome; the client learns
//! nothing more than "the attempt has settled". Excess connections past
//! the worker cap are shut down immediately, which the client's bounded
//! read sees as EOF.

pub mod extract;
pub mod fetch;
pub mod setup;

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use color_eyre::{Result, eyre::Context as _};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{UnixListener, UnixStream},
    time::timeout,
};
use tracing::{debug, error, info};

use crate::{
    config::{self, IDLE_TIMEOUT, MAX_CONNECTIONS, MAX_REQUEST_LEN, Mirrors},
    proto::{self, Request},
};
use fetch::{FetchStatus, RecentFetches};

/// Process-wide state shared by every worker.
#[derive(Debug)]
pub struct Context {
    pub mirrors: Mirrors,
    recent: RecentFetches,
    http: reqwest::Client,
    cache_root: PathBuf,
    connections: Connections,
}

impl Context {
    pub fn new(mirrors: Mirrors, cache_root: PathBuf) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config::CONNECT_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self {
            mirrors,
            recent: RecentFetches::new(),
            http,
            cache_root,
            connections: Connections::new(MAX_CONNECTIONS),
        })
    }
}

/// Accept connections until the idle timeout elapses.
pub async fn run(ctx: Arc<Context>, listener: UnixListener) -> Result<()> {
    info!(mirrors = ctx.mirrors.len(), "listening for fetch requests");
    loop {
        let accepted = match timeout(IDLE_TIMEOUT, listener.accept()).await {
            Ok(accepted) => accepted,
            Err(_) => {
                info!("no requests for {IDLE_TIMEOUT:?}, exiting");
                return Ok(());
            }
        };
        let (stream, _) = match accepted {
            Ok(accepted) => accepted,
            Err(error) => {
                debug!(?error, "accept failed");
                continue;
            }
        };

        let Some(slot) = ctx.connections.try_acquire() else {
            debug!("worker pool exhausted, refusing connection");
            refuse(stream).await;
            continue;
        };
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let _slot = slot;
            serve(&ctx, stream).await;
        });
    }
}

async fn refuse(mut stream: UnixStream) {
    let _ = stream.shutdown().await;
}

/// Handle one connection: read the request line, fetch, reply `"ok"`.
///
/// Malformed requests are dropped without a reply, and a failed reply
/// write is ignored (the client may have given up already).
pub async fn serve(ctx: &Context, mut stream: UnixStream) {
    let request = match read_request(&mut stream).await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(error) => {
            debug!(?error, "failed to read request");
            return;
        }
    };

    let status = dispatch(ctx, &request).await;
    if status.is_expected() {
        debug!(code = status.code(), path = %request.path, "fetch settled");
    } else {
        ctx.mirrors.demote();
        error!(code = status.code(), path = %request.path, "fetch failed");
    }

    let _ = stream.write_all(proto::REPLY_OK).await;
}

async fn dispatch(ctx: &Context, request: &Request) -> FetchStatus {
    let url = match ctx.mirrors.artifact_url(request.prefix, &request.path) {
        Ok(url) => url,
        Err(error) => {
            debug!(?error, "failed to compose artifact url");
            return FetchStatus::BadUrl;
        }
    };
    let tree_root = ctx.cache_root.join(request.prefix.as_ref());
    fetch::fetch_artifact(&ctx.recent, &ctx.http, &url, &tree_root, request.timestamp).await
}

async fn read_request(stream: &mut UnixStream) -> Result<Option<Request>> {
    let mut buf = vec![0u8; MAX_REQUEST_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream
            .read(&mut buf[filled..])
            .await
            .context("read request")?;
        if n == 0 {
            break;
        }
        filled += n;
        if buf[..filled].contains(&0) {
            break;
        }
    }

    match Request::parse(&buf[..filled]) {
        Ok(request) => Ok(Some(request)),
        Err(reason) => {
            debug!(%reason, "rejecting malformed request");
            Ok(None)
        }
    }
}

/// In-flight worker accounting. One slot per accepted connection; the
/// guard gives the slot back exactly once, on drop.
#[derive(Debug)]
struct Connections {
    active: Arc<AtomicUsize>,
    cap: usize,
}

impl Connections {
    fn new(cap: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            cap,
        }
    }

    fn try_acquire(&self) -> Option<ConnectionSlot> {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            if current >= self.cap {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(ConnectionSlot {
                        active: Arc::clone(&self.active),
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }
}

#[derive(Debug)]
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
