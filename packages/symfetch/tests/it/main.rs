//! Integration tests drive the daemon's fetch pipeline end to end against
//! a loopback HTTP origin serving prepared artifact archives.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_compression::tokio::write::XzEncoder;
use axum::{
    Router,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tokio::io::AsyncWriteExt as _;
use tokio_util::compat::TokioAsyncWriteCompatExt as _;

pub mod daemon;

/// A loopback origin serving a fixed set of artifact paths.
///
/// Conditional requests are answered `304 Not Modified`, `Range` requests
/// with the requested slice, paths under `/err/` with a server error, and
/// everything unknown with `404`. `downloads` counts GET requests only.
pub struct Origin {
    pub addr: SocketAddr,
    pub downloads: Arc<AtomicUsize>,
}

impl Origin {
    /// Mirror list pointing this origin, for [`symfetch::config::Mirrors::parse`].
    pub fn mirror(&self) -> String {
        format!("http://{}/", self.addr)
    }
}

#[derive(Clone)]
struct OriginState {
    artifacts: Arc<HashMap<String, Vec<u8>>>,
    downloads: Arc<AtomicUsize>,
}

pub async fn spawn_origin(artifacts: HashMap<String, Vec<u8>>) -> Origin {
    let downloads = Arc::new(AtomicUsize::new(0));
    let state = OriginState {
        artifacts: Arc::new(artifacts),
        downloads: Arc::clone(&downloads),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind origin listener");
    let addr = listener.local_addr().expect("origin address");
    let app = Router::new().fallback(artifact).with_state(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve origin");
    });
    Origin { addr, downloads }
}

async fn artifact(
    State(state): State<OriginState>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if uri.path().contains("/err/") {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let Some(body) = state.artifacts.get(uri.path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if headers.contains_key(header::IF_MODIFIED_SINCE) {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    if let Some(range) = headers.get(header::RANGE).and_then(|value| value.to_str().ok()) {
        if let Some((start, end)) = parse_range(range, body.len() as u64) {
            if method == Method::GET {
                state.downloads.fetch_add(1, Ordering::Relaxed);
            }
            let slice = body[start as usize..=end as usize].to_vec();
            return (
                StatusCode::PARTIAL_CONTENT,
                [
                    (
                        header::CONTENT_RANGE,
                        format!("bytes {start}-{end}/{}", body.len()),
                    ),
                    (header::CONTENT_LENGTH, slice.len().to_string()),
                ],
                slice,
            )
                .into_response();
        }
    }

    if method == Method::GET {
        state.downloads.fetch_add(1, Ordering::Relaxed);
    }
    (
        [(header::CONTENT_LENGTH, body.len().to_string())],
        body.clone(),
    )
        .into_response()
}

fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let bounds = value.strip_prefix("bytes=")?;
    let (start, end) = bounds.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        total.checked_sub(1)?
    } else {
        end.parse().ok()?
    };
    (start <= end && end < total).then_some((start, end))
}

/// Build an XZ tarball artifact in memory.
///
/// Writes the entry name directly into the header rather than going
/// through `append_data`, whose path validation rejects `..`
/// components before a test can exercise the daemon's own rejection of
/// them.
pub async fn tar_xz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = XzEncoder::new(Vec::new());
    let mut builder = async_tar::Builder::new(encoder.compat_write());
    for (path, content) in entries {
        let mut header = async_tar::Header::new_gnu();
        let name = header.as_gnu_mut().expect("gnu header").name.as_mut();
        name[..path.len()].copy_from_slice(path.as_bytes());
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append(&header, *content)
            .await
            .expect("append archive entry");
    }
    let mut encoder = builder
        .into_inner()
        .await
        .expect("finish archive")
        .into_inner();
    encoder.shutdown().await.expect("finish xz stream");
    encoder.into_inner()
}

/// Deterministic bytes that do not compress away, for exercising the
/// split download path.
pub fn incompressible(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}
