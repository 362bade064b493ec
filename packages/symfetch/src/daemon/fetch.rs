//! The fetch procedure: dedup, conditional probe, ranged download,
//! verification, extraction.

use std::{
    path::Path,
    time::{Duration, Instant},
};

use color_eyre::{
    Result,
    eyre::{Context as _, bail, eyre},
};
use dashmap::{DashMap, mapref::entry::Entry};
use filetime::FileTime;
use futures::StreamExt;
use jiff::{Timestamp, fmt::rfc2822};
use reqwest::{StatusCode, header};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::{
        DEDUP_TTL, DOWNLOAD_PARTS, LOW_SPEED_LIMIT, LOW_SPEED_WINDOW, PART_SPLIT_MIN,
    },
    daemon::extract,
};

/// Outcome of one fetch attempt, collapsed to the HTTP-like codes the
/// daemon logs. Clients only ever see `"ok"` or EOF.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum FetchStatus {
    /// 200: downloaded and extracted into the cache.
    Fetched,
    /// 300: a recent attempt already covers this URL; nothing was done.
    Deduplicated,
    /// 301: the artifact URL could not be composed.
    BadUrl,
    /// 304: the origin copy is no newer than the client's.
    NotModified,
    /// 404: the origin has no artifact for this path.
    Absent,
    /// 418: transport, validation, or extraction failure.
    Failed,
    /// 500: the temporary download file could not be created.
    TempFile,
    /// Any other upstream response, passed through for logging.
    Upstream(StatusCode),
}

impl FetchStatus {
    /// The numeric code for logs.
    pub fn code(self) -> u16 {
        match self {
            FetchStatus::Fetched => 200,
            FetchStatus::Deduplicated => 300,
            FetchStatus::BadUrl => 301,
            FetchStatus::NotModified => 304,
            FetchStatus::Absent => 404,
            FetchStatus::Failed => 418,
            FetchStatus::TempFile => 500,
            FetchStatus::Upstream(status) => status.as_u16(),
        }
    }

    /// Expected outcomes leave the mirror preference alone and are not
    /// worth an error-level log line.
    pub fn is_expected(self) -> bool {
        matches!(
            self,
            FetchStatus::Fetched
                | FetchStatus::Deduplicated
                | FetchStatus::NotModified
                | FetchStatus::Absent
        )
    }
}

/// URL to the wall-clock time of the last in-flight-or-completed fetch.
///
/// The first caller for a URL within the TTL wins the claim and does the
/// work; concurrent and repeated callers are answered immediately with
/// [`FetchStatus::Deduplicated`]. Claim times only move forward.
#[derive(Debug)]
pub struct RecentFetches {
    claims: DashMap<String, Instant>,
    ttl: Duration,
}

impl RecentFetches {
    /// Sweep stale claims once the table grows past this many entries.
    const SWEEP_THRESHOLD: usize = 1024;

    pub fn new() -> Self {
        Self::with_ttl(DEDUP_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            claims: DashMap::new(),
            ttl,
        }
    }

    /// Try to claim `url`. `true` means the caller owns the fetch; `false`
    /// means a recent attempt already covers it.
    pub fn try_claim(&self, url: &str) -> bool {
        if self.claims.len() > Self::SWEEP_THRESHOLD {
            let ttl = self.ttl;
            self.claims.retain(|_, claimed| claimed.elapsed() < ttl);
        }

        // The entry holds its shard lock, so check-then-insert is atomic
        // per key: exactly one concurrent caller wins.
        match self.claims.entry(url.to_owned()) {
            Entry::Occupied(entry) if entry.get().elapsed() < self.ttl => false,
            Entry::Occupied(mut entry) => {
                entry.insert(Instant::now());
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                true
            }
        }
    }
}

impl Default for RecentFetches {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetch one artifact and populate `cache_root` with its contents.
///
/// A non-zero `timestamp` is the client's cached mtime and turns the probe
/// conditional. The temporary download file is removed on every exit path.
#[tracing::instrument(skip_all, fields(%url, timestamp))]
pub async fn fetch_artifact(
    recent: &RecentFetches,
    http: &reqwest::Client,
    url: &Url,
    cache_root: &Path,
    timestamp: u64,
) -> FetchStatus {
    if !recent.try_claim(url.as_str()) {
        return FetchStatus::Deduplicated;
    }

    let since = (timestamp != 0)
        .then(|| Timestamp::from_second(timestamp as i64).ok())
        .flatten();

    let probe = match probe(http, url, since).await {
        Ok(probe) => probe,
        Err(error) => {
            debug!(?error, "artifact probe failed");
            return FetchStatus::Failed;
        }
    };

    match probe.status {
        StatusCode::OK => {}
        StatusCode::NOT_MODIFIED => return FetchStatus::NotModified,
        StatusCode::NOT_FOUND => return FetchStatus::Absent,
        status => return FetchStatus::Upstream(status),
    }

    let Ok(target) = NamedTempFile::new() else {
        return FetchStatus::TempFile;
    };

    if let Err(error) = download(http, url, &probe, &target).await {
        debug!(?error, "artifact download failed");
        return FetchStatus::Failed;
    }

    // Preserve the server's file time so the next conditional request for
    // this artifact can match against it.
    if let Some(modified) = probe.modified {
        let mtime = FileTime::from_unix_time(modified.as_second(), 0);
        if let Err(error) = filetime::set_file_mtime(target.path(), mtime) {
            debug!(?error, "failed to preserve the server file time");
        }
    }

    let size = target.as_file().metadata().map(|meta| meta.len()).unwrap_or(0);
    if size == 0 {
        debug!("artifact body is empty");
        return FetchStatus::Failed;
    }

    if let Err(error) = extract::verify_archive(target.path()).await {
        warn!(?error, "artifact failed verification");
        return FetchStatus::Failed;
    }
    if let Err(error) = extract::extract_archive(target.path(), cache_root).await {
        warn!(?error, "artifact extraction failed");
        return FetchStatus::Failed;
    }

    FetchStatus::Fetched
}

/// What the conditional HEAD learned about the artifact.
#[derive(Debug)]
struct Probe {
    status: StatusCode,
    length: Option<u64>,
    modified: Option<Timestamp>,
}

async fn probe(http: &reqwest::Client, url: &Url, since: Option<Timestamp>) -> Result<Probe> {
    let mut request = http.head(url.clone());
    if let Some(since) = since {
        request = request.header(header::IF_MODIFIED_SINCE, httpdate(since));
    }
    let response = request.send().await.context("send HEAD request")?;
    // Read the header, not the body hint: a HEAD response carries no body,
    // so the hint would report zero.
    let length = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    let modified = response
        .headers()
        .get(header::LAST_MODIFIED)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_httpdate);
    Ok(Probe {
        status: response.status(),
        length,
        modified,
    })
}

async fn download(
    http: &reqwest::Client,
    url: &Url,
    probe: &Probe,
    target: &NamedTempFile,
) -> Result<()> {
    let mut file =
        tokio::fs::File::from_std(target.reopen().context("reopen download file")?);
    match probe.length {
        Some(length) if length >= PART_SPLIT_MIN => {
            download_parts(http, url, length, &mut file).await
        }
        _ => {
            let response = http
                .get(url.clone())
                .send()
                .await
                .context("send GET request")?;
            if response.status() != StatusCode::OK {
                bail!("unexpected status for artifact body: {}", response.status());
            }
            download_stream(response, &mut file).await
        }
    }
}

/// Download the body as [`DOWNLOAD_PARTS`] byte ranges in parallel, then
/// concatenate them in order. Any part failing fails the whole fetch, and
/// a mirror that ignores the range request counts as failing.
async fn download_parts(
    http: &reqwest::Client,
    url: &Url,
    length: u64,
    file: &mut tokio::fs::File,
) -> Result<()> {
    let part_size = length / DOWNLOAD_PARTS;
    let ranges = (0..DOWNLOAD_PARTS).map(|index| {
        let start = index * part_size;
        let end = if index == DOWNLOAD_PARTS - 1 {
            length - 1
        } else {
            (index + 1) * part_size - 1
        };
        download_part(http, url, start, end)
    });

    let parts = futures::future::try_join_all(ranges)
        .await
        .context("download artifact parts")?;
    for part in parts {
        let mut part = tokio::fs::File::from_std(part.reopen().context("reopen part file")?);
        tokio::io::copy(&mut part, file)
            .await
            .context("concatenate part")?;
    }
    file.flush().await.context("flush download file")?;
    Ok(())
}

async fn download_part(
    http: &reqwest::Client,
    url: &Url,
    start: u64,
    end: u64,
) -> Result<NamedTempFile> {
    let part = NamedTempFile::new().context("create part file")?;
    let response = http
        .get(url.clone())
        .header(header::RANGE, format!("bytes={start}-{end}"))
        .send()
        .await
        .context("send ranged GET request")?;
    if response.status() != StatusCode::PARTIAL_CONTENT {
        bail!("mirror ignored the range request: {}", response.status());
    }
    let mut file = tokio::fs::File::from_std(part.reopen().context("reopen part file")?);
    download_stream(response, &mut file).await?;
    Ok(part)
}

/// Stream a response body to the file, aborting stalled or crawling
/// transfers.
async fn download_stream(response: reqwest::Response, file: &mut tokio::fs::File) -> Result<()> {
    let mut stream = response.bytes_stream();
    let mut guard = SpeedGuard::new();
    loop {
        let chunk = tokio::time::timeout(LOW_SPEED_WINDOW, stream.next())
            .await
            .map_err(|_| eyre!("transfer stalled for {LOW_SPEED_WINDOW:?}"))?;
        let Some(chunk) = chunk else { break };
        let chunk = chunk.context("read response body")?;
        if !guard.record(chunk.len() as u64) {
            bail!("transfer below {LOW_SPEED_LIMIT} B/s over {LOW_SPEED_WINDOW:?}");
        }
        file.write_all(&chunk).await.context("write download file")?;
    }
    file.flush().await.context("flush download file")?;
    Ok(())
}

/// Windowed transfer-rate check.
#[derive(Debug)]
struct SpeedGuard {
    window_started: Instant,
    window_bytes: u64,
}

impl SpeedGuard {
    fn new() -> Self {
        Self {
            window_started: Instant::now(),
            window_bytes: 0,
        }
    }

    /// Record `len` transferred bytes. `false` means the transfer averaged
    /// below the low-speed limit for a full window.
    fn record(&mut self, len: u64) -> bool {
        self.window_bytes += len;
        let elapsed = self.window_started.elapsed();
        if elapsed < LOW_SPEED_WINDOW {
            return true;
        }
        if too_slow(self.window_bytes, elapsed) {
            return false;
        }
        self.window_started = Instant::now();
        self.window_bytes = 0;
        true
    }
}

/// Whether `bytes` over `elapsed` averages under [`LOW_SPEED_LIMIT`].
fn too_slow(bytes: u64, elapsed: Duration) -> bool {
    elapsed >= LOW_SPEED_WINDOW && bytes < LOW_SPEED_LIMIT * elapsed.as_secs()
}

/// Format a timestamp as an IMF-fixdate header value.
fn httpdate(ts: Timestamp) -> String {
    ts.strftime("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an RFC 2822 / IMF-fixdate header value.
fn parse_httpdate(value: &str) -> Option<Timestamp> {
    static PARSER: rfc2822::DateTimeParser = rfc2822::DateTimeParser::new();
    PARSER.parse_timestamp(value).ok()
}
