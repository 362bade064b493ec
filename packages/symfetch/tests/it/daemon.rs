//! End-to-end scenarios for the fetch daemon: the worker protocol over a
//! socket pair and the fetch procedure against the loopback origin.

use std::{collections::HashMap, time::Duration};

use color_eyre::Result;
use pretty_assertions::assert_eq as pretty_assert_eq;
use symfetch::{
    config::Mirrors,
    daemon::{
        Context, serve,
        fetch::{FetchStatus, RecentFetches, fetch_artifact},
    },
    proto::Prefix,
};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::UnixStream,
};

use crate::{incompressible, spawn_origin, tar_xz};

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .expect("build http client")
}

#[test_log::test(tokio::test)]
async fn first_access_hydrates_the_cache() -> Result<()> {
    let _ = color_eyre::install();

    let archive = tar_xz(&[("foo/bar.debug", b"DWARF!".as_slice())]).await;
    let origin = spawn_origin(HashMap::from([(
        "/lib/foo/bar.debug.tar".to_owned(),
        archive,
    )]))
    .await;

    let cache = tempfile::tempdir()?;
    let mirrors = Mirrors::parse(&origin.mirror())?;
    let url = mirrors.artifact_url(Prefix::Lib, "/foo/bar.debug")?;

    let status = fetch_artifact(&RecentFetches::new(), &http_client(), &url, cache.path(), 0).await;
    pretty_assert_eq!(status, FetchStatus::Fetched);

    let content = std::fs::read(cache.path().join("foo/bar.debug"))?;
    pretty_assert_eq!(content, b"DWARF!");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn refresh_with_a_current_copy_changes_nothing() -> Result<()> {
    let _ = color_eyre::install();

    let archive = tar_xz(&[("foo/bar.debug", b"DWARF!".as_slice())]).await;
    let origin = spawn_origin(HashMap::from([(
        "/lib/foo/bar.debug.tar".to_owned(),
        archive,
    )]))
    .await;

    let cache = tempfile::tempdir()?;
    let mirrors = Mirrors::parse(&origin.mirror())?;
    let url = mirrors.artifact_url(Prefix::Lib, "/foo/bar.debug")?;

    // The client already holds a copy with this mtime; the conditional
    // probe comes back 304 and the cache stays untouched.
    let status = fetch_artifact(
        &RecentFetches::new(),
        &http_client(),
        &url,
        cache.path(),
        1_700_000_000,
    )
    .await;
    pretty_assert_eq!(status, FetchStatus::NotModified);
    assert!(!cache.path().join("foo/bar.debug").exists());
    pretty_assert_eq!(origin.downloads.load(std::sync::atomic::Ordering::Relaxed), 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn absent_artifacts_are_a_clean_miss() -> Result<()> {
    let _ = color_eyre::install();

    let origin = spawn_origin(HashMap::new()).await;
    let cache = tempfile::tempdir()?;
    let mirrors = Mirrors::parse(&origin.mirror())?;
    let url = mirrors.artifact_url(Prefix::Lib, "/does/not/exist")?;

    let status = fetch_artifact(&RecentFetches::new(), &http_client(), &url, cache.path(), 0).await;
    pretty_assert_eq!(status, FetchStatus::Absent);
    pretty_assert_eq!(std::fs::read_dir(cache.path())?.count(), 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn repeated_fetches_are_deduplicated() -> Result<()> {
    let _ = color_eyre::install();

    let archive = tar_xz(&[("same.debug", b"once".as_slice())]).await;
    let origin = spawn_origin(HashMap::from([("/lib/same.debug.tar".to_owned(), archive)])).await;

    let cache = tempfile::tempdir()?;
    let mirrors = Mirrors::parse(&origin.mirror())?;
    let url = mirrors.artifact_url(Prefix::Lib, "/same.debug")?;
    let recent = RecentFetches::new();
    let http = http_client();

    let first = fetch_artifact(&recent, &http, &url, cache.path(), 0).await;
    let second = fetch_artifact(&recent, &http, &url, cache.path(), 0).await;

    pretty_assert_eq!(first, FetchStatus::Fetched);
    pretty_assert_eq!(second, FetchStatus::Deduplicated);
    // Exactly one download left the host for this URL.
    pretty_assert_eq!(origin.downloads.load(std::sync::atomic::Ordering::Relaxed), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn hostile_archives_never_reach_the_cache() -> Result<()> {
    let _ = color_eyre::install();

    let archive = tar_xz(&[("../escape", b"gotcha".as_slice())]).await;
    let origin = spawn_origin(HashMap::from([("/lib/evil.tar".to_owned(), archive)])).await;

    let outer = tempfile::tempdir()?;
    let cache = outer.path().join("cache");
    std::fs::create_dir(&cache)?;
    let mirrors = Mirrors::parse(&origin.mirror())?;
    let url = mirrors.artifact_url(Prefix::Lib, "/evil")?;

    let status = fetch_artifact(&RecentFetches::new(), &http_client(), &url, &cache, 0).await;
    pretty_assert_eq!(status, FetchStatus::Failed);
    assert!(!outer.path().join("escape").exists(), "member escaped the root");
    pretty_assert_eq!(std::fs::read_dir(&cache)?.count(), 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn split_downloads_reassemble_the_artifact() -> Result<()> {
    let _ = color_eyre::install();

    // Large enough that the sized download is fetched as two ranged parts.
    let payload = incompressible(256 * 1024);
    let archive = tar_xz(&[("big/blob.debug", payload.as_slice())]).await;
    assert!(archive.len() as u64 >= symfetch::config::PART_SPLIT_MIN);

    let origin = spawn_origin(HashMap::from([(
        "/lib/big/blob.debug.tar".to_owned(),
        archive,
    )]))
    .await;

    let cache = tempfile::tempdir()?;
    let mirrors = Mirrors::parse(&origin.mirror())?;
    let url = mirrors.artifact_url(Prefix::Lib, "/big/blob.debug")?;

    let status = fetch_artifact(&RecentFetches::new(), &http_client(), &url, cache.path(), 0).await;
    pretty_assert_eq!(status, FetchStatus::Fetched);

    let content = std::fs::read(cache.path().join("big/blob.debug"))?;
    pretty_assert_eq!(content.len(), payload.len());
    pretty_assert_eq!(content, payload);
    // One ranged GET per part.
    pretty_assert_eq!(origin.downloads.load(std::sync::atomic::Ordering::Relaxed), 2);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn workers_answer_ok_over_the_socket() -> Result<()> {
    let _ = color_eyre::install();

    let archive = tar_xz(&[("foo/bar.debug", b"DWARF!".as_slice())]).await;
    let origin = spawn_origin(HashMap::from([(
        "/lib/foo/bar.debug.tar".to_owned(),
        archive,
    )]))
    .await;

    let cache = tempfile::tempdir()?;
    std::fs::create_dir(cache.path().join("lib"))?;
    let ctx = Context::new(Mirrors::parse(&origin.mirror())?, cache.path().to_path_buf())?;

    let (mut client, server) = UnixStream::pair()?;
    let worker = tokio::spawn(async move { serve(&ctx, server).await });

    client.write_all(b"0:lib:/foo/bar.debug\0").await?;
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await?;
    worker.await?;

    pretty_assert_eq!(reply, b"ok\0");
    let content = std::fs::read(cache.path().join("lib/foo/bar.debug"))?;
    pretty_assert_eq!(content, b"DWARF!");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn malformed_requests_are_dropped_silently() -> Result<()> {
    let _ = color_eyre::install();

    let origin = spawn_origin(HashMap::new()).await;
    let cache = tempfile::tempdir()?;
    let ctx = std::sync::Arc::new(Context::new(
        Mirrors::parse(&origin.mirror())?,
        cache.path().to_path_buf(),
    )?);

    for line in [
        b"0:lib:/foo/../../etc/passwd\0".as_slice(),
        b"0:bin:/foo\0".as_slice(),
        b"0:lib:/\0".as_slice(),
        b"not a request at all\0".as_slice(),
    ] {
        let (mut client, server) = UnixStream::pair()?;
        let ctx = std::sync::Arc::clone(&ctx);
        let worker = tokio::spawn(async move { serve(&ctx, server).await });
        client.write_all(line).await?;
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await?;
        worker.await?;

        pretty_assert_eq!(reply, b"", "line {line:?} must get no reply");
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn upstream_errors_rotate_the_mirror() -> Result<()> {
    let _ = color_eyre::install();

    let origin = spawn_origin(HashMap::new()).await;
    let cache = tempfile::tempdir()?;
    std::fs::create_dir(cache.path().join("lib"))?;

    let first = format!("http://{}/a/", origin.addr);
    let second = format!("http://{}/b/", origin.addr);
    let ctx = std::sync::Arc::new(Context::new(
        Mirrors::parse(&format!("{first} {second}"))?,
        cache.path().to_path_buf(),
    )?);
    pretty_assert_eq!(ctx.mirrors.preferred().as_str(), first);

    let (mut client, server) = UnixStream::pair()?;
    let worker = {
        let ctx = std::sync::Arc::clone(&ctx);
        tokio::spawn(async move { serve(&ctx, server).await })
    };
    client.write_all(b"0:lib:/err/boom\0").await?;
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await?;
    worker.await?;

    // The worker still answers, and the preference has moved on.
    pretty_assert_eq!(reply, b"ok\0");
    pretty_assert_eq!(ctx.mirrors.preferred().as_str(), second);
    Ok(())
}
