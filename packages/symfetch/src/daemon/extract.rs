//! Archive verification and extraction.
//!
//! Artifacts are XZ-compressed tarballs whose members are relative to a
//! tree's cache root. Verification walks the entry list without writing
//! anything; member paths are untrusted, so anything that could land
//! outside the root is rejected before a single byte is materialized. The
//! extraction itself is delegated to `tar` in a child process.

use std::path::{Component, Path};

use async_compression::tokio::bufread::XzDecoder;
use async_tar::{Archive, EntryType};
use color_eyre::{
    Result,
    eyre::{Context as _, ensure},
};
use futures::StreamExt;
use tokio::{fs::File, io::BufReader, process::Command};
use tokio_util::compat::TokioAsyncReadCompatExt;

/// Walk the archive's entry list and reject any member that could escape
/// the extraction root. Nothing is written.
pub async fn verify_archive(archive: &Path) -> Result<()> {
    let file = File::open(archive).await.context("open archive")?;
    let decoder = XzDecoder::new(BufReader::new(file));
    let archive = Archive::new(decoder.compat());
    let mut entries = archive.entries().context("read archive entries")?;

    while let Some(entry) = entries.next().await {
        let entry = entry.context("read archive entry")?;
        let path = entry.path().context("read entry path")?;
        ensure!(
            contained(AsRef::<Path>::as_ref(path.as_ref())),
            "archive member {path:?} escapes the extraction root"
        );

        // A hard link materializes through its target, so the target is
        // held to the same rule. Symlink targets are not: the prepared
        // archives carry top-level symlinks and nothing writes through
        // them at extraction time.
        if entry.header().entry_type() == EntryType::Link {
            if let Some(target) = entry.link_name().context("read link target")? {
                ensure!(
                    contained(AsRef::<Path>::as_ref(target.as_ref())),
                    "archive hard link target {target:?} escapes the extraction root"
                );
            }
        }
    }
    Ok(())
}

/// `true` when extracting `path` relative to a root cannot land outside it.
fn contained(path: &Path) -> bool {
    if path.is_absolute() {
        return false;
    }
    path.components().all(|component| match component {
        Component::ParentDir | Component::RootDir | Component::Prefix(_) => false,
        Component::CurDir | Component::Normal(_) => true,
    })
}

/// Materialize the archive into `root` with a `tar` child process.
pub async fn extract_archive(archive: &Path, root: &Path) -> Result<()> {
    let status = Command::new("tar")
        .arg("-C")
        .arg(root)
        .arg("--no-same-owner")
        .arg("--no-same-permissions")
        .arg("-xf")
        .arg(archive)
        .status()
        .await
        .context("spawn tar")?;
    ensure!(status.success(), "tar exited with {status}");
    Ok(())
}
