//! The binary entrypoint for `symfetch-fs`, the shadow filesystem.
//!
//! By default both debug trees are served, one mount per thread; each
//! instance owns its own cache-root translation, so the mounts are fully
//! independent.

use std::os::unix::fs::DirBuilderExt as _;

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context as _, bail},
};
use symfetch::{config::DebugTree, proto::Prefix, shadow};
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};
use tracing_tree::time::Uptime;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Config {
    /// Serve a single tree (lib or src) instead of both
    #[arg(long)]
    tree: Option<Prefix>,

    /// FUSE dispatch threads per mount
    #[arg(long, default_value_t = 1)]
    threads: usize,
}

fn main() -> Result<()> {
    let config = Config::parse();
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_bracketed_fields(true)
                .with_timer(Uptime::default())
                .with_targets(false),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Extracted files keep their archived modes, and the trigger client
    // must survive the daemon closing a socket under it.
    unsafe {
        libc::umask(0);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
    ensure_fuse_module();

    let trees = match config.tree {
        Some(prefix) => vec![DebugTree::of(prefix)],
        None => Prefix::ALL.into_iter().map(DebugTree::of).collect(),
    };

    // The daemon normally creates these with the right ownership; an
    // unprivileged start still needs them to exist for the mount.
    for tree in &trees {
        let result = std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&tree.cache_root);
        if let Err(error) = result {
            bail!("create cache root {:?}: {error}", tree.cache_root);
        }
    }

    let mut mounts = Vec::new();
    for tree in trees {
        let threads = config.threads;
        mounts.push(std::thread::spawn(move || shadow::mount(tree, threads)));
    }
    for mount in mounts {
        match mount.join() {
            Ok(result) => result.context("serve mount")?,
            Err(_) => bail!("mount thread panicked"),
        }
    }
    Ok(())
}

/// Best effort: load the fuse module if it is not already present.
fn ensure_fuse_module() {
    if std::path::Path::new("/sys/module/fuse").exists() {
        return;
    }
    let _ = std::process::Command::new("modprobe").arg("fuse").status();
}
