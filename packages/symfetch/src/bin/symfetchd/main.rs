//! The binary entrypoint for `symfetchd`, the fetch daemon.

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use color_eyre::Result;
use symfetch::{
    config::{self, Mirrors},
    daemon,
};
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};
use tracing_tree::time::Uptime;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Config {
    /// Parent directory of the per-tree caches
    #[arg(long, default_value = config::CACHE_ROOT)]
    cache_root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
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

    // Archived files keep their modes verbatim, and a worker losing its
    // client mid-write must not take the process down.
    unsafe {
        libc::umask(0);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let user = daemon::setup::ServiceUser::lookup();
    daemon::setup::prepare_cache_trees(&config.cache_root, user)?;

    // The socket is acquired before privileges go away: binding the
    // well-known address may be the last thing root is needed for.
    let listener = daemon::setup::acquire_listener()?;
    daemon::setup::drop_privileges(user)?;

    listener.set_nonblocking(true)?;
    let listener = tokio::net::UnixListener::from_std(listener)?;

    let mirrors = Mirrors::from_env()?;
    let ctx = Arc::new(daemon::Context::new(mirrors, config.cache_root)?);
    daemon::run(ctx, listener).await
}
