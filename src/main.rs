pub use anyhow::Result;
use anyhow::Error;
use clap::Parser;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use tracing::{error, info, info_span};
use tracing_subscriber::{
    fmt::{format::FmtSpan, Subscriber},
    prelude::*,
    EnvFilter,
};

mod cache;
mod calldata;
mod config;
mod errors;
mod formatter;
mod geo;
mod resolver;
mod server;
mod sources;

use crate::cache::CallsignCache;
use crate::config::{ConfigTree, Settings, SiteLocation};
use crate::errors::FatalError;
use crate::resolver::Resolver;
use crate::server::Service;
use crate::sources::{qrz::Credentials, qrz::QrzClient, shared_http_client, uls::UlsDatabase};
use crate::sources::CallsignSource;

/// Our command-line arguments.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "answer callsign lookups over a line protocol on standard input"
)]
struct Opt {
    /// Path to the JSON configuration file.
    #[arg(long = "config", default_value = "config.json")]
    config_path: PathBuf,

    /// Callsigns to look up in batch mode. With none given, the service
    /// answers commands interactively until EOF or /EXIT.
    callsigns: Vec<String>,
}

// Our main entrypoint. The request loop is strictly single-threaded, so a
// current-thread runtime is all we need.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opt = Opt::parse();
    if let Err(err) = run(opt).await {
        process::exit(errors::report(&err));
    }
}

async fn run(opt: Opt) -> Result<()> {
    // This can't work without a valid configuration.
    let tree = match ConfigTree::from_path(&opt.config_path) {
        Ok(tree) => tree,
        Err(err) => {
            println!("Please edit your config.json and try again!");
            return Err(err.context(FatalError::ConfigUnusable(
                opt.config_path.display().to_string(),
            )));
        }
    };

    // Configure tracing. The log destination comes from the config so it
    // can be pointed at a file without touching the environment.
    let logpath = tree.get_str("logpath").unwrap_or("stderr").to_owned();
    init_tracing(&logpath)?;
    let _span = info_span!("callsign-lookup").entered();
    info!(
        "{}/{} starting up!",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let mut settings = Settings::from_tree(&tree);
    let site = SiteLocation::from_tree(&tree);

    // Wire up the sources in lookup-priority order: the remote directory
    // first, then the local regulator database.
    let mut lookup_sources: Vec<Arc<dyn CallsignSource>> = Vec::new();
    if settings.use_qrz {
        match Credentials::from_env() {
            Ok(credentials) => {
                lookup_sources.push(Arc::new(QrzClient::new(credentials, shared_http_client())));
            }
            Err(err) => {
                error!("QRZ enabled but credentials unavailable: {:#}. Disabling QRZ!", err);
                settings.use_qrz = false;
            }
        }
    }
    if settings.use_uls {
        match &settings.uls_db {
            Some(path) => match UlsDatabase::open(path).await {
                Ok(uls) => lookup_sources.push(Arc::new(uls)),
                Err(err) => {
                    error!("failed opening ULS database: {:#}. Disabling ULS!", err);
                    settings.use_uls = false;
                }
            },
            None => {
                error!("Failed to find uls-db in config! Disabling ULS...");
                settings.use_uls = false;
            }
        }
    }

    let cache = if settings.use_cache {
        match &settings.cache_db {
            Some(path) => {
                match CallsignCache::open(path, settings.cache_expiry, settings.keep_stale_if_offline)
                    .await
                {
                    Ok(cache) => Some(cache),
                    Err(err) => {
                        error!("failed opening cache {}: {:#}. Disabling caching!", path, err);
                        settings.use_cache = false;
                        None
                    }
                }
            }
            None => {
                error!("Failed to find cache-db in config! Disabling cache...");
                settings.use_cache = false;
                None
            }
        }
    } else {
        None
    };

    let resolver = Resolver::new(
        cache,
        lookup_sources,
        settings.retry_delay,
        settings.max_requests,
    );
    let mut service = Service::new(settings, site, resolver);

    // Banner first, then the startup expiry sweep, then requests.
    print!("{}", service.banner());
    io::Write::flush(&mut io::stdout())?;
    service.startup_sweep().await;

    if !opt.callsigns.is_empty() {
        service.run_batch(&opt.callsigns).await
    } else {
        info!("ready to answer requests");
        service.run_interactive().await
    }
}

/// Send tracing output to stderr or to the `file://` destination named by
/// the `logpath` config option.
fn init_tracing(logpath: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if logpath == "stderr" {
        Subscriber::builder()
            .with_writer(io::stderr)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_env_filter(filter)
            .finish()
            .init();
    } else {
        let path = logpath.strip_prefix("file://").unwrap_or(logpath);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| {
                eprintln!("+ERROR could not open logpath {:?}: {}", logpath, err);
                Error::new(err).context(format!("could not open logpath {:?}", logpath))
            })?;
        Subscriber::builder()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_env_filter(filter)
            .finish()
            .init();
    }
    Ok(())
}
