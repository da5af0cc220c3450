use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use sniff::archive::ArchiveWriter;
use sniff::config::{Cli, Config, Mode};
use sniff::dns::{ReverseResolver, SystemResolver};
use sniff::events::{EventSink, JsonLinesSink};
use sniff::offline::{self, OfflineOptions};
use sniff::{Controller, SessionEnv};

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if cli.list_interfaces {
        for name in sniff::sniff::list_interfaces().context("listing interfaces")? {
            println!("{name}");
        }
        return Ok(());
    }
    let list_captures = cli.list_captures;
    let config = Config::from_cli(cli).context("invalid configuration")?;
    let archive = ArchiveWriter::new(&config.capture_dir, config.tuning.archive_keep);

    if list_captures {
        let catalog = archive.catalog().context("reading capture catalog")?;
        println!("{}", serde_json::to_string_pretty(&catalog)?);
        return Ok(());
    }

    let resolver: Arc<dyn ReverseResolver> = Arc::new(SystemResolver);
    match config.mode.clone() {
        Mode::Offline(path) => {
            let options = OfflineOptions {
                resolve_dns: config.resolve_dns,
                policy: config.policy,
                dns_timeout: config.tuning.dns.timeout(),
                dns_parallelism: config.tuning.dns.per_tick,
            };
            match offline::analyze(&path, &options, resolver) {
                Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                Err(e) => {
                    error!(file = %path.display(), error = %e, "offline analysis failed");
                    println!("{}", serde_json::json!({ "error": e.to_string() }));
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Mode::Capture(target) => serve(&config, Some(target), archive, resolver),
        Mode::Idle => serve(&config, None, archive, resolver),
    }
}

fn serve(
    config: &Config,
    target: Option<sniff::CaptureTarget>,
    archive: ArchiveWriter,
    resolver: Arc<dyn ReverseResolver>,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("sniff-worker")
        .build()
        .context("building async runtime")?;

    let sink: Arc<dyn EventSink> = Arc::new(JsonLinesSink);
    let env = SessionEnv { runtime: runtime.handle().clone(), sink, resolver };
    let configured = target.is_some();
    let (controller, control_thread) =
        Controller::new(target, config.session_options(), archive, env).spawn().context("starting controller")?;

    let (shutdown_tx, shutdown_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("installing Ctrl-C handler")?;

    info!(port = config.port, capture_dir = %config.capture_dir.display(), "ready");
    if configured {
        controller.start(None).context("starting capture")?;
    } else if controller.query_readiness()?.is_none() {
        warn!("no capture target configured, waiting for Ctrl-C");
    }

    let _ = shutdown_rx.recv();
    info!("shutting down");
    match controller.stop() {
        Ok(Some(saved)) => info!(file = %saved.path.display(), packets = saved.packet_count, "capture archived"),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "stop failed"),
    }
    controller.shutdown()?;
    if control_thread.join().is_err() {
        warn!("controller thread panicked");
    }
    runtime.shutdown_timeout(config.tuning.stop_timeout());
    Ok(())
}
