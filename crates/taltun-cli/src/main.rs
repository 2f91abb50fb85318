//! taltun daemon: configuration, logging, signals, engine lifecycle.

mod config;

use anyhow::Context;
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::Arc;
use std::time::Instant;
use taltun_core::{Engine, Mode};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(err) = run() {
        eprintln!("taltun: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = config::Cli::parse();
    let (engine_cfg, peers) = config::load(&cli).context("loading configuration")?;

    let default_level = if engine_cfg.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mode = engine_cfg.mode;
    info!(
        mode = ?mode,
        vip = %engine_cfg.local_vip,
        bind = %engine_cfg.local_bind,
        "starting taltun"
    );

    let mut engine = Engine::new(engine_cfg).context("building engine")?;

    let mut configured = 0usize;
    for peer in &peers {
        match engine.add_peer(peer) {
            Ok(()) => configured += 1,
            Err(err) => warn!(peer = %peer.vip, %err, "skipping invalid peer"),
        }
    }
    if configured == 0 && mode == Mode::Client {
        warn!("client started with no configured peers");
    }

    engine.initialize().context("initializing engine resources")?;
    let engine = Arc::new(engine);

    // SIGINT/SIGTERM flip the engine's closed flag; run() then drains and
    // joins the workers.
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("installing signal handler")?;
    {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "shutdown signal received");
                engine.close();
            }
        });
    }

    let started = Instant::now();
    engine.run().context("engine failed")?;

    info!(uptime = ?started.elapsed(), "taltun stopped");
    Ok(())
}
