use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Result, anyhow};
use clap::Parser;
use mvm::{
    cfg::Config,
    db::Db,
    group,
    machine::{Machine, ProcessPlatform},
    quorum, rpc,
};
use tokio::{select, signal, sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[clap(long, short, default_values = ["config.toml"])]
    config_file: Vec<PathBuf>,
    #[clap(long, default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_line_number(true)
        .with_ansi(false);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    // Set a panic hook that records the panic as a `tracing` event at the `ERROR` verbosity level.
    std::panic::set_hook(Box::new(|panic| {
        let message = match panic.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>");

        let backtrace = Backtrace::capture();
        let backtrace =
            (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());

        match (panic.location(), backtrace) {
            (None, None) => {
                error!(thread_name, message);
            }
            (None, Some(backtrace)) => {
                error!(thread_name, message, %backtrace);
            }
            (Some(location), None) => {
                error!(
                    thread_name,
                    message,
                    panic.file = location.file(),
                    panic.line = location.line(),
                    panic.column = location.column(),
                );
            }
            (Some(location), Some(backtrace)) => {
                error!(
                    thread_name,
                    message,
                    panic.file = location.file(),
                    panic.line = location.line(),
                    panic.column = location.column(),
                    %backtrace,
                );
            }
        }
    }));

    let mut merged_config = toml::Table::new();
    for config_file in args.config_file {
        let config = fs::read_to_string(&config_file)?;
        let config: toml::Table = toml::from_str(&config)?;
        for key in config.keys() {
            if merged_config.contains_key(key) {
                return Err(anyhow!(
                    "configuration conflict: {config_file:?} contained a key {key:?} that was already included in an earlier file"
                ));
            }
        }
        merged_config.extend(config);
    }

    let config: Config = serde::Deserialize::deserialize(merged_config)?;
    config.validate()?;

    let db = Arc::new(Db::new(config.data_dir.as_ref(), config.db_cache_size)?);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let machine = Arc::new(Machine::new(
        db.clone(),
        config.machine.clone(),
        outbound_tx,
    )?);
    let engine = Arc::new(quorum::Engine::connect(db.clone(), config.quorum.clone()));
    machine.add_engine(ProcessPlatform::Quorum, engine.clone());
    info!(
        member = %machine.signer().address(),
        threshold = machine.signer().threshold(),
        "machine started"
    );

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    tasks.spawn(machine.run(inbound_rx, cancel.clone()));
    tasks.spawn(engine.run(cancel.clone()));
    tasks.spawn(rpc::serve(db, config.status_port, cancel.clone()));
    tasks.spawn(group::loopback(outbound_rx, inbound_tx, cancel.clone()));
    tasks.spawn(shutdown_signal(cancel.clone()));

    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined.map_err(anyhow::Error::from).and_then(|r| r) {
            error!(%e, "task failed, shutting down");
            cancel.cancel();
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}

/// Cancels `cancel` on SIGINT or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())?
            .recv()
            .await;
        Ok::<_, anyhow::Error>(())
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    select! {
        _ = cancel.cancelled() => return Ok(()),
        result = signal::ctrl_c() => result?,
        result = terminate => result?,
    }
    info!("shutting down");
    cancel.cancel();
    Ok(())
}
