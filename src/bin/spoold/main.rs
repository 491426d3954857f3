mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use label_spooler::config::Config;
use label_spooler::executor::Executor;
use label_spooler::poller::LogSink;
use label_spooler::queue::PriorityQueue;
use label_spooler::session::{serve_conn, Limits};
use label_spooler::spooler::Spooler;
use label_spooler::store::MemoryStore;
use label_spooler::transport::RawSocketTransport;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Level};

use crate::args::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(error) => {
                error!(%error, "unusable configuration");
                return ExitCode::from(2);
            },
        },
        None => Config::default(),
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    // Each connection task holds a sender; recv() returns once all are gone.
    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code =
        if let Err(error) = begin(args, config, cancel, shutdown_hold).await {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        };

    shutdown_wait.recv().await;

    exit_code
}

async fn begin(
    args: Args,
    config: Config,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> Result<()> {
    let printers = config.printer_addrs().context("loading printers")?;
    info!(printers = printers.len(), workers = config.workers, "starting");
    if printers.is_empty() {
        warn!("no printers configured, every submission will be refused");
    }

    let limits = Limits {
        max_unit_size: args.max_unit_size as usize,
        max_units: args.max_units as usize,
    };
    let queue = Arc::new(
        PriorityQueue::new(Arc::new(MemoryStore::new()))
            .with_max_unit_size(limits.max_unit_size)
            .with_max_units(limits.max_units)
            .with_printers(printers.keys().cloned()),
    );
    let spooler = Arc::new(Spooler::new(queue.clone(), Arc::new(LogSink)));

    let executor = Arc::new(
        Executor::new(queue, Arc::new(RawSocketTransport::new(printers)))
            .with_retry(config.retry.clone())
            .with_inter_unit_delay(config.inter_unit_delay())
            .with_shutdown(cancel.clone()),
    );
    let workers = executor.spawn(config.workers);
    let sweeper = tokio::spawn(
        spooler
            .poller()
            .clone()
            .run_sweeper(config.sweep_interval(), cancel.clone()),
    );

    let listener = TcpListener::bind((args.listen, args.port))
        .await
        .context("binding listener")?;
    info!(addr = %listener.local_addr()?, "listening");

    // Accept incoming connections until an exit signal is sent, and handle each
    // connection as its own task.
    loop {
        let conn = match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => break,
        } {
            Ok((conn, _)) => conn,
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };

        tokio::spawn(begin_handle(
            spooler.clone(),
            cancel.clone(),
            shutdown_hold.clone(),
            conn,
            limits,
        ));
    }

    for worker in workers {
        worker.await.context("joining worker")?;
    }
    sweeper.await.context("joining sweeper")?;

    Ok(())
}

#[instrument(name = "handle", err, fields(peer = %conn.peer_addr()?), skip_all)]
async fn begin_handle(
    spooler: Arc<Spooler>,
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    mut conn: TcpStream,
    limits: Limits,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let ret = serve_conn(&spooler, &mut conn, cancel, limits)
        .await
        .context("serving connection");

    conn.shutdown().await.context("during shutdown")?;

    debug!("closed connection");

    ret
}
