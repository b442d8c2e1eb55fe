//! Echo server: every stream a client opens is echoed back, followed by a closing notice once the
//! client finishes it.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    thread,
};

use anyhow::{Context, Result};
use clap::Parser;
use quic_shard::{
    engine::quiche::QuicheEngine, shard, Echo, EndpointConfig, TransportConfig,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "quic-echo-server")]
struct Opt {
    /// UDP port to listen on
    #[arg(long, default_value_t = 1234)]
    port: u16,
    /// TLS certificate chain in PEM format
    #[arg(long, default_value = "./cert.crt")]
    cert: PathBuf,
    /// TLS private key in PEM format
    #[arg(long, default_value = "./cert.key")]
    key: PathBuf,
    /// Number of worker threads, each with its own socket on the same port
    #[arg(long)]
    workers: Option<usize>,
}

fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish(),
    )
    .unwrap();
    let opt = Opt::parse();
    let code = {
        if let Err(e) = run(opt) {
            eprintln!("ERROR: {e:#}");
            1
        } else {
            0
        }
    };
    ::std::process::exit(code);
}

fn run(options: Opt) -> Result<()> {
    let workers = match options.workers {
        Some(n) => n,
        None => thread::available_parallelism()
            .context("failed to determine available parallelism")?
            .get(),
    };
    let transport = Arc::new(TransportConfig::from_env());
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, options.port));
    let (cert, key) = (options.cert, options.key);

    let workers = shard::spawn_workers(workers, addr, EndpointConfig::default(), move |_| {
        let engine = QuicheEngine::server(&transport, &cert, &key)?;
        Ok((engine, Echo))
    })
    .context("failed to start server")?;
    info!(
        "listening on {} with {} workers",
        workers.local_addr(),
        workers.len()
    );

    for (index, result) in workers.join().into_iter().enumerate() {
        match result {
            Ok(stats) => info!(index, ?stats, "worker stopped"),
            Err(e) => error!(index, "worker failed: {e}"),
        }
    }
    Ok(())
}
