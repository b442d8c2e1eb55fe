//! Echo client: sends a file (or standard input) on one stream and prints what comes back.

use std::{
    fs::File,
    io::{self, BufRead, Read, Write},
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    thread,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use quic_shard::{
    engine::quiche::QuicheEngine, ChunkWriter, Client, ClientConfig, TransportConfig, FILE_CHUNK,
};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "quic-echo-client")]
struct Opt {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,
    /// Server port
    #[arg(long, default_value_t = 1234)]
    port: u16,
    /// File to send; standard input is sent line by line if omitted
    #[arg(long)]
    file: Option<PathBuf>,
}

fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(io::stderr)
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

#[tokio::main(flavor = "current_thread")]
async fn run(options: Opt) -> Result<()> {
    let server = SocketAddr::new(options.host, options.port);
    let transport = Arc::new(TransportConfig::from_env());
    let engine = QuicheEngine::client(&transport)?;
    let mut config = ClientConfig::new(transport);
    config.server_name(Some(options.host.to_string()));

    let (client, streams) =
        Client::bind(engine, server, config).context("failed to start connection")?;
    info!(cid = %client.cid(), %server, "connecting");

    let file = match &options.file {
        Some(path) => {
            Some(File::open(path).with_context(|| format!("failed to open {}", path.display()))?)
        }
        None => None,
    };
    let send = streams.send;
    thread::spawn(move || {
        let result = match file {
            Some(file) => send_file(file, send),
            None => send_lines(io::stdin().lock(), send),
        };
        if let Err(e) = result {
            debug!("stopped reading input: {e}");
        }
    });

    let mut recv = streams.recv;
    let printer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(chunk) = recv.read().await {
            if stdout.write_all(&chunk.data).and_then(|()| stdout.flush()).is_err() {
                break;
            }
        }
    });

    let stats = client.run().await.context("connection failed")?;
    printer.await?;
    info!("recv={} sent={} lost={} rtt={:?}", stats.recv, stats.sent, stats.lost, stats.rtt);
    Ok(())
}

fn send_file(mut file: File, mut send: ChunkWriter) -> Result<()> {
    let mut buf = vec![0; FILE_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        send.write(Bytes::copy_from_slice(&buf[..n]))?;
    }
    send.finish()?;
    Ok(())
}

fn send_lines(input: impl BufRead, mut send: ChunkWriter) -> Result<()> {
    for line in input.lines() {
        let mut line = line?;
        line.push('\n');
        send.write(line.into_bytes())?;
    }
    send.finish()?;
    Ok(())
}
