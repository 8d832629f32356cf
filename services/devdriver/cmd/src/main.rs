//! devdriver session daemon and client.
//!
//! With `--listen` the binary accepts TCP peers and serves the echo protocol
//! on every connection. With `--connect` it opens a session to the echo
//! server, sends a series of pings, checks the echoes and closes gracefully.

use anyhow::{bail, Context, Result};
use clap::Parser;
use dd_session::{dispatch_inbound, SessionManager, TcpChannel};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod echo;
mod logging;

use config::DevDriverConfig;
use echo::{run_pings, EchoServer, PingOptions};
use logging::DevDriverLogFormatter;

/// Messages buffered per direction on a TCP connection
const TRANSPORT_QUEUE_DEPTH: usize = 1024;

/// Reliable session transport daemon and echo client
#[derive(Parser, Debug)]
#[command(name = "devdriver", version, about = "Reliable session transport for developer-driver protocols")]
struct Args {
    /// Accept peers on this address, e.g. 0.0.0.0:27300
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Connect to an echo server at this address, e.g. 127.0.0.1:27300
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Client id of this endpoint
    #[arg(long)]
    client_id: Option<u16>,

    /// Client id of the echo server when connecting
    #[arg(long)]
    remote_client_id: Option<u16>,

    /// Pings to send when connecting
    #[arg(long, default_value = "10")]
    count: u32,

    /// Bytes per ping
    #[arg(long, default_value = "64")]
    payload_size: usize,

    /// Session update interval, e.g. 1ms
    #[arg(long)]
    tick: Option<humantime::Duration>,

    /// Time allowed for each ping and for the session handshake
    #[arg(long, default_value = "5s")]
    timeout: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "devdriver.yaml")]
    config: PathBuf,
}

impl Args {
    /// Flags given on the command line win over file and environment values
    fn apply_to(&self, config: &mut DevDriverConfig) {
        if let Some(listen) = self.listen {
            config.listen = Some(listen);
        }
        if let Some(connect) = self.connect {
            config.connect = Some(connect);
        }
        if let Some(client_id) = self.client_id {
            config.client_id = client_id;
        }
        if let Some(remote_client_id) = self.remote_client_id {
            config.remote_client_id = remote_client_id;
        }
        if let Some(tick) = self.tick {
            config.session.update_interval = tick.into();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("devdriver={}", args.log_level).parse()?)
        .add_directive(format!("dd_session={}", args.log_level).parse()?)
        .add_directive(format!("dd_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(DevDriverLogFormatter::new("devdriver".to_string()))
        .init();

    info!("Starting devdriver v{}", env!("CARGO_PKG_VERSION"));

    let mut config = DevDriverConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);
    config.validate()?;

    match (config.listen, config.connect) {
        (Some(listen), None) => serve(listen, &config).await,
        (None, Some(connect)) => ping(connect, &config, &args).await,
        (Some(_), Some(_)) => bail!("--listen and --connect are mutually exclusive"),
        (None, None) => bail!("one of --listen or --connect is required"),
    }
}

/// Accept peers until interrupted, one session manager per connection
async fn serve(listen: SocketAddr, config: &DevDriverConfig) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    component_info!("server", "Listening on {} as client {}", listen, config.client_id);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("failed to accept connection")?;
                component_info!("server", "Accepted connection from {}", peer);
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, &config).await {
                        component_warn!("server", "Connection from {} failed: {:#}", peer, e);
                    }
                });
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for interrupt")?;
                info!("Received interrupt, shutting down");
                return Ok(());
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, config: &DevDriverConfig) -> Result<()> {
    let (channel, inbound) = TcpChannel::spawn(stream, config.client_id, TRANSPORT_QUEUE_DEPTH);
    let manager = Arc::new(SessionManager::new(channel, config.session.clone()));
    manager
        .register_protocol_server(Arc::new(EchoServer::new(config.min_version, config.max_version)))
        .map_err(|e| anyhow::anyhow!("failed to register echo server: {}", e))?;

    let updates = tokio::spawn(manager.clone().run_updates(config.session.update_interval));
    dispatch_inbound(inbound, manager.clone()).await;

    if let Err(e) = manager.destroy(config.session.destroy_timeout).await {
        component_warn!("server", "Sessions did not close cleanly: {}", e);
    }
    updates.await.context("update task failed")?;
    Ok(())
}

/// Connect to an echo server, run the pings and report
async fn ping(connect: SocketAddr, config: &DevDriverConfig, args: &Args) -> Result<()> {
    let stream = TcpStream::connect(connect)
        .await
        .with_context(|| format!("failed to connect to {}", connect))?;
    let (channel, inbound) = TcpChannel::spawn(stream, config.client_id, TRANSPORT_QUEUE_DEPTH);
    let manager = Arc::new(SessionManager::new(channel, config.session.clone()));

    let dispatcher = tokio::spawn(dispatch_inbound(inbound, manager.clone()));
    let updates = tokio::spawn(manager.clone().run_updates(config.session.update_interval));

    let options = PingOptions {
        remote_client_id: config.remote_client_id,
        min_version: config.min_version,
        max_version: config.max_version,
        count: args.count,
        payload_size: args.payload_size,
        timeout: Duration::from(args.timeout),
    };
    let result = run_pings(&manager, &options).await;

    if let Err(e) = manager.destroy(config.session.destroy_timeout).await {
        component_warn!("client", "Sessions did not close cleanly: {}", e);
    }
    updates.await.context("update task failed")?;
    dispatcher.abort();

    let report = result?;
    component_info!(
        "client",
        "{} pings echoed at version {} (max round trip {:?}, rtt estimate {:.2}ms, {} retransmitted, {} fast retransmitted), closed with {:?}",
        report.echoed,
        report.version,
        report.max_round_trip,
        report.stats.round_trip_time_ms,
        report.stats.retransmitted,
        report.stats.fast_retransmitted,
        report.reason
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "devdriver",
            "--connect",
            "127.0.0.1:27300",
            "--client-id",
            "5",
            "--tick",
            "3ms",
        ]);
        let mut config = DevDriverConfig::default();
        args.apply_to(&mut config);

        assert_eq!(config.connect, Some("127.0.0.1:27300".parse().unwrap()));
        assert_eq!(config.client_id, 5);
        assert_eq!(config.remote_client_id, 2);
        assert_eq!(config.session.update_interval, Duration::from_millis(3));
        assert_eq!(args.count, 10);
    }

    #[tokio::test]
    async fn test_ping_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_config = DevDriverConfig {
            client_id: 2,
            ..Default::default()
        };
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_connection(stream, &server_config).await
        });

        let args = Args::parse_from(["devdriver", "--count", "20"]);
        let client_config = DevDriverConfig::default();
        ping(addr, &client_config, &args).await.unwrap();

        // The client closing its connection ends the server side
        server.await.unwrap().unwrap();
    }
}
