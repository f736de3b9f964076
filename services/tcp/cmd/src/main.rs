//! reDB TCP service binary.
//!
//! `redb-tcp serve` (the default) runs the line-echo demo protocol on the
//! configured bindings; `redb-tcp --connect host:port` opens an interactive
//! client session instead and takes precedence over `serve`.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tcp_server::{Server, ServerEvent};
use tcp_session::Session;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod echo;
mod interactive;
mod logging;

use config::{BindingConfig, TcpConfig};
use echo::EchoFactory;
use logging::TcpLogFormatter;

/// Protocol-agnostic TCP server/client with TLS upgrade
#[derive(Parser, Debug)]
#[command(name = "redb-tcp", version, about = "reDB TCP server and client")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the YAML configuration file
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Connect to host:port as an interactive client instead of serving
    #[arg(long)]
    connect: Option<String>,

    /// Use TLS from the first byte when connecting
    #[arg(long, requires = "connect")]
    connect_tls: bool,

    /// Path to extra trusted CA certificates (PEM) for client connections
    #[arg(long, global = true)]
    tls_ca: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the line-echo server
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug, Default)]
struct ServeArgs {
    /// Listen address, e.g. 0.0.0.0:2525 (repeatable; replaces configured bindings)
    #[arg(long)]
    listen: Vec<SocketAddr>,

    /// Require TLS on the --listen addresses
    #[arg(long)]
    tls: bool,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Host name announced in greetings
    #[arg(long)]
    host_name: Option<String>,

    /// Maximum concurrent sessions (0 = unlimited)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum concurrent sessions per remote IP (0 = unlimited)
    #[arg(long)]
    max_connections_per_ip: Option<usize>,

    /// Idle timeout, e.g. 100s (0s disables the sweep)
    #[arg(long)]
    idle_timeout: Option<humantime::Duration>,

    /// Acceptors per listening socket (1-50)
    #[arg(long)]
    acceptors: Option<usize>,
}

impl ServeArgs {
    fn apply(self, config: &mut TcpConfig) {
        if let Some(host_name) = self.host_name {
            config.host_name = host_name;
        }
        if !self.listen.is_empty() {
            config.bindings = self
                .listen
                .iter()
                .map(|addr| BindingConfig {
                    address: addr.ip(),
                    port: addr.port(),
                    tls: self.tls,
                    host_name: None,
                })
                .collect();
        }
        if self.tls_cert.is_some() {
            config.tls.cert_file = self.tls_cert;
        }
        if self.tls_key.is_some() {
            config.tls.key_file = self.tls_key;
        }
        if let Some(max) = self.max_connections {
            config.limits.max_connections = max;
        }
        if let Some(max) = self.max_connections_per_ip {
            config.limits.max_connections_per_ip = max;
        }
        if let Some(timeout) = self.idle_timeout {
            config.limits.session_idle_timeout = timeout.to_string();
        }
        if let Some(acceptors) = self.acceptors {
            config.limits.acceptors_per_socket = acceptors;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("redb_tcp={}", args.log_level).parse()?)
        .add_directive(format!("tcp_session={}", args.log_level).parse()?)
        .add_directive(format!("tcp_server={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(TcpLogFormatter::new("tcp"))
        .init();

    info!("Starting reDB TCP service v{}", env!("CARGO_PKG_VERSION"));

    let mut config = TcpConfig::load_from_file(&args.config)?;
    if args.tls_ca.is_some() {
        config.tls.ca_file = args.tls_ca;
    }

    if let Some(target) = args.connect {
        return interactive::run(&target, args.connect_tls, config.client_tls()?).await;
    }

    let Command::Serve(serve_args) = args
        .command
        .unwrap_or(Command::Serve(ServeArgs::default()));
    serve_args.apply(&mut config);
    serve(config).await
}

async fn serve(config: TcpConfig) -> Result<()> {
    let bindings = config.server_bindings().context("invalid bindings")?;
    if bindings.is_empty() {
        anyhow::bail!("no bindings configured");
    }

    let server = Server::new(EchoFactory);
    server
        .set_limits(config.server_limits()?)
        .context("invalid limits")?;
    server.set_bindings(bindings)?;

    let events = server.clone();
    server.events().subscribe(move |event: &ServerEvent| match event {
        ServerEvent::Started => crate::component_info!(
            "server",
            "Listening on {}",
            events
                .listening_addrs()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        ServerEvent::Stopped => crate::component_info!("server", "Stopped listening"),
        ServerEvent::Error(e) => crate::component_error!("server", "{:#}", e),
        ServerEvent::SessionCreated(session) => crate::component_debug!(
            "session",
            "Session from {} accepted on {}",
            session.remote_addr().map(|a| a.to_string()).unwrap_or_default(),
            session.host_name()
        ),
        ServerEvent::Log(_) | ServerEvent::Disposed => {}
    });

    server.start()?;

    shutdown_signal().await?;
    crate::component_warn!(
        "server",
        "Shutting down with {} active sessions",
        server.sessions().len()
    );
    server.dispose().await;
    info!("reDB TCP service stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl-C")?,
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")
}
