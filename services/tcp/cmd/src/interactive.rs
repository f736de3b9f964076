//! `redb-tcp --connect host:port`: stdin lines go to the server, server lines
//! go to stdout.
//!
//! Sending `STARTTLS` arms an upgrade; the next `220` reply from the server
//! triggers the client TLS handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tcp_session::{
    ClientOptions, ClientSession, ClientTlsOptions, LineOverflow, LogEntry, LogSink, Session,
    SessionError,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, trace, warn};

/// Split `host:port`, accepting `[v6]:port`
pub fn split_host_port(target: &str) -> Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .with_context(|| format!("expected host:port, got {:?}", target))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in {:?}", target))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        anyhow::bail!("missing host in {:?}", target);
    }
    Ok((host.to_string(), port))
}

/// Run an interactive session until stdin closes, the server hangs up or
/// Ctrl-C is pressed
pub async fn run(target: &str, use_tls: bool, tls: ClientTlsOptions) -> Result<()> {
    let (host, port) = split_host_port(target)?;

    let log: Arc<dyn LogSink> = Arc::new(|entry: &LogEntry| trace!(?entry, "client session log"));
    let mut session = ClientSession::new(ClientOptions {
        tls,
        log: Some(log),
        ..ClientOptions::default()
    });
    session
        .connect(&host, port, use_tls)
        .await
        .with_context(|| format!("failed to connect to {}", target))?;
    info!(
        remote = %session.remote_addr()?,
        secure = session.is_secure()?,
        "connected"
    );

    let session = Arc::new(session);
    let starttls_pending = Arc::new(AtomicBool::new(false));
    let mut reader = tokio::spawn(print_server_lines(
        Arc::clone(&session),
        Arc::clone(&starttls_pending),
    ));

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = stdin.next_line() => match line.context("failed to read stdin")? {
                Some(line) => {
                    if line.trim().eq_ignore_ascii_case("STARTTLS") {
                        starttls_pending.store(true, Ordering::SeqCst);
                    }
                    session.write_line(&line).await.context("failed to send line")?;
                }
                None => break,
            },
            _ = &mut reader => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    reader.abort();
    session.disconnect().await;
    session.dispose().await;
    Ok(())
}

async fn print_server_lines(session: Arc<ClientSession>, starttls_pending: Arc<AtomicBool>) {
    loop {
        match session.read_line(LineOverflow::Truncate).await {
            Ok(Some(line)) => {
                println!("{}", line);
                if line.starts_with("220") && starttls_pending.swap(false, Ordering::SeqCst) {
                    match session.switch_to_secure().await {
                        Ok(()) => info!("switched to tls"),
                        Err(e) => {
                            warn!("tls upgrade failed: {}", e);
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                info!("server closed the connection");
                return;
            }
            // Waiting for the server is not an error in an interactive session.
            Err(SessionError::Timeout(_)) => continue,
            Err(e) if e.is_disconnect() => {
                debug!("connection closed: {}", e);
                return;
            }
            Err(e) => {
                warn!("read failed: {}", e);
                return;
            }
        }
    }
}
