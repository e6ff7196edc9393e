use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use log::{debug, error, info, warn};
use russh::server::Config;
use tokio::{
    net::{TcpListener, TcpStream},
    pin,
};
use tokio_util::sync::CancellationToken;

mod config;
mod droppable_handle;
mod error;
mod forwarding;
mod keys;
mod ssh;

pub use config::ApplicationConfig;

use crate::{
    keys::{load_authorized_keys, load_host_key},
    ssh::Server,
};

// Data shared by every connection.
pub(crate) struct TunnelServer {
    // Path to the authorized keys file, re-read on every authentication.
    pub(crate) authorized_keys_file: PathBuf,
}

// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> anyhow::Result<()> {
    info!("Starting burrow...");
    let key = load_host_key(&config.key).await?;
    // Require a loadable authorized keys file on start, so a broken setup
    // fails immediately instead of denying every client later.
    let authorized_keys = load_authorized_keys(&config.authorized_keys_file)
        .await
        .with_context(|| "Error loading authorized keys")?;
    info!(
        "Loaded {} authorized key(s) from {}",
        authorized_keys.len(),
        config.authorized_keys_file.display()
    );

    let ssh_config = Arc::new(Config {
        auth_rejection_time: Duration::from_secs(2),
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: Some(Duration::from_secs(3_600)),
        keepalive_interval: Some(config.keepalive_interval),
        keepalive_max: config.keepalive_max,
        keys: vec![key],
        ..Default::default()
    });
    let mut server = Arc::new(TunnelServer {
        authorized_keys_file: config.authorized_keys_file,
    });

    let listener = TcpListener::bind((config.listen_address, config.port.into()))
        .await
        .with_context(|| "Error listening to SSH port")?;
    info!("Listening for SSH connections on port {}.", config.port);
    let signal_handler = wait_for_signal();
    pin!(signal_handler);
    loop {
        tokio::select! {
            conn = listener.accept() => {
                let (stream, address) = match conn {
                    Ok((stream, address)) => (stream, address),
                    Err(error) => {
                        // The listener is unrecoverable; stop the server.
                        error!("Unable to accept SSH connection: {}", error);
                        break;
                    }
                };
                if let Err(error) = stream.set_nodelay(true) {
                    warn!("Error setting nodelay for {}: {}", address, error);
                }
                handle_ssh_connection(stream, address, Arc::clone(&ssh_config), &mut server);
            }
            _ = &mut signal_handler => {
                break;
            }
        }
    }
    info!("burrow is shutting down.");
    Ok(())
}

// Drives a single SSH connection to completion in its own task. Handshake
// failures only take down this connection. Whenever the session ends, the
// connection token fires and every forward the connection owns is
// reclaimed.
fn handle_ssh_connection(
    stream: TcpStream,
    address: SocketAddr,
    config: Arc<Config>,
    server: &mut Arc<TunnelServer>,
) {
    let cancellation_token = CancellationToken::new();
    let handler = server.new_client(address, cancellation_token.clone());
    tokio::spawn(async move {
        let mut session = match russh::server::run_stream(config, stream, handler).await {
            Ok(session) => session,
            Err(error) => {
                warn!("Connection setup failed for {}: {}", address, error);
                return;
            }
        };
        tokio::select! {
            result = &mut session => {
                if let Err(error) = result {
                    debug!("Connection closed for {}: {}", address, error);
                }
            }
            _ = cancellation_token.cancelled() => {
                info!("Disconnecting {}...", address);
                let _ = session
                    .handle()
                    .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
                    .await;
            }
        }
        cancellation_token.cancel();
    });
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_terminate = signal(SignalKind::terminate()).unwrap();
    let mut signal_interrupt = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    }
}
