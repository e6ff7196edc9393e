use std::{
    collections::HashMap,
    fmt::Display,
    net::Ipv6Addr,
    sync::{Arc, Mutex},
};

use log::{debug, error, info};
use russh::server::Handle;
use tokio::{io::copy_bidirectional, net::TcpListener};
use tokio_util::sync::CancellationToken;

use crate::droppable_handle::DroppableHandle;

// Identity of a remote forward within one connection: the bind address and
// port exactly as the client requested them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ForwardAddr(pub(crate) String, pub(crate) u32);

impl Display for ForwardAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]:{}", self.0, self.1)
    }
}

// The active remote forwards of a single connection, keyed by the requested
// address. At most one binding exists per address; a new registration for
// the same address replaces the old binding after stopping it.
pub(crate) type ForwardRegistry = Arc<Mutex<HashMap<ForwardAddr, ForwardBinding>>>;

// One active remote-port-forwarding registration. Dropping the binding
// aborts its accept loop, which closes the bound listener.
pub(crate) struct ForwardBinding {
    accept_loop: DroppableHandle<()>,
    // Retires this binding's monitor without touching the listener.
    stop: CancellationToken,
}

impl ForwardBinding {
    pub(crate) fn new(accept_loop: DroppableHandle<()>, stop: CancellationToken) -> Self {
        ForwardBinding { accept_loop, stop }
    }

    // Retires the monitor and waits for the accept loop to wind down, so
    // the listener is released before a replacement binds the same address.
    pub(crate) async fn shutdown(mut self) {
        self.stop.cancel();
        self.accept_loop.0.abort();
        let _ = (&mut self.accept_loop.0).await;
    }
}

// Binds the listener for a remote forward. An empty or wildcard address
// listens on all interfaces.
pub(crate) async fn bind_forward_listener(
    address: &str,
    port: u16,
) -> std::io::Result<TcpListener> {
    match address {
        "" | "*" => TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await,
        address => TcpListener::bind((address, port)).await,
    }
}

// Accepts connections for a remote forward, splicing each one into a
// forwarded-tcpip channel toward the owning client. If the client rejects
// the channel, the socket is dropped.
pub(crate) fn spawn_accept_loop(
    listener: TcpListener,
    handle: Handle,
    address: String,
    port: u32,
) -> DroppableHandle<()> {
    DroppableHandle(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, peer)) => {
                    let handle = handle.clone();
                    let address = address.clone();
                    tokio::spawn(async move {
                        match handle
                            .channel_open_forwarded_tcpip(
                                address,
                                port,
                                peer.ip().to_canonical().to_string(),
                                peer.port().into(),
                            )
                            .await
                        {
                            Ok(channel) => {
                                let mut channel = channel.into_stream();
                                let _ = copy_bidirectional(&mut stream, &mut channel).await;
                            }
                            Err(error) => {
                                debug!(
                                    "Client rejected forwarded connection from {}: {}",
                                    peer, error
                                );
                            }
                        }
                    });
                }
                Err(error) => {
                    error!("Error accepting forwarded connection: {}", error);
                    break;
                }
            }
        }
    }))
}

// Watches over one forward binding. When the owning connection goes away,
// the monitor removes the binding from the registry, closing its listener.
// A replacement or cancellation retires the monitor through the stop token
// instead, leaving listener cleanup to the caller.
pub(crate) fn spawn_forward_monitor(
    registry: ForwardRegistry,
    key: ForwardAddr,
    stop: CancellationToken,
    connection: CancellationToken,
) {
    tokio::spawn(async move {
        debug!("Starting monitor for forward {}", key);
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("Stopping monitor for forward {}", key);
            }
            _ = connection.cancelled() => {
                info!("Forward endpoint not available anymore. Closing listener for {}", key);
                registry.lock().unwrap().remove(&key);
            }
        }
    });
}
