use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use log::{debug, error, info, warn};
use russh::{
    Channel, ChannelId, MethodKind, MethodSet,
    keys::{HashAlg, PublicKey, ssh_key::Fingerprint},
    server::{Auth, Handler, Msg, Session},
};
use tokio::{io::copy_bidirectional, net::TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{
    TunnelServer,
    forwarding::{
        ForwardAddr, ForwardBinding, ForwardRegistry, bind_forward_listener, spawn_accept_loop,
        spawn_forward_monitor,
    },
    keys::load_authorized_keys,
};

// Per-connection SSH state. Each accepted connection owns its handler, its
// forward registry, and its cancellation token; nothing is shared between
// connections besides the TunnelServer configuration.
pub(crate) struct ServerHandler {
    // The IP and port of this connection.
    peer: SocketAddr,
    // The username from this connection's authentication.
    user: Option<String>,
    // SHA-256 fingerprint of the public key that authenticated this peer.
    key_fingerprint: Option<Fingerprint>,
    // Cancelled when the connection goes away; every forward owned by the
    // connection hangs off of it.
    cancellation_token: CancellationToken,
    // Active remote forwards owned by this connection.
    forwards: ForwardRegistry,
    // Reference to the shared server data.
    server: Arc<TunnelServer>,
}

pub(crate) trait Server {
    fn new_client(
        &mut self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
    ) -> ServerHandler;
}

impl Server for Arc<TunnelServer> {
    // Create a new handler for the SSH connection.
    fn new_client(
        &mut self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
    ) -> ServerHandler {
        info!("{} connected", peer_address);
        ServerHandler {
            peer: peer_address,
            user: None,
            key_fingerprint: None,
            cancellation_token,
            forwards: Arc::new(Mutex::new(HashMap::new())),
            server: Arc::clone(self),
        }
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    // Offer public key authentication only.
    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
            partial_success: false,
        })
    }

    // Validate the presented key against the authorized keys file, which is
    // re-read on every attempt so edits apply immediately. A failed attempt
    // offers no further methods.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        info!(
            "{} authenticating with public key ({})",
            self.peer,
            public_key.algorithm()
        );
        let rejection = Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        };
        let authorized_keys = match load_authorized_keys(&self.server.authorized_keys_file).await {
            Ok(keys) => keys,
            Err(error) => {
                error!("Unable to load authorized keys: {:#}", error);
                return Ok(rejection);
            }
        };
        let presented = match public_key.to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                error!("Unable to encode public key from {}: {}", self.peer, error);
                return Ok(rejection);
            }
        };
        if !authorized_keys.contains(&presented) {
            warn!("Unknown public key for {:?} ({})", user, self.peer);
            return Ok(rejection);
        }
        let fingerprint = public_key.fingerprint(HashAlg::Sha256);
        info!("{} ({}) logged in with key {}", user, self.peer, fingerprint);
        self.user = Some(user.into());
        self.key_fingerprint = Some(fingerprint);
        Ok(Auth::Accept)
    }

    // Accept session channels as a sink: drain whatever the client sends so
    // the connection cannot stall, and discard it. No PTY, no exec.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Opening session channel for {}", self.peer);
        tokio::spawn(async move {
            let mut channel = channel;
            while channel.wait().await.is_some() {}
        });
        Ok(true)
    }

    // Data received on session channels is discarded.
    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Discarding {} byte(s) of session data", data.len());
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Acknowledged but ignored; the session channel is a sink.
        session.channel_success(channel)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(
            "Rejecting exec request from {}: {:?}",
            self.peer,
            String::from_utf8_lossy(data)
        );
        session.channel_failure(channel)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!("Rejecting subsystem request {:?} from {}", name, self.peer);
        session.channel_failure(channel)
    }

    // Handle a remote forwarding request from the client.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // Reject invalid ports
        if *port > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        let key = ForwardAddr(address.to_string(), *port);
        // Replace any prior binding for this address: retire its monitor and
        // release its listener before the new binding exists.
        let old = self.forwards.lock().unwrap().remove(&key);
        if let Some(old) = old {
            info!("Closing old listener for {} ({})", key, self.peer);
            old.shutdown().await;
        }
        // The bind happens outside the registry lock.
        let listener = match bind_forward_listener(address, *port as u16).await {
            Ok(listener) => listener,
            Err(error) => {
                warn!("Listen failed for {} ({}): {}", key, self.peer, error);
                return Ok(false);
            }
        };
        let bound_port = listener.local_addr().map_err(russh::Error::from)?.port();
        if *port == 0 {
            // Report the actually assigned port back to the client.
            *port = bound_port.into();
        }
        info!(
            "Forwarding {} for {} (listening on port {})",
            key, self.peer, bound_port
        );
        let accept_loop = spawn_accept_loop(listener, session.handle(), address.to_string(), *port);
        let stop = CancellationToken::new();
        spawn_forward_monitor(
            Arc::clone(&self.forwards),
            key.clone(),
            stop.clone(),
            self.cancellation_token.clone(),
        );
        self.forwards
            .lock()
            .unwrap()
            .insert(key, ForwardBinding::new(accept_loop, stop));
        Ok(true)
    }

    // Handle closure of a remote forwarding request. Unknown addresses are
    // a no-op.
    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if port > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        let key = ForwardAddr(address.to_string(), port);
        let binding = self.forwards.lock().unwrap().remove(&key);
        match binding {
            Some(binding) => {
                info!("Canceling forward {} for {}", key, self.peer);
                binding.shutdown().await;
                Ok(true)
            }
            None => {
                debug!("No forward {} to cancel for {}", key, self.peer);
                Ok(false)
            }
        }
    }

    // Handle a local forwarding request: connect to the requested target on
    // the client's behalf and splice it into the channel.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // Reject invalid ports
        if port_to_connect > u16::MAX.into() || originator_port > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        match TcpStream::connect((host_to_connect, port_to_connect as u16)).await {
            Ok(mut stream) => {
                info!(
                    "Direct forward from {}:{} to {}:{} ({})",
                    originator_address, originator_port, host_to_connect, port_to_connect, self.peer
                );
                tokio::spawn(async move {
                    let mut channel = channel.into_stream();
                    let _ = copy_bidirectional(&mut channel, &mut stream).await;
                });
                Ok(true)
            }
            Err(error) => {
                warn!(
                    "Direct forward to {}:{} failed ({}): {}",
                    host_to_connect, port_to_connect, self.peer, error
                );
                Ok(false)
            }
        }
    }
}

// Tear down everything the connection owns when it goes away: cancelling
// the token retires the forward monitors, which close their listeners.
impl Drop for ServerHandler {
    fn drop(&mut self) {
        let user = self.user.as_deref().unwrap_or("unknown");
        match self.key_fingerprint {
            Some(fingerprint) => {
                info!("{} ({}) disconnected (key {})", user, self.peer, fingerprint)
            }
            None => info!("{} ({}) disconnected", user, self.peer),
        }
        self.cancellation_token.cancel();
    }
}
