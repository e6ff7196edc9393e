use std::{sync::Arc, time::Duration};

use burrow::{ApplicationConfig, entrypoint};
use clap::Parser;
use russh::keys::{key::PrivateKeyWithHashAlg, load_secret_key};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

/// This test ensures that a public key absent from the authorized keys file
/// cannot authenticate, while a known key can.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn auth_unknown_key() {
    // 1. Initialize the server
    let config = ApplicationConfig::parse_from([
        "burrow",
        "--key",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server_keys/ssh"),
        "--authorized-keys-file",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/authorized_keys"),
        "--listen-address=127.0.0.1",
        "--port=28522",
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:28522").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for burrow to start.")
    };

    // 2. key2 is not in the authorized keys file; authentication must fail
    let key = load_secret_key(
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/client_keys/key2"),
        None,
    )
    .expect("Missing file key2");
    let ssh_client = SshClient;
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:28522", ssh_client)
        .await
        .expect("Failed to connect to SSH server");
    let hash_alg = session.best_supported_rsa_hash().await.unwrap().flatten();
    let authenticated = session
        .authenticate_publickey("user", PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await;
    assert!(
        !authenticated.map(|result| result.success()).unwrap_or(false),
        "unknown key must not authenticate"
    );

    // 3. key1 is authorized; authentication must succeed
    let key = load_secret_key(
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/client_keys/key1"),
        None,
    )
    .expect("Missing file key1");
    let ssh_client = SshClient;
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:28522", ssh_client)
        .await
        .expect("Failed to connect to SSH server");
    assert!(
        session
            .authenticate_publickey(
                "user",
                PrivateKeyWithHashAlg::new(
                    Arc::new(key),
                    session
                        .best_supported_rsa_hash()
                        .await
                        .unwrap()
                        .flatten()
                )
            )
            .await
            .expect("SSH authentication failed")
            .success(),
        "authorized key must authenticate"
    );
}

struct SshClient;

impl russh::client::Handler for SshClient {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
