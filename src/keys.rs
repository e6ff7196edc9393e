use std::{collections::HashSet, path::Path};

use anyhow::Context;
use log::info;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::keys::{
    PrivateKey, PublicKey, decode_secret_key,
    ssh_key::{LineEnding, private::Ed25519Keypair},
};
use tokio::fs;

use crate::error::ServerError;

/// Loads the host key used to sign the server side of the SSH handshake.
///
/// If the file is missing, a new ed25519 key is generated and saved at the
/// same path. Any other read or parse error aborts startup.
pub(crate) async fn load_host_key(path: &Path) -> anyhow::Result<PrivateKey> {
    match fs::read_to_string(path).await {
        Ok(key) => decode_secret_key(&key, None).with_context(|| "Error decoding host key"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            info!("Host key file not found. Creating...");
            generate_host_key(path).await
        }
        Err(error) => Err(error).with_context(|| "Error reading host key"),
    }
}

async fn generate_host_key(path: &Path) -> anyhow::Result<PrivateKey> {
    let key = PrivateKey::from(Ed25519Keypair::from_seed(
        &ChaCha20Rng::from_os_rng().random(),
    ));
    let parent = path
        .parent()
        .ok_or_else(|| ServerError::InvalidKeyPath(path.to_path_buf()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| "Error creating host key directory")?;
    }
    let key_string = key.to_openssh(LineEnding::LF)?;
    let key = decode_secret_key(&key_string, None).with_context(|| "Error decoding host key")?;
    fs::write(path, key_string)
        .await
        .with_context(|| "Error saving host key to filesystem")?;
    Ok(key)
}

/// Builds a fresh set of the wire-encoded public keys allowed to
/// authenticate. Membership is exact byte equality of the wire encoding.
///
/// Called once at startup and again for every authentication attempt, so
/// edits to the file take effect without a restart.
pub(crate) async fn load_authorized_keys(path: &Path) -> anyhow::Result<HashSet<Vec<u8>>> {
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("Error reading authorized keys file {}", path.display()))?;
    let mut keys = HashSet::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let key = PublicKey::from_openssh(line)
            .with_context(|| format!("Error parsing authorized key: {line:?}"))?;
        keys.insert(
            key.to_bytes()
                .with_context(|| "Error encoding authorized key")?,
        );
    }
    Ok(keys)
}
