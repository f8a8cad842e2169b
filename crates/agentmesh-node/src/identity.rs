use std::io::{ErrorKind, Write};
use std::path::Path;

use ed25519_dalek::SigningKey;
use libp2p::identity::Keypair;
use rand::rngs::OsRng;

/// Length of the raw Ed25519 secret stored in the key file.
const SECRET_LEN: usize = 32;

/// One Ed25519 secret backs both message signatures and the libp2p peer id,
/// so the public key on a signed message maps straight to its sender.
pub struct NodeIdentity {
    pub signing_key:    SigningKey,
    pub libp2p_keypair: Keypair,
    /// Base58 libp2p peer id.
    pub peer_id:        String,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        Self::from_secret(SigningKey::generate(&mut OsRng).to_bytes())
    }

    pub fn from_secret(secret: [u8; SECRET_LEN]) -> Self {
        let signing_key = SigningKey::from_bytes(&secret);
        let mut raw = secret;
        // Never fails: the length is fixed and any 32 bytes are a valid secret.
        let libp2p_keypair = Keypair::ed25519_from_bytes(&mut raw)
            .expect("32-byte ed25519 secret");
        let peer_id = libp2p_keypair.public().to_peer_id().to_base58();
        Self { signing_key, libp2p_keypair, peer_id }
    }

    /// Read the key file at `path`, creating it with a fresh secret when it
    /// does not exist yet.
    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let secret: [u8; SECRET_LEN] = bytes.as_slice().try_into().map_err(|_| {
                    anyhow::anyhow!(
                        "key file {} holds {} bytes, expected {SECRET_LEN}",
                        path.display(),
                        bytes.len(),
                    )
                })?;
                let id = Self::from_secret(secret);
                tracing::info!(peer_id = %id.peer_id, "Loaded identity from {}", path.display());
                Ok(id)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let id = Self::generate();
                write_secret(path, &id.signing_key.to_bytes())?;
                tracing::info!(peer_id = %id.peer_id, "Generated identity at {}", path.display());
                Ok(id)
            }
            Err(e) => Err(anyhow::anyhow!("reading key file {}: {e}", path.display())),
        }
    }
}

/// Create the key file readable by the owner only.
fn write_secret(path: &Path, secret: &[u8]) -> anyhow::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);
    let mut file = options
        .open(path)
        .map_err(|e| anyhow::anyhow!("creating key file {}: {e}", path.display()))?;
    file.write_all(secret)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::peer_id_from_public_key;

    #[test]
    fn peer_id_matches_signing_key() {
        let id = NodeIdentity::generate();
        let derived = peer_id_from_public_key(id.signing_key.verifying_key().as_bytes()).unwrap();
        assert_eq!(derived, id.peer_id);
    }

    #[test]
    fn key_file_is_created_once_and_reused() {
        let dir  = std::env::temp_dir().join(format!("agentmesh-id-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("identity.key");
        let _ = std::fs::remove_file(&path);

        let a = NodeIdentity::load_or_generate(&path).unwrap();
        let b = NodeIdentity::load_or_generate(&path).unwrap();
        assert_eq!(a.peer_id, b.peer_id);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        std::fs::write(&path, [0u8; 5]).unwrap();
        assert!(NodeIdentity::load_or_generate(&path).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
