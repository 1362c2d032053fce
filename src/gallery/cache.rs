//! Encrypted descriptor cache
//!
//! Descriptors are biometric data, so they are kept encrypted at rest with
//! XChaCha20-Poly1305 under a per-gallery key (`.key`, mode 0600). Each
//! entry is tagged with the SHA-256 of the reference image it was computed
//! from; a changed image or embedder dimension invalidates the entry and
//! the descriptor is recomputed from the image.

use anyhow::{bail, Context, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::vision::Descriptor;

const KEY_FILE: &str = ".key";
const DESCRIPTORS_DIR: &str = "descriptors";
const ENTRY_EXTENSION: &str = "descriptor";

/// SHA-256 of a file as lowercase hex
pub fn compute_sha256(path: &Path) -> Result<String> {
    let content =
        fs::read(path).with_context(|| format!("Failed to read file: {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}

/// On-disk cache entry
#[derive(Serialize, Deserialize)]
struct EncryptedDescriptor {
    /// XChaCha20-Poly1305 nonce (192-bit)
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
    /// Metadata (unencrypted)
    image_sha256: String,
    dim: usize,
    created_at: String,
}

pub struct DescriptorCache {
    dir: PathBuf,
    encryption_key: Zeroizing<[u8; 32]>,
}

impl DescriptorCache {
    /// Open (or initialize) the cache inside a gallery directory
    pub fn open(gallery_dir: &Path) -> Result<Self> {
        let dir = gallery_dir.join(DESCRIPTORS_DIR);
        fs::create_dir_all(&dir).context("Failed to create descriptor cache directory")?;
        let encryption_key = get_or_create_encryption_key(gallery_dir)?;
        Ok(Self {
            dir,
            encryption_key,
        })
    }

    fn entry_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", label, ENTRY_EXTENSION))
    }

    /// Cached descriptor for `label`, if one exists for this exact image and dimension
    pub fn load(&self, label: &str, image_sha256: &str, dim: usize) -> Option<Descriptor> {
        let path = self.entry_path(label);
        if !path.exists() {
            return None;
        }

        match self.read_entry(&path, image_sha256, dim) {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Discarding cached descriptor for '{}': {:#}", label, e);
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    fn read_entry(&self, path: &Path, image_sha256: &str, dim: usize) -> Result<Option<Descriptor>> {
        let content = fs::read_to_string(path).context("Failed to read cache entry")?;
        let entry: EncryptedDescriptor =
            serde_json::from_str(&content).context("Failed to parse cache entry")?;

        if entry.image_sha256 != image_sha256 || entry.dim != dim {
            log::debug!("Stale cache entry: {}", path.display());
            return Ok(None);
        }

        let values = self.decrypt(&entry)?;
        if values.len() != dim {
            bail!("Cached descriptor has {} values, expected {}", values.len(), dim);
        }
        Ok(Some(Descriptor::new(values)?))
    }

    /// Store `descriptor` for `label`, replacing any previous entry
    pub fn store(&self, label: &str, descriptor: &Descriptor, image_sha256: &str) -> Result<()> {
        let entry = self.encrypt(descriptor, image_sha256)?;
        let json = serde_json::to_string(&entry)?;

        let path = self.entry_path(label);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).context("Failed to write cache entry")?;
        fs::rename(&tmp, &path).context("Failed to commit cache entry")?;
        Ok(())
    }

    pub fn remove(&self, label: &str) {
        let path = self.entry_path(label);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                log::warn!("Failed to remove cache entry {}: {}", path.display(), e);
            }
        }
    }

    fn encrypt(&self, descriptor: &Descriptor, image_sha256: &str) -> Result<EncryptedDescriptor> {
        let cipher = XChaCha20Poly1305::new((&*self.encryption_key).into());

        let mut nonce_bytes = [0u8; 24];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from(nonce_bytes);

        let plaintext: Zeroizing<Vec<u8>> = Zeroizing::new(
            descriptor
                .as_slice()
                .iter()
                .flat_map(|&f| f.to_le_bytes())
                .collect(),
        );

        let ciphertext = cipher
            .encrypt(&nonce, &plaintext[..])
            .map_err(|e| anyhow::anyhow!("Encryption failed: {:?}", e))?;

        Ok(EncryptedDescriptor {
            nonce: nonce_bytes.to_vec(),
            ciphertext,
            image_sha256: image_sha256.to_string(),
            dim: descriptor.dim(),
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    fn decrypt(&self, entry: &EncryptedDescriptor) -> Result<Vec<f32>> {
        let cipher = XChaCha20Poly1305::new((&*self.encryption_key).into());

        let nonce: &XNonce = entry
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid nonce length"))?;

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(nonce, entry.ciphertext.as_ref())
                .map_err(|e| anyhow::anyhow!("Decryption failed: {:?}", e))?,
        );

        Ok(plaintext
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}

fn get_or_create_encryption_key(gallery_dir: &Path) -> Result<Zeroizing<[u8; 32]>> {
    let key_path = gallery_dir.join(KEY_FILE);

    if key_path.exists() {
        let key_bytes = Zeroizing::new(fs::read(&key_path).context("Failed to read encryption key")?);
        if key_bytes.len() != 32 {
            bail!("Invalid encryption key length");
        }
        let mut key_array = Zeroizing::new([0u8; 32]);
        key_array.copy_from_slice(&key_bytes);
        return Ok(key_array);
    }

    let mut key_array = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut *key_array);
    fs::write(&key_path, &*key_array).context("Failed to write encryption key")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set key file permissions")?;
    }

    log::info!("Generated new descriptor cache key");
    Ok(key_array)
}
