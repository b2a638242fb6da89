use crate::error::CacheError;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;
const MIN_KEY_LEN: usize = 16;

/// Where the key returned by [`Signer::load_or_create`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOrigin {
    Loaded,
    Created,
    /// The file existed but held no usable key.
    Replaced { reason: String },
}

/// Signs and verifies cache rows with HMAC-SHA-256.
///
/// The signature covers `item_id`, `version`, `payload` and `scanned_at`, each
/// length-prefixed so field boundaries cannot be shifted.
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl Signer {
    pub fn new(key: &[u8]) -> Result<Self, CacheError> {
        if key.len() < MIN_KEY_LEN {
            return Err(CacheError::Key(format!(
                "key must be at least {} bytes, got {}",
                MIN_KEY_LEN,
                key.len()
            )));
        }
        let mac = HmacSha256::new_from_slice(key).map_err(|e| CacheError::Key(e.to_string()))?;
        Ok(Self { mac })
    }

    /// A signer with a fresh random key. Entries signed by it cannot be
    /// verified after the process exits.
    pub fn ephemeral() -> Result<Self, CacheError> {
        Self::new(&random_key())
    }

    /// Loads the key stored at `path`, creating it on first use.
    ///
    /// A key file of the wrong length (empty, truncated by a crash) cannot
    /// verify anything, so it is replaced with a fresh key and reported as
    /// [`KeyOrigin::Replaced`]. Only I/O failures are errors.
    pub fn load_or_create(path: &Path) -> Result<(Self, KeyOrigin), CacheError> {
        let origin = match fs::read(path) {
            Ok(key) if key.len() == KEY_LEN => return Ok((Self::new(&key)?, KeyOrigin::Loaded)),
            Ok(key) => KeyOrigin::Replaced {
                reason: format!("key file holds {} bytes, expected {}", key.len(), KEY_LEN),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => KeyOrigin::Created,
            Err(e) => return Err(e.into()),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let key = random_key();
        write_key(path, &key)?;
        Ok((Self::new(&key)?, origin))
    }

    pub fn sign(&self, item_id: &str, version: &str, payload: &[u8], scanned_at_ms: i64) -> Vec<u8> {
        self.keyed(item_id, version, payload, scanned_at_ms)
            .finalize()
            .into_bytes()
            .to_vec()
    }

    /// Constant-time comparison against a stored signature.
    pub fn verify(
        &self,
        item_id: &str,
        version: &str,
        payload: &[u8],
        scanned_at_ms: i64,
        signature: &[u8],
    ) -> bool {
        self.keyed(item_id, version, payload, scanned_at_ms)
            .verify_slice(signature)
            .is_ok()
    }

    fn keyed(&self, item_id: &str, version: &str, payload: &[u8], scanned_at_ms: i64) -> HmacSha256 {
        let mut mac = self.mac.clone();
        for field in [item_id.as_bytes(), version.as_bytes(), payload] {
            mac.update(&(field.len() as u64).to_le_bytes());
            mac.update(field);
        }
        mac.update(&scanned_at_ms.to_le_bytes());
        mac
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

/// Writes `key` to a sibling temp file and renames it over `path`, so a crash
/// never leaves a half-written key behind.
fn write_key(path: &Path, key: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("key.tmp");
    let mut file = File::create(&tmp)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(key)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rng().fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sign_and_verify() {
        let signer = Signer::new(b"0123456789abcdef0123456789abcdef").unwrap();
        let sig = signer.sign("publisher.ext", "1.0", b"{}", 1_700_000_000_000);
        assert_eq!(sig.len(), 32);
        assert!(signer.verify("publisher.ext", "1.0", b"{}", 1_700_000_000_000, &sig));
        assert!(!signer.verify("publisher.ext", "1.1", b"{}", 1_700_000_000_000, &sig));
        assert!(!signer.verify("publisher.ext", "1.0", b"{ }", 1_700_000_000_000, &sig));
        assert!(!signer.verify("publisher.ext", "1.0", b"{}", 1_700_000_000_001, &sig));
    }

    #[test]
    fn test_field_boundaries_are_bound() {
        let signer = Signer::ephemeral().unwrap();
        let a = signer.sign("ab", "c", b"", 0);
        let b = signer.sign("a", "bc", b"", 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(matches!(Signer::new(b"short"), Err(CacheError::Key(_))));
    }

    #[test]
    fn test_key_file_is_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("scans.key");

        let (first, origin) = Signer::load_or_create(&path).unwrap();
        assert_eq!(origin, KeyOrigin::Created);
        let sig = first.sign("a.b", "1", b"x", 5);

        let (second, origin) = Signer::load_or_create(&path).unwrap();
        assert_eq!(origin, KeyOrigin::Loaded);
        assert!(second.verify("a.b", "1", b"x", 5, &sig));
        assert_eq!(fs::read(&path).unwrap().len(), KEY_LEN);
    }

    #[test]
    fn test_truncated_key_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scans.key");

        for contents in [&b""[..], &b"0123456789abcdef0123"[..]] {
            fs::write(&path, contents).unwrap();

            let (signer, origin) = Signer::load_or_create(&path).unwrap();
            assert!(matches!(origin, KeyOrigin::Replaced { .. }));

            let key = fs::read(&path).unwrap();
            assert_eq!(key.len(), KEY_LEN);
            let sig = signer.sign("a.b", "1", b"x", 5);
            assert!(Signer::new(&key).unwrap().verify("a.b", "1", b"x", 5, &sig));
        }
        assert!(!dir.path().join("scans.key.tmp").exists());
    }
}
