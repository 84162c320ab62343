// tunnelkeep - Host Trust Store
// Trust-on-first-use registry of remote host identity keys

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

const ORIGIN_COMMENT: &str = "tunnelkeepd";

/// Decision for a presented host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// Key matches the pinned entry, or was accepted on first use.
    Trust,
    /// A different key is pinned for this hostname. Possible MITM; the
    /// connection must not proceed and the store is left untouched.
    Reject {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

impl TrustDecision {
    pub fn is_trusted(&self) -> bool {
        matches!(self, TrustDecision::Trust)
    }
}

/// Verification seam handed to the transport. The supervisor and tests see
/// only this trait.
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, hostname: &str, key_type: &str, key_base64: &str) -> TrustDecision;
}

/// A single pinned host key. One entry per hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyEntry {
    pub hostname: String,
    pub key_type: String,
    /// Base64-encoded public key material
    pub key_material: String,
    /// Where the entry came from (free-text comment column)
    pub origin: String,
}

impl HostKeyEntry {
    /// Parse one record: `hostname key_type key_material [comment]`
    fn parse(line: &str, line_number: usize) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            warn!("Invalid trust store entry at line {}: too few fields", line_number);
            return None;
        }

        Some(HostKeyEntry {
            hostname: parts[0].to_string(),
            key_type: parts[1].to_string(),
            key_material: parts[2].to_string(),
            origin: parts.get(3).map(|s| s.to_string()).unwrap_or_default(),
        })
    }

    fn format(&self) -> String {
        if self.origin.is_empty() {
            format!("{} {} {}", self.hostname, self.key_type, self.key_material)
        } else {
            format!(
                "{} {} {} {}",
                self.hostname, self.key_type, self.key_material, self.origin
            )
        }
    }

    fn matches_key(&self, key_type: &str, key_material: &str) -> bool {
        self.key_type == key_type && self.key_material == key_material
    }
}

/// Persistent trust-on-first-use registry keyed by hostname.
///
/// The backing file is append-only: a new host appends one record, a
/// mismatch never rewrites anything, and the file is only removed again by
/// an explicit reset.
pub struct HostTrustStore {
    path: PathBuf,
    entries: Vec<HostKeyEntry>,
}

impl HostTrustStore {
    /// Load the registry, tolerating a missing file (created on first
    /// accepted host).
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut entries: Vec<HostKeyEntry> = Vec::new();

        if path.exists() {
            let file = fs::File::open(path)
                .context(format!("Failed to open trust store: {}", path.display()))?;
            let reader = BufReader::new(file);

            for (line_idx, line_result) in reader.lines().enumerate() {
                let line = line_result.context("Failed to read line from trust store")?;
                if let Some(entry) = HostKeyEntry::parse(&line, line_idx + 1) {
                    // one entry per hostname; first record wins
                    if !entries.iter().any(|e| e.hostname == entry.hostname) {
                        entries.push(entry);
                    }
                }
            }

            debug!("Loaded {} entries from trust store: {}", entries.len(), path.display());
        } else {
            info!("Trust store does not exist yet: {}", path.display());
        }

        Ok(HostTrustStore {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Default location: `<config_dir>/tunnelkeep/known_hosts`
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("tunnelkeep").join("known_hosts"))
    }

    /// Verify a presented key for `hostname`, accepting unknown hosts on
    /// first use. A persistence failure while pinning a new host is
    /// surfaced as a warning but does not refuse the handshake: the trust
    /// decision stands in memory for this session.
    pub fn verify(&mut self, hostname: &str, key_type: &str, key_material: &str) -> TrustDecision {
        if let Some(entry) = self.entries.iter().find(|e| e.hostname == hostname) {
            if entry.matches_key(key_type, key_material) {
                debug!("Host key verified for {}", hostname);
                return TrustDecision::Trust;
            }
            warn!("Host key changed for {} - rejecting", hostname);
            return TrustDecision::Reject {
                expected_fingerprint: fingerprint_base64(&entry.key_material),
                actual_fingerprint: fingerprint_base64(key_material),
            };
        }

        let entry = HostKeyEntry {
            hostname: hostname.to_string(),
            key_type: key_type.to_string(),
            key_material: key_material.to_string(),
            origin: ORIGIN_COMMENT.to_string(),
        };
        if let Err(e) = self.append(&entry) {
            warn!(
                "Failed to persist host key for {}: {} (trusting in memory only)",
                hostname, e
            );
        } else {
            info!(
                "Pinned new host key for {} ({})",
                hostname,
                fingerprint_base64(key_material)
            );
        }
        self.entries.push(entry);
        TrustDecision::Trust
    }

    /// Append a single record to the backing file.
    fn append(&self, entry: &HostKeyEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create trust store directory")?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context(format!("Failed to open trust store: {}", self.path.display()))?;
        writeln!(file, "{}", entry.format())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.path, permissions)
                .context("Failed to set trust store permissions")?;
        }

        Ok(())
    }

    /// Remove the persisted registry. The only sanctioned recovery from a
    /// rejected host-key change.
    pub fn reset(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)
                .context(format!("Failed to remove trust store: {}", path.display()))?;
            info!("Trust store removed: {}", path.display());
        }
        Ok(())
    }

    pub fn entries(&self) -> &[HostKeyEntry] {
        &self.entries
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Shareable verifier handle over the store. The supervisor writes through
/// it during handshakes; the doctor only ever looks at the file.
#[derive(Clone)]
pub struct SharedTrustStore(Arc<Mutex<HostTrustStore>>);

impl SharedTrustStore {
    pub fn new(store: HostTrustStore) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }
}

impl HostKeyVerifier for SharedTrustStore {
    fn verify(&self, hostname: &str, key_type: &str, key_base64: &str) -> TrustDecision {
        self.0.lock().unwrap().verify(hostname, key_type, key_base64)
    }
}

/// SHA256 fingerprint of base64-encoded key material, in the usual
/// `SHA256:<base64>` rendering.
pub fn fingerprint_base64(key_material: &str) -> String {
    use base64::engine::general_purpose::STANDARD;
    let raw = STANDARD
        .decode(key_material)
        .unwrap_or_else(|_| key_material.as_bytes().to_vec());
    let mut hasher = Sha256::new();
    hasher.update(&raw);
    format!("SHA256:{}", STANDARD.encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const K1: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIAbc123";
    const K2: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIOther456";

    fn store_in(dir: &TempDir) -> HostTrustStore {
        HostTrustStore::load_from(&dir.path().join("known_hosts")).unwrap()
    }

    #[test]
    fn test_entry_parse_and_format() {
        let entry = HostKeyEntry::parse("example.com ssh-ed25519 AAAA tunnelkeepd", 1).unwrap();
        assert_eq!(entry.hostname, "example.com");
        assert_eq!(entry.key_type, "ssh-ed25519");
        assert_eq!(entry.key_material, "AAAA");
        assert_eq!(entry.origin, "tunnelkeepd");
        assert_eq!(entry.format(), "example.com ssh-ed25519 AAAA tunnelkeepd");

        assert!(HostKeyEntry::parse("# comment", 1).is_none());
        assert!(HostKeyEntry::parse("", 1).is_none());
        assert!(HostKeyEntry::parse("too few", 1).is_none());
    }

    #[test]
    fn test_first_use_pins_key() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        assert_eq!(store.verify("h", "ssh-ed25519", K1), TrustDecision::Trust);
        assert_eq!(store.entries().len(), 1);

        // same key again: trusted, no new entry
        assert_eq!(store.verify("h", "ssh-ed25519", K1), TrustDecision::Trust);
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn test_mismatch_rejects_without_mutation() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.verify("h", "ssh-ed25519", K1);

        let decision = store.verify("h", "ssh-ed25519", K2);
        assert!(!decision.is_trusted());
        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.entries()[0].key_material, K1);

        // ... and the rejected key was not persisted either
        let reloaded = store_in(&dir);
        assert_eq!(reloaded.entries().len(), 1);
        assert_eq!(reloaded.entries()[0].key_material, K1);
    }

    #[test]
    fn test_key_type_change_is_a_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.verify("h", "ssh-ed25519", K1);
        assert!(!store.verify("h", "ssh-rsa", K1).is_trusted());
    }

    #[test]
    fn test_accept_new_survives_reload() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = store_in(&dir);
            store.verify("a.example", "ssh-ed25519", K1);
            store.verify("b.example", "ssh-ed25519", K2);
        }
        let store = store_in(&dir);
        assert_eq!(store.entries().len(), 2);
        assert_eq!(store.entries()[0].hostname, "a.example");
        assert_eq!(store.entries()[1].hostname, "b.example");
    }

    #[test]
    fn test_unwritable_store_still_trusts() {
        // a directory path cannot be opened for append
        let dir = TempDir::new().unwrap();
        let mut store = HostTrustStore {
            path: dir.path().to_path_buf(),
            entries: Vec::new(),
        };
        assert_eq!(store.verify("h", "ssh-ed25519", K1), TrustDecision::Trust);
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn test_reset_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("known_hosts");
        {
            let mut store = HostTrustStore::load_from(&path).unwrap();
            store.verify("h", "ssh-ed25519", K1);
        }
        assert!(path.exists());
        HostTrustStore::reset(&path).unwrap();
        assert!(!path.exists());
        // resetting a missing file is fine
        HostTrustStore::reset(&path).unwrap();
    }
}
