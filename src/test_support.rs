//! In-memory stand-ins for the keyring and the cipher, so protocol tests run
//! without a `gpg` binary.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cipher::Cipher;
use crate::error::{Result, ShareError};
use crate::identity::{Identity, IdentityProvider, ImportedKey};

pub fn fake_armor(fingerprint: &str) -> String {
    format!(
        "-----BEGIN PGP PUBLIC KEY BLOCK-----\n\nfpr:{}\n-----END PGP PUBLIC KEY BLOCK-----\n",
        fingerprint
    )
}

pub fn fake_identity(label: &str, fingerprint: &str) -> Identity {
    Identity {
        fingerprint: fingerprint.to_string(),
        label: label.to_string(),
        public_key_armor: fake_armor(fingerprint),
    }
}

/// Keys are "armored" as `fpr:<FINGERPRINT>` lines.
#[derive(Default)]
pub struct FakeKeyring {
    local: Option<Identity>,
    keys: Mutex<HashMap<String, String>>,
    fail_imports: bool,
}

impl FakeKeyring {
    pub fn with_identity(identity: Identity) -> Self {
        FakeKeyring {
            local: Some(identity),
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// A keyring that refuses every import.
    pub fn failing_imports() -> Self {
        FakeKeyring {
            fail_imports: true,
            ..Default::default()
        }
    }

    pub fn preload(&self, fingerprint: &str) {
        self.keys
            .lock()
            .unwrap()
            .insert(fingerprint.to_string(), fake_armor(fingerprint));
    }

    pub fn has(&self, fingerprint: &str) -> bool {
        self.keys.lock().unwrap().contains_key(fingerprint)
    }
}

#[async_trait]
impl IdentityProvider for FakeKeyring {
    async fn default_identity(&self) -> Result<Identity> {
        self.local
            .clone()
            .ok_or_else(|| ShareError::IdentityUnavailable("no secret key".into()))
    }

    async fn export_public_key(&self, fingerprint: &str) -> Result<String> {
        Ok(fake_armor(fingerprint))
    }

    async fn import_public_key(&self, armor: &str) -> Result<ImportedKey> {
        if self.fail_imports {
            return Err(ShareError::ImportFailed("import disabled".into()));
        }
        let fingerprints: Vec<String> = armor
            .lines()
            .filter_map(|line| line.strip_prefix("fpr:"))
            .map(str::to_string)
            .collect();
        if fingerprints.is_empty() {
            return Err(ShareError::ImportFailed("no key in block".into()));
        }

        let mut keys = self.keys.lock().unwrap();
        for fpr in &fingerprints {
            keys.entry(fpr.clone()).or_insert_with(|| armor.to_string());
        }
        Ok(ImportedKey { fingerprints })
    }

    async fn key_exists(&self, fingerprint: &str) -> bool {
        self.has(fingerprint)
    }
}

/// "Encrypts" by tagging the recipient and flipping bits. Decryption only
/// works for the recipient the cipher was built for.
pub struct FakeCipher {
    pub own_fingerprint: String,
}

impl FakeCipher {
    pub fn new(own_fingerprint: &str) -> Self {
        FakeCipher {
            own_fingerprint: own_fingerprint.to_string(),
        }
    }
}

const FAKE_HEADER: &str = "FAKEPGP ";

#[async_trait]
impl Cipher for FakeCipher {
    async fn encrypt(&self, source: &Path, recipient_fingerprint: &str) -> Result<Vec<u8>> {
        let plain = tokio::fs::read(source)
            .await
            .map_err(|e| ShareError::FileUnavailable {
                path: source.to_path_buf(),
                source: e,
            })?;
        let mut out = format!("{}{}\n", FAKE_HEADER, recipient_fingerprint).into_bytes();
        out.extend(plain.iter().map(|b| b ^ 0x5a));
        Ok(out)
    }

    async fn decrypt(&self, ciphertext: &[u8], destination: &Path) -> Result<()> {
        let newline = ciphertext
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| ShareError::DecryptionFailed("no header".into()))?;
        let header = std::str::from_utf8(&ciphertext[..newline])
            .map_err(|_| ShareError::DecryptionFailed("bad header".into()))?;
        let recipient = header
            .strip_prefix(FAKE_HEADER)
            .ok_or_else(|| ShareError::DecryptionFailed("bad header".into()))?;
        if recipient != self.own_fingerprint {
            return Err(ShareError::DecryptionFailed(format!(
                "encrypted for {}, not us",
                recipient
            )));
        }

        let plain: Vec<u8> = ciphertext[newline + 1..].iter().map(|b| b ^ 0x5a).collect();
        tokio::fs::write(destination, plain).await?;
        Ok(())
    }
}

pub fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("secretshare_{}_{}", name, std::process::id()))
}
