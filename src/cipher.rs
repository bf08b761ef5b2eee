use std::path::Path;

use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncWriteExt;

use crate::config::GpgConfig;
use crate::error::{Result, ShareError};
use crate::identity::{gpg_command, run_with_stdin, stderr_text};

/// Public-key encryption of whole files.
///
/// `decrypt` trusts whichever key produced the ciphertext: sender
/// authenticity comes from the handshake, not from this layer.
#[async_trait]
pub trait Cipher: Send + Sync {
    async fn encrypt(&self, source: &Path, recipient_fingerprint: &str) -> Result<Vec<u8>>;

    /// Decrypt `ciphertext` into `destination`; returns once the file is on disk.
    async fn decrypt(&self, ciphertext: &[u8], destination: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct GpgCipher {
    config: GpgConfig,
}

impl GpgCipher {
    pub fn new(config: GpgConfig) -> Self {
        GpgCipher { config }
    }
}

#[async_trait]
impl Cipher for GpgCipher {
    async fn encrypt(&self, source: &Path, recipient_fingerprint: &str) -> Result<Vec<u8>> {
        let plaintext = tokio::fs::read(source).await.map_err(|e| ShareError::FileUnavailable {
            path: source.to_path_buf(),
            source: e,
        })?;
        debug!("Encrypting {} bytes for {}", plaintext.len(), recipient_fingerprint);

        let mut cmd = gpg_command(&self.config);
        cmd.args([
            "--yes",
            "--trust-model",
            "always",
            "--armor",
            "--encrypt",
            "--recipient",
            recipient_fingerprint,
        ]);
        let output = run_with_stdin(cmd, plaintext)
            .await
            .map_err(|e| ShareError::EncryptionFailed(format!("could not run gpg: {}", e)))?;

        if !output.status.success() {
            return Err(ShareError::EncryptionFailed(stderr_text(&output)));
        }
        if output.stdout.is_empty() {
            return Err(ShareError::EncryptionFailed("gpg produced no output".into()));
        }
        Ok(output.stdout)
    }

    async fn decrypt(&self, ciphertext: &[u8], destination: &Path) -> Result<()> {
        let mut cmd = gpg_command(&self.config);
        cmd.args(["--yes", "--decrypt"]);
        let output = run_with_stdin(cmd, ciphertext.to_vec())
            .await
            .map_err(|e| ShareError::DecryptionFailed(format!("could not run gpg: {}", e)))?;

        if !output.status.success() {
            return Err(ShareError::DecryptionFailed(stderr_text(&output)));
        }

        write_private_file(destination, &output.stdout)
            .await
            .map_err(|e| {
                ShareError::DecryptionFailed(format!(
                    "failed to write {}: {}",
                    destination.display(),
                    e
                ))
            })?;
        debug!("Wrote {} decrypted bytes to {}", output.stdout.len(), destination.display());
        Ok(())
    }
}

/// Create or truncate `path` readable by the owner only, write `data` and sync it.
pub async fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_write_private_file() {
        let path = std::env::temp_dir().join(format!("test_private_{}.bin", std::process::id()));

        write_private_file(&path, b"first version, longer").await.unwrap();
        write_private_file(&path, b"second").await.unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o077, 0);
        }

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_encrypt_missing_file() {
        let cipher = GpgCipher::default();
        let missing = std::env::temp_dir().join(format!("does_not_exist_{}", std::process::id()));

        let err = cipher.encrypt(&missing, "ABCDEF").await.unwrap_err();
        assert!(matches!(err, ShareError::FileUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_missing_gpg_binary() {
        let cipher = GpgCipher::new(GpgConfig {
            program: "/nonexistent/gpg-binary".into(),
            homedir: None,
        });

        let err = cipher.decrypt(b"whatever", Path::new("/tmp/never")).await.unwrap_err();
        assert!(matches!(err, ShareError::DecryptionFailed(_)));
    }
}
