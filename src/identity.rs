//! # Identities and the Local Keyring
//!
//! An [`Identity`] is what a client presents during the handshake. The
//! fingerprint is the only field trust decisions are made on; the label is
//! shown to a human and nothing more.
//!
//! [`GpgKeyring`] is the production [`IdentityProvider`], driving the `gpg`
//! binary as a subprocess.

use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::GpgConfig;
use crate::error::{Result, ShareError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub fingerprint: String,
    pub label: String,
    pub public_key_armor: String,
}

/// What an import actually brought into the keyring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportedKey {
    pub fingerprints: Vec<String>,
}

impl ImportedKey {
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.fingerprints
            .iter()
            .any(|fpr| same_fingerprint(fpr, fingerprint))
    }
}

/// Access to the local actor's identity and to the keyring remote keys are
/// imported into.
///
/// `import_public_key` must be idempotent and must never remove or replace a
/// key belonging to a fingerprint other than the ones in the imported block.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn default_identity(&self) -> Result<Identity>;

    async fn export_public_key(&self, fingerprint: &str) -> Result<String>;

    async fn import_public_key(&self, armor: &str) -> Result<ImportedKey>;

    async fn key_exists(&self, fingerprint: &str) -> bool;
}

/// Fingerprints compare case-insensitively and ignore the spaces gpg puts in
/// its human-readable output.
pub fn same_fingerprint(a: &str, b: &str) -> bool {
    let normalize = |s: &str| -> String {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect()
    };
    let (a, b) = (normalize(a), normalize(b));
    !a.is_empty() && a == b
}

/// One record of `gpg --with-colons` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColonRecord<'a> {
    pub kind: &'a str,
    fields: Vec<&'a str>,
}

impl<'a> ColonRecord<'a> {
    pub fn field(&self, index: usize) -> Option<&'a str> {
        self.fields.get(index).copied().filter(|f| !f.is_empty())
    }

    /// Field 10 holds the fingerprint on `fpr` lines and the user id on `uid` lines.
    pub fn user_data(&self) -> Option<&'a str> {
        self.field(9)
    }
}

pub fn parse_colons(output: &str) -> Vec<ColonRecord<'_>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            ColonRecord {
                kind: fields[0],
                fields,
            }
        })
        .collect()
}

/// The first primary key of a listing: its fingerprint and first user id.
///
/// `fpr` records that follow a `sub`/`ssb` line belong to subkeys and are skipped.
pub fn primary_identity(records: &[ColonRecord<'_>]) -> Option<(String, String)> {
    let mut fingerprint = None;
    let mut label = None;
    let mut in_primary = false;

    for record in records {
        match record.kind {
            "pub" | "sec" => {
                if fingerprint.is_some() {
                    break;
                }
                in_primary = true;
            }
            "sub" | "ssb" => in_primary = false,
            "fpr" if in_primary && fingerprint.is_none() => {
                fingerprint = record.user_data().map(str::to_string);
            }
            "uid" if label.is_none() => {
                label = record.user_data().map(unescape_colon_field);
            }
            _ => {}
        }
    }

    Some((fingerprint?, label.unwrap_or_default()))
}

/// Fingerprints of every primary key in a listing.
pub fn primary_fingerprints(records: &[ColonRecord<'_>]) -> Vec<String> {
    let mut fingerprints = Vec::new();
    let mut expect_primary_fpr = false;

    for record in records {
        match record.kind {
            "pub" | "sec" => expect_primary_fpr = true,
            "sub" | "ssb" => expect_primary_fpr = false,
            "fpr" if expect_primary_fpr => {
                if let Some(fpr) = record.user_data() {
                    fingerprints.push(fpr.to_string());
                }
                expect_primary_fpr = false;
            }
            _ => {}
        }
    }

    fingerprints
}

// gpg escapes ':' and control characters in user ids as \xNN
fn unescape_colon_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find("\\x") {
        out.push_str(&rest[..pos]);
        let hex = rest.get(pos + 2..pos + 4);
        match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
            Some(byte) if byte.is_ascii() => {
                out.push(byte as char);
                rest = &rest[pos + 4..];
            }
            _ => {
                out.push_str("\\x");
                rest = &rest[pos + 2..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// The local GnuPG keyring.
#[derive(Debug, Clone, Default)]
pub struct GpgKeyring {
    config: GpgConfig,
}

impl GpgKeyring {
    pub fn new(config: GpgConfig) -> Self {
        GpgKeyring { config }
    }

    fn command(&self) -> Command {
        gpg_command(&self.config)
    }

    /// Fingerprints in an armored block and whether it carries secret key material,
    /// without touching the keyring.
    async fn inspect_block(&self, armor: &str) -> Result<(Vec<String>, bool)> {
        let mut cmd = self.command();
        cmd.args([
            "--with-colons",
            "--import-options",
            "show-only",
            "--import",
        ]);
        let output = run_with_stdin(cmd, armor.as_bytes().to_vec())
            .await
            .map_err(|e| ShareError::ImportFailed(format!("could not run gpg: {}", e)))?;

        if !output.status.success() {
            return Err(ShareError::ImportFailed(format!(
                "gpg could not read the key block: {}",
                stderr_text(&output)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let records = parse_colons(&stdout);
        let has_secret = records.iter().any(|r| r.kind == "sec" || r.kind == "ssb");
        Ok((primary_fingerprints(&records), has_secret))
    }
}

#[async_trait]
impl IdentityProvider for GpgKeyring {
    async fn default_identity(&self) -> Result<Identity> {
        let output = self
            .command()
            .args(["--with-colons", "--list-secret-keys"])
            .output()
            .await
            .map_err(|e| ShareError::IdentityUnavailable(format!("could not run gpg: {}", e)))?;

        if !output.status.success() {
            return Err(ShareError::IdentityUnavailable(format!(
                "failed to list secret keys: {}",
                stderr_text(&output)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (fingerprint, label) = primary_identity(&parse_colons(&stdout))
            .ok_or_else(|| ShareError::IdentityUnavailable("no secret key in keyring".into()))?;
        let label = if label.is_empty() {
            fingerprint.clone()
        } else {
            label
        };
        debug!("Default identity: {} ({})", label, fingerprint);

        let public_key_armor = self.export_public_key(&fingerprint).await?;
        Ok(Identity {
            fingerprint,
            label,
            public_key_armor,
        })
    }

    async fn export_public_key(&self, fingerprint: &str) -> Result<String> {
        let output = self
            .command()
            .args(["--armor", "--export", fingerprint])
            .output()
            .await
            .map_err(|e| ShareError::IdentityUnavailable(format!("could not run gpg: {}", e)))?;

        let armor = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() || armor.trim().is_empty() {
            return Err(ShareError::IdentityUnavailable(format!(
                "failed to export public key {}: {}",
                fingerprint,
                stderr_text(&output)
            )));
        }
        Ok(armor)
    }

    async fn import_public_key(&self, armor: &str) -> Result<ImportedKey> {
        let (fingerprints, has_secret) = self.inspect_block(armor).await?;
        if has_secret {
            return Err(ShareError::ImportFailed(
                "key block carries secret key material".into(),
            ));
        }
        match fingerprints.len() {
            0 => return Err(ShareError::ImportFailed("key block holds no public key".into())),
            1 => {}
            n => {
                return Err(ShareError::ImportFailed(format!(
                    "key block holds {} primary keys, expected one",
                    n
                )))
            }
        }

        let mut cmd = self.command();
        cmd.arg("--import");
        let output = run_with_stdin(cmd, armor.as_bytes().to_vec())
            .await
            .map_err(|e| ShareError::ImportFailed(format!("could not run gpg: {}", e)))?;
        if !output.status.success() {
            return Err(ShareError::ImportFailed(stderr_text(&output)));
        }

        info!("Imported public key {}", fingerprints[0]);
        Ok(ImportedKey { fingerprints })
    }

    async fn key_exists(&self, fingerprint: &str) -> bool {
        let output = match self
            .command()
            .args(["--with-colons", "--list-keys", fingerprint])
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!("Could not run gpg to look up {}: {}", fingerprint, e);
                return false;
            }
        };
        if !output.status.success() {
            return false;
        }

        // gpg also matches short key ids and user ids, so insist on the full fingerprint
        let stdout = String::from_utf8_lossy(&output.stdout);
        primary_fingerprints(&parse_colons(&stdout))
            .iter()
            .any(|fpr| same_fingerprint(fpr, fingerprint))
    }
}

pub(crate) fn gpg_command(config: &GpgConfig) -> Command {
    let mut cmd = Command::new(&config.program);
    cmd.arg("--batch").arg("--no-tty");
    if let Some(home) = &config.homedir {
        cmd.arg("--homedir").arg(home);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Run `cmd` feeding `input` to its stdin while collecting its output.
pub(crate) async fn run_with_stdin(
    mut cmd: Command,
    input: Vec<u8>,
) -> std::io::Result<std::process::Output> {
    cmd.stdin(Stdio::piped());
    let mut child = cmd.spawn()?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gpg stdin unavailable"))?;
    // Feed stdin concurrently so a full stdout pipe can not deadlock the child
    let writer = tokio::spawn(async move {
        let result = stdin.write_all(&input).await;
        drop(stdin);
        result
    });

    let output = child.wait_with_output().await?;
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("gpg closed stdin early: {}", e),
        Err(e) => debug!("stdin writer task failed: {}", e),
    }
    Ok(output)
}

pub(crate) fn stderr_text(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET_LISTING: &str = "\
sec:u:255:22:AAAABBBBCCCCDDDD:1700000000:::u:::scESC:::+:::ed25519:::0:
fpr:::::::::0123456789ABCDEF0123456789ABCDEF01234567:
grp:::::::::9F3B8E6A4D2C1B0A9F3B8E6A4D2C1B0A9F3B8E6A:
uid:u::::1700000000::HASH::Alice Example <alice@example.com>::::::::::0:
ssb:u:255:18:1111222233334444:1700000000::::::e:::+:::cv25519::
fpr:::::::::FEDCBA9876543210FEDCBA9876543210FEDCBA98:
";

    #[test]
    fn test_primary_identity_skips_subkeys() {
        let records = parse_colons(SECRET_LISTING);
        let (fpr, label) = primary_identity(&records).expect("identity");

        assert_eq!(fpr, "0123456789ABCDEF0123456789ABCDEF01234567");
        assert_eq!(label, "Alice Example <alice@example.com>");
    }

    #[test]
    fn test_primary_identity_empty_listing() {
        assert!(primary_identity(&parse_colons("")).is_none());
    }

    #[test]
    fn test_primary_fingerprints_multiple_keys() {
        let listing = "\
pub:-:255:22:AAAA:1700000000:::-:::scESC:::::ed25519:::0:
fpr:::::::::AAAA000000000000000000000000000000000001:
sub:-:255:18:BBBB:1700000000::::::e:::::cv25519::
fpr:::::::::BBBB000000000000000000000000000000000002:
pub:-:255:22:CCCC:1700000000:::-:::scESC:::::ed25519:::0:
fpr:::::::::CCCC000000000000000000000000000000000003:
";
        let fprs = primary_fingerprints(&parse_colons(listing));
        assert_eq!(
            fprs,
            vec![
                "AAAA000000000000000000000000000000000001".to_string(),
                "CCCC000000000000000000000000000000000003".to_string(),
            ]
        );
    }

    #[test]
    fn test_uid_unescaping() {
        assert_eq!(unescape_colon_field("Bob\\x3a Work"), "Bob: Work");
        assert_eq!(unescape_colon_field("plain"), "plain");
        assert_eq!(unescape_colon_field("bad\\xZZ"), "bad\\xZZ");
    }

    #[test]
    fn test_same_fingerprint() {
        assert!(same_fingerprint(
            "0123 4567 89AB CDEF",
            "0123456789abcdef"
        ));
        assert!(!same_fingerprint("0123", "01234"));
        assert!(!same_fingerprint("", ""));
    }

    const PUBLIC_LISTING: &str = "\
pub:-:255:22:CDEF0123456789AB:1700000000:::-:::scESC:::::ed25519:::0:
fpr:::::::::0123456789ABCDEF0123456789ABCDEF01234567:
uid:-::::1700000000::HASH::Alice Example <alice@example.com>::::::::::0:
sub:-:255:18:FEDCBA9876543210:1700000000::::::e:::::cv25519::
fpr:::::::::FEDCBA9876543210FEDCBA9876543210FEDCBA98:
";

    const ALICE_FPR: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

    // Scripts are written then executed; one at a time keeps a concurrent
    // fork from holding a script open for writing (ETXTBSY).
    #[cfg(unix)]
    static SCRIPT_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    /// A stand-in `gpg` that answers `show-only` inspection and
    /// `--list-keys` from canned listings and records real imports by
    /// touching `imported` next to itself.
    #[cfg(unix)]
    struct FakeGpg {
        dir: std::path::PathBuf,
    }

    #[cfg(unix)]
    impl FakeGpg {
        fn with_body(name: &str, body: &str) -> Self {
            use std::fs;
            use std::os::unix::fs::PermissionsExt;

            let dir = crate::test_support::temp_path(name);
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(&dir).unwrap();
            let script = dir.join("gpg");
            fs::write(&script, format!("#!/bin/sh\ncat > /dev/null\n{}", body)).unwrap();
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
            FakeGpg { dir }
        }

        fn new(name: &str, show_only: &str, list_keys: &str) -> Self {
            let body = format!(
                "case \"$*\" in\n\
                 *show-only*) cat <<'LISTING'\n{}LISTING\n;;\n\
                 *--import*) touch \"$(dirname \"$0\")/imported\" ;;\n\
                 *--list-keys*) cat <<'LISTING'\n{}LISTING\n;;\n\
                 *) exit 2 ;;\n\
                 esac\n",
                show_only, list_keys
            );
            Self::with_body(name, &body)
        }

        fn keyring(&self) -> GpgKeyring {
            GpgKeyring::new(GpgConfig {
                program: self.dir.join("gpg"),
                homedir: None,
            })
        }

        fn imported(&self) -> bool {
            self.dir.join("imported").exists()
        }
    }

    #[cfg(unix)]
    impl Drop for FakeGpg {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_import_single_public_key() {
        let _lock = SCRIPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let gpg = FakeGpg::new("gpg_import_one", PUBLIC_LISTING, "");

        let imported = gpg.keyring().import_public_key("armor").await.unwrap();

        assert_eq!(imported.fingerprints, vec![ALICE_FPR.to_string()]);
        assert!(gpg.imported());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_import_refuses_secret_material() {
        let _lock = SCRIPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let gpg = FakeGpg::new("gpg_import_secret", SECRET_LISTING, "");

        let err = gpg.keyring().import_public_key("armor").await.unwrap_err();

        assert!(matches!(err, ShareError::ImportFailed(ref m) if m.contains("secret")));
        assert!(!gpg.imported());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_import_refuses_several_primary_keys() {
        let two_keys = format!(
            "{}pub:-:255:22:AAAA:1700000000:::-:::scESC:::::ed25519:::0:\n\
             fpr:::::::::AAAA000000000000000000000000000000000001:\n",
            PUBLIC_LISTING
        );
        let _lock = SCRIPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let gpg = FakeGpg::new("gpg_import_two", &two_keys, "");

        let err = gpg.keyring().import_public_key("armor").await.unwrap_err();

        assert!(matches!(err, ShareError::ImportFailed(ref m) if m.contains("2 primary keys")));
        assert!(!gpg.imported());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_import_refuses_empty_block() {
        let _lock = SCRIPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let gpg = FakeGpg::new("gpg_import_none", "", "");

        let err = gpg.keyring().import_public_key("armor").await.unwrap_err();

        assert!(matches!(err, ShareError::ImportFailed(_)));
        assert!(!gpg.imported());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_key_exists_requires_full_primary_fingerprint() {
        let _lock = SCRIPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // gpg lists the key for any query that matches it, short ids and
        // user ids included
        let gpg = FakeGpg::new("gpg_key_exists", "", PUBLIC_LISTING);
        let keyring = gpg.keyring();

        assert!(keyring.key_exists(ALICE_FPR).await);
        assert!(keyring.key_exists(&ALICE_FPR.to_lowercase()).await);
        assert!(!keyring.key_exists("89ABCDEF01234567").await);
        assert!(!keyring.key_exists("Alice Example").await);
        assert!(!keyring.key_exists("FEDCBA9876543210FEDCBA9876543210FEDCBA98").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_gpg_refuses_everything() {
        let _lock = SCRIPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let gpg = FakeGpg::with_body("gpg_broken", "echo 'gpg: keybox unusable' >&2\nexit 2\n");
        let keyring = gpg.keyring();

        let err = keyring.import_public_key("armor").await.unwrap_err();
        assert!(matches!(err, ShareError::ImportFailed(ref m) if m.contains("keybox unusable")));
        assert!(!keyring.key_exists(ALICE_FPR).await);
        assert!(matches!(
            keyring.default_identity().await,
            Err(ShareError::IdentityUnavailable(_))
        ));
        assert!(!gpg.imported());
    }

    #[test]
    fn test_imported_key_contains() {
        let imported = ImportedKey {
            fingerprints: vec!["ABCDEF".to_string()],
        };
        assert!(imported.contains("abcdef"));
        assert!(!imported.contains("ABCDE0"));
    }
}
