//! Signature backend adapter
//!
//! Hands a (payload, signature, keyring) triple to an external signature
//! checker and interprets its machine-readable status lines. A missing
//! public key can trigger one key download followed by one retry.

mod gpg;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::error::Result;
use crate::models::{ObjectKind, VerificationOutcome};
use crate::object;
use crate::observer::{NullObserver, TrustObserver};

pub use gpg::{GpgBackend, GpgConfig};

const KEYRING_FILE: &str = "keygate.kbx";
const STATUS_PREFIX: &str = "[GNUPG:] ";

/// External signature checking operations
#[cfg_attr(test, mockall::automock)]
pub trait SignatureBackend {
    /// Verify `signature` over `payload` against `keyring`, returning status lines
    fn check(&self, payload: &Path, signature: &Path, keyring: &Path) -> Result<Vec<String>>;

    /// Retrieve `key_id` from a key server into `keyring`
    fn download_key(&self, keyring: &Path, key_id: &str) -> Result<()>;
}

/// Keyring used for one trust search
#[derive(Debug)]
pub enum Keyring {
    /// Caller-supplied keyring, never modified or deleted
    Persistent(PathBuf),
    /// Scratch keyring removed (with any downloaded keys) on drop
    Temporary { path: PathBuf, _dir: TempDir },
}

impl Keyring {
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Keyring::Persistent(path.into())
    }

    /// Create an empty scratch keyring
    pub fn temporary() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("keygate-keyring-").tempdir()?;
        let path = dir.path().join(KEYRING_FILE);
        Ok(Keyring::Temporary { path, _dir: dir })
    }

    pub fn path(&self) -> &Path {
        match self {
            Keyring::Persistent(path) => path,
            Keyring::Temporary { path, .. } => path,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Keyring::Temporary { .. })
    }

    /// Whether keys may be downloaded into this keyring
    pub fn permits_download(&self, requested: bool) -> bool {
        requested && self.is_temporary()
    }
}

/// A status line from the signature backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLine<'a> {
    GoodSignature { key_id: &'a str },
    MissingKey { key_id: &'a str },
    Other,
}

impl<'a> StatusLine<'a> {
    pub fn parse(line: &'a str) -> Self {
        let line = line.strip_prefix(STATUS_PREFIX).unwrap_or(line);
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("GOODSIG"), Some(key_id)) => StatusLine::GoodSignature { key_id },
            (Some("NO_PUBKEY"), Some(key_id)) => StatusLine::MissingKey { key_id },
            _ => StatusLine::Other,
        }
    }
}

/// What one backend run tells the verifier to do next
#[derive(Debug, Clone, PartialEq, Eq)]
enum Scan {
    Good(String),
    Download(String),
    NoGoodSignature,
}

fn scan_status(lines: &[String], download_available: bool) -> Scan {
    for line in lines {
        match StatusLine::parse(line) {
            StatusLine::GoodSignature { key_id } => return Scan::Good(key_id.to_string()),
            StatusLine::MissingKey { key_id } if download_available => {
                return Scan::Download(key_id.to_string())
            }
            _ => {}
        }
    }
    Scan::NoGoodSignature
}

fn payload_digest(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// Detached signature verifier
pub struct Verifier {
    backend: Box<dyn SignatureBackend>,
    observer: Arc<dyn TrustObserver>,
}

impl Verifier {
    pub fn new(backend: impl SignatureBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            observer: Arc::new(NullObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TrustObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn observer(&self) -> &Arc<dyn TrustObserver> {
        &self.observer
    }

    /// Verify `signature` over `payload`.
    ///
    /// Returns the signing key id on a good signature and `None` otherwise.
    /// At most one key download is attempted, and only into a temporary
    /// keyring.
    pub fn verify(
        &self,
        payload: &[u8],
        signature: &[u8],
        keyring: &Keyring,
        allow_key_download: bool,
    ) -> Result<Option<String>> {
        let scratch = tempfile::Builder::new().prefix("keygate-verify-").tempdir()?;
        let payload_path = scratch.path().join("payload");
        let signature_path = scratch.path().join("signature.asc");
        fs::write(&payload_path, payload)?;
        fs::write(&signature_path, signature)?;

        let mut downloads_left: u8 = if keyring.permits_download(allow_key_download) {
            1
        } else {
            0
        };

        loop {
            let status = self
                .backend
                .check(&payload_path, &signature_path, keyring.path())?;

            match scan_status(&status, downloads_left > 0) {
                Scan::Good(key_id) => return Ok(Some(key_id)),
                Scan::NoGoodSignature => return Ok(None),
                Scan::Download(key_id) => {
                    downloads_left -= 1;
                    match self.backend.download_key(keyring.path(), &key_id) {
                        Ok(()) => self.observer.key_downloaded(&key_id),
                        Err(err) => {
                            self.observer.key_download_failed(&key_id, &err);
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Parse and verify a single raw object without any fallback
    pub fn verify_object(
        &self,
        kind: ObjectKind,
        id: &str,
        text: &[u8],
        keyring: &Keyring,
        allow_key_download: bool,
    ) -> Result<VerificationOutcome> {
        let outcome = match object::parse(kind, text)? {
            None => VerificationOutcome::unsigned(),
            Some(signed) => {
                self.observer
                    .verifying(kind, id, &payload_digest(&signed.payload));
                match self.verify(&signed.payload, &signed.signature, keyring, allow_key_download)? {
                    Some(key_id) => VerificationOutcome::verified(key_id),
                    None => VerificationOutcome::unverified(),
                }
            }
        };
        self.observer.object_checked(kind, id, &outcome);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrustError;
    use mockall::predicate::*;
    use mockall::Sequence;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    const TAG: &str = "object 1a410efbd13591db07496601ebc7a059dd55cfe9\ntype commit\ntag v1.0\n\n\
        Release\n-----BEGIN PGP SIGNATURE-----\n\nabc\n-----END PGP SIGNATURE-----\n";

    #[test]
    fn test_status_line_parsing() {
        assert_eq!(
            StatusLine::parse("[GNUPG:] GOODSIG 0123456789ABCDEF Jane Doe <jane@example.com>"),
            StatusLine::GoodSignature { key_id: "0123456789ABCDEF" }
        );
        assert_eq!(
            StatusLine::parse("NO_PUBKEY FEDCBA9876543210"),
            StatusLine::MissingKey { key_id: "FEDCBA9876543210" }
        );
        assert_eq!(StatusLine::parse("[GNUPG:] BADSIG 0123 Jane"), StatusLine::Other);
        assert_eq!(StatusLine::parse("[GNUPG:] GOODSIG"), StatusLine::Other);
        assert_eq!(StatusLine::parse(""), StatusLine::Other);
    }

    #[test]
    fn test_scan_stops_at_first_good_signature() {
        let status = lines(&[
            "[GNUPG:] NEWSIG",
            "[GNUPG:] GOODSIG AAAA First",
            "[GNUPG:] GOODSIG BBBB Second",
        ]);
        assert_eq!(scan_status(&status, true), Scan::Good("AAAA".to_string()));
    }

    #[test]
    fn test_scan_missing_key_without_download() {
        let status = lines(&["[GNUPG:] ERRSIG CCCC 1 8 00", "[GNUPG:] NO_PUBKEY CCCC"]);
        assert_eq!(scan_status(&status, false), Scan::NoGoodSignature);
        assert_eq!(scan_status(&status, true), Scan::Download("CCCC".to_string()));
    }

    #[test]
    fn test_verify_good_signature() {
        let mut backend = MockSignatureBackend::new();
        backend
            .expect_check()
            .times(1)
            .returning(|payload, signature, _| {
                assert_eq!(std::fs::read_to_string(payload).unwrap(), "payload");
                assert_eq!(std::fs::read_to_string(signature).unwrap(), "signature");
                Ok(lines(&["[GNUPG:] GOODSIG 0xKEYID Someone"]))
            });
        backend.expect_download_key().never();

        let verifier = Verifier::new(backend);
        let keyring = Keyring::temporary().unwrap();
        let key = verifier.verify(b"payload", b"signature", &keyring, true).unwrap();
        assert_eq!(key.as_deref(), Some("0xKEYID"));
    }

    #[test]
    fn test_payload_written_byte_exact() {
        let mut backend = MockSignatureBackend::new();
        backend.expect_check().times(1).returning(|payload, _, _| {
            assert_eq!(std::fs::read(payload).unwrap(), b"encoding ISO-8859-1\n\ncaf\xe9\n");
            Ok(lines(&["[GNUPG:] GOODSIG 0xKEYID Someone"]))
        });

        let verifier = Verifier::new(backend);
        let keyring = Keyring::persistent("/nonexistent");
        let key = verifier
            .verify(b"encoding ISO-8859-1\n\ncaf\xe9\n", b"signature", &keyring, false)
            .unwrap();
        assert_eq!(key.as_deref(), Some("0xKEYID"));
    }

    #[test]
    fn test_verify_downloads_once_then_retries() {
        let keyring = Keyring::temporary().unwrap();
        let keyring_path = keyring.path().to_path_buf();

        let mut seq = Sequence::new();
        let mut backend = MockSignatureBackend::new();
        backend
            .expect_check()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(lines(&["[GNUPG:] NO_PUBKEY DDDD"])));
        backend
            .expect_download_key()
            .with(eq(keyring_path), eq("DDDD"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        backend
            .expect_check()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(lines(&["[GNUPG:] GOODSIG DDDD Someone"])));

        let verifier = Verifier::new(backend);
        let key = verifier.verify(b"p", b"s", &keyring, true).unwrap();
        assert_eq!(key.as_deref(), Some("DDDD"));
    }

    #[test]
    fn test_verify_retry_does_not_download_again() {
        let mut backend = MockSignatureBackend::new();
        backend
            .expect_check()
            .times(2)
            .returning(|_, _, _| Ok(lines(&["[GNUPG:] NO_PUBKEY EEEE"])));
        backend.expect_download_key().times(1).returning(|_, _| Ok(()));

        let verifier = Verifier::new(backend);
        let keyring = Keyring::temporary().unwrap();
        assert_eq!(verifier.verify(b"p", b"s", &keyring, true).unwrap(), None);
    }

    #[test]
    fn test_download_failure_is_not_propagated() {
        let mut backend = MockSignatureBackend::new();
        backend
            .expect_check()
            .times(1)
            .returning(|_, _, _| Ok(lines(&["[GNUPG:] NO_PUBKEY FFFF"])));
        backend.expect_download_key().times(1).returning(|_, key_id| {
            Err(TrustError::KeyDownload {
                key_id: key_id.to_string(),
                reason: "keyserver unreachable".to_string(),
            })
        });

        let verifier = Verifier::new(backend);
        let keyring = Keyring::temporary().unwrap();
        assert_eq!(verifier.verify(b"p", b"s", &keyring, true).unwrap(), None);
    }

    #[test]
    fn test_persistent_keyring_never_downloads() {
        let mut backend = MockSignatureBackend::new();
        backend
            .expect_check()
            .times(1)
            .returning(|_, _, _| Ok(lines(&["[GNUPG:] NO_PUBKEY ABAB"])));
        backend.expect_download_key().never();

        let verifier = Verifier::new(backend);
        let keyring = Keyring::persistent("/etc/keygate/trusted.kbx");
        assert_eq!(verifier.verify(b"p", b"s", &keyring, true).unwrap(), None);
    }

    #[test]
    fn test_scratch_files_removed() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let captured = seen.clone();

        let mut backend = MockSignatureBackend::new();
        backend.expect_check().returning(move |payload, _, _| {
            *captured.lock().unwrap() = Some(payload.to_path_buf());
            Ok(vec![])
        });

        let verifier = Verifier::new(backend);
        let keyring = Keyring::persistent("/nonexistent");
        assert_eq!(verifier.verify(b"p", b"s", &keyring, false).unwrap(), None);

        let payload = seen.lock().unwrap().clone().unwrap();
        assert!(!payload.exists());
        assert!(!payload.parent().unwrap().exists());
    }

    #[test]
    fn test_scratch_files_removed_on_error() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let captured = seen.clone();

        let mut backend = MockSignatureBackend::new();
        backend.expect_check().returning(move |payload, _, _| {
            *captured.lock().unwrap() = Some(payload.to_path_buf());
            Err(TrustError::Backend {
                reason: "gpg not found".to_string(),
            })
        });

        let verifier = Verifier::new(backend);
        let keyring = Keyring::persistent("/nonexistent");
        assert!(verifier.verify(b"p", b"s", &keyring, false).is_err());

        let payload = seen.lock().unwrap().clone().unwrap();
        assert!(!payload.parent().unwrap().exists());
    }

    #[test]
    fn test_temporary_keyring_removed_on_drop() {
        let keyring = Keyring::temporary().unwrap();
        let dir = keyring.path().parent().unwrap().to_path_buf();
        assert!(dir.exists());
        assert!(keyring.is_temporary());
        drop(keyring);
        assert!(!dir.exists());
    }

    #[test]
    fn test_verify_object_outcomes() {
        let mut backend = MockSignatureBackend::new();
        backend.expect_check().never();
        let verifier = Verifier::new(backend);
        let keyring = Keyring::persistent("/nonexistent");

        let unsigned = "object abc\ntype commit\ntag v0\n\nmsg\n";
        let outcome = verifier
            .verify_object(ObjectKind::Tag, "v0", unsigned.as_bytes(), &keyring, false)
            .unwrap();
        assert_eq!(outcome, VerificationOutcome::unsigned());

        let mut backend = MockSignatureBackend::new();
        backend
            .expect_check()
            .returning(|_, _, _| Ok(lines(&["[GNUPG:] BADSIG 1234 Mallory"])));
        let verifier = Verifier::new(backend);
        let outcome = verifier
            .verify_object(ObjectKind::Tag, "v1.0", TAG.as_bytes(), &keyring, false)
            .unwrap();
        assert_eq!(outcome, VerificationOutcome::unverified());
    }

    #[test]
    fn test_payload_digest() {
        assert_eq!(
            payload_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
