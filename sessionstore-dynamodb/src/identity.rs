//! Signed session identifiers.
//!
//! An identifier is `"<tag>--<token>"` where `token` is random and `tag` is
//! the hex HMAC of the token under the configured secret. Two tag formats are
//! accepted:
//!
//! - [`IdFormat::Current`]: HMAC-SHA256, 64 hex characters. Always issued.
//! - [`IdFormat::Legacy`]: HMAC-MD5, 32 hex characters, as issued by earlier
//!   releases. Verified only, so existing cookies survive an upgrade.

use crate::error::{SessionError, SessionResult};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;
type HmacMd5 = Hmac<Md5>;

/// Separator between tag and token.
pub const DELIMITER: &str = "--";

/// Random bytes per token (hex encoded to twice as many characters).
const TOKEN_BYTES: usize = 16;

/// Wire format of an identifier's integrity tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFormat {
    Current,
    Legacy,
}

impl IdFormat {
    /// Hex length of the tag in this format.
    pub fn tag_len(self) -> usize {
        match self {
            IdFormat::Current => 64,
            IdFormat::Legacy => 32,
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        [IdFormat::Current, IdFormat::Legacy]
            .into_iter()
            .find(|format| format.tag_len() == tag.len())
    }
}

/// Outcome of verifying an untrusted identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// No identifier, or nothing shaped like one: start a new session silently.
    Absent,
    /// The identifier was tampered with or signed under another secret.
    Invalid,
    /// The tag matches.
    Valid { token: String, format: IdFormat },
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid { .. })
    }
}

/// Issues and verifies signed session identifiers.
#[derive(Clone)]
pub struct IdentitySigner {
    secret: Option<Vec<u8>>,
}

impl std::fmt::Debug for IdentitySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySigner")
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl IdentitySigner {
    /// Create a signer. Without a secret every operation fails with `MissingSecret`.
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret: secret.map(|s| s.as_bytes().to_vec()),
        }
    }

    /// Whether a secret is configured.
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Generate a fresh identifier in the current format.
    ///
    /// # Examples
    ///
    /// ```
    /// use sessionstore_dynamodb::identity::IdentitySigner;
    ///
    /// let signer = IdentitySigner::new(Some("watermelon_smiles"));
    /// let id = signer.generate().unwrap();
    /// assert!(signer.verify(Some(&id)).unwrap().is_valid());
    /// ```
    pub fn generate(&self) -> SessionResult<String> {
        let secret = self.secret()?;
        let bytes: [u8; TOKEN_BYTES] = rand::random();
        let token = hex::encode(bytes);
        let tag = hex::encode(sign_sha256(secret, &token)?);
        Ok(format!("{}{}{}", tag, DELIMITER, token))
    }

    /// Verify an untrusted identifier.
    ///
    /// `None`, an empty string or a value without `--` is [`Verification::Absent`].
    /// A value with `--` but an empty token, an unknown tag length, or a
    /// mismatching tag is [`Verification::Invalid`].
    pub fn verify(&self, candidate: Option<&str>) -> SessionResult<Verification> {
        let secret = self.secret()?;

        let Some((tag, token)) = candidate.and_then(|c| c.split_once(DELIMITER)) else {
            return Ok(Verification::Absent);
        };
        if token.is_empty() {
            return Ok(Verification::Invalid);
        }
        let Some(format) = IdFormat::from_tag(tag) else {
            return Ok(Verification::Invalid);
        };
        if !tag.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Ok(Verification::Invalid);
        }
        let Ok(tag_bytes) = hex::decode(tag) else {
            return Ok(Verification::Invalid);
        };

        let matches = match format {
            IdFormat::Current => mac_sha256(secret, token)?.verify_slice(&tag_bytes).is_ok(),
            IdFormat::Legacy => mac_md5(secret, token)?.verify_slice(&tag_bytes).is_ok(),
        };

        Ok(if matches {
            Verification::Valid {
                token: token.to_string(),
                format,
            }
        } else {
            Verification::Invalid
        })
    }

    /// Compute the legacy-format identifier for a token.
    ///
    /// The store never issues these. It exists to mint legacy ids for
    /// fixtures and migration checks while old ids are still in circulation.
    pub fn legacy_id(&self, token: &str) -> SessionResult<String> {
        let tag = hex::encode(mac_md5(self.secret()?, token)?.finalize().into_bytes());
        Ok(format!("{}{}{}", tag, DELIMITER, token))
    }

    fn secret(&self) -> SessionResult<&[u8]> {
        self.secret.as_deref().ok_or(SessionError::MissingSecret)
    }
}

fn mac_sha256(secret: &[u8], token: &str) -> SessionResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| SessionError::Config(format!("Invalid secret key: {}", e)))?;
    mac.update(token.as_bytes());
    Ok(mac)
}

fn mac_md5(secret: &[u8], token: &str) -> SessionResult<HmacMd5> {
    let mut mac = HmacMd5::new_from_slice(secret)
        .map_err(|e| SessionError::Config(format!("Invalid secret key: {}", e)))?;
    mac.update(token.as_bytes());
    Ok(mac)
}

fn sign_sha256(secret: &[u8], token: &str) -> SessionResult<Vec<u8>> {
    Ok(mac_sha256(secret, token)?.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> IdentitySigner {
        IdentitySigner::new(Some("watermelon_smiles"))
    }

    #[test]
    fn test_generate_and_verify() {
        let signer = signer();
        let id = signer.generate().unwrap();
        let (tag, token) = id.split_once("--").unwrap();

        assert_eq!(tag.len(), 64);
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert_eq!(
            signer.verify(Some(&id)).unwrap(),
            Verification::Valid {
                token: token.to_string(),
                format: IdFormat::Current
            }
        );
    }

    #[test]
    fn test_ids_are_unique() {
        let signer = signer();
        assert_ne!(signer.generate().unwrap(), signer.generate().unwrap());
    }

    #[test]
    fn test_flipping_any_character_invalidates() {
        let signer = signer();
        let id = signer.generate().unwrap();

        for (i, c) in id.char_indices() {
            if c == '-' {
                continue;
            }
            let flipped = if c == 'a' { 'b' } else { 'a' };
            let mut tampered = id.clone();
            tampered.replace_range(i..i + 1, &flipped.to_string());
            assert_eq!(
                signer.verify(Some(&tampered)).unwrap(),
                Verification::Invalid,
                "tampered at {i}: {tampered}"
            );
        }
    }

    #[test]
    fn test_absent_vs_invalid() {
        let signer = signer();
        assert_eq!(signer.verify(None).unwrap(), Verification::Absent);
        assert_eq!(signer.verify(Some("")).unwrap(), Verification::Absent);
        assert_eq!(signer.verify(Some("no-delimiter")).unwrap(), Verification::Absent);

        let id = signer.generate().unwrap();
        let (tag, _) = id.split_once("--").unwrap();
        assert_eq!(
            signer.verify(Some(&format!("{tag}--"))).unwrap(),
            Verification::Invalid
        );
        assert_eq!(signer.verify(Some("abc--def")).unwrap(), Verification::Invalid);
    }

    #[test]
    fn test_uppercase_tag_is_invalid() {
        let signer = signer();
        let id = signer.generate().unwrap();
        let (tag, token) = id.split_once("--").unwrap();
        let shouted = format!("{}--{}", tag.to_uppercase(), token);
        assert_eq!(signer.verify(Some(&shouted)).unwrap(), Verification::Invalid);
    }

    #[test]
    fn test_other_secret_is_invalid() {
        let id = signer().generate().unwrap();
        let other = IdentitySigner::new(Some("lemon_frowns"));
        assert_eq!(other.verify(Some(&id)).unwrap(), Verification::Invalid);
    }

    #[test]
    fn test_legacy_format_accepted() {
        let signer = signer();
        let token = "0123456789abcdef0123456789abcdef";
        let id = signer.legacy_id(token).unwrap();

        assert_eq!(id.split_once("--").unwrap().0.len(), 32);
        assert_eq!(
            signer.verify(Some(&id)).unwrap(),
            Verification::Valid {
                token: token.to_string(),
                format: IdFormat::Legacy
            }
        );
    }

    #[test]
    fn test_missing_secret() {
        let signer = IdentitySigner::new(None);
        assert!(matches!(signer.generate(), Err(SessionError::MissingSecret)));
        assert!(matches!(signer.verify(Some("a--b")), Err(SessionError::MissingSecret)));
    }

    #[test]
    fn test_debug_redacts_secret() {
        assert!(!format!("{:?}", signer()).contains("watermelon"));
    }
}
