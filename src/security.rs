//! Token and credential helpers shared by the session registry, the account
//! ledger and the retrieval store.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand_core::{OsRng, RngCore};

/// Byte length of session tokens.
pub const SESSION_TOKEN_BYTES: usize = 32;
/// Byte length of retrieval handles. Handles double as directory names, so
/// they stay shorter than session tokens.
pub const HANDLE_BYTES: usize = 18;

/// Draws `len` bytes from the OS RNG and encodes them as URL-safe base64.
///
/// The alphabet (`A-Z a-z 0-9 - _`) is safe both inside URL path segments and
/// as a file name, which is what retrieval handles rely on.
pub fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn session_token() -> String {
    random_token(SESSION_TOKEN_BYTES)
}

pub fn retrieval_handle() -> String {
    random_token(HANDLE_BYTES)
}

/// Digest used to compare login credentials. This is a plain, unsalted hash:
/// it only keeps cleartext passwords out of memory and the account database.
pub fn credential_digest(account_id: &str, password: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(account_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(password.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Returns true when `value` could have been produced by [`random_token`].
/// Used to reject path segments before they touch the filesystem.
pub fn is_token_shaped(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_are_unique_and_url_safe() {
        let tokens: HashSet<String> = (0..64).map(|_| session_token()).collect();
        assert_eq!(tokens.len(), 64);
        for token in &tokens {
            assert_eq!(token.len(), 43);
            assert!(is_token_shaped(token));
        }
    }

    #[test]
    fn handles_are_shorter_than_session_tokens() {
        assert_eq!(retrieval_handle().len(), 24);
    }

    #[test]
    fn credential_digest_binds_account_and_password() {
        let a = credential_digest("u1@test.com", "pw");
        assert_eq!(a, credential_digest("u1@test.com", "pw"));
        assert_ne!(a, credential_digest("u2@test.com", "pw"));
        assert_ne!(a, credential_digest("u1@test.com", "pw2"));
        assert!(!a.contains("pw"));
    }

    #[test]
    fn token_shape_rejects_traversal() {
        assert!(!is_token_shaped(".."));
        assert!(!is_token_shaped("a/b"));
        assert!(!is_token_shaped(""));
        assert!(is_token_shaped("abc-DEF_123"));
    }
}
