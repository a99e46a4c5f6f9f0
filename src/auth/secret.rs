//! Password and PIN hashing, input validation, challenge codes.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use lazy_static::lazy_static;
use rand::{distributions::Alphanumeric, Rng};
use regex::Regex;
use tracing::error;

const CHALLENGE_CODE_LEN: usize = 8;

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    static ref PIN_RE: Regex = Regex::new(r"^[0-9]{4,8}$").unwrap();
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

pub fn is_valid_pin(pin: &str) -> bool {
    PIN_RE.is_match(pin)
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Argon2 hash for a password or a PIN.
pub fn hash_secret(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

pub fn verify_secret(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        error!(error = %e, "argon2 parse hash error");
        anyhow::anyhow!(e.to_string())
    })?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}

/// Opaque code identifying one successful PIN challenge.
pub fn challenge_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CHALLENGE_CODE_LEN)
        .map(|c| char::from(c).to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_password() {
        let hash = hash_secret("Secur3P@ssw0rd!").expect("hashing should succeed");
        assert!(verify_secret("Secur3P@ssw0rd!", &hash).expect("verify should succeed"));
        assert!(!verify_secret("wrong-password", &hash).expect("verify should not error"));
    }

    #[test]
    fn pin_hashes_verify_like_passwords() {
        let hash = hash_secret("4821").unwrap();
        assert!(verify_secret("4821", &hash).unwrap());
        assert!(!verify_secret("4822", &hash).unwrap());
    }

    #[test]
    fn verify_errors_on_malformed_hash() {
        let err = verify_secret("anything", "not-a-valid-hash").unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn pin_format() {
        assert!(is_valid_pin("1234"));
        assert!(is_valid_pin("12345678"));
        assert!(!is_valid_pin("123"));
        assert!(!is_valid_pin("123456789"));
        assert!(!is_valid_pin("12a4"));
    }

    #[test]
    fn email_is_normalized_and_checked() {
        let email = normalize_email("  Farmer@Example.COM ");
        assert_eq!(email, "farmer@example.com");
        assert!(is_valid_email(&email));
        assert!(!is_valid_email("farmer@example"));
    }

    #[test]
    fn challenge_codes_are_short_and_uppercase() {
        let code = challenge_code();
        assert_eq!(code.len(), CHALLENGE_CODE_LEN);
        assert!(code.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }
}
