//! Encrypted cloud-init variables.
//!
//! `cloud_init_variables_from` points at a YAML map whose values may carry
//! an `enc:v1:<nonce>:<ciphertext>` envelope (AES-256-GCM, both parts
//! base64). Encrypted values are decrypted with the key from
//! `SCALEGATE_SECRETS_KEY`; plaintext values pass through untouched.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::error::ConfigError;

/// Environment variable holding the base64-encoded 256-bit key.
pub const KEY_ENV: &str = "SCALEGATE_SECRETS_KEY";

const ENCRYPTED_PREFIX: &str = "enc:v1:";
const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;

/// Load a variables file, decrypting any enveloped values.
pub fn load_variables_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::VariablesFile {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: HashMap<String, String> = serde_yaml::from_str(&content)?;

    // Only reach for the key when the file actually holds encrypted values.
    let key = if raw.values().any(|v| v.starts_with(ENCRYPTED_PREFIX)) {
        Some(load_key()?)
    } else {
        None
    };

    let mut variables = HashMap::with_capacity(raw.len());
    for (name, value) in raw {
        if !value.starts_with(ENCRYPTED_PREFIX) {
            variables.insert(name, value);
            continue;
        }
        let key = key.as_ref().expect("key loaded when any value is encrypted");
        let plaintext = decrypt(key, &value).map_err(|reason| ConfigError::Decrypt {
            name: name.clone(),
            reason,
        })?;
        debug!(variable = %name, "Decrypted cloud-init variable");
        variables.insert(name, plaintext);
    }
    Ok(variables)
}

fn load_key() -> Result<[u8; KEY_LENGTH], ConfigError> {
    let encoded = std::env::var(KEY_ENV).map_err(|_| ConfigError::MissingKey(KEY_ENV))?;
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| ConfigError::Decrypt {
            name: KEY_ENV.to_string(),
            reason: format!("invalid base64 key: {e}"),
        })?;
    bytes.try_into().map_err(|_| ConfigError::Decrypt {
        name: KEY_ENV.to_string(),
        reason: format!("key must be {KEY_LENGTH} bytes"),
    })
}

fn decrypt(key: &[u8; KEY_LENGTH], enveloped: &str) -> Result<String, String> {
    let data = enveloped
        .strip_prefix(ENCRYPTED_PREFIX)
        .expect("caller checked prefix");
    let (nonce_b64, cipher_b64) = data
        .split_once(':')
        .ok_or_else(|| "invalid envelope format".to_string())?;

    let nonce_bytes = BASE64
        .decode(nonce_b64)
        .map_err(|e| format!("invalid nonce: {e}"))?;
    if nonce_bytes.len() != NONCE_LENGTH {
        return Err(format!("nonce must be {NONCE_LENGTH} bytes"));
    }
    let ciphertext = BASE64
        .decode(cipher_b64)
        .map_err(|e| format!("invalid ciphertext: {e}"))?;

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| e.to_string())?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| "decryption failed (wrong key or corrupted value)".to_string())?;

    String::from_utf8(plaintext).map_err(|e| format!("decrypted value is not utf-8: {e}"))
}

/// Produce an `enc:v1:` envelope for `plaintext`. Used by tests and by
/// operators preparing a variables file.
pub fn encrypt(key: &[u8; KEY_LENGTH], nonce: &[u8; NONCE_LENGTH], plaintext: &str) -> String {
    let cipher = Aes256Gcm::new_from_slice(key).expect("key length is fixed");
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), plaintext.as_bytes())
        .expect("aes-gcm encryption is infallible for valid inputs");
    format!(
        "{}{}:{}",
        ENCRYPTED_PREFIX,
        BASE64.encode(nonce),
        BASE64.encode(ciphertext)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TEST_KEY: [u8; KEY_LENGTH] = [7u8; KEY_LENGTH];
    const TEST_NONCE: [u8; NONCE_LENGTH] = [9u8; NONCE_LENGTH];

    fn write_variables_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_decrypt_roundtrip() {
        let enveloped = encrypt(&TEST_KEY, &TEST_NONCE, "hunter2");
        assert!(enveloped.starts_with(ENCRYPTED_PREFIX));
        assert_eq!(decrypt(&TEST_KEY, &enveloped).unwrap(), "hunter2");
    }

    #[test]
    fn test_decrypt_rejects_wrong_key() {
        let enveloped = encrypt(&TEST_KEY, &TEST_NONCE, "hunter2");
        let wrong = [8u8; KEY_LENGTH];
        assert!(decrypt(&wrong, &enveloped).is_err());
    }

    #[test]
    fn test_plaintext_values_pass_through() {
        let file = write_variables_file("TOKEN: plain-value\nOTHER: also-plain\n");
        let vars = load_variables_file(file.path()).unwrap();
        assert_eq!(vars["TOKEN"], "plain-value");
        assert_eq!(vars["OTHER"], "also-plain");
    }

    #[test]
    fn test_encrypted_value_requires_key() {
        std::env::remove_var(KEY_ENV);
        let enveloped = encrypt(&TEST_KEY, &TEST_NONCE, "secret");
        let file = write_variables_file(&format!("TOKEN: \"{enveloped}\"\n"));
        let err = load_variables_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(_)));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = load_variables_file(Path::new("/nonexistent/vars.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::VariablesFile { .. }));
    }
}
