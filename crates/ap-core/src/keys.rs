use anyhow::{Context, Result};
use nostr_sdk::prelude::{Keys, SecretKey};

/// Decode a 32-byte hex secret into a signing keypair.
pub fn keys_from_hex(secret_hex: &str) -> Result<Keys> {
    let secret = SecretKey::from_hex(secret_hex).context("invalid secret key")?;
    Ok(Keys::new(secret))
}

pub fn public_key_hex(keys: &Keys) -> String {
    keys.public_key().to_hex()
}

pub fn secret_key_hex(keys: &Keys) -> String {
    keys.secret_key().display_secret().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let keys = Keys::generate();
        let hex = secret_key_hex(&keys);
        let restored = keys_from_hex(&hex).expect("restore keys");
        assert_eq!(public_key_hex(&keys), public_key_hex(&restored));
    }

    #[test]
    fn rejects_garbage_secret() {
        assert!(keys_from_hex("not-hex").is_err());
        assert!(keys_from_hex("abcd").is_err());
    }
}
