use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, KeyIvInit, StreamCipher};
use base64::{Engine, prelude::BASE64_STANDARD};

use crate::error::TidalError;

type KeyUnwrap = cbc::Decryptor<aes::Aes256>;
type TrackCipher = ctr::Ctr64BE<aes::Aes128>;

/// Well-known master key the provider wraps per-track content keys with.
const MASTER_KEY: &str = "UIlTTEMmmLfGowo/UC60x2H45W6MdGgTRfo/umg4754=";

/// Decrypts a concatenated audio payload in place.
///
/// `key_id` is the manifest's wrapped key: 16 IV bytes followed by an
/// AES-256-CBC block holding the 16-byte content key and 8-byte nonce.
/// The payload itself is AES-128-CTR with a 64-bit big-endian counter.
pub fn decrypt_track(key_id: &str, data: &mut [u8]) -> Result<(), TidalError> {
    let master = BASE64_STANDARD.decode(MASTER_KEY)?;
    let token = BASE64_STANDARD.decode(key_id)?;
    if token.len() < 48 || (token.len() - 16) % 16 != 0 {
        return Err(TidalError::Decrypt(format!(
            "wrapped key has unexpected length {}",
            token.len()
        )));
    }

    let (iv, wrapped) = token.split_at(16);
    let mut wrapped = wrapped.to_vec();
    let unwrapped = KeyUnwrap::new_from_slices(&master, iv)
        .map_err(|err| TidalError::Decrypt(err.to_string()))?
        .decrypt_padded_mut::<NoPadding>(&mut wrapped)
        .map_err(|err| TidalError::Decrypt(err.to_string()))?;

    let key = &unwrapped[..16];
    let nonce = &unwrapped[16..24];
    let mut counter = [0u8; 16];
    counter[..8].copy_from_slice(nonce);

    let mut cipher = TrackCipher::new_from_slices(key, &counter)
        .map_err(|err| TidalError::Decrypt(err.to_string()))?;
    cipher.apply_keystream(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use aes::cipher::BlockEncryptMut;

    use super::*;

    type KeyWrap = cbc::Encryptor<aes::Aes256>;

    #[test]
    fn roundtrip_against_wrapped_key() {
        let content_key = [7u8; 16];
        let nonce = [3u8; 8];

        let plaintext = b"a little audio payload, longer than one block";
        let mut payload = plaintext.to_vec();
        let mut counter = [0u8; 16];
        counter[..8].copy_from_slice(&nonce);
        TrackCipher::new_from_slices(&content_key, &counter)
            .unwrap()
            .apply_keystream(&mut payload);
        assert_ne!(payload.as_slice(), plaintext.as_slice());

        // wrap key + nonce the way the provider does
        let master = BASE64_STANDARD.decode(MASTER_KEY).unwrap();
        let iv = [9u8; 16];
        let mut secret = [0u8; 32];
        secret[..16].copy_from_slice(&content_key);
        secret[16..24].copy_from_slice(&nonce);
        let mut block = secret;
        let wrapped = KeyWrap::new_from_slices(&master, &iv)
            .unwrap()
            .encrypt_padded_mut::<NoPadding>(&mut block, secret.len())
            .unwrap()
            .to_vec();

        let mut token = iv.to_vec();
        token.extend_from_slice(&wrapped);
        let key_id = BASE64_STANDARD.encode(&token);

        decrypt_track(&key_id, &mut payload).unwrap();
        assert_eq!(payload.as_slice(), plaintext.as_slice());
    }

    #[test]
    fn truncated_key_is_refused() {
        let key_id = BASE64_STANDARD.encode([0u8; 20]);
        assert!(decrypt_track(&key_id, &mut []).is_err());
    }
}
