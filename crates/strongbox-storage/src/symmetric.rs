use std::fmt;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use strongbox_core::StoreError;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// 256-bit data key length in bytes.
pub const DATA_KEY_LEN: usize = 32;
/// AES block-sized IV.
pub const IV_LEN: usize = 16;
/// Length of `base64(IV)`; the stored IV prefix is always exactly this long.
pub const ENCODED_IV_LEN: usize = 24;

const BLOCK_LEN: usize = 16;

/// The symmetric key protecting ordinary values. Lives only in memory.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; DATA_KEY_LEN]);

impl DataKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; DATA_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() != DATA_KEY_LEN {
            return Err(StoreError::crypto(format!(
                "expected {DATA_KEY_LEN}-byte data key, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; DATA_KEY_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(..)")
    }
}

/// Ciphertext plus the IV it was produced with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
}

impl Sealed {
    /// `base64(IV) ‖ base64(ciphertext)` with no separator.
    pub fn encode(&self) -> String {
        let mut out = STANDARD.encode(self.iv);
        out.push_str(&STANDARD.encode(&self.ciphertext));
        out
    }

    /// Split a stored value on the fixed-length IV prefix.
    pub fn decode(stored: &str) -> Result<Self, StoreError> {
        if stored.len() <= ENCODED_IV_LEN || !stored.is_char_boundary(ENCODED_IV_LEN) {
            return Err(StoreError::crypto(format!(
                "stored value too short for a {ENCODED_IV_LEN}-character IV prefix"
            )));
        }
        let (iv_part, ciphertext_part) = stored.split_at(ENCODED_IV_LEN);

        let iv_bytes = STANDARD
            .decode(iv_part)
            .map_err(|e| StoreError::crypto(format!("iv decode failed: {e}")))?;
        let iv: [u8; IV_LEN] = iv_bytes.as_slice().try_into().map_err(|_| {
            StoreError::crypto(format!(
                "expected {IV_LEN}-byte iv, got {}",
                iv_bytes.len()
            ))
        })?;
        let ciphertext = STANDARD
            .decode(ciphertext_part)
            .map_err(|e| StoreError::crypto(format!("ciphertext decode failed: {e}")))?;

        Ok(Self { ciphertext, iv })
    }
}

/// Stateless AES-256-CBC with PKCS#7 padding and a fresh random IV per call.
pub struct SymmetricCipher;

impl SymmetricCipher {
    pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Sealed, StoreError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
            .map_err(|e| StoreError::crypto(format!("cipher init failed: {e}")))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        Ok(Sealed { ciphertext, iv })
    }

    pub fn decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, StoreError> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(StoreError::crypto(format!(
                "ciphertext length {} is not a positive multiple of {BLOCK_LEN}",
                ciphertext.len()
            )));
        }
        let cipher = Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| StoreError::crypto(format!("cipher init failed: {e}")))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| StoreError::crypto(format!("decrypt failed: {e}")))
    }

    /// Encrypt a setting value into its stored form.
    pub fn seal_str(value: &str, key: &DataKey) -> Result<String, StoreError> {
        Ok(Self::encrypt(value.as_bytes(), key.as_bytes())?.encode())
    }

    /// Decrypt a stored value back into the setting value.
    pub fn open_str(stored: &str, key: &DataKey) -> Result<String, StoreError> {
        let sealed = Sealed::decode(stored)?;
        let plaintext = Self::decrypt(&sealed.ciphertext, key.as_bytes(), &sealed.iv)?;
        String::from_utf8(plaintext)
            .map_err(|e| StoreError::crypto(format!("plaintext is not utf-8: {e}")))
    }
}
