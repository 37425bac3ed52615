//! Window cipher
//!
//! Each window is encrypted on its own with AES-128 in CBC mode, restarting
//! from the same fixed IV. Windows can therefore be rewritten independently
//! and need no header on the medium.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit};
use aes::Aes128;

use nvstack_core::{Error, Result};

use crate::key::AesKey;

type CbcEncryptor = cbc::Encryptor<Aes128>;
type CbcDecryptor = cbc::Decryptor<Aes128>;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// IV every window starts from
pub const WINDOW_IV: [u8; BLOCK_SIZE] = *b"mysecretpassword";

/// Default window size
pub const DEFAULT_WINDOW: usize = 64;

/// Whether `window` is a usable window size
pub fn is_valid_window(window: usize) -> bool {
    window != 0 && window % BLOCK_SIZE == 0
}

/// AES-128-CBC over whole windows
pub struct WindowCipher {
    aes: Aes128,
}

impl WindowCipher {
    /// Expand `key`
    pub fn new(key: &AesKey) -> Self {
        Self {
            aes: Aes128::new(GenericArray::from_slice(key.as_bytes())),
        }
    }

    fn check(buf: &[u8]) -> Result<()> {
        if buf.len() % BLOCK_SIZE != 0 {
            return Err(Error::InvalidAlignment);
        }
        Ok(())
    }

    /// Encrypt a window in place
    pub fn encrypt_window(&self, buf: &mut [u8]) -> Result<()> {
        Self::check(buf)?;
        let len = buf.len();
        CbcEncryptor::inner_iv_init(self.aes.clone(), GenericArray::from_slice(&WINDOW_IV))
            .encrypt_padded_mut::<NoPadding>(buf, len)
            .map_err(|_| Error::InvalidAlignment)?;
        Ok(())
    }

    /// Decrypt a window in place
    pub fn decrypt_window(&self, buf: &mut [u8]) -> Result<()> {
        Self::check(buf)?;
        CbcDecryptor::inner_iv_init(self.aes.clone(), GenericArray::from_slice(&WINDOW_IV))
            .decrypt_padded_mut::<NoPadding>(buf)
            .map_err(|_| Error::InvalidAlignment)?;
        Ok(())
    }
}
