//! Encryption driver
//!
//! Presents plaintext to the layer above while the layer below only ever
//! holds ciphertext. Every access is widened to whole windows: reads decrypt
//! the covering windows and copy out, writes decrypt, splice the new bytes in
//! and re-encrypt before writing the windows back.

use std::sync::{Mutex, MutexGuard, PoisonError};

use nvstack_core::{DriverChain, Error, MemDriver, Partition, Result};
use rand::RngCore;

use crate::cipher::{is_valid_window, WindowCipher};
use crate::key::{AesKey, KeyStore};

struct State {
    window: Vec<u8>,
    rng: Box<dyn RngCore + Send>,
}

/// AES window encryption layer
pub struct EncryptionDriver {
    keys: Box<dyn KeyStore>,
    window_size: usize,
    state: Mutex<State>,
}

/// Portion of a request that falls in one window
struct Piece {
    base: u32,
    offset: usize,
    len: usize,
    pos: usize,
}

fn pieces(offset: u32, len: usize, window: usize) -> impl Iterator<Item = Piece> {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos >= len {
            return None;
        }
        let cur = offset as usize + pos;
        let in_window = cur % window;
        let take = (window - in_window).min(len - pos);
        let piece = Piece {
            base: (cur - in_window) as u32,
            offset: in_window,
            len: take,
            pos,
        };
        pos += take;
        Some(piece)
    })
}

impl EncryptionDriver {
    /// Create an encryption layer
    ///
    /// `window` must be a non-zero multiple of the AES block size. `rng`
    /// supplies key material when a write finds no key provisioned.
    pub fn new(
        keys: impl KeyStore + 'static,
        window: usize,
        rng: impl RngCore + Send + 'static,
    ) -> Result<Self> {
        if !is_valid_window(window) {
            return Err(Error::InvalidParameter);
        }
        Ok(Self {
            keys: Box::new(keys),
            window_size: window,
            state: Mutex::new(State {
                window: vec![0; window],
                rng: Box::new(rng),
            }),
        })
    }

    /// Window size in bytes
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Key for a write, generating and persisting one if none is stored
    fn write_key(&self, state: &mut State) -> Result<AesKey> {
        if let Some(key) = self.keys.load()? {
            return Ok(key);
        }
        let key = AesKey::generate(state.rng.as_mut());
        self.keys.write_record(key.as_bytes()).inspect_err(|e| {
            log::error!("Persisting generated key failed: {}", e);
        })?;
        log::info!("Generated and stored a new encryption key");
        Ok(key)
    }

    /// Read-modify-write every window covering `len` bytes at `offset`
    ///
    /// `fill` receives the plaintext bytes of each window that fall in the
    /// range, and where they start within the request.
    #[allow(clippy::too_many_arguments)]
    fn splice_windows(
        &self,
        state: &mut State,
        cipher: &WindowCipher,
        part: &Partition,
        offset: u32,
        len: usize,
        next: DriverChain<'_>,
        mut fill: impl FnMut(&mut [u8], usize),
    ) -> Result<()> {
        let buf = state.window.as_mut_slice();
        for piece in pieces(offset, len, self.window_size) {
            next.read(part, buf, piece.base)?;
            cipher.decrypt_window(buf)?;
            fill(&mut buf[piece.offset..piece.offset + piece.len], piece.pos);
            cipher.encrypt_window(buf)?;
            next.write(part, buf, piece.base)?;
        }
        Ok(())
    }
}

impl MemDriver for EncryptionDriver {
    fn name(&self) -> &'static str {
        "encrypt"
    }

    fn read(&self, part: &Partition, dst: &mut [u8], offset: u32, next: DriverChain<'_>) -> Result<()> {
        let mut state = self.lock();
        let key = self.keys.load()?.ok_or_else(|| {
            log::warn!("Partition '{}': no encryption key, cannot decrypt", part.name);
            Error::KeyUnavailable
        })?;
        let cipher = WindowCipher::new(&key);

        let buf = state.window.as_mut_slice();
        for piece in pieces(offset, dst.len(), self.window_size) {
            next.read(part, buf, piece.base)?;
            cipher.decrypt_window(buf)?;
            dst[piece.pos..piece.pos + piece.len]
                .copy_from_slice(&buf[piece.offset..piece.offset + piece.len]);
        }
        Ok(())
    }

    fn write(&self, part: &Partition, src: &[u8], offset: u32, next: DriverChain<'_>) -> Result<()> {
        let mut state = self.lock();
        let key = self.write_key(&mut state)?;
        let cipher = WindowCipher::new(&key);
        self.splice_windows(&mut state, &cipher, part, offset, src.len(), next, |dst, pos| {
            dst.copy_from_slice(&src[pos..pos + dst.len()]);
        })
    }

    /// Write zero plaintext over the range
    fn erase(&self, part: &Partition, offset: u32, len: u32, next: DriverChain<'_>) -> Result<()> {
        let mut state = self.lock();
        let key = self.write_key(&mut state)?;
        let cipher = WindowCipher::new(&key);
        self.splice_windows(&mut state, &cipher, part, offset, len as usize, next, |dst, _| {
            dst.fill(0);
        })
    }

    /// Nothing is buffered here
    fn restore(&self, _part: &Partition, _offset: u32, _len: u32, _next: DriverChain<'_>) -> Result<()> {
        Ok(())
    }
}
