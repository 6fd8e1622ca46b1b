//! RC4 byte filter over another page file.
//!
//! Every page is XORed with the same RC4 keystream (the generator restarts at
//! each page boundary), so any byte can be decrypted from its page offset
//! alone. This hides contents at rest; it is not authenticated encryption.

use parking_lot::Mutex;

use super::PageFile;
use crate::{
    error::{Error, Result},
    layout::PAGE_SIZE,
};

/// Page file that encrypts everything written to `inner`.
pub struct CipherFile<F> {
    inner: F,
    keystream: Box<[u8]>,
    /// Page-aligned logical length; gaps below it are filled with encrypted zeros.
    length: Mutex<u64>,
}

impl<F: PageFile> CipherFile<F> {
    /// Wraps `inner` with a keystream derived from `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessViolation`] for an empty key and
    /// [`Error::FileAccess`] if the inner length cannot be read.
    pub fn new(inner: F, key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::access("cipher key must not be empty"));
        }
        let length = inner.length()? & !(PAGE_SIZE as u64 - 1);
        Ok(Self { inner, keystream: rc4_keystream(key, PAGE_SIZE), length: Mutex::new(length) })
    }

    fn apply(&self, pos: u64, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= self.keystream[(pos as usize + i) % PAGE_SIZE];
        }
    }
}

fn rc4_keystream(key: &[u8], len: usize) -> Box<[u8]> {
    let mut state: [u8; 256] = std::array::from_fn(|i| i as u8);
    let mut j = 0u8;
    for i in 0..256 {
        j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
        state.swap(i, j as usize);
    }
    let (mut x, mut y) = (0u8, 0u8);
    (0..len)
        .map(|_| {
            x = x.wrapping_add(1);
            y = y.wrapping_add(state[x as usize]);
            state.swap(x as usize, y as usize);
            state[state[x as usize].wrapping_add(state[y as usize]) as usize]
        })
        .collect()
}

impl<F: PageFile> PageFile for CipherFile<F> {
    fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(pos, buf)?;
        self.apply(pos, &mut buf[..n]);
        Ok(n)
    }

    fn write(&self, pos: u64, buf: &[u8]) -> Result<()> {
        let mut length = self.length.lock();
        while *length < pos {
            let n = (pos - *length).min(PAGE_SIZE as u64) as usize;
            let mut zeros = vec![0u8; n];
            self.apply(*length, &mut zeros);
            self.inner.write(*length, &zeros)?;
            *length += n as u64;
        }
        let mut cipher = buf.to_vec();
        self.apply(pos, &mut cipher);
        self.inner.write(pos, &cipher)?;
        *length = (*length).max(pos + buf.len() as u64);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn length(&self) -> Result<u64> {
        self.inner.length()
    }

    fn lock(&self) -> Result<()> {
        self.inner.lock()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
