use crate::Error;
use std::fmt::Debug;

/// Source of the 32-bit masking key placed on every client-to-server frame.
pub trait MaskingKeyGenerator: Debug + Send + Sync {
    fn next_key(&self) -> Result<u32, Error>;
}

/// Draws a fresh key from the operating system for every frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomMaskingKey;

impl MaskingKeyGenerator for RandomMaskingKey {
    fn next_key(&self) -> Result<u32, Error> {
        let mut mask_bytes = [0u8; 4];
        getrandom::getrandom(&mut mask_bytes)?;
        Ok(u32::from_le_bytes(mask_bytes))
    }
}

/// Always hands out the same key. Only useful for tests and wire captures.
#[derive(Debug, Clone, Copy)]
pub struct FixedMaskingKey(pub u32);

impl MaskingKeyGenerator for FixedMaskingKey {
    fn next_key(&self) -> Result<u32, Error> {
        Ok(self.0)
    }
}

pub fn mask_payload(payload: &mut [u8], mask_key: u32) {
    let mask_bytes = mask_key.to_be_bytes();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_bytes[i % 4];
    }
}
