// crc.rs — 32-bit CRC (polynomial 0x04C11DB7, reflected)
// Delegates to the `crc` crate (CRC-32/ISO-HDLC, the zlib/ethernet CRC).

use crc::{Crc, CRC_32_ISO_HDLC};

static CRC_CALC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Compute the CRC for an entire block of data.
#[inline]
pub fn crc32_block(data: &[u8]) -> u32 {
    CRC_CALC.checksum(data)
}

/// Streaming CRC-32 for data that arrives in chunks (level files are fed
/// through this while being read off disk).
pub struct Crc32Digest {
    digest: crc::Digest<'static, u32>,
}

impl Crc32Digest {
    pub fn new() -> Self {
        Self {
            digest: CRC_CALC.digest(),
        }
    }

    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    #[inline]
    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for Crc32Digest {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared-secret hash used on the peer wire: the ones complement of the
/// CRC-32 of the configured password bytes.
#[inline]
pub fn peer_password_hash(password: &str) -> u32 {
    !crc32_block(password.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_check_value() {
        // The standard check value for CRC-32/ISO-HDLC over "123456789".
        assert_eq!(crc32_block(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_streaming_matches_block() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut digest = Crc32Digest::new();
        for chunk in data.chunks(7) {
            digest.update(chunk);
        }
        assert_eq!(digest.finalize(), crc32_block(data));
    }

    #[test]
    fn test_peer_hash_is_complemented() {
        let pw = "sharedsecret";
        assert_eq!(peer_password_hash(pw), !crc32_block(pw.as_bytes()));
    }
}
