//! The UMF-level IPC header (spec §6 "IPC wire format (bit-exact)").
//!
//! Little-endian, fixed field widths regardless of host word size: a
//! 20-byte header (`pid: i32`, `base_size: u64`, `offset: u64`) followed
//! by the provider's opaque blob.

use crate::error::{UmfError, UmfResult};

pub const HEADER_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcHeader {
    pub pid: i32,
    pub base_size: u64,
    pub offset: u64,
}

impl IpcHeader {
    pub fn encode_into(&self, out: &mut [u8]) -> UmfResult<()> {
        if out.len() < HEADER_SIZE {
            return Err(UmfError::invalid_argument("ipc header buffer too small"));
        }
        out[0..4].copy_from_slice(&self.pid.to_le_bytes());
        out[4..12].copy_from_slice(&self.base_size.to_le_bytes());
        out[12..20].copy_from_slice(&self.offset.to_le_bytes());
        Ok(())
    }

    pub fn decode(blob: &[u8]) -> UmfResult<Self> {
        if blob.len() < HEADER_SIZE {
            return Err(UmfError::invalid_argument("ipc blob shorter than the header"));
        }
        let pid = i32::from_le_bytes(blob[0..4].try_into().unwrap());
        let base_size = u64::from_le_bytes(blob[4..12].try_into().unwrap());
        let offset = u64::from_le_bytes(blob[12..20].try_into().unwrap());
        Ok(Self {
            pid,
            base_size,
            offset,
        })
    }
}

/// A stable hash over the opaque (non-header) portion of a handle, used
/// as the consumer's open-handle cache key (spec §4.5 "Fingerprint").
/// Collisions are expected to be handled by the caller comparing the full
/// opaque bytes, not by trusting the fingerprint alone.
pub fn fingerprint(opaque: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    opaque.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = IpcHeader {
            pid: 4242,
            base_size: 1 << 20,
            offset: 128,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode_into(&mut buf).unwrap();
        assert_eq!(IpcHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn header_is_bit_exact_little_endian() {
        let header = IpcHeader {
            pid: 1,
            base_size: 2,
            offset: 3,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode_into(&mut buf).unwrap();
        assert_eq!(&buf[0..4], &1i32.to_le_bytes());
        assert_eq!(&buf[4..12], &2u64.to_le_bytes());
        assert_eq!(&buf[12..20], &3u64.to_le_bytes());
    }

    #[test]
    fn fingerprint_is_stable_and_collision_aware() {
        let a = fingerprint(&[1, 2, 3]);
        let b = fingerprint(&[1, 2, 3]);
        let c = fingerprint(&[1, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
