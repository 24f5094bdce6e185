// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVMe/TCP header and data digests.

const CRC32C: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Computes the CRC32C (Castagnoli) digest of `data`, as used for both the
/// header and data digests. The digest is sent little endian.
pub fn compute_digest(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::compute_digest;

    #[test]
    fn check_value() {
        assert_eq!(compute_digest(b"123456789"), 0xe3069283);
    }

    #[test]
    fn empty() {
        assert_eq!(compute_digest(&[]), 0);
    }

    // RFC 3720, appendix B.4.
    #[test]
    fn iscsi_vectors() {
        assert_eq!(compute_digest(&[0; 32]), 0x8a9136aa);
        assert_eq!(compute_digest(&[0xff; 32]), 0x62a8ab43);
        let ascending: Vec<u8> = (0..32).collect();
        assert_eq!(compute_digest(&ascending), 0x46dd794e);
        let descending: Vec<u8> = (0..32).rev().collect();
        assert_eq!(compute_digest(&descending), 0x113fdb5c);
    }

    #[test]
    fn deterministic() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 7) as u8).collect();
        assert_eq!(compute_digest(&data), compute_digest(&data));
        let mut other = data.clone();
        other[100] ^= 1;
        assert_ne!(compute_digest(&data), compute_digest(&other));
    }
}
