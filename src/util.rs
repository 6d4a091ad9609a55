use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};

const ALIGNMENT: usize = 4;

/// Number of zero bytes needed to pad `len` out to a 4-byte boundary.
/// The padding never counts toward a chunk or parameter length field.
pub(crate) fn padding_needed(len: usize) -> usize {
    (ALIGNMENT - (len % ALIGNMENT)) % ALIGNMENT
}

pub(crate) const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

static ZEROED_CHECKSUM_FIELD: Bytes = Bytes::from_static(&[0, 0, 0, 0]);

/// Checksums a serialized packet with the checksum field treated as zero,
/// without copying the buffer.
pub(crate) fn packet_checksum(raw: &Bytes) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    digest.update(&raw[..8]);
    digest.update(&ZEROED_CHECKSUM_FIELD[..]);
    digest.update(&raw[12..]);
    digest.finalize()
}

// Serial number arithmetic per RFC 1982. TSNs and reconfiguration request
// sequence numbers wrap at 2^32, SSNs at 2^16; plain integer comparison
// is wrong near the wrap point.

#[inline]
pub(crate) fn sna32lt(i1: u32, i2: u32) -> bool {
    (i1 < i2 && i2 - i1 < 1 << 31) || (i1 > i2 && i1 - i2 > 1 << 31)
}

#[inline]
pub(crate) fn sna32lte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32lt(i1, i2)
}

#[inline]
pub(crate) fn sna32gt(i1: u32, i2: u32) -> bool {
    (i1 < i2 && (i2 - i1) >= 1 << 31) || (i1 > i2 && (i1 - i2) <= 1 << 31)
}

#[inline]
pub(crate) fn sna32gte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32gt(i1, i2)
}

#[inline]
pub(crate) fn sna16lt(i1: u16, i2: u16) -> bool {
    (i1 < i2 && (i2 - i1) < 1 << 15) || (i1 > i2 && (i1 - i2) > 1 << 15)
}

#[inline]
pub(crate) fn sna16lte(i1: u16, i2: u16) -> bool {
    i1 == i2 || sna16lt(i1, i2)
}

#[inline]
pub(crate) fn sna16gt(i1: u16, i2: u16) -> bool {
    (i1 < i2 && (i2 - i1) >= 1 << 15) || (i1 > i2 && (i1 - i2) <= 1 << 15)
}

#[inline]
pub(crate) fn sna16gte(i1: u16, i2: u16) -> bool {
    i1 == i2 || sna16gt(i1, i2)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_padding_needed() {
        let tests = vec![(0, 0), (1, 3), (2, 2), (3, 1), (4, 0), (5, 3), (8, 0)];
        for (len, expected) in tests {
            assert_eq!(padding_needed(len), expected, "padding for length {len}");
        }
    }

    #[test]
    fn test_serial_number_arithmetic_32bit() {
        // straddle the wrap point in both directions
        assert!(sna32lt(0xffff_fffe, 1));
        assert!(sna32gt(1, 0xffff_fffe));
        assert!(!sna32lt(1, 0xffff_fffe));
        assert!(sna32lt(5, 10));
        assert!(sna32gt(10, 5));
        assert!(sna32lte(7, 7));
        assert!(sna32gte(7, 7));
        // a distance of exactly 2^31 counts as "greater" under RFC 1982
        assert!(sna32gt(0, 1 << 31));
        assert!(!sna32lt(0, 1 << 31));
    }

    #[test]
    fn test_serial_number_arithmetic_16bit() {
        assert!(sna16lt(0xfffe, 1));
        assert!(sna16gt(1, 0xfffe));
        assert!(sna16lt(5, 10));
        assert!(sna16gt(10, 5));
        assert!(sna16lte(7, 7));
        assert!(sna16gte(7, 7));
        assert!(sna16gt(0, 1 << 15));
    }
}
