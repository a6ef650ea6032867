//! Frame checksum primitives shared by the protocol codecs.

/// Additive checksum: sum of all bytes, truncated to 8 bits.
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Additive checksum over 16 bits, used for write-verify readback.
pub fn sum16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

/// Two's-complement sum: `(256 - sum(data) mod 256) mod 256`.
///
/// A frame is intact when the sum of payload plus checksum is 0 mod 256.
pub fn complement(data: &[u8]) -> u8 {
    sum8(data).wrapping_neg()
}

/// XOR of all bytes.
pub fn xor8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// CRC-8 with polynomial 0x07, zero init.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum8() {
        assert_eq!(sum8(&[]), 0);
        assert_eq!(sum8(&[0x01, 0x02, 0x03]), 0x06);
        assert_eq!(sum8(&[0xFF, 0x01]), 0x00); // wraps
    }

    #[test]
    fn test_sum16_no_byte_wrap() {
        assert_eq!(sum16(&[0xFF, 0xFF, 0x02]), 0x0200);
    }

    #[test]
    fn test_complement_cancels_sum() {
        let data = [0x23, 0x00, 0x10, 0x00, 0x00, 0x10];
        let chk = complement(&data);
        assert_eq!(sum8(&data).wrapping_add(chk), 0);
    }

    #[test]
    fn test_complement_of_empty() {
        assert_eq!(complement(&[]), 0);
    }

    #[test]
    fn test_xor8() {
        assert_eq!(xor8(&[0xAA, 0x55]), 0xFF);
        assert_eq!(xor8(&[0x12, 0x12]), 0x00);
    }

    #[test]
    fn test_crc8_known_vector() {
        // CRC-8/ATM of "123456789" is 0xF4
        assert_eq!(crc8(b"123456789"), 0xF4);
        assert_eq!(crc8(&[]), 0x00);
    }
}
