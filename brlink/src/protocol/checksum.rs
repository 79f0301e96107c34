//! 16-bit packet checksums.

use crc_all::Crc;
use serde::{Deserialize, Serialize};

/// Checksum algorithm trailing an escaped packet body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Checksum {
    /// CRC-16/CCITT-FALSE: poly 0x1021, init 0xffff, no reflection.
    Crc16Ccitt,
    /// CRC-16/MODBUS: poly 0x8005, init 0xffff, reflected.
    Crc16Modbus,
    /// Wrapping sum of all bytes.
    Additive,
}

impl Checksum {
    pub fn compute(&self, bytes: &[u8]) -> u16 {
        match self {
            Checksum::Crc16Ccitt => crc16(bytes, 0x1021, false),
            Checksum::Crc16Modbus => crc16(bytes, 0x8005, true),
            Checksum::Additive => bytes
                .iter()
                .fold(0u16, |sum, &b| sum.wrapping_add(b as u16)),
        }
    }
}

fn crc16(bytes: &[u8], polynomial: u16, reflect: bool) -> u16 {
    const WIDTH: usize = 16;
    const INITIAL: u16 = 0xffff;
    const XOR: u16 = 0;
    let mut crc = Crc::<u16>::new(polynomial, WIDTH, INITIAL, XOR, reflect);

    crc.update(bytes);
    crc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_additive_wraps() {
        assert_eq!(Checksum::Additive.compute(&[]), 0);
        assert_eq!(Checksum::Additive.compute(&[0x01, 0x02, 0x03]), 6);
        let many = vec![0xffu8; 300];
        assert_eq!(Checksum::Additive.compute(&many), (0xffu32 * 300) as u16);
    }

    #[test_case(Checksum::Crc16Ccitt ; "ccitt")]
    #[test_case(Checksum::Crc16Modbus ; "modbus")]
    fn test_crc_detects_single_bit_flips(checksum: Checksum) {
        let data = b"refreshable braille".to_vec();
        let reference = checksum.compute(&data);
        assert_eq!(checksum.compute(&data), reference, "must be deterministic");

        for i in 0..data.len() {
            for bit in 0..8 {
                let mut corrupted = data.clone();
                corrupted[i] ^= 1 << bit;
                assert_ne!(checksum.compute(&corrupted), reference, "byte {i} bit {bit}");
            }
        }
    }

    #[test]
    fn test_algorithms_differ() {
        let data = b"123456789";
        assert_ne!(
            Checksum::Crc16Ccitt.compute(data),
            Checksum::Crc16Modbus.compute(data)
        );
    }
}
