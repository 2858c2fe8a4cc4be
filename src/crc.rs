/* CRC for the safety-sensor auxiliary block: CRC-CCITT reflected,
polynomial 0x8408, initial value 0, no final xor. */

use std::sync::OnceLock;

const POLYNOMIAL: u16 = 0x8408;

static CRC_TABLE: OnceLock<[u16; 256]> = OnceLock::new();

fn table() -> &'static [u16; 256] {
    CRC_TABLE.get_or_init(|| {
        let mut table = [0u16; 256];
        for (u, entry) in table.iter_mut().enumerate() {
            let mut result = u as u16;
            for _ in 0..8 {
                result = if result & 1 != 0 {
                    (result >> 1) ^ POLYNOMIAL
                } else {
                    result >> 1
                };
            }
            *entry = result;
        }
        table
    })
}

pub(crate) fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, byte| {
        (crc >> 8) ^ table()[((crc ^ *byte as u16) & 0xff) as usize]
    })
}
