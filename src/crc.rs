//! CRC-16/MODBUS.
//!
//! Reflected polynomial 0xA001 (0x8005 normal form), initial value 0xFFFF,
//! no final XOR. Bits are processed LSB first, one byte at a time.

/// Initial register value.
pub const CRC_INIT: u16 = 0xffff;

/// Reflected generator polynomial.
pub const CRC_POLY: u16 = 0xa001;

/// Feeds one byte into the running checksum.
pub fn crc16_update(crc: u16, data: u8) -> u16 {
    let mut crc = crc ^ (data as u16);
    for _ in 0..8 {
        if crc & 0x0001 != 0 {
            crc = (crc >> 1) ^ CRC_POLY;
        } else {
            crc >>= 1;
        }
    }
    crc
}

/// Computes the checksum of a whole slice, starting from [`CRC_INIT`].
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(CRC_INIT, |crc, &b| crc16_update(crc, b))
}
