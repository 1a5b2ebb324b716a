//! CRC-16/13239 used by the OTP slot protocol
//!
//! Reflected polynomial 0x8408, initial value 0xFFFF. Checksummed data with
//! its trailing CRC appended always sums to the residual 0xF0B8.

/// Residual of `calculate` over data plus its correct trailing checksum
pub const CRC_OK_RESIDUAL: u16 = 0xF0B8;

/// Calculate the CRC-16/13239 checksum over `data`
pub fn calculate(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            let carry = crc & 1 != 0;
            crc >>= 1;
            if carry {
                crc ^= 0x8408;
            }
        }
    }
    crc
}

/// Verify data with its trailing checksum included
pub fn check(data: &[u8]) -> bool {
    calculate(data) == CRC_OK_RESIDUAL
}
