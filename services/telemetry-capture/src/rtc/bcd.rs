//! Binary-coded decimal helpers for clock registers

/// 0x59 -> 59
pub fn from_bcd(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0F)
}

/// 59 -> 0x59. Only meaningful for 0-99.
pub fn to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}
