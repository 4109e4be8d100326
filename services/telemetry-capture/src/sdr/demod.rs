//! IQ sample conversion
//!
//! RTL-SDR outputs 8-bit unsigned IQ samples (I, Q pairs) centered on 127.5.

use rustfft::num_complex::Complex32;

/// Pre-computed byte → normalized float table, range [-1.0, 1.0]
pub struct IqTable {
    table: [f32; 256],
}

impl IqTable {
    pub fn new() -> Self {
        let mut table = [0.0f32; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = (i as f32 - 127.5) / 127.5;
        }
        Self { table }
    }

    #[inline(always)]
    pub fn sample(&self, i: u8, q: u8) -> Complex32 {
        Complex32::new(self.table[i as usize], self.table[q as usize])
    }

    /// Convert interleaved IQ bytes; output length is `min(pairs, out.len())`
    pub fn convert(&self, iq_data: &[u8], out: &mut [Complex32]) -> usize {
        let pairs = (iq_data.len() / 2).min(out.len());
        for (slot, pair) in out.iter_mut().zip(iq_data.chunks_exact(2)).take(pairs) {
            *slot = self.sample(pair[0], pair[1]);
        }
        pairs
    }
}

impl Default for IqTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iq_table_range() {
        let table = IqTable::new();

        assert_eq!(table.sample(0, 255), Complex32::new(-1.0, 1.0));

        // 127/128 straddle zero
        let near_zero = table.sample(127, 128);
        assert!(near_zero.re < 0.0 && near_zero.re > -0.01);
        assert!(near_zero.im > 0.0 && near_zero.im < 0.01);
    }

    #[test]
    fn test_convert_stops_at_shorter_side() {
        let table = IqTable::new();
        let mut out = [Complex32::new(9.0, 9.0); 2];
        assert_eq!(table.convert(&[255, 0, 0, 255, 127, 127], &mut out), 2);
        assert_eq!(out[0], Complex32::new(1.0, -1.0));
        assert_eq!(out[1], Complex32::new(-1.0, 1.0));
    }
}
