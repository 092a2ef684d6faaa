//! Raw waveform byte to volt conversion.

use crate::models::DataFormat;

/// Screen codes per vertical division.
const CODES_PER_DIV: f32 = 25.6;

/// Screen code of the top of the display in legacy data.
const LEGACY_CENTER: i32 = 128;

/// Vertical settings used to scale one channel's samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerticalScale {
    /// Volts per division.
    pub vdiv: f32,
    /// Vertical offset in volts.
    pub offset: f32,
    /// Code that corresponds to the screen center (IEEE-488.2 data only).
    pub reference: i32,
}

impl VerticalScale {
    /// Volts per code.
    pub fn increment(&self) -> f32 {
        self.vdiv / CODES_PER_DIV
    }

    /// Convert one raw byte.
    pub fn convert(&self, format: DataFormat, byte: u8) -> f32 {
        let code = match format {
            DataFormat::Legacy => LEGACY_CENTER - i32::from(byte),
            DataFormat::Ieee4882 => i32::from(byte) - self.reference,
        };
        code as f32 * self.increment() - self.offset
    }

    /// Convert a run of raw bytes.
    pub fn convert_all(&self, format: DataFormat, bytes: &[u8]) -> Vec<f32> {
        bytes.iter().map(|&b| self.convert(format, b)).collect()
    }

    /// Significant decimal digits for samples at this resolution.
    pub fn digits(&self) -> i32 {
        let log = self.increment().log10();
        -(log as i32) + i32::from(log < 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scale(vdiv: f32, offset: f32, reference: i32) -> VerticalScale {
        VerticalScale {
            vdiv,
            offset,
            reference,
        }
    }

    #[test]
    fn legacy_center_is_zero_volts() {
        assert_eq!(scale(1.0, 0.0, 0).convert(DataFormat::Legacy, 128), 0.0);
    }

    #[test]
    fn ieee_reference_is_zero_volts() {
        assert_eq!(scale(1.0, 0.0, 128).convert(DataFormat::Ieee4882, 128), 0.0);
    }

    #[test]
    fn legacy_is_inverted() {
        let s = scale(2.56, 0.0, 0);
        assert!((s.convert(DataFormat::Legacy, 118) - 1.0).abs() < 1e-6);
        assert!((s.convert(DataFormat::Legacy, 138) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn ieee_counts_up_from_reference() {
        let s = scale(2.56, 0.0, 127);
        assert!((s.convert(DataFormat::Ieee4882, 137) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn offset_is_subtracted() {
        let s = scale(1.0, 0.5, 128);
        assert!((s.convert(DataFormat::Ieee4882, 128) + 0.5).abs() < 1e-6);
        assert!((s.convert(DataFormat::Legacy, 128) + 0.5).abs() < 1e-6);
    }

    #[test]
    fn convert_all_preserves_length() {
        let samples = scale(1.0, 0.0, 128).convert_all(DataFormat::Ieee4882, &[0, 128, 255]);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[1], 0.0);
        assert!(samples[0] < 0.0 && samples[2] > 0.0);
    }

    #[test]
    fn digits_follow_resolution() {
        // 1 V/div -> 39 mV per code
        assert_eq!(scale(1.0, 0.0, 0).digits(), 2);
        // 10 mV/div -> 0.39 mV per code
        assert_eq!(scale(0.01, 0.0, 0).digits(), 4);
        // 100 V/div -> 3.9 V per code
        assert_eq!(scale(100.0, 0.0, 0).digits(), 0);
    }
}
