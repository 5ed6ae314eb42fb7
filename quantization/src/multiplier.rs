//! # Kernel Quant Apache 2.0 License
//! Copyright (c) 2025-present The Kernel Quant Authors.
//! Licensed under the Apache License, Version 2.0 (the "License");
//! you may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!     http://www.apache.org/licenses/LICENSE-2.0
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

//! Real multiplier decomposition and per-channel requantization tables
//!
//! An integer kernel rescales its 32-bit accumulators with a Q31 significand
//! and a binary shift. The decomposition here must agree bit-for-bit with the
//! fixed-point arithmetic in [`multiply_by_quantized_multiplier`].

use tracing::{debug, warn};

use crate::channel::map_channels;
use crate::types::{MultiplierTable, PerChannelScaleTable, QuantizedMultiplier};
use crate::{QuantizationError, Result};

/// `2^31`, the fixed-point one of a Q31 significand
const Q31_ONE: i64 = 1 << 31;

/// Split `x` into a significand in `[0.5, 1)` and a power-of-two exponent
///
/// Zero, infinities and NaN come back unchanged with exponent 0.
pub fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    if biased == 0 {
        // Subnormal: lift into the normal range first.
        let (significand, exponent) = frexp(x * 2f64.powi(54));
        return (significand, exponent - 54);
    }
    let significand = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (significand, biased - 1022)
}

/// Decompose a positive real scale into a Q31 significand and a shift
pub fn quantize_multiplier(scale: f64) -> Result<QuantizedMultiplier> {
    if !(scale.is_finite() && scale > 0.0) {
        return Err(QuantizationError::InvalidScale(format!(
            "multiplier must be positive and finite, got {scale}"
        )));
    }

    let (significand, mut shift) = frexp(scale);
    let mut q = (significand * Q31_ONE as f64).round() as i64;
    if q == Q31_ONE {
        q /= 2;
        shift += 1;
    }
    if q.abs() >= Q31_ONE {
        return Err(QuantizationError::SignificandOverflow { significand: q });
    }

    Ok(QuantizedMultiplier {
        significand: q as i32,
        shift,
    })
}

/// Rescale an accumulator the way the integer kernel does
///
/// Left shift by the positive part of `shift`, saturating rounding doubling
/// high multiply by the significand, then a rounding right shift by the
/// negative part. Right shifts past 62 bits leave every i32 at zero.
pub fn multiply_by_quantized_multiplier(acc: i32, multiplier: QuantizedMultiplier) -> i32 {
    let left_shift = multiplier.shift.clamp(0, 31);
    let right_shift = (-multiplier.shift).clamp(0, 62);

    let shifted = (i64::from(acc) << left_shift).clamp(i64::from(i32::MIN), i64::from(i32::MAX));
    let high = saturating_rounding_doubling_high_mul(shifted as i32, multiplier.significand);
    rounding_divide_by_pot(high, right_shift)
}

fn saturating_rounding_doubling_high_mul(a: i32, b: i32) -> i32 {
    if a == i32::MIN && b == i32::MIN {
        return i32::MAX;
    }
    let ab = i64::from(a) * i64::from(b);
    let nudge: i64 = if ab >= 0 { 1 << 30 } else { 1 - (1 << 30) };
    ((ab + nudge) / Q31_ONE) as i32
}

fn rounding_divide_by_pot(x: i32, exponent: i32) -> i32 {
    if exponent <= 0 {
        return x;
    }
    let mask = (1i64 << exponent) - 1;
    let remainder = i64::from(x) & mask;
    let mut threshold = mask >> 1;
    if x < 0 {
        threshold += 1;
    }
    let mut result = i64::from(x) >> exponent;
    if remainder > threshold {
        result += 1;
    }
    result as i32
}

/// Builds the per-channel (multiplier, shift) table of a convolution
#[derive(Debug, Clone, Copy)]
pub struct MultiplierTableBuilder {
    input_scale: f64,
    output_scale: f64,
    parallel: bool,
}

impl MultiplierTableBuilder {
    /// Create a builder, rejecting non-positive or non-finite scales
    pub fn new(input_scale: f64, output_scale: f64) -> Result<Self> {
        for (name, scale) in [("input", input_scale), ("output", output_scale)] {
            if !(scale.is_finite() && scale > 0.0) {
                return Err(QuantizationError::InvalidScale(format!(
                    "{name} scale must be positive and finite, got {scale}"
                )));
            }
        }
        Ok(Self {
            input_scale,
            output_scale,
            parallel: false,
        })
    }

    /// Spread channels over the rayon pool
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Decompose `input_scale * filter_scale[c] / output_scale` for every channel
    ///
    /// An all-zero filter channel has a zero scale; its pair is `(0, 0)`, the
    /// frexp decomposition of zero, which makes the kernel emit only the
    /// output offset for that channel.
    pub fn build(
        &self,
        filter_scales: &PerChannelScaleTable,
        output_channels: usize,
    ) -> Result<MultiplierTable> {
        if filter_scales.is_empty() {
            return Err(QuantizationError::InvalidScale(
                "per-channel scale table is empty".to_string(),
            ));
        }
        if filter_scales.len() != output_channels {
            return Err(QuantizationError::ScaleTableMismatch {
                expected: output_channels,
                actual: filter_scales.len(),
            });
        }

        let pairs = map_channels(output_channels, self.parallel, |channel| {
            let effective = self.input_scale * filter_scales[channel] / self.output_scale;
            if effective == 0.0 {
                warn!(channel, "zero effective scale, emitting a null multiplier");
                return Ok(QuantizedMultiplier {
                    significand: 0,
                    shift: 0,
                });
            }
            quantize_multiplier(effective)
        })?;

        debug!(channels = pairs.len(), "built multiplier table");
        Ok(pairs.into_iter().collect())
    }
}

/// Single (multiplier, shift) pair of a per-tensor fully-connected layer
pub fn fully_connected_multiplier(
    input_scale: f64,
    weights_scale: f64,
    output_scale: f64,
) -> Result<QuantizedMultiplier> {
    let input_product_scale = input_scale * weights_scale;
    if input_product_scale < 0.0 {
        return Err(QuantizationError::InvalidScale(format!(
            "negative input product scale {input_product_scale}"
        )));
    }
    quantize_multiplier(input_product_scale / output_scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frexp_matches_definition() {
        assert_eq!(frexp(1.0), (0.5, 1));
        assert_eq!(frexp(0.5), (0.5, 0));
        assert_eq!(frexp(3.0), (0.75, 2));
        assert_eq!(frexp(-6.0), (-0.75, 3));
        assert_eq!(frexp(0.0), (0.0, 0));

        let tiny = f64::from_bits(1);
        let (m, e) = frexp(tiny);
        assert_eq!(m, 0.5);
        assert_eq!(e, -1073);
    }

    #[test]
    fn test_powers_of_two() {
        assert_eq!(
            quantize_multiplier(1.0).unwrap(),
            QuantizedMultiplier { significand: 1 << 30, shift: 1 }
        );
        assert_eq!(
            quantize_multiplier(0.25).unwrap(),
            QuantizedMultiplier { significand: 1 << 30, shift: -1 }
        );
    }

    #[test]
    fn test_rounding_overflow_bumps_shift() {
        let m = quantize_multiplier(0.999_999_999_999).unwrap();
        assert_eq!(m, QuantizedMultiplier { significand: 1 << 30, shift: 1 });
    }

    #[test]
    fn test_reference_value() {
        let m = quantize_multiplier(4.0 / 127.0 * 0.05512).unwrap();
        assert_eq!(m.significand, 1_908_821_446);
        assert_eq!(m.shift, -9);
    }

    #[test]
    fn test_rejects_non_positive() {
        assert!(quantize_multiplier(0.0).is_err());
        assert!(quantize_multiplier(-1.0).is_err());
        assert!(quantize_multiplier(f64::NAN).is_err());
    }

    #[test]
    fn test_requantize_reference() {
        let m = quantize_multiplier(0.5).unwrap();
        assert_eq!(multiply_by_quantized_multiplier(100, m), 50);
        assert_eq!(multiply_by_quantized_multiplier(-102, m), -51);
        assert_eq!(multiply_by_quantized_multiplier(101, m), 51);
        assert_eq!(multiply_by_quantized_multiplier(i32::MAX, m), 1 << 30);

        let m = quantize_multiplier(3.0).unwrap();
        assert_eq!(multiply_by_quantized_multiplier(7, m), 21);

        let m = quantize_multiplier(0.001).unwrap();
        assert_eq!(multiply_by_quantized_multiplier(123_456, m), 123);
    }

    #[test]
    fn test_requantize_shift_beyond_31_bits() {
        let m = quantize_multiplier(1e-12).unwrap();
        assert_eq!(m.shift, -39);
        assert_eq!(multiply_by_quantized_multiplier(i32::MAX, m), 0);
        assert_eq!(multiply_by_quantized_multiplier(i32::MIN, m), 0);

        // 0.75 * 2^-32: a 31-bit cap would round i32::MAX up to 1.
        let m = quantize_multiplier(3.0 * 2f64.powi(-34)).unwrap();
        assert_eq!(m.shift, -32);
        assert_eq!(multiply_by_quantized_multiplier(i32::MAX, m), 0);
        assert_eq!(multiply_by_quantized_multiplier(i32::MIN, m), 0);
    }

    #[test]
    fn test_table_validation() {
        let builder = MultiplierTableBuilder::new(0.05, 1.0).unwrap();
        assert!(matches!(
            builder.build(&PerChannelScaleTable::default(), 0),
            Err(QuantizationError::InvalidScale(_))
        ));
        assert_eq!(
            builder.build(&vec![0.1, 0.2].into(), 3),
            Err(QuantizationError::ScaleTableMismatch { expected: 3, actual: 2 })
        );
        assert!(MultiplierTableBuilder::new(0.0, 1.0).is_err());
    }

    #[test]
    fn test_table_orders_by_channel() {
        let scales: PerChannelScaleTable = vec![0.1, 0.0, 0.4].into();
        let table = MultiplierTableBuilder::new(0.5, 2.0)
            .unwrap()
            .parallel(true)
            .build(&scales, 3)
            .unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(0), quantize_multiplier(0.025).ok());
        assert_eq!(table.get(1), Some(QuantizedMultiplier { significand: 0, shift: 0 }));
        assert_eq!(table.get(2), quantize_multiplier(0.1).ok());
    }

    #[test]
    fn test_fully_connected_multiplier() {
        let m = fully_connected_multiplier(1.0, 1.0, 1.0).unwrap();
        assert_eq!(m, QuantizedMultiplier { significand: 1 << 30, shift: 1 });
        assert!(fully_connected_multiplier(-1.0, 1.0, 1.0).is_err());
    }
}
