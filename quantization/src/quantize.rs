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

//! Element-level quantization primitives and per-tensor quantizers

use ndarray::ArrayViewD;

use crate::types::{AffineQuantizationParams, IntegerType, QuantizedTensor};
use crate::{QuantizationError, Result};

/// Quantize a single value onto `ty`: `round(value / scale) + zero_point`
///
/// Halves round away from zero and the result saturates at the type bounds.
pub fn quantize_value(value: f64, params: &AffineQuantizationParams, ty: IntegerType) -> i64 {
    let steps = (value / params.scale).round() as i64;
    ty.clamp(steps.saturating_add(i64::from(params.zero_point)))
}

/// Quantize a single activation or weight to signed 8-bit
pub fn quantize_i8(value: f64, params: &AffineQuantizationParams) -> i8 {
    quantize_value(value, params, IntegerType::I8) as i8
}

/// Saturate a raw accumulator value to the 32-bit range
pub fn clamp_i32(value: i64) -> i32 {
    IntegerType::I32.clamp(value) as i32
}

/// Magnitude bound of the symmetric 16-bit bias range
pub const SYMMETRIC_I16_LIMIT: i64 = 32767;

/// Saturate to the symmetric 16-bit range `[-32767, 32767]`
pub fn clamp_i16(value: i64) -> i16 {
    value.clamp(-SYMMETRIC_I16_LIMIT, SYMMETRIC_I16_LIMIT) as i16
}

/// Map a quantized value back to the real line
pub fn dequantize(q: i64, params: &AffineQuantizationParams) -> f64 {
    (q - i64::from(params.zero_point)) as f64 * params.scale
}

/// Narrow an already clamped integer into the element type of a tensor
pub(crate) fn narrow<T: num_traits::NumCast>(value: i64) -> Result<T> {
    num_traits::cast::<i64, T>(value).ok_or_else(|| {
        QuantizationError::InvalidParams(format!(
            "value {value} does not fit the target element type"
        ))
    })
}

/// Trait for whole-tensor quantization
pub trait Quantizer {
    /// Integer element type produced
    type Element;

    /// Quantize a tensor, preserving its shape
    fn quantize(&self, data: ArrayViewD<'_, f64>) -> Result<QuantizedTensor<Self::Element>>;
}

/// Per-tensor affine quantizer for 8-bit activations and weights
#[derive(Debug, Clone, Copy)]
pub struct AffineQuantizer {
    params: AffineQuantizationParams,
}

impl AffineQuantizer {
    /// Quantizer applying `params` to every element
    pub fn new(params: AffineQuantizationParams) -> Self {
        Self { params }
    }

    /// Parameters this quantizer applies
    pub fn params(&self) -> &AffineQuantizationParams {
        &self.params
    }
}

impl Quantizer for AffineQuantizer {
    type Element = i8;

    fn quantize(&self, data: ArrayViewD<'_, f64>) -> Result<QuantizedTensor<i8>> {
        let values = data.iter().map(|&x| quantize_i8(x, &self.params)).collect();
        QuantizedTensor::new(values, data.shape().to_vec())
    }
}

/// Quantizer for 32-bit accumulator inputs: `trunc(value / scale)` saturated
/// to the i32 range, with no zero-point
#[derive(Debug, Clone, Copy)]
pub struct AccumulatorQuantizer {
    scale: f64,
}

impl AccumulatorQuantizer {
    /// Create a quantizer, rejecting non-positive or non-finite scales
    pub fn new(scale: f64) -> Result<Self> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(QuantizationError::InvalidScale(format!(
                "accumulator scale must be positive and finite, got {scale}"
            )));
        }
        Ok(Self { scale })
    }

    /// Truncate `value / scale` toward zero and saturate
    pub fn quantize_value(&self, value: f64) -> i32 {
        clamp_i32((value / self.scale).trunc() as i64)
    }
}

impl Quantizer for AccumulatorQuantizer {
    type Element = i32;

    fn quantize(&self, data: ArrayViewD<'_, f64>) -> Result<QuantizedTensor<i32>> {
        let values = data.iter().map(|&x| self.quantize_value(x)).collect();
        QuantizedTensor::new(values, data.shape().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn params(scale: f64, zero_point: i32) -> AffineQuantizationParams {
        AffineQuantizationParams::new(scale, zero_point).unwrap()
    }

    #[test]
    fn test_rounds_half_away_from_zero() {
        let p = params(1.0, 0);
        assert_eq!(quantize_i8(2.5, &p), 3);
        assert_eq!(quantize_i8(-2.5, &p), -3);
        assert_eq!(quantize_i8(2.49, &p), 2);
    }

    #[test]
    fn test_zero_point_is_added_after_rounding() {
        let p = params(0.5, -50);
        assert_eq!(quantize_i8(1.25, &p), -47);
        assert_eq!(quantize_i8(0.0, &p), -50);
    }

    #[test]
    fn test_saturation_at_bounds() {
        let p = params(0.1, 10);
        assert_eq!(quantize_i8(1.0e9, &p), 127);
        assert_eq!(quantize_i8(-1.0e9, &p), -128);
        assert_eq!(quantize_i8(11.7, &p), 127);
        assert_eq!(quantize_i8(-13.8, &p), -128);
    }

    #[test]
    fn test_accumulator_clamps() {
        assert_eq!(clamp_i32(i64::from(i32::MAX) + 1), i32::MAX);
        assert_eq!(clamp_i32(i64::from(i32::MIN) - 1), i32::MIN);
        assert_eq!(clamp_i16(40_000), 32767);
        assert_eq!(clamp_i16(-40_000), -32767);
        assert_eq!(clamp_i16(-32768), -32767);
    }

    #[test]
    fn test_narrow_rejects_out_of_range() {
        assert_eq!(narrow::<i8>(-128).unwrap(), -128i8);
        assert!(matches!(
            narrow::<i8>(128),
            Err(QuantizationError::InvalidParams(_))
        ));
        assert_eq!(narrow::<i32>(i64::from(i32::MIN)).unwrap(), i32::MIN);
    }

    #[test]
    fn test_accumulator_quantizer_truncates() {
        let q = AccumulatorQuantizer::new(2.0).unwrap();
        assert_eq!(q.quantize_value(7.0), 3);
        assert_eq!(q.quantize_value(-7.0), -3);
        assert_eq!(q.quantize_value(1.0e12), i32::MAX);
        assert!(AccumulatorQuantizer::new(0.0).is_err());
    }

    #[test]
    fn test_affine_tensor_quantization_keeps_shape() {
        let data = array![[-1.0, 0.0, 1.0], [2.0, 3.0, 4.0]].into_dyn();
        let quantizer = AffineQuantizer::new(params(0.5, 1));
        let quantized = quantizer.quantize(data.view()).unwrap();
        assert_eq!(quantized.shape(), &[2, 3]);
        assert_eq!(quantized.data, vec![-1, 1, 3, 5, 7, 9]);

        let restored = quantized.dequantize(quantizer.params()).unwrap();
        for (a, b) in data.iter().zip(restored.iter()) {
            assert!((a - b).abs() <= 0.5, "Mismatch: {} vs {}", a, b);
        }
    }
}
