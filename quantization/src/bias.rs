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

//! Bias quantization against the input x filter scale of each channel

use ndarray::ArrayViewD;
use tracing::warn;

use crate::channel::map_channels;
use crate::quantize::{clamp_i16, AccumulatorQuantizer, Quantizer};
use crate::types::{PerChannelScaleTable, QuantizedTensor};
use crate::{QuantizationError, Result};

/// Scale substituted when a channel's bias scale is zero
pub const DEFAULT_DEGENERATE_SCALE_EPSILON: f64 = 1e-7;

/// Quantizes a convolution bias with one scale per output channel
///
/// Values are stored as 32-bit words but clamped to `[-32767, 32767]`, the
/// range the reference numeric model keeps biases in.
#[derive(Debug, Clone, Copy)]
pub struct PerChannelBiasQuantizer {
    input_scale: f64,
    epsilon: f64,
    parallel: bool,
}

impl PerChannelBiasQuantizer {
    /// Create a quantizer, rejecting non-positive or non-finite input scales
    pub fn new(input_scale: f64) -> Result<Self> {
        if !(input_scale.is_finite() && input_scale > 0.0) {
            return Err(QuantizationError::InvalidScale(format!(
                "input scale must be positive and finite, got {input_scale}"
            )));
        }
        Ok(Self {
            input_scale,
            epsilon: DEFAULT_DEGENERATE_SCALE_EPSILON,
            parallel: false,
        })
    }

    /// Scale used in place of a zero bias scale
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Spread channels over the rayon pool
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Effective scale of channel `channel`, failing on a zero product
    pub fn strict_bias_scale(&self, filter_scales: &PerChannelScaleTable, channel: usize) -> Result<f64> {
        let filter_scale = filter_scales.as_slice().get(channel).ok_or(
            QuantizationError::ScaleTableMismatch {
                expected: channel + 1,
                actual: filter_scales.len(),
            },
        )?;
        let scale = filter_scale * self.input_scale;
        if scale == 0.0 {
            return Err(QuantizationError::DegenerateScale { channel });
        }
        Ok(scale)
    }

    /// Quantize one bias per channel: `round(bias[c] / (filter_scale[c] * input_scale))`
    pub fn quantize(
        &self,
        bias: &[f64],
        filter_scales: &PerChannelScaleTable,
    ) -> Result<QuantizedTensor<i32>> {
        if bias.len() != filter_scales.len() {
            return Err(QuantizationError::ScaleTableMismatch {
                expected: bias.len(),
                actual: filter_scales.len(),
            });
        }

        let data = map_channels(bias.len(), self.parallel, |channel| {
            let scale = match self.strict_bias_scale(filter_scales, channel) {
                Ok(scale) => scale,
                Err(err @ QuantizationError::DegenerateScale { .. }) => {
                    warn!(%err, epsilon = self.epsilon, "substituting bias scale");
                    self.epsilon
                }
                Err(err) => return Err(err),
            };
            let q = (bias[channel] / scale).round() as i64;
            Ok(i32::from(clamp_i16(q)))
        })?;

        QuantizedTensor::new(data, vec![bias.len()])
    }
}

/// Quantize a fully-connected bias with one tensor-wide scale
///
/// Values are truncated toward zero and saturated to the i32 range.
pub fn quantize_fully_connected_bias(
    bias: ArrayViewD<'_, f64>,
    bias_scale: f64,
) -> Result<QuantizedTensor<i32>> {
    AccumulatorQuantizer::new(bias_scale)?.quantize(bias)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_per_channel_bias() {
        let scales: PerChannelScaleTable = vec![0.5, 0.25].into();
        let quantized = PerChannelBiasQuantizer::new(0.1)
            .unwrap()
            .quantize(&[1.0, -1.0], &scales)
            .unwrap();
        assert_eq!(quantized.data, vec![20, -40]);
        assert_eq!(quantized.shape(), &[2]);
    }

    #[test]
    fn test_bias_clamps_to_16_bits() {
        let scales: PerChannelScaleTable = vec![1.0 / 127.0, 1.0 / 127.0].into();
        let quantized = PerChannelBiasQuantizer::new(0.001)
            .unwrap()
            .quantize(&[1000.0, -1000.0], &scales)
            .unwrap();
        assert_eq!(quantized.data, vec![32767, -32767]);
    }

    #[test]
    fn test_zero_scale_uses_epsilon() {
        let scales: PerChannelScaleTable = vec![0.0].into();
        let quantizer = PerChannelBiasQuantizer::new(0.05).unwrap();
        assert_eq!(
            quantizer.strict_bias_scale(&scales, 0),
            Err(QuantizationError::DegenerateScale { channel: 0 })
        );

        let quantized = quantizer.quantize(&[0.0], &scales).unwrap();
        assert_eq!(quantized.data, vec![0]);

        let quantized = quantizer.with_epsilon(1.0).quantize(&[3.0], &scales).unwrap();
        assert_eq!(quantized.data, vec![3]);
    }

    #[test]
    fn test_length_mismatch() {
        let scales: PerChannelScaleTable = vec![0.5].into();
        assert_eq!(
            PerChannelBiasQuantizer::new(0.1).unwrap().quantize(&[1.0, 2.0], &scales),
            Err(QuantizationError::ScaleTableMismatch { expected: 2, actual: 1 })
        );
    }

    #[test]
    fn test_strict_scale_out_of_range_channel() {
        let scales: PerChannelScaleTable = vec![0.5, 0.25].into();
        let quantizer = PerChannelBiasQuantizer::new(0.1).unwrap();
        assert_eq!(
            quantizer.strict_bias_scale(&scales, 2),
            Err(QuantizationError::ScaleTableMismatch { expected: 3, actual: 2 })
        );
    }

    #[test]
    fn test_rejects_invalid_input_scale() {
        for scale in [0.0, -0.1, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                PerChannelBiasQuantizer::new(scale),
                Err(QuantizationError::InvalidScale(_))
            ));
        }
    }

    #[test]
    fn test_fully_connected_bias_truncates() {
        let bias = array![2.9, -2.9, 1.0e12].into_dyn();
        let quantized = quantize_fully_connected_bias(bias.view(), 1.0).unwrap();
        assert_eq!(quantized.data, vec![2, -2, i32::MAX]);
    }
}
