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

//! Symmetric per-output-channel filter quantization

use ndarray::ArrayViewD;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::map_channels;
use crate::quantize::narrow;
use crate::types::{PerChannelScaleTable, QuantizedTensor};
use crate::{QuantizationError, Result};

/// Largest magnitude of a quantized filter element; filters have no zero-point
pub const FILTER_QMAX: i64 = 127;

/// Which dimension of the flattened filter indexes the output channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantizedDimension {
    /// Dimension 0: each channel is a contiguous block (conv, OHWI)
    Leading,
    /// Last dimension: channel elements are strided by the channel count
    /// (depthwise conv, HWIM)
    Trailing,
}

impl QuantizedDimension {
    fn flat_index(self, channel: usize, element: usize, channels: usize, per_channel: usize) -> usize {
        match self {
            Self::Leading => channel * per_channel + element,
            Self::Trailing => element * channels + channel,
        }
    }
}

/// Quantized filter together with the scale of every output channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedFilter {
    /// Values in `[-127, 127]`, in the source layout
    pub tensor: QuantizedTensor<i8>,
    /// `max|v| / 127` of every channel
    pub scales: PerChannelScaleTable,
}

/// Quantizes a filter independently per output channel
#[derive(Debug, Clone, Copy)]
pub struct PerChannelFilterQuantizer {
    channels: usize,
    dimension: QuantizedDimension,
    parallel: bool,
}

impl PerChannelFilterQuantizer {
    /// Quantizer for `channels` output channels laid out along `dimension`
    pub fn new(channels: usize, dimension: QuantizedDimension) -> Self {
        Self {
            channels,
            dimension,
            parallel: false,
        }
    }

    /// Spread channels over the rayon pool
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Quantize `filter`, returning 8-bit values and one scale per channel
    ///
    /// Each channel's range always contains zero, so its scale is
    /// `max(|min|, |max|) / 127`. Elements are rounded to integers before
    /// scaling and clamped to `[-127, 127]`. An all-zero channel gets a zero
    /// scale and zero values; consumers substitute a small scale downstream.
    pub fn quantize(&self, filter: ArrayViewD<'_, f64>) -> Result<QuantizedFilter> {
        let total = filter.len();
        if self.channels == 0 || total % self.channels != 0 {
            return Err(QuantizationError::ShapeMismatch(format!(
                "{} filter elements cannot be split into {} channels",
                total, self.channels
            )));
        }
        let per_channel = total / self.channels;
        let values: Vec<f64> = filter.iter().copied().collect();

        let channels = map_channels(self.channels, self.parallel, |channel| {
            let at = |element: usize| self.dimension.flat_index(channel, element, self.channels, per_channel);

            let (fmin, fmax) = (0..per_channel)
                .map(|element| values[at(element)])
                .fold((0.0f64, 0.0f64), |(lo, hi), x| (lo.min(x), hi.max(x)));
            let scale = fmin.abs().max(fmax.abs()) / FILTER_QMAX as f64;

            if scale == 0.0 {
                warn!(channel, "filter channel is all zeros, scale is 0");
                return Ok((scale, vec![0i8; per_channel]));
            }

            let quantized = (0..per_channel)
                .map(|element| {
                    let q = (values[at(element)].round() / scale).round() as i64;
                    narrow::<i8>(q.clamp(-FILTER_QMAX, FILTER_QMAX))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok((scale, quantized))
        })?;

        let mut data = vec![0i8; total];
        let mut scales = Vec::with_capacity(self.channels);
        for (channel, (scale, quantized)) in channels.into_iter().enumerate() {
            for (element, q) in quantized.into_iter().enumerate() {
                data[self.dimension.flat_index(channel, element, self.channels, per_channel)] = q;
            }
            scales.push(scale);
        }

        debug!(
            channels = self.channels,
            per_channel,
            dimension = ?self.dimension,
            "quantized filter per channel"
        );
        Ok(QuantizedFilter {
            tensor: QuantizedTensor::new(data, filter.shape().to_vec())?,
            scales: scales.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array, IxDyn};

    #[test]
    fn test_single_channel_symmetric() {
        let filter = array![-7.0, 0.0, 7.0].into_dyn();
        let result = PerChannelFilterQuantizer::new(1, QuantizedDimension::Leading)
            .quantize(filter.view())
            .unwrap();
        assert_relative_eq!(result.scales[0], 7.0 / 127.0);
        assert_eq!(result.tensor.data, vec![-127, 0, 127]);
    }

    #[test]
    fn test_values_are_rounded_before_scaling() {
        let filter = array![-4.0, -2.0, 0.0, 2.0, 4.0].into_dyn();
        let result = PerChannelFilterQuantizer::new(1, QuantizedDimension::Leading)
            .quantize(filter.view())
            .unwrap();
        assert_relative_eq!(result.scales[0], 4.0 / 127.0);
        assert_eq!(result.tensor.data, vec![-127, -64, 0, 64, 127]);

        // 3.4 rounds to 3 before it is scaled.
        let filter = array![7.0, 3.4].into_dyn();
        let result = PerChannelFilterQuantizer::new(1, QuantizedDimension::Leading)
            .quantize(filter.view())
            .unwrap();
        assert_eq!(result.tensor.data, vec![127, 54]);
    }

    #[test]
    fn test_one_sided_channels_anchor_at_zero() {
        // Two channel-major channels: all positive, all negative.
        let filter = array![[1.0, 5.0], [-2.0, -4.0]].into_dyn();
        let result = PerChannelFilterQuantizer::new(2, QuantizedDimension::Leading)
            .quantize(filter.view())
            .unwrap();
        assert_relative_eq!(result.scales[0], 5.0 / 127.0);
        assert_relative_eq!(result.scales[1], 4.0 / 127.0);
        assert_eq!(result.tensor.data, vec![25, 127, -64, -127]);
        assert_eq!(result.tensor.shape(), &[2, 2]);
    }

    #[test]
    fn test_trailing_dimension_is_strided() {
        // [H=1, W=2, I=1, M=3]: channel c owns flat indices c and c + 3.
        let values = vec![1.0, -2.0, 0.0, 2.0, 1.0, 0.0];
        let filter = Array::from_shape_vec(IxDyn(&[1, 2, 1, 3]), values).unwrap();
        let result = PerChannelFilterQuantizer::new(3, QuantizedDimension::Trailing)
            .parallel(true)
            .quantize(filter.view())
            .unwrap();

        assert_eq!(result.scales.len(), 3);
        assert_relative_eq!(result.scales[0], 2.0 / 127.0);
        assert_relative_eq!(result.scales[1], 2.0 / 127.0);
        assert_eq!(result.scales[2], 0.0);
        assert_eq!(result.tensor.data, vec![64, -127, 0, 127, 64, 0]);
        assert_eq!(result.tensor.shape(), &[1, 2, 1, 3]);
    }

    #[test]
    fn test_rejects_uneven_split() {
        let filter = array![1.0, 2.0, 3.0].into_dyn();
        let quantizer = PerChannelFilterQuantizer::new(2, QuantizedDimension::Leading);
        assert!(matches!(
            quantizer.quantize(filter.view()),
            Err(QuantizationError::ShapeMismatch(_))
        ));
        let quantizer = PerChannelFilterQuantizer::new(0, QuantizedDimension::Leading);
        assert!(quantizer.quantize(filter.view()).is_err());
    }
}
