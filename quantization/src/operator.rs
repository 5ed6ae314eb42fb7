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

//! Operator kinds, shape metadata and the geometry derived from it

use ndarray::{ArrayD, ArrayViewD, Ix4, IxDyn};
use serde::{Deserialize, Serialize};

use crate::filter::QuantizedDimension;
use crate::{QuantizationError, Result};

/// Padding mode of a windowed operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Output covers `ceil(in / stride)` positions, zero-padded evenly
    Same,
    /// Output only covers positions where the window fits
    Valid,
}

/// Pooling flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Mean over the window
    Average,
    /// Maximum over the window
    Max,
}

/// Explicit per-tensor parameters of a fully-connected layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FullyConnectedParams {
    /// Scale of the 8-bit input
    pub input_scale: f64,
    /// Zero-point of the 8-bit input
    pub input_zero_point: i32,
    /// Tensor-wide weight scale
    pub weights_scale: f64,
    /// Weight zero-point, passed to the kernel as its offset
    pub weights_zero_point: i32,
    /// Scale the 32-bit bias is truncated against
    pub bias_scale: f64,
    /// Scale of the 8-bit output
    pub output_scale: f64,
    /// Zero-point of the 8-bit output
    pub output_zero_point: i32,
}

impl Default for FullyConnectedParams {
    fn default() -> Self {
        Self {
            input_scale: 1.0,
            input_zero_point: 0,
            weights_scale: 1.0,
            weights_zero_point: 0,
            bias_scale: 1.0,
            output_scale: 1.0,
            output_zero_point: 0,
        }
    }
}

/// The operator a quantization run prepares data for
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorKind {
    /// Standard convolution with per-channel filter scales
    Conv,
    /// Depthwise convolution, channel multiplier `output / input`
    DepthwiseConv,
    /// Average or max pooling; no filter or bias
    Pool { kind: PoolKind },
    /// Fully connected layer with caller-supplied per-tensor parameters
    FullyConnected(FullyConnectedParams),
}

/// Output size and padding derived from the operator settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorGeometry {
    /// Output columns
    pub output_width: usize,
    /// Output rows
    pub output_height: usize,
    /// Left padding
    pub pad_x: usize,
    /// Top padding
    pub pad_y: usize,
}

/// Shape, stride, padding and value ranges of one operator case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorSettings {
    /// Operator this case targets
    pub kind: OperatorKind,
    /// Channels of the input tensor
    pub input_channels: usize,
    /// Channels of the output tensor
    pub output_channels: usize,
    /// Input columns
    pub input_width: usize,
    /// Input rows
    pub input_height: usize,
    /// Filter or pooling window columns
    pub filter_width: usize,
    /// Filter or pooling window rows
    pub filter_height: usize,
    /// Horizontal stride
    pub stride_x: usize,
    /// Vertical stride
    pub stride_y: usize,
    /// Padding mode
    pub padding: Padding,
    /// Batch count
    pub batches: usize,
    /// Interval the float input values are drawn from
    pub value_range: (f64, f64),
    /// Interval the float output is expected to cover
    pub output_range: (f64, f64),
}

impl OperatorSettings {
    /// Standard convolution, 7x7 input, 3x3 filter, stride 2, `SAME` padding
    pub fn conv(input_channels: usize, output_channels: usize) -> Self {
        Self {
            kind: OperatorKind::Conv,
            input_channels,
            output_channels,
            input_width: 7,
            input_height: 7,
            filter_width: 3,
            filter_height: 3,
            stride_x: 2,
            stride_y: 2,
            padding: Padding::Same,
            batches: 1,
            value_range: (-7.0, 7.0),
            output_range: (-128.0, 127.0),
        }
    }

    /// Depthwise convolution with the same defaults as [`Self::conv`]
    pub fn depthwise_conv(input_channels: usize, output_channels: usize) -> Self {
        Self {
            kind: OperatorKind::DepthwiseConv,
            ..Self::conv(input_channels, output_channels)
        }
    }

    /// Pooling, 4x4 input and window, stride 1, `VALID` padding
    pub fn pool(kind: PoolKind, channels: usize) -> Self {
        Self {
            kind: OperatorKind::Pool { kind },
            input_width: 4,
            input_height: 4,
            filter_width: 4,
            filter_height: 4,
            stride_x: 1,
            stride_y: 1,
            padding: Padding::Valid,
            ..Self::conv(channels, channels)
        }
    }

    /// Fully connected layer over a 1x1 input
    pub fn fully_connected(
        input_channels: usize,
        output_channels: usize,
        params: FullyConnectedParams,
    ) -> Self {
        Self {
            kind: OperatorKind::FullyConnected(params),
            input_width: 1,
            input_height: 1,
            filter_width: 1,
            filter_height: 1,
            stride_x: 1,
            stride_y: 1,
            padding: Padding::Valid,
            ..Self::conv(input_channels, output_channels)
        }
    }

    /// Set the input size
    pub fn with_input(mut self, width: usize, height: usize) -> Self {
        self.input_width = width;
        self.input_height = height;
        self
    }

    /// Set the filter or window size
    pub fn with_filter(mut self, width: usize, height: usize) -> Self {
        self.filter_width = width;
        self.filter_height = height;
        self
    }

    /// Set both strides
    pub fn with_stride(mut self, x: usize, y: usize) -> Self {
        self.stride_x = x;
        self.stride_y = y;
        self
    }

    /// Set the padding mode
    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Set the batch count
    pub fn with_batches(mut self, batches: usize) -> Self {
        self.batches = batches;
        self
    }

    /// Set the input value interval
    pub fn with_value_range(mut self, min: f64, max: f64) -> Self {
        self.value_range = (min, max);
        self
    }

    /// Set the expected output interval
    pub fn with_output_range(mut self, min: f64, max: f64) -> Self {
        self.output_range = (min, max);
        self
    }

    /// Check the structural constraints of the operator kind
    pub fn validate(&self) -> Result<()> {
        if self.input_channels == 0 || self.output_channels == 0 || self.batches == 0 {
            return Err(QuantizationError::InvalidParams(
                "channel and batch counts must be non-zero".to_string(),
            ));
        }
        if self.stride_x == 0 || self.stride_y == 0 {
            return Err(QuantizationError::InvalidParams(
                "strides must be non-zero".to_string(),
            ));
        }
        match self.kind {
            OperatorKind::DepthwiseConv if self.output_channels % self.input_channels != 0 => {
                Err(QuantizationError::InvalidParams(format!(
                    "out channel ({}) is not a multiple of in channel ({})",
                    self.output_channels, self.input_channels
                )))
            }
            OperatorKind::Pool { .. } if self.input_channels != self.output_channels => {
                Err(QuantizationError::InvalidParams(format!(
                    "pooling keeps the channel count, got {} in and {} out",
                    self.input_channels, self.output_channels
                )))
            }
            OperatorKind::FullyConnected(_)
                if self.input_width != self.filter_width
                    || self.input_height != self.filter_height =>
            {
                Err(QuantizationError::InvalidParams(
                    "mismatching input and filter dimensions".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Output size and leading padding for the configured padding mode
    pub fn geometry(&self) -> Result<OperatorGeometry> {
        let (output_width, pad_x) =
            output_extent(self.input_width, self.filter_width, self.stride_x, self.padding)?;
        let (output_height, pad_y) =
            output_extent(self.input_height, self.filter_height, self.stride_y, self.padding)?;
        Ok(OperatorGeometry {
            output_width,
            output_height,
            pad_x,
            pad_y,
        })
    }

    /// Output channels per input channel of a depthwise convolution
    pub fn channel_multiplier(&self) -> Option<usize> {
        match self.kind {
            OperatorKind::DepthwiseConv => Some(self.output_channels / self.input_channels),
            _ => None,
        }
    }

    /// Filter dimension indexing the output channel, if the operator has a
    /// per-channel filter
    pub fn quantized_dimension(&self) -> Option<QuantizedDimension> {
        match self.kind {
            OperatorKind::Conv => Some(QuantizedDimension::Leading),
            OperatorKind::DepthwiseConv => Some(QuantizedDimension::Trailing),
            OperatorKind::Pool { .. } | OperatorKind::FullyConnected(_) => None,
        }
    }

    /// `[batches, height, width, input_channels]`
    pub fn input_shape(&self) -> Vec<usize> {
        vec![
            self.batches,
            self.input_height,
            self.input_width,
            self.input_channels,
        ]
    }

    /// `[batches, output_height, output_width, output_channels]`
    pub fn output_shape(&self) -> Result<Vec<usize>> {
        let geometry = self.geometry()?;
        Ok(vec![
            self.batches,
            geometry.output_height,
            geometry.output_width,
            self.output_channels,
        ])
    }

    /// Kernel-layout filter shape: `[O, H, W, I]`, or `[H, W, I, M]` for
    /// depthwise convolution. Pooling has no filter tensor.
    pub fn filter_shape(&self) -> Option<Vec<usize>> {
        match self.kind {
            OperatorKind::Conv | OperatorKind::FullyConnected(_) => Some(vec![
                self.output_channels,
                self.filter_height,
                self.filter_width,
                self.input_channels,
            ]),
            OperatorKind::DepthwiseConv => Some(vec![
                self.filter_height,
                self.filter_width,
                self.input_channels,
                self.output_channels / self.input_channels,
            ]),
            OperatorKind::Pool { .. } => None,
        }
    }

    /// Reorder a kernel-layout filter into the layout a float reference
    /// framework expects: `OHWI -> HWIO`, depthwise `HWIM` unchanged
    pub fn framework_filter(&self, filter: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>> {
        let expected = self.filter_shape().ok_or_else(|| {
            QuantizationError::InvalidParams("pooling has no filter".to_string())
        })?;
        let filter = filter
            .to_shape(IxDyn(&expected))
            .map_err(|e| QuantizationError::ShapeMismatch(e.to_string()))?;
        match self.kind {
            OperatorKind::DepthwiseConv => Ok(filter.to_owned()),
            _ => ohwi_to_hwio(filter.view()),
        }
    }
}

fn output_extent(input: usize, filter: usize, stride: usize, padding: Padding) -> Result<(usize, usize)> {
    match padding {
        Padding::Same => {
            let output = input.div_ceil(stride);
            let pad_total = ((output.saturating_sub(1)) * stride + filter).saturating_sub(input);
            Ok((output, pad_total / 2))
        }
        Padding::Valid => {
            if filter > input {
                return Err(QuantizationError::ShapeMismatch(format!(
                    "filter extent {filter} exceeds input extent {input} with valid padding"
                )));
            }
            Ok(((input - filter + 1).div_ceil(stride), 0))
        }
    }
}

/// `[O, H, W, I] -> [H, W, I, O]`
pub fn ohwi_to_hwio(filter: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>> {
    let filter = filter
        .into_dimensionality::<Ix4>()
        .map_err(|e| QuantizationError::ShapeMismatch(e.to_string()))?;
    Ok(filter
        .permuted_axes([1, 2, 3, 0])
        .as_standard_layout()
        .into_owned()
        .into_dyn())
}

/// `[H, W, I, O] -> [O, H, W, I]`
pub fn hwio_to_ohwi(filter: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>> {
    let filter = filter
        .into_dimensionality::<Ix4>()
        .map_err(|e| QuantizationError::ShapeMismatch(e.to_string()))?;
    Ok(filter
        .permuted_axes([3, 0, 1, 2])
        .as_standard_layout()
        .into_owned()
        .into_dyn())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    #[test]
    fn test_same_padding_geometry() {
        let settings = OperatorSettings::conv(1, 1);
        let geometry = settings.geometry().unwrap();
        assert_eq!(
            geometry,
            OperatorGeometry { output_width: 4, output_height: 4, pad_x: 1, pad_y: 1 }
        );

        // 10x49 input, 4x10 filter, stride (1, 2).
        let settings = OperatorSettings::conv(3, 1)
            .with_input(10, 49)
            .with_filter(4, 10)
            .with_stride(1, 2);
        let geometry = settings.geometry().unwrap();
        assert_eq!((geometry.output_width, geometry.output_height), (10, 25));
        assert_eq!((geometry.pad_x, geometry.pad_y), (1, 4));
    }

    #[test]
    fn test_valid_padding_geometry() {
        let settings = OperatorSettings::conv(3, 3)
            .with_input(5, 5)
            .with_filter(2, 3)
            .with_stride(2, 2)
            .with_padding(Padding::Valid);
        let geometry = settings.geometry().unwrap();
        assert_eq!(
            geometry,
            OperatorGeometry { output_width: 2, output_height: 2, pad_x: 0, pad_y: 0 }
        );

        let too_small = settings.with_filter(6, 1);
        assert!(too_small.geometry().is_err());
    }

    #[test]
    fn test_validation() {
        assert!(OperatorSettings::depthwise_conv(3, 9).validate().is_ok());
        assert!(OperatorSettings::depthwise_conv(3, 8).validate().is_err());
        assert!(OperatorSettings::fully_connected(10, 6, Default::default())
            .with_input(2, 1)
            .validate()
            .is_err());
        assert!(OperatorSettings::conv(1, 1).with_stride(0, 1).validate().is_err());

        let mut pool = OperatorSettings::pool(PoolKind::Max, 4);
        assert!(pool.validate().is_ok());
        pool.output_channels = 5;
        assert!(pool.validate().is_err());
    }

    #[test]
    fn test_filter_layouts() {
        let conv = OperatorSettings::conv(2, 4).with_filter(3, 1);
        assert_eq!(conv.filter_shape(), Some(vec![4, 1, 3, 2]));
        assert_eq!(conv.quantized_dimension(), Some(QuantizedDimension::Leading));

        let depthwise = OperatorSettings::depthwise_conv(3, 9).with_filter(3, 4);
        assert_eq!(depthwise.channel_multiplier(), Some(3));
        assert_eq!(depthwise.filter_shape(), Some(vec![4, 3, 3, 3]));
        assert_eq!(depthwise.quantized_dimension(), Some(QuantizedDimension::Trailing));

        assert_eq!(OperatorSettings::pool(PoolKind::Average, 8).filter_shape(), None);
    }

    #[test]
    fn test_relayout_round_trip() {
        let ohwi = Array::from_shape_vec(IxDyn(&[2, 1, 2, 3]), (0..12).map(f64::from).collect())
            .unwrap();
        let hwio = ohwi_to_hwio(ohwi.view()).unwrap();
        assert_eq!(hwio.shape(), &[1, 2, 3, 2]);
        // Element (o=1, h=0, w=1, i=2) sits at flat index 11 in OHWI.
        assert_eq!(hwio[[0, 1, 2, 1]], 11.0);
        assert_eq!(hwio_to_ohwi(hwio.view()).unwrap(), ohwi);
    }

    #[test]
    fn test_framework_filter() {
        let conv = OperatorSettings::conv(3, 2).with_filter(2, 1);
        let flat = Array::from_shape_vec(IxDyn(&[12]), (0..12).map(f64::from).collect()).unwrap();
        let hwio = conv.framework_filter(flat.view()).unwrap();
        assert_eq!(hwio.shape(), &[1, 2, 3, 2]);
        assert_eq!(hwio[[0, 0, 0, 1]], 6.0);

        let depthwise = OperatorSettings::depthwise_conv(2, 4).with_filter(1, 1);
        let flat = Array::from_shape_vec(IxDyn(&[4]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let hwim = depthwise.framework_filter(flat.view()).unwrap();
        assert_eq!(hwim.shape(), &[1, 1, 2, 2]);
        assert_eq!(hwim.iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
