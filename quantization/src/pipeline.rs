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

//! One quantization run over the tensors of a single operator

use ndarray::{Array1, ArrayD};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::bias::{quantize_fully_connected_bias, PerChannelBiasQuantizer};
use crate::calibrate::derive_scale_and_zero_point;
use crate::config::QuantizationConfig;
use crate::filter::PerChannelFilterQuantizer;
use crate::multiplier::{fully_connected_multiplier, MultiplierTableBuilder};
use crate::operator::{FullyConnectedParams, OperatorGeometry, OperatorKind, OperatorSettings};
use crate::quantize::{AffineQuantizer, Quantizer};
use crate::types::{
    AffineQuantizationParams, IntegerType, MultiplierTable, PerChannelScaleTable,
    QuantizationRange, QuantizedTensor,
};
use crate::{QuantizationError, Result};

/// Floating-point tensors of one operator case
///
/// `output_reference` is the float result computed by an external reference
/// implementation; it is quantized, never recomputed.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorTensors {
    /// `[batches, height, width, input_channels]`
    pub input: ArrayD<f64>,
    /// Kernel-layout filter, see [`OperatorSettings::filter_shape`]
    pub filter: Option<ArrayD<f64>>,
    /// One bias per output channel, absent for pooling
    pub bias: Option<Array1<f64>>,
    /// `[batches, output_height, output_width, output_channels]`
    pub output_reference: ArrayD<f64>,
}

/// Window parameters shared by convolution and pooling kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window columns
    pub filter_x: usize,
    /// Window rows
    pub filter_y: usize,
    /// Horizontal stride
    pub stride_x: usize,
    /// Vertical stride
    pub stride_y: usize,
    /// Left padding
    pub pad_x: usize,
    /// Top padding
    pub pad_y: usize,
    /// Output columns
    pub output_w: usize,
    /// Output rows
    pub output_h: usize,
}

/// Per-tensor requantization values of a fully-connected kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullyConnectedConfig {
    /// Weight zero-point
    pub weights_offset: i32,
    /// Q31 output multiplier
    pub output_multiplier: i32,
    /// Output shift
    pub output_shift: i32,
    /// Inputs summed per output
    pub accumulation_depth: usize,
}

/// Scalar configuration an integer kernel test needs next to its tensors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Output channels
    pub out_ch: usize,
    /// Input channels
    pub in_ch: usize,
    /// Input columns
    pub input_w: usize,
    /// Input rows
    pub input_h: usize,
    /// Elements in the quantized output reference
    pub dst_size: usize,
    /// Elements in one input batch for pooling, in the whole input otherwise
    pub input_size: usize,
    /// Negated input zero-point
    pub input_offset: i32,
    /// Output zero-point
    pub output_offset: i32,
    /// Lower activation clamp
    pub out_activation_min: i32,
    /// Upper activation clamp
    pub out_activation_max: i32,
    /// Batch count
    pub input_batches: usize,
    /// Set for convolutions and pooling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowConfig>,
    /// Set for depthwise convolutions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ch_mult: Option<usize>,
    /// Set for fully connected layers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fully_connected: Option<FullyConnectedConfig>,
}

/// Everything one quantization run produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedOperator {
    /// Parameters of the 8-bit input
    pub input_params: AffineQuantizationParams,
    /// Parameters of the 8-bit output
    pub output_params: AffineQuantizationParams,
    /// Output size and padding
    pub geometry: OperatorGeometry,
    /// Quantized input
    pub input: QuantizedTensor<i8>,
    /// Quantized filter in kernel layout
    pub filter: Option<QuantizedTensor<i8>>,
    /// Filter scale of every output channel
    pub filter_scales: Option<PerChannelScaleTable>,
    /// Quantized bias
    pub bias: Option<QuantizedTensor<i32>>,
    /// Per-channel for convolutions, a single entry for fully connected
    pub multipliers: Option<MultiplierTable>,
    /// Quantized reference output
    pub output_reference: QuantizedTensor<i8>,
    /// Scalar kernel configuration
    pub config: KernelConfig,
}

struct FilterStage {
    filter: QuantizedTensor<i8>,
    scales: Option<PerChannelScaleTable>,
    bias: QuantizedTensor<i32>,
    multipliers: MultiplierTable,
}

/// Input and output activation parameters of a windowed operator
///
/// The input range is the value range widened by the configured margin.
pub fn activation_params(
    settings: &OperatorSettings,
    config: &QuantizationConfig,
) -> Result<(AffineQuantizationParams, AffineQuantizationParams)> {
    let (min, max) = settings.value_range;
    let input_range = QuantizationRange::new(min, max)?.widened(config.input_range_margin)?;
    let input = derive_scale_and_zero_point(&input_range, IntegerType::I8)?;

    let (min, max) = settings.output_range;
    let mut output = derive_scale_and_zero_point(&QuantizationRange::new(min, max)?, IntegerType::I8)?;
    if config.unit_output_scale {
        output.scale = 1.0;
    }
    Ok((input, output))
}

/// Quantize all tensors of one operator and derive its kernel configuration
#[instrument(skip(settings, tensors, config), fields(kind = ?settings.kind))]
pub fn quantize_operator(
    settings: &OperatorSettings,
    tensors: &OperatorTensors,
    config: &QuantizationConfig,
) -> Result<QuantizedOperator> {
    settings.validate()?;
    let geometry = settings.geometry()?;
    check_shape("input", tensors.input.shape(), &settings.input_shape())?;
    check_shape(
        "output reference",
        tensors.output_reference.shape(),
        &settings.output_shape()?,
    )?;

    let (input_params, output_params) = match settings.kind {
        OperatorKind::FullyConnected(fc) => (
            AffineQuantizationParams::new(fc.input_scale, fc.input_zero_point)?,
            AffineQuantizationParams::new(fc.output_scale, fc.output_zero_point)?,
        ),
        _ => activation_params(settings, config)?,
    };
    debug!(?input_params, ?output_params, "activation parameters fixed");

    let input = AffineQuantizer::new(input_params).quantize(tensors.input.view())?;

    let stage = match settings.kind {
        OperatorKind::Conv | OperatorKind::DepthwiseConv => {
            Some(per_channel_stage(settings, tensors, config, &input_params, &output_params)?)
        }
        OperatorKind::FullyConnected(fc) => Some(fully_connected_stage(settings, tensors, &fc)?),
        OperatorKind::Pool { .. } => None,
    };

    let output_reference =
        AffineQuantizer::new(output_params).quantize(tensors.output_reference.view())?;

    let fully_connected = match (settings.kind, &stage) {
        (OperatorKind::FullyConnected(fc), Some(stage)) => {
            let pair = stage.multipliers.get(0).ok_or_else(|| {
                QuantizationError::InvalidParams("missing fully connected multiplier".to_string())
            })?;
            Some(FullyConnectedConfig {
                weights_offset: -fc.weights_zero_point,
                output_multiplier: pair.significand,
                output_shift: pair.shift,
                accumulation_depth: settings.input_channels
                    * settings.input_width
                    * settings.input_height,
            })
        }
        _ => None,
    };
    let window = match settings.kind {
        OperatorKind::FullyConnected(_) => None,
        _ => Some(WindowConfig {
            filter_x: settings.filter_width,
            filter_y: settings.filter_height,
            stride_x: settings.stride_x,
            stride_y: settings.stride_y,
            pad_x: geometry.pad_x,
            pad_y: geometry.pad_y,
            output_w: geometry.output_width,
            output_h: geometry.output_height,
        }),
    };

    let config = KernelConfig {
        out_ch: settings.output_channels,
        in_ch: settings.input_channels,
        input_w: settings.input_width,
        input_h: settings.input_height,
        dst_size: geometry.output_width
            * geometry.output_height
            * settings.output_channels
            * settings.batches,
        input_size: settings.input_width * settings.input_height * settings.input_channels,
        input_offset: -input_params.zero_point,
        output_offset: output_params.zero_point,
        out_activation_min: IntegerType::I8.min() as i32,
        out_activation_max: IntegerType::I8.max() as i32,
        input_batches: settings.batches,
        window,
        ch_mult: settings.channel_multiplier(),
        fully_connected,
    };

    info!(
        input_elements = input.len(),
        output_elements = output_reference.len(),
        "quantized operator"
    );

    let (filter, filter_scales, bias, multipliers) = match stage {
        Some(stage) => (
            Some(stage.filter),
            stage.scales,
            Some(stage.bias),
            Some(stage.multipliers),
        ),
        None => (None, None, None, None),
    };
    Ok(QuantizedOperator {
        input_params,
        output_params,
        geometry,
        input,
        filter,
        filter_scales,
        bias,
        multipliers,
        output_reference,
        config,
    })
}

fn per_channel_stage(
    settings: &OperatorSettings,
    tensors: &OperatorTensors,
    config: &QuantizationConfig,
    input_params: &AffineQuantizationParams,
    output_params: &AffineQuantizationParams,
) -> Result<FilterStage> {
    let (filter, bias) = filter_and_bias(settings, tensors)?;
    let dimension = settings.quantized_dimension().ok_or_else(|| {
        QuantizationError::InvalidParams("operator has no per-channel filter".to_string())
    })?;
    let channels = settings.output_channels;

    let quantized = PerChannelFilterQuantizer::new(channels, dimension)
        .parallel(config.parallel_channels)
        .quantize(filter.view())?;

    let bias_values: Vec<f64> = bias.iter().copied().collect();
    let bias = PerChannelBiasQuantizer::new(input_params.scale)?
        .with_epsilon(config.degenerate_scale_epsilon)
        .parallel(config.parallel_channels)
        .quantize(&bias_values, &quantized.scales)?;

    let multipliers = MultiplierTableBuilder::new(input_params.scale, output_params.scale)?
        .parallel(config.parallel_channels)
        .build(&quantized.scales, channels)?;

    Ok(FilterStage {
        filter: quantized.tensor,
        scales: Some(quantized.scales),
        bias,
        multipliers,
    })
}

fn fully_connected_stage(
    settings: &OperatorSettings,
    tensors: &OperatorTensors,
    fc: &FullyConnectedParams,
) -> Result<FilterStage> {
    let (weights, bias) = filter_and_bias(settings, tensors)?;
    let weights_params = AffineQuantizationParams::new(fc.weights_scale, fc.weights_zero_point)?;
    let filter = AffineQuantizer::new(weights_params).quantize(weights.view())?;
    let bias = quantize_fully_connected_bias(bias.view().into_dyn(), fc.bias_scale)?;
    let pair = fully_connected_multiplier(fc.input_scale, fc.weights_scale, fc.output_scale)?;

    Ok(FilterStage {
        filter,
        scales: None,
        bias,
        multipliers: std::iter::once(pair).collect(),
    })
}

fn filter_and_bias<'a>(
    settings: &OperatorSettings,
    tensors: &'a OperatorTensors,
) -> Result<(&'a ArrayD<f64>, &'a Array1<f64>)> {
    let filter = tensors
        .filter
        .as_ref()
        .ok_or_else(|| QuantizationError::InvalidParams("filter tensor required".to_string()))?;
    let bias = tensors
        .bias
        .as_ref()
        .ok_or_else(|| QuantizationError::InvalidParams("bias tensor required".to_string()))?;

    let expected: usize = settings.filter_shape().map_or(0, |shape| shape.iter().product());
    if filter.len() != expected {
        return Err(QuantizationError::ShapeMismatch(format!(
            "filter has {} elements, expected {:?}",
            filter.len(),
            settings.filter_shape()
        )));
    }
    check_shape("bias", bias.shape(), &[settings.output_channels])?;
    Ok((filter, bias))
}

fn check_shape(name: &str, actual: &[usize], expected: &[usize]) -> Result<()> {
    if actual != expected {
        return Err(QuantizationError::ShapeMismatch(format!(
            "{name} shape {actual:?} does not match {expected:?}"
        )));
    }
    Ok(())
}
