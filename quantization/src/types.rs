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

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Index;

use crate::{QuantizationError, Result};

/// Target integer element type of a quantized tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntegerType {
    /// Signed 8-bit
    I8,
    /// Signed 16-bit
    I16,
    /// Signed 32-bit
    I32,
}

impl IntegerType {
    /// Lowest value a quantized element may take
    pub const fn min(self) -> i64 {
        match self {
            Self::I8 => -128,
            Self::I16 => i16::MIN as i64,
            Self::I32 => i32::MIN as i64,
        }
    }

    /// Highest value a quantized element may take
    pub const fn max(self) -> i64 {
        match self {
            Self::I8 => 127,
            Self::I16 => i16::MAX as i64,
            Self::I32 => i32::MAX as i64,
        }
    }

    /// Clamp an integer into this type's range
    pub fn clamp(self, value: i64) -> i64 {
        value.clamp(self.min(), self.max())
    }
}

impl fmt::Display for IntegerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegerType::I8 => write!(f, "i8"),
            IntegerType::I16 => write!(f, "i16"),
            IntegerType::I32 => write!(f, "i32"),
        }
    }
}

/// Closed floating-point interval a tensor's values are expected to fall in
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationRange {
    min: f64,
    max: f64,
}

impl QuantizationRange {
    /// Create a range, rejecting empty, inverted and non-finite bounds
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !(min.is_finite() && max.is_finite()) || min >= max {
            return Err(QuantizationError::DegenerateRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// Observed range of a set of values
    pub fn from_values<'a, I>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a f64>,
    {
        let (min, max) = values
            .into_iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), &x| {
                (min.min(x), max.max(x))
            });
        Self::new(min, max)
    }

    /// Grow the range by `margin` on both sides
    pub fn widened(&self, margin: f64) -> Result<Self> {
        Self::new(self.min - margin, self.max + margin)
    }

    /// Lower bound
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Upper bound
    pub fn max(&self) -> f64 {
        self.max
    }
}

/// Scale and zero-point of an affine mapping `real = (q - zero_point) * scale`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineQuantizationParams {
    /// Real-valued width of one quantization step
    pub scale: f64,
    /// Integer that real zero maps to
    pub zero_point: i32,
}

impl AffineQuantizationParams {
    /// Create parameters, rejecting non-positive or non-finite scales
    pub fn new(scale: f64, zero_point: i32) -> Result<Self> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(QuantizationError::InvalidScale(format!(
                "affine scale must be positive and finite, got {scale}"
            )));
        }
        Ok(Self { scale, zero_point })
    }
}

impl Default for AffineQuantizationParams {
    fn default() -> Self {
        Self {
            scale: 1.0,
            zero_point: 0,
        }
    }
}

/// Fixed-point form of a real multiplier: `significand * 2^(shift - 31)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuantizedMultiplier {
    /// Q31 significand in `[2^30, 2^31)`, or zero
    pub significand: i32,
    /// Power-of-two exponent; negative values shift right
    pub shift: i32,
}

impl QuantizedMultiplier {
    /// The real value this pair stands for
    pub fn to_f64(self) -> f64 {
        f64::from(self.significand) * 2f64.powi(self.shift - 31)
    }
}

/// One scale per output channel, indexed by channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerChannelScaleTable(Vec<f64>);

impl PerChannelScaleTable {
    /// Wrap one scale per channel
    pub fn new(scales: Vec<f64>) -> Self {
        Self(scales)
    }

    /// Number of channels
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the table has no channels
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Scales in channel order
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Iterate scales in channel order
    pub fn iter(&self) -> std::slice::Iter<'_, f64> {
        self.0.iter()
    }

    /// Unwrap into the underlying vector
    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl Index<usize> for PerChannelScaleTable {
    type Output = f64;

    fn index(&self, channel: usize) -> &f64 {
        &self.0[channel]
    }
}

impl From<Vec<f64>> for PerChannelScaleTable {
    fn from(scales: Vec<f64>) -> Self {
        Self(scales)
    }
}

/// Parallel multiplier and shift sequences, indexed by output channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplierTable {
    /// Q31 significands
    pub multipliers: Vec<i32>,
    /// Power-of-two shifts
    pub shifts: Vec<i32>,
}

impl MultiplierTable {
    /// Number of channels
    pub fn len(&self) -> usize {
        self.multipliers.len()
    }

    /// True when the table has no channels
    pub fn is_empty(&self) -> bool {
        self.multipliers.is_empty()
    }

    /// The pair used for `channel`, if it exists
    pub fn get(&self, channel: usize) -> Option<QuantizedMultiplier> {
        Some(QuantizedMultiplier {
            significand: *self.multipliers.get(channel)?,
            shift: *self.shifts.get(channel)?,
        })
    }
}

impl FromIterator<QuantizedMultiplier> for MultiplierTable {
    fn from_iter<I: IntoIterator<Item = QuantizedMultiplier>>(iter: I) -> Self {
        let (multipliers, shifts) = iter
            .into_iter()
            .map(|m| (m.significand, m.shift))
            .unzip();
        Self {
            multipliers,
            shifts,
        }
    }
}

/// A quantized tensor with the shape of its floating-point source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedTensor<T> {
    /// Elements in row-major order
    pub data: Vec<T>,
    /// Dimensions of the source tensor
    pub shape: Vec<usize>,
}

impl<T> QuantizedTensor<T> {
    /// Create a new quantized tensor
    pub fn new(data: Vec<T>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(QuantizationError::ShapeMismatch(format!(
                "{} elements do not fill shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self { data, shape })
    }

    /// Get the total number of elements in the tensor
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the tensor is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the tensor's shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
}

impl<T: Copy + Into<i64>> QuantizedTensor<T> {
    /// Dequantize the tensor back to f64 using affine parameters
    pub fn dequantize(&self, params: &AffineQuantizationParams) -> Result<ArrayD<f64>> {
        let values = self
            .data
            .iter()
            .map(|&q| crate::quantize::dequantize(q.into(), params))
            .collect();
        ArrayD::from_shape_vec(IxDyn(&self.shape), values)
            .map_err(|e| QuantizationError::ShapeMismatch(e.to_string()))
    }
}
