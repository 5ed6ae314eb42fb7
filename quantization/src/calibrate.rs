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

//! Scale and zero-point derivation from a value range

use tracing::debug;

use crate::types::{AffineQuantizationParams, IntegerType, QuantizationRange};
use crate::{QuantizationError, Result};

/// Step size that spreads `range` over every level of `ty`
pub fn derive_scale(range: &QuantizationRange, ty: IntegerType) -> f64 {
    (range.max() - range.min()) / (ty.max() - ty.min()) as f64
}

/// Compute asymmetric affine parameters mapping `range` onto `ty`
///
/// The zero-point is `INT_MIN + round(-min / scale)` with halves rounded away
/// from zero. It is clamped into `[INT_MIN, -INT_MIN]` and then into the
/// type's representable range, so a range lying entirely above or below zero
/// still yields a storable zero-point.
pub fn derive_scale_and_zero_point(
    range: &QuantizationRange,
    ty: IntegerType,
) -> Result<AffineQuantizationParams> {
    let scale = derive_scale(range, ty);
    if !(scale.is_finite() && scale > 0.0) {
        return Err(QuantizationError::DegenerateRange {
            min: range.min(),
            max: range.max(),
        });
    }

    let offset = (-range.min() / scale).round() as i64;
    let zero_point = ty.min().saturating_add(offset).clamp(ty.min(), -ty.min());
    let zero_point = ty.clamp(zero_point) as i32;

    debug!(
        min = range.min(),
        max = range.max(),
        scale,
        zero_point,
        "derived affine parameters"
    );
    AffineQuantizationParams::new(scale, zero_point)
}

/// Shorthand for the common signed 8-bit activation case
pub fn derive_i8_params(min: f64, max: f64) -> Result<AffineQuantizationParams> {
    derive_scale_and_zero_point(&QuantizationRange::new(min, max)?, IntegerType::I8)
}
