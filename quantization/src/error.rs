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


use thiserror::Error;

/// Errors that can occur while deriving or applying quantization parameters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuantizationError {
    /// Range is empty, inverted or non-finite
    #[error("Degenerate range: min {min} must be strictly below max {max}")]
    DegenerateRange {
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },

    /// A channel's effective scale is zero
    #[error("Degenerate scale for channel {channel}")]
    DegenerateScale {
        /// Offending output channel
        channel: usize,
    },

    /// Scale table length disagrees with the channel count
    #[error("Scale table mismatch: expected {expected} channels, got {actual}")]
    ScaleTableMismatch {
        /// Entries required
        expected: usize,
        /// Entries present
        actual: usize,
    },

    /// Rounded significand left the Q31 range
    #[error("Significand {significand} does not fit a 31-bit signed encoding")]
    SignificandOverflow {
        /// The out-of-range significand
        significand: i64,
    },

    /// Scale is non-positive or non-finite
    #[error("Invalid scale: {0}")]
    InvalidScale(String),

    /// Tensor shape disagrees with the operator
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Operator settings are structurally invalid
    #[error("Invalid quantization parameters: {0}")]
    InvalidParams(String),

    /// Config could not be read or written
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for QuantizationError {
    fn from(err: serde_json::Error) -> Self {
        QuantizationError::Serialization(err.to_string())
    }
}
