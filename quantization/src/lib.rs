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

//! Quantization parameters for integer inference kernels
//!
//! This crate derives scales, zero-points and per-channel (multiplier, shift)
//! pairs for convolution, depthwise convolution, pooling and fully-connected
//! operators, and applies them to turn floating-point tensors into the
//! fixed-point data an integer-only kernel consumes. Every rounding and
//! clamping step is part of the numeric contract with that kernel.

#![warn(missing_docs)]
#![allow(clippy::needless_doctest_main)]

pub mod bias;
pub mod calibrate;
mod channel;
pub mod config;
pub mod error;
pub mod filter;
pub mod multiplier;
pub mod operator;
pub mod pipeline;
pub mod quantize;
pub mod types;

pub use bias::{quantize_fully_connected_bias, PerChannelBiasQuantizer};
pub use calibrate::{derive_i8_params, derive_scale_and_zero_point};
pub use config::QuantizationConfig;
pub use error::QuantizationError;
pub use filter::{PerChannelFilterQuantizer, QuantizedDimension, QuantizedFilter};
pub use multiplier::{
    multiply_by_quantized_multiplier, quantize_multiplier, MultiplierTableBuilder,
};
pub use operator::{
    FullyConnectedParams, OperatorGeometry, OperatorKind, OperatorSettings, Padding, PoolKind,
};
pub use pipeline::{quantize_operator, KernelConfig, OperatorTensors, QuantizedOperator};
pub use quantize::{AccumulatorQuantizer, AffineQuantizer, Quantizer};
pub use types::{
    AffineQuantizationParams, IntegerType, MultiplierTable, PerChannelScaleTable,
    QuantizationRange, QuantizedMultiplier, QuantizedTensor,
};

/// Result type for quantization operations
pub type Result<T> = std::result::Result<T, QuantizationError>;

/// Re-export common types for convenience
pub mod prelude {
    pub use super::{
        quantize_multiplier, quantize_operator, AffineQuantizationParams, AffineQuantizer,
        IntegerType, MultiplierTableBuilder, OperatorKind, OperatorSettings, OperatorTensors,
        Padding, PerChannelBiasQuantizer, PerChannelFilterQuantizer, PerChannelScaleTable,
        PoolKind, QuantizationConfig, QuantizationError, QuantizationRange, QuantizedDimension,
        QuantizedMultiplier, QuantizedOperator, QuantizedTensor, Quantizer, Result,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_single_channel_end_to_end() -> Result<()> {
        let input = derive_i8_params(-7.0, 7.0)?;
        let output_scale = 1.0;

        let filter = array![-4.0, -2.0, 0.0, 2.0, 4.0].into_dyn();
        let quantized = PerChannelFilterQuantizer::new(1, QuantizedDimension::Leading)
            .quantize(filter.view())?;
        assert_relative_eq!(quantized.scales[0], 4.0 / 127.0);

        let table = MultiplierTableBuilder::new(input.scale, output_scale)?
            .build(&quantized.scales, 1)?;
        let pair = table.get(0).unwrap();
        let expected = input.scale * quantized.scales[0] / output_scale;
        assert!((pair.to_f64() - expected).abs() / expected < 1e-6);

        Ok(())
    }
}
