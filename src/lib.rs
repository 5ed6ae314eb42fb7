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

//! Kernel Quant - fixed-point test data preparation for integer NN kernels

// Re-export the workspace crates
pub use quantization;

use anyhow::{Context, Result};
use ndarray::ArrayD;
use quantization::{
    quantize_operator, OperatorSettings, OperatorTensors, QuantizationConfig, QuantizedOperator,
};

/// Quantize one operator case with a JSON configuration document
///
/// `config_json` may be empty, in which case the default policy is used.
pub fn quantize_case(
    settings: &OperatorSettings,
    tensors: &OperatorTensors,
    config_json: &str,
) -> Result<QuantizedOperator> {
    let config = if config_json.trim().is_empty() {
        QuantizationConfig::default()
    } else {
        QuantizationConfig::from_json(config_json).context("invalid quantization config")?
    };
    tracing::info!(kind = ?settings.kind, "Processing operator case");
    quantize_operator(settings, tensors, &config)
        .with_context(|| format!("quantizing {:?} case", settings.kind))
}

/// Zero-filled float reference output with the operator's output shape
pub fn empty_reference(settings: &OperatorSettings) -> Result<ArrayD<f64>> {
    let shape = settings.output_shape()?;
    Ok(ArrayD::zeros(shape))
}
