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

//! Quantize a small convolution case end to end

use ndarray::{Array, Array1, IxDyn};
use quantization::prelude::*;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = OperatorSettings::conv(2, 3)
        .with_input(3, 3)
        .with_filter(2, 2)
        .with_stride(1, 1)
        .with_padding(Padding::Valid)
        .with_value_range(-2.0, 2.0);

    let input_len: usize = settings.input_shape().iter().product();
    let filter_shape = settings
        .filter_shape()
        .ok_or_else(|| anyhow::anyhow!("convolution without a filter"))?;
    let filter_len: usize = filter_shape.iter().product();
    let output_shape = settings.output_shape()?;

    // Deterministic stand-ins for generated data and the float reference.
    let input = Array::from_shape_vec(
        IxDyn(&settings.input_shape()),
        (0..input_len).map(|i| (i % 5) as f64 - 2.0).collect(),
    )?;
    let filter = Array::from_shape_vec(
        IxDyn(&filter_shape),
        (0..filter_len).map(|i| (i % 7) as f64 - 3.0).collect(),
    )?;
    let bias = Array1::from(vec![1.0, -2.0, 0.5]);
    let output_reference = Array::from_elem(IxDyn(&output_shape), 3.0);

    let tensors = OperatorTensors {
        input,
        filter: Some(filter),
        bias: Some(bias),
        output_reference,
    };
    let result = quantize_operator(&settings, &tensors, &QuantizationConfig::default())?;

    println!("Input params: {:?}", result.input_params);
    println!("Quantized input (int8): {:?}", result.input.data);
    if let Some(filter) = &result.filter {
        println!("Quantized weights (int8): {:?}", filter.data);
    }
    if let Some(scales) = &result.filter_scales {
        println!("Per-channel scales: {:?}", scales.as_slice());
    }
    if let Some(bias) = &result.bias {
        println!("Quantized biases (int32): {:?}", bias.data);
    }
    if let Some(table) = &result.multipliers {
        println!("Output multipliers: {:?}", table.multipliers);
        println!("Output shifts: {:?}", table.shifts);
    }
    println!("Kernel config:\n{}", serde_json::to_string_pretty(&result.config)?);

    Ok(())
}
