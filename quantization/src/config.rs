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

//! Run-wide quantization policy

use serde::{Deserialize, Serialize};

use crate::bias::DEFAULT_DEGENERATE_SCALE_EPSILON;
use crate::Result;

/// Configuration for quantization runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    /// Widening applied on both sides of the input value range
    pub input_range_margin: f64,
    /// Replace the derived output scale by 1.0, keeping the zero-point
    ///
    /// A derived scale slightly below one makes rounded outputs drift from
    /// the float reference.
    pub unit_output_scale: bool,
    /// Scale substituted for a zero bias scale
    pub degenerate_scale_epsilon: f64,
    /// Process output channels on the rayon pool
    pub parallel_channels: bool,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            input_range_margin: 1.0,
            unit_output_scale: true,
            degenerate_scale_epsilon: DEFAULT_DEGENERATE_SCALE_EPSILON,
            parallel_channels: false,
        }
    }
}

impl QuantizationConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Pretty-printed JSON form
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = QuantizationConfig::from_json(r#"{ "parallel_channels": true }"#).unwrap();
        assert!(config.parallel_channels);
        assert!(config.unit_output_scale);
        assert_eq!(config.input_range_margin, 1.0);
        assert_eq!(config.degenerate_scale_epsilon, 1e-7);
    }

    #[test]
    fn test_json_round_trip() {
        let config = QuantizationConfig {
            unit_output_scale: false,
            ..Default::default()
        };
        let parsed = QuantizationConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            QuantizationConfig::from_json("{ not json"),
            Err(crate::QuantizationError::Serialization(_))
        ));
    }
}
