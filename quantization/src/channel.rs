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

//! Per-channel work distribution

use rayon::prelude::*;

use crate::Result;

/// Run `f` once per channel and collect the results in channel order
///
/// With `parallel` set the channels are spread over the rayon pool; the
/// returned vector is indexed by channel either way.
pub(crate) fn map_channels<T, F>(count: usize, parallel: bool, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> Result<T> + Sync + Send,
{
    if parallel {
        (0..count).into_par_iter().map(f).collect()
    } else {
        (0..count).map(f).collect()
    }
}
