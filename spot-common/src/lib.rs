//  Copyright 2024 SRA Tools Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Shared building blocks for the SRA spot-assembly crates: the opaque spot key codec,
//! the typed error taxonomy, and metric handles.

pub mod error;
pub mod key;
pub mod metrics;

pub use error::{ErrorCounters, LoaderError, Result};
pub use key::{KeyCodec, SpotKey, DEFAULT_GROUP_BITS};
