// Copyright 2026 MindVPN Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # MindVPN CLI
//!
//! Command-line interface for the MindVPN control core.
//!
//! ## Key Commands
//!
//! - `mindvpn serve`: Run the control plane (dispatcher and liveness loops)
//! - `mindvpn render`: Render a preset's config files (JSON to stdout)
//! - `mindvpn validate`: Check a proxy config file, optionally with the
//!   native `xray` / `sing-box` binaries
//!
//! ## Configuration
//!
//! `serve` and `validate` layer their settings: command-line flags win over
//! `MINDVPN_*` environment variables, which win over the JSON config file,
//! which wins over built-in defaults.

pub mod commands;
