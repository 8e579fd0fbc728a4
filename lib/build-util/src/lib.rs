// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Small helpers shared by the workspace's `build.rs` scripts.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Reads an environment variable, registering it with Cargo so the build
/// reruns if the variable changes.
pub fn env_var(name: &str) -> Result<String> {
    println!("cargo:rerun-if-env-changed={name}");
    env::var(name).with_context(|| format!("reading env var {name}"))
}

/// The directory a build script should write generated sources into.
pub fn out_dir() -> PathBuf {
    PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is always set for build scripts"))
}
