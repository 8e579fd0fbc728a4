// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::io::Write;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let out = build_util::out_dir();
    let mut ver_file = File::create(out.join("consts.rs"))?;

    let version: u32 = build_util::env_var("LOADER_BUILD_VERSION")?.parse()?;
    let epoch: u32 = build_util::env_var("LOADER_BUILD_EPOCH")?.parse()?;

    writeln!(ver_file, "pub const LOADER_BUILD_VERSION: u32 = {version};")?;
    writeln!(ver_file, "pub const LOADER_BUILD_EPOCH: u32 = {epoch};")?;

    Ok(())
}
