//! Writes `control_message.schema.json` from the `ControlMessage` type

use anyhow::{bail, Context, Result};
use schema::ControlMessage;
use schemars::schema_for;
use std::fs;
use std::path::Path;

const FILE_NAME: &str = "control_message.schema.json";

pub fn run(out_dir: &Path, check: bool) -> Result<()> {
    let schema = schema_for!(ControlMessage);
    let mut rendered =
        serde_json::to_string_pretty(&schema).context("Failed to serialize schema")?;
    rendered.push('\n');

    let path = out_dir.join(FILE_NAME);
    if check {
        let existing = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if existing != rendered {
            bail!("{} is out of date; run `cargo run -p xtask -- gen-schemas`", path.display());
        }
        println!("{} is up to date", path.display());
        return Ok(());
    }

    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    fs::write(&path, rendered).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}
