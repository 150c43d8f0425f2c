//! Skip marker handling
//!
//! A step may ask the executor to jump ahead by writing `skip.json` into the
//! workspace root. The marker is consumed on read.

use serde::Deserialize;
use std::io;
use std::path::Path;

/// Name of the marker file inside the workspace
pub const SKIP_FILE: &str = "skip.json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SkipMarker {
    next_step: String,
}

/// Reads and deletes the skip marker in `dir`
///
/// # Returns
/// The key of the step to jump to, or an empty string when no marker exists
pub fn next_step(dir: &Path) -> io::Result<String> {
    let path = dir.join(SKIP_FILE);

    let contents = match std::fs::read(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };

    std::fs::remove_file(&path)?;

    let marker: SkipMarker = serde_json::from_slice(&contents)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(marker.next_step)
}
