//! Per-module JSON Lines output

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::flatten::FlatRow;

/// Output file for `module` in `dir`, e.g. `out/Contacts_20250101_093000.jsonl`.
pub fn module_path(dir: &Path, module: &str, timestamp: &str) -> PathBuf {
    dir.join(format!("{module}_{timestamp}.jsonl"))
}

/// Write `rows` as one JSON object per line, creating `dir` if needed.
///
/// Returns the path written.
pub fn write_module(
    dir: &Path,
    module: &str,
    timestamp: &str,
    rows: &[FlatRow],
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Export(format!("creating {}: {e}", dir.display())))?;

    let path = module_path(dir, module, timestamp);
    let file = File::create(&path)
        .map_err(|e| Error::Export(format!("creating {}: {e}", path.display())))?;
    let mut out = BufWriter::new(file);

    for row in rows {
        serde_json::to_writer(&mut out, row)
            .map_err(|e| Error::Export(format!("writing {}: {e}", path.display())))?;
        out.write_all(b"\n")
            .map_err(|e| Error::Export(format!("writing {}: {e}", path.display())))?;
    }
    out.flush()
        .map_err(|e| Error::Export(format!("flushing {}: {e}", path.display())))?;

    Ok(path)
}
