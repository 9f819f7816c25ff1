//! Recovery-point checkpoint file.
//!
//! Format, one value per line:
//!
//! ```text
//! 0                  version
//! 1                  entry count
//! 0 <offset>         <partition> <offset>
//! ```
//!
//! The journal is single-partition, so exactly one entry is ever written.
//! The file is replaced atomically (temp file, fsync, rename) so a crash
//! mid-write leaves the previous checkpoint intact.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use tracing::warn;

use crate::error::Result;

const VERSION: u64 = 0;
const PARTITION: u32 = 0;

pub(crate) fn write(path: &Path, recovery_point: u64) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        writeln!(tmp, "{VERSION}")?;
        writeln!(tmp, "1")?;
        writeln!(tmp, "{PARTITION} {recovery_point}")?;
        tmp.flush()?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Reads the checkpointed recovery point, tolerating a missing or mangled
/// file (recovery then falls back to scanning).
pub(crate) fn read(path: &Path) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    let mut lines = contents.lines();

    let version: u64 = lines.next()?.trim().parse().ok()?;
    if version != VERSION {
        warn!(
            "unsupported checkpoint version {version} in {}, ignoring",
            path.display()
        );
        return None;
    }
    let count: usize = lines.next()?.trim().parse().ok()?;
    for line in lines.take(count) {
        let mut fields = line.split_whitespace();
        let partition: u32 = fields.next()?.parse().ok()?;
        let offset: u64 = fields.next()?.parse().ok()?;
        if partition == PARTITION {
            return Some(offset);
        }
    }
    None
}
