//! Orphan manifest files.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// CSV listing of the rows that reference a missing target.
///
/// The header is the referencing table's key columns followed by the
/// referencing column, which is enough to look each row up again or to fetch
/// the missing target out of band.
///
/// Rows are written to `<constraint>.csv.partial` and only renamed to
/// `<constraint>.csv` by [`OrphanManifest::finish`]. A manifest dropped
/// without finishing removes its partial file.
pub struct OrphanManifest {
    writer: Option<csv::Writer<File>>,
    partial: PathBuf,
    path: PathBuf,
    rows: u64,
}

impl OrphanManifest {
    /// Start `<dir>/<constraint>.csv`. An earlier manifest stays in place
    /// until this one finishes.
    pub fn create(dir: &Path, constraint: &str, columns: &[String]) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.csv", constraint));
        let partial = dir.join(format!("{}.csv.partial", constraint));
        let mut writer = csv::Writer::from_path(&partial)?;
        writer.write_record(columns)?;
        Ok(Self {
            writer: Some(writer),
            partial,
            path,
            rows: 0,
        })
    }

    /// Append one orphaned row. NULL values are written as empty fields.
    pub fn write_row(&mut self, values: &[Option<String>]) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_record(values.iter().map(|v| v.as_deref().unwrap_or("")))?;
            self.rows += 1;
        }
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Where the manifest lands once finished.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and move the manifest into place, replacing an earlier one. A
    /// manifest without rows leaves no file and returns `None`.
    pub fn finish(mut self) -> Result<Option<PathBuf>> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        if self.rows == 0 {
            std::fs::remove_file(&self.partial)?;
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(None);
        }
        std::fs::rename(&self.partial, &self.path)?;
        Ok(Some(self.path.clone()))
    }
}

impl Drop for OrphanManifest {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            drop(writer);
            let _ = std::fs::remove_file(&self.partial);
        }
    }
}
