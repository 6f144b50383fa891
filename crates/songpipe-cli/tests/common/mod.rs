#![allow(dead_code)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// One tab-separated line in the 20-column song layout.
pub fn tsv_row(artist: &str, title: &str, tempo: &str, time_signature: &str, year: &str) -> String {
    let mut fields = vec![""; 20];
    fields[0] = "AR0001";
    fields[4] = artist;
    fields[14] = tempo;
    fields[15] = time_signature;
    fields[17] = title;
    fields[18] = year;
    fields.join("\t")
}

pub fn write_tsv(path: &Path, rows: &[String]) -> TestResult {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut text = rows.join("\n");
    text.push('\n');
    std::fs::write(path, text)?;
    Ok(())
}

pub struct Dirs {
    pub source: PathBuf,
    pub table: PathBuf,
    pub checkpoint: PathBuf,
}

impl Dirs {
    pub fn new(tmp: &TempDir) -> TestResult<Self> {
        let dirs = Dirs {
            source: tmp.path().join("source"),
            table: tmp.path().join("output").join("songs"),
            checkpoint: tmp.path().join("output").join("_checkpoint"),
        };
        std::fs::create_dir_all(&dirs.source)?;
        Ok(dirs)
    }

    pub fn source_arg(&self) -> String {
        self.source.to_string_lossy().to_string()
    }

    pub fn table_arg(&self) -> String {
        self.table.to_string_lossy().to_string()
    }

    pub fn checkpoint_arg(&self) -> String {
        self.checkpoint.to_string_lossy().to_string()
    }
}
