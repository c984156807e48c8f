use std::{
    io::{self, Write},
    path::Path,
};

use anyhow::Context;
use log::{debug, warn};
use serde::{Serialize, de::DeserializeOwned};

/// A record that can be flattened into one CSV row.
pub trait Tabular {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Json,
    Csv,
}

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

/// Write a single CSV row to any writer.
pub fn write_row<W: Write, S: AsRef<str>>(mut w: W, row: &[S]) -> io::Result<()> {
    let mut first = true;
    for cell in row {
        let cell = cell.as_ref();
        if !first {
            write!(w, ",")?;
        } else {
            first = false;
        }
        if needs_quotes(cell) {
            write!(w, "\"{}\"", cell.replace('"', "\"\""))?;
        } else {
            write!(w, "{cell}")?;
        }
    }
    writeln!(w)
}

pub fn write_csv<W: Write, T: Tabular>(mut w: W, records: &[T]) -> io::Result<()> {
    write_row(&mut w, &T::headers())?;
    for record in records {
        write_row(&mut w, &record.row())?;
    }
    Ok(())
}

pub fn to_csv_string<T: Tabular>(records: &[T]) -> String {
    let mut buf: Vec<u8> = Vec::new();
    let _ = write_csv(&mut buf, records);
    match String::from_utf8(buf) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(&e.into_bytes()).into_owned(),
    }
}

/// Pretty JSON; serde_json leaves non-ASCII text unescaped.
pub fn to_json_string<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

pub fn render<T: Serialize + Tabular>(records: &[T], format: Format) -> anyhow::Result<String> {
    match format {
        Format::Json => to_json_string(records),
        Format::Csv => Ok(to_csv_string(records)),
    }
}

pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, to_json_string(value)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    debug!("Saved {}", path.display());
    Ok(())
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring unreadable cache {}: {e}", path.display());
            None
        }
    }
}
