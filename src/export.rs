//! CSV output with header-aware append.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::aggregate::{Cell, Table};
use crate::error::{persistence_conflict, TaskResult};

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn line(fields: impl Iterator<Item = String>) -> String {
    fields.map(|f| escape(&f)).collect::<Vec<_>>().join(",")
}

fn header_line(table: &Table) -> String {
    line(table.columns.iter().cloned())
}

fn row_line(row: &[Cell]) -> String {
    line(row.iter().map(Cell::to_string))
}

/// Appends `table` to the CSV at `path`. A new or empty file gets the header
/// first; an existing file must carry the identical header. Returns the
/// number of rows written.
pub fn append_csv(path: &Path, table: &Table) -> TaskResult<usize> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let header = header_line(table);
    let existing = match fs::File::open(path) {
        Ok(file) => {
            let mut first = String::new();
            BufReader::new(file).read_line(&mut first)?;
            Some(first.trim_end_matches(['\n', '\r']).to_string())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(err.into()),
    };

    let write_header = match existing.as_deref() {
        None | Some("") => true,
        Some(found) if found == header => false,
        Some(found) => {
            return Err(persistence_conflict(format!(
                "{} has header [{}], expected [{}]",
                path.display(),
                found,
                header
            )))
        }
    };

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut out = BufWriter::new(file);
    if write_header {
        writeln!(out, "{}", header)?;
    }
    for row in &table.rows {
        writeln!(out, "{}", row_line(row))?;
    }
    out.flush()?;
    Ok(table.rows.len())
}
