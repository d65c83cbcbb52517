//! Header-plus-rows CSV codec (comma-delimited, UTF-8).

use std::path::Path;

use crate::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    /// Rows re-ordered onto `header` by column name; absent columns read as empty.
    pub fn project(&self, header: &[String]) -> Vec<Vec<String>> {
        let indices: Vec<Option<usize>> = header.iter().map(|h| self.column(h)).collect();
        self.rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|idx| idx.and_then(|i| row.get(i)).cloned().unwrap_or_default())
                    .collect()
            })
            .collect()
    }
}

/// Parse a whole file. A zero-byte file is an empty table; ragged rows are malformed.
pub fn parse_table(path: &Path, bytes: &[u8]) -> Result<Table, StoreError> {
    if bytes.is_empty() {
        return Ok(Table::default());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes);

    let header = reader
        .headers()
        .map_err(|e| StoreError::malformed(path, e))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| StoreError::malformed(path, e))?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    Ok(Table { header, rows })
}

pub fn encode_rows<H, I>(header: &[H], rows: I) -> Result<Vec<u8>, csv::Error>
where
    H: AsRef<str>,
    I: IntoIterator<Item = Vec<String>>,
{
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    if !header.is_empty() {
        writer.write_record(header.iter().map(|h| h.as_ref()))?;
    }
    for row in rows {
        writer.write_record(&row)?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}
