use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tracing::debug;

use crate::database::{
    postgres::{
        client::{PostgresError, StagingTransaction},
        encodings::{get_postgres_encoding, EncodingNotSupported},
        table::Table,
    },
    sql_type_wrapper::SqlValue,
};

#[derive(thiserror::Error, Debug)]
pub enum CopyError {
    #[error("{0}")]
    EncodingNotSupported(#[from] EncodingNotSupported),

    #[error("Record {row} has {found} values but {expected} columns were expected")]
    InvalidRecord { row: usize, expected: usize, found: usize },

    #[error("Copy failed: {0}")]
    Postgres(#[from] PostgresError),
}

fn default_delimiter() -> char {
    ','
}

fn default_encoding() -> String {
    "utf8".to_string()
}

fn default_header() -> bool {
    true
}

fn default_quote_char() -> char {
    '"'
}

fn default_escape_char() -> char {
    '\\'
}

/// How the delimited stream is laid out. Defaults describe a comma separated
/// utf8 file with a header row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyOptions {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    #[serde(default = "default_encoding")]
    pub encoding: String,

    #[serde(default)]
    pub null_str: String,

    #[serde(default = "default_header")]
    pub header: bool,

    #[serde(default = "default_quote_char")]
    pub quote_char: char,

    #[serde(default = "default_escape_char")]
    pub escape_char: char,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_not_null: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_null: Option<Vec<String>>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        CopyOptions {
            delimiter: default_delimiter(),
            encoding: default_encoding(),
            null_str: String::new(),
            header: default_header(),
            quote_char: default_quote_char(),
            escape_char: default_escape_char(),
            force_not_null: None,
            force_null: None,
        }
    }
}

fn format_force_not_null(column_names: &[String]) -> String {
    format!("FORCE_NOT_NULL ({})", column_names.join(", "))
}

fn format_force_null(column_names: &[String]) -> String {
    format!("FORCE_NULL ({})", column_names.join(", "))
}

/// Renders the `COPY ... FROM STDIN` directive for a CSV stream into `table_name`.
///
/// The HEADER token is only present when `options.header` is set; empty force
/// lists are left out.
pub fn copy_from_csv_sql(
    table_name: &str,
    options: &CopyOptions,
) -> Result<String, EncodingNotSupported> {
    let mut copy_options = vec![
        format!("DELIMITER '{}'", options.delimiter),
        format!("NULL '{}'", options.null_str),
    ];

    if options.header {
        copy_options.push("HEADER".to_string());
    }

    copy_options.push(format!("QUOTE '{}'", options.quote_char));
    copy_options.push(format!("ESCAPE '{}'", options.escape_char));

    if let Some(columns) = options.force_not_null.as_deref().filter(|c| !c.is_empty()) {
        copy_options.push(format_force_not_null(columns));
    }

    if let Some(columns) = options.force_null.as_deref().filter(|c| !c.is_empty()) {
        copy_options.push(format_force_null(columns));
    }

    let encoding = get_postgres_encoding(&options.encoding)?;
    copy_options.push(format!("ENCODING '{}'", encoding));

    Ok(format!(
        "COPY {} FROM STDIN\n  WITH (\n    FORMAT CSV,\n    {})",
        table_name,
        copy_options.join(",\n    ")
    ))
}

fn push_quoted(buffer: &mut BytesMut, value: &str, options: &CopyOptions) {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push(options.quote_char);
    for c in value.chars() {
        if c == options.quote_char || (c == options.escape_char && c != options.quote_char) {
            quoted.push(options.escape_char);
        }
        quoted.push(c);
    }
    quoted.push(options.quote_char);

    buffer.put_slice(quoted.as_bytes());
}

/// Encodes records as CSV rows for a COPY described by `options`.
///
/// Every value except null is quoted so an empty string never reads back as the
/// null sentinel. Records are validated against `column_names` before anything
/// is written.
pub fn encode_records(
    column_names: &[String],
    options: &CopyOptions,
    records: &[Vec<SqlValue>],
) -> Result<Bytes, CopyError> {
    if let Some((row, record)) =
        records.iter().enumerate().find(|(_, record)| record.len() != column_names.len())
    {
        return Err(CopyError::InvalidRecord {
            row,
            expected: column_names.len(),
            found: record.len(),
        });
    }

    let mut delimiter = [0; 4];
    let delimiter = options.delimiter.encode_utf8(&mut delimiter).as_bytes();
    let mut buffer = BytesMut::new();

    if options.header {
        for (i, name) in column_names.iter().enumerate() {
            if i > 0 {
                buffer.put_slice(delimiter);
            }
            push_quoted(&mut buffer, name, options);
        }
        buffer.put_u8(b'\n');
    }

    for record in records {
        for (i, value) in record.iter().enumerate() {
            if i > 0 {
                buffer.put_slice(delimiter);
            }
            match value.to_text() {
                Some(text) => push_quoted(&mut buffer, &text, options),
                None => buffer.put_slice(options.null_str.as_bytes()),
            }
        }
        buffer.put_u8(b'\n');
    }

    Ok(buffer.freeze())
}

/// Plain COPY of a stream straight into the target table, inside the caller's
/// transaction. Committing is left to the caller.
#[derive(Debug, Clone)]
pub struct CopyFrom {
    table: Table,
    options: CopyOptions,
    copy_sql: String,
}

impl CopyFrom {
    pub fn new(table: Table, options: CopyOptions) -> Result<Self, EncodingNotSupported> {
        let copy_sql = copy_from_csv_sql(&table.qualified_name(), &options)?;
        Ok(CopyFrom { table, options, copy_sql })
    }

    pub fn copy_sql(&self) -> &str {
        &self.copy_sql
    }

    pub async fn run(
        &self,
        transaction: &mut dyn StagingTransaction,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, CopyError> {
        debug!("Copy statement: {}", self.copy_sql);
        let rows = transaction.copy_in(&self.copy_sql, reader).await?;
        debug!("Copied {} rows into {}", rows, self.table.qualified_name());
        Ok(rows)
    }

    pub async fn run_records(
        &self,
        transaction: &mut dyn StagingTransaction,
        records: &[Vec<SqlValue>],
    ) -> Result<u64, CopyError> {
        let encoded = encode_records(&self.table.column_names(), &self.options, records)?;
        let mut reader: &[u8] = &encoded;
        self.run(transaction, &mut reader).await
    }
}
