//! Schema descriptors for tables and the statements they know how to emit.
//!
//! Descriptors are immutable values. Reordering or filtering columns produces a
//! new `Table`, it never mutates one in place.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::database::postgres::ddl::{
    compile_column, compile_create_table, compile_create_temporary_table, compile_drop_table,
    compile_primary_key, compile_qualified_name,
};

pub const DEFAULT_SCHEMA: &str = "public";

/// Prefix given to key-only tables built for joined deletes.
pub const DELETE_TABLE_PREFIX: &str = "delete_from__";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TableError {
    #[error("Column {column} does not exist on table {table}")]
    ColumnNotFound { table: String, column: String },

    #[error("Primary key column {column} is not a column of table {table}")]
    PrimaryKeyColumnNotFound { table: String, column: String },

    #[error("Column {column} appears more than once for table {table}")]
    DuplicateColumn { table: String, column: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Database {
    pub name: String,
}

impl Database {
    pub fn new(name: impl Into<String>) -> Self {
        Database { name: name.into() }
    }

    pub fn create_statement(&self) -> String {
        format!("CREATE DATABASE {};", self.name)
    }

    pub fn drop_statement(&self) -> String {
        format!("DROP DATABASE IF EXISTS {};", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub name: String,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Schema { name: name.into() }
    }

    pub fn create_statement(&self) -> String {
        format!("CREATE SCHEMA IF NOT EXISTS {};", self.name)
    }

    pub fn drop_statement(&self) -> String {
        format!("DROP SCHEMA IF EXISTS {} CASCADE;", self.name)
    }
}

/// A view over a select or join statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub name: String,
    pub statement: String,
}

impl View {
    pub fn new(name: impl Into<String>, statement: impl Into<String>) -> Self {
        View { name: name.into(), statement: statement.into() }
    }

    pub fn create_statement(&self) -> String {
        format!("CREATE VIEW {} AS {};", self.name, self.statement)
    }

    pub fn drop_statement(&self) -> String {
        format!("DROP VIEW IF EXISTS {};", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Column { name: name.into(), data_type: data_type.into(), nullable }
    }

    pub fn create_statement(&self) -> String {
        compile_column(&self.name, &self.data_type, self.nullable)
    }
}

/// Ordered column names of a (possibly composite) key. Empty means unkeyed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub column_names: Vec<String>,
}

impl PrimaryKey {
    pub fn new<I, S>(column_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PrimaryKey { column_names: column_names.into_iter().map(Into::into).collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.column_names.is_empty()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.column_names.iter().any(|name| name == column)
    }

    pub fn create_statement(&self) -> String {
        if self.is_empty() {
            return String::new();
        }

        compile_primary_key(&self.column_names)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    primary_key: PrimaryKey,
    schema: String,
}

impl Table {
    /// Builds a table in the `public` schema, checking that the key only
    /// references existing columns.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<Column>,
        primary_key: PrimaryKey,
    ) -> Result<Self, TableError> {
        Self::with_schema(name, columns, primary_key, DEFAULT_SCHEMA)
    }

    pub fn with_schema(
        name: impl Into<String>,
        columns: Vec<Column>,
        primary_key: PrimaryKey,
        schema: impl Into<String>,
    ) -> Result<Self, TableError> {
        let table = Table { name: name.into(), columns, primary_key, schema: schema.into() };
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<(), TableError> {
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(TableError::DuplicateColumn {
                    table: self.name.clone(),
                    column: column.name.clone(),
                });
            }
        }

        for key in &self.primary_key.column_names {
            if !seen.contains(key.as_str()) {
                return Err(TableError::PrimaryKeyColumnNotFound {
                    table: self.name.clone(),
                    column: key.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    pub fn qualified_name(&self) -> String {
        compile_qualified_name(&self.name, &self.schema)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }

    pub fn primary_key_columns(&self) -> &[String] {
        &self.primary_key.column_names
    }

    /// Same table under another name, used for staging copies.
    pub fn renamed(&self, name: impl Into<String>) -> Table {
        Table { name: name.into(), ..self.clone() }
    }

    pub fn column_statement(&self) -> String {
        let statement =
            self.columns.iter().map(Column::create_statement).collect::<Vec<_>>().join(" ");

        if self.primary_key.is_empty() {
            statement.trim_end_matches(',').to_string()
        } else {
            statement
        }
    }

    pub fn primary_key_statement(&self) -> String {
        self.primary_key.create_statement()
    }

    pub fn create_statement(&self) -> String {
        compile_create_table(
            &self.qualified_name(),
            &self.column_statement(),
            &self.primary_key_statement(),
        )
    }

    pub fn drop_statement(&self) -> String {
        compile_drop_table(&self.qualified_name())
    }

    pub fn create_temporary_statement(&self) -> String {
        compile_create_temporary_table(
            &self.name,
            &self.column_statement(),
            &self.primary_key_statement(),
        )
    }

    /// Temporary variant without the key constraint, so rows may repeat a key.
    pub fn create_unkeyed_temporary_statement(&self) -> String {
        let column_statement =
            self.columns.iter().map(Column::create_statement).collect::<Vec<_>>().join(" ");

        compile_create_temporary_table(&self.name, column_statement.trim_end_matches(','), "")
    }

    pub fn drop_temporary_statement(&self) -> String {
        compile_drop_table(&self.name)
    }
}

/// Splits `schema.table` into its parts, defaulting the schema when absent.
pub fn split_qualified_name(qualified_name: &str) -> (String, String) {
    match qualified_name.split_once('.') {
        Some((schema, table)) => (schema.to_string(), table.to_string()),
        None => (DEFAULT_SCHEMA.to_string(), qualified_name.to_string()),
    }
}

/// Reorders (and filters) the table columns to follow `column_names`. The
/// primary key keeps only the key columns that were requested, in the new order.
pub fn order_table_columns<S: AsRef<str>>(
    table: &Table,
    column_names: &[S],
) -> Result<Table, TableError> {
    let mut ordered_columns = Vec::with_capacity(column_names.len());

    for name in column_names {
        let name = name.as_ref();
        let column = table.columns.iter().find(|column| column.name == name).ok_or_else(|| {
            TableError::ColumnNotFound { table: table.name.clone(), column: name.to_string() }
        })?;
        ordered_columns.push(column.clone());
    }

    let ordered_key = PrimaryKey::new(
        column_names
            .iter()
            .map(|name| name.as_ref())
            .filter(|name| table.primary_key.contains(name))
            .map(str::to_string),
    );

    Table::with_schema(table.name.clone(), ordered_columns, ordered_key, table.schema.clone())
}

/// Key-only copy of `table` named `prefix + table.name`, the minimal shape
/// needed to identify rows to remove.
pub fn make_delete_table(table: &Table, delete_prefix: &str) -> Table {
    let columns = table
        .columns
        .iter()
        .filter(|column| table.primary_key.contains(&column.name))
        .cloned()
        .collect();

    Table {
        name: format!("{}{}", delete_prefix, table.name),
        columns,
        primary_key: table.primary_key.clone(),
        schema: DEFAULT_SCHEMA.to_string(),
    }
}
