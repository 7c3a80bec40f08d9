//! Data definition statement compilers.
//!
//! These are plain formatters; they never touch a connection. `Table` and the
//! staging descriptors build their statements from here.

/// Formats a table's fully qualified `schema.table` name.
pub fn compile_qualified_name(table: &str, schema: &str) -> String {
    format!("{}.{}", schema, table)
}

pub fn compile_create_table(
    qualified_name: &str,
    column_statement: &str,
    primary_key_statement: &str,
) -> String {
    format!("CREATE TABLE {} ({} {});", qualified_name, column_statement, primary_key_statement)
}

/// Temporary tables live in the session's temp schema so they take the bare name.
pub fn compile_create_temporary_table(
    table_name: &str,
    column_statement: &str,
    primary_key_statement: &str,
) -> String {
    format!(
        "CREATE TEMPORARY TABLE {} ({} {});",
        table_name, column_statement, primary_key_statement
    )
}

/// Column definition fragment, always terminated by a comma because the
/// primary key clause follows it.
pub fn compile_column(name: &str, data_type: &str, nullable: bool) -> String {
    let null_str = if nullable { "NULL" } else { "NOT NULL" };

    format!("{} {} {},", name, data_type, null_str)
}

pub fn compile_primary_key(column_names: &[String]) -> String {
    format!("PRIMARY KEY ({})", column_names.join(", "))
}

pub fn compile_drop_table(name: &str) -> String {
    format!("DROP TABLE IF EXISTS {};", name)
}
