//! Catalog queries and server side administration.

use tokio_postgres::error::SqlState;
use tracing::{debug, info};

use crate::database::postgres::{
    client::{PostgresClient, PostgresError},
    ddl::compile_qualified_name,
    table::{Column, Database, PrimaryKey, Table, TableError},
};

pub const CRYPTO_EXTENSION: &str = "pgcrypto";
pub const UUID_OSSP_EXTENSION: &str = "uuid-ossp";

#[derive(thiserror::Error, Debug)]
pub enum ReflectTableError {
    #[error("Table {0} does not exist")]
    TableNotFound(String),

    #[error("{0}")]
    Schema(#[from] TableError),

    #[error("{0}")]
    Postgres(#[from] PostgresError),
}

#[derive(thiserror::Error, Debug)]
pub enum InstallExtensionError {
    #[error("Extension {0} is not available for installation")]
    NotAvailable(String),

    #[error("Extension {0} failed installation")]
    NotInstalled(String),

    #[error("{0}")]
    Postgres(#[from] PostgresError),
}

/// `(schema, table)` for every user table.
pub async fn get_user_tables(
    client: &PostgresClient,
) -> Result<Vec<(String, String)>, PostgresError> {
    let rows = client
        .query("SELECT schemaname::text, relname::text FROM pg_stat_user_tables;", &[])
        .await?;

    Ok(rows.iter().map(|row| (row.get(0), row.get(1))).collect())
}

/// Primary key column names in key order.
pub async fn get_primary_keys(
    client: &PostgresClient,
    table: &str,
    schema: &str,
) -> Result<Vec<String>, PostgresError> {
    let query = "
        SELECT c.column_name::text
        FROM information_schema.key_column_usage AS c
        LEFT JOIN information_schema.table_constraints AS t
          ON t.constraint_name = c.constraint_name
         AND t.table_schema = c.table_schema
        WHERE t.constraint_type = 'PRIMARY KEY'
          AND c.table_schema::text = $1
          AND c.table_name::text = $2
        ORDER BY c.ordinal_position;
    ";

    let rows = client.query(query, &[&schema, &table]).await?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}

pub async fn get_column_metadata(
    client: &PostgresClient,
    table: &str,
    schema: &str,
) -> Result<Vec<Column>, ReflectTableError> {
    let query = "
        SELECT
          attname::text AS name,
          format_type(atttypid, atttypmod) AS data_type,
          NOT attnotnull AS nullable
        FROM pg_catalog.pg_attribute
        WHERE attrelid = $1::text::regclass
          AND attnum > 0 AND NOT attisdropped
        ORDER BY attnum;
    ";

    let qualified_name = compile_qualified_name(table, schema);

    let rows = match client.query(query, &[&qualified_name]).await {
        Ok(rows) => rows,
        Err(e) if e.code() == Some(&SqlState::UNDEFINED_TABLE) => {
            return Err(ReflectTableError::TableNotFound(qualified_name));
        }
        Err(e) => return Err(e.into()),
    };

    Ok(rows
        .iter()
        .map(|row| Column::new(row.get::<_, String>(0), row.get::<_, String>(1), row.get(2)))
        .collect())
}

/// Builds the descriptor of an existing table from the catalog.
pub async fn reflect_table(
    client: &PostgresClient,
    table: &str,
    schema: &str,
) -> Result<Table, ReflectTableError> {
    let columns = get_column_metadata(client, table, schema).await?;
    if columns.is_empty() {
        return Err(ReflectTableError::TableNotFound(compile_qualified_name(table, schema)));
    }

    let primary_key = PrimaryKey::new(get_primary_keys(client, table, schema).await?);
    debug!(
        "Reflected {}.{} with {} columns, primary key ({})",
        schema,
        table,
        columns.len(),
        primary_key.column_names.join(", ")
    );

    Ok(Table::with_schema(table, columns, primary_key, schema)?)
}

/// Whether `extension` is installed. Fails when the server does not ship it.
pub async fn check_extension(
    client: &PostgresClient,
    extension: &str,
) -> Result<bool, InstallExtensionError> {
    let row = client
        .query_one_or_none(
            "SELECT installed_version FROM pg_available_extensions WHERE name = $1;",
            &[&extension],
        )
        .await?;

    match row {
        Some(row) => Ok(row.get::<_, Option<String>>(0).is_some()),
        None => Err(InstallExtensionError::NotAvailable(extension.to_string())),
    }
}

pub async fn install_extension(
    client: &PostgresClient,
    extension: &str,
) -> Result<(), InstallExtensionError> {
    client.batch_execute(&format!("CREATE EXTENSION IF NOT EXISTS \"{}\";", extension)).await?;

    if !check_extension(client, extension).await? {
        return Err(InstallExtensionError::NotInstalled(extension.to_string()));
    }

    info!("Extension {} installed", extension);
    Ok(())
}

/// Idempotent: installs `extension` only when it is missing.
pub async fn ensure_extension_installed(
    client: &PostgresClient,
    extension: &str,
) -> Result<(), InstallExtensionError> {
    if check_extension(client, extension).await? {
        debug!("Extension {} already installed", extension);
        return Ok(());
    }

    install_extension(client, extension).await
}

/// Server side random UUIDs, provided by pgcrypto.
pub async fn register_crypto(client: &PostgresClient) -> Result<(), InstallExtensionError> {
    ensure_extension_installed(client, CRYPTO_EXTENSION).await
}

/// Server side sequential UUIDs, provided by uuid-ossp.
pub async fn register_uuid(client: &PostgresClient) -> Result<(), InstallExtensionError> {
    ensure_extension_installed(client, UUID_OSSP_EXTENSION).await
}

fn format_function_schema(schema: Option<&str>) -> String {
    schema.map(|schema| format!("{}.", schema)).unwrap_or_default()
}

pub fn random_uuid_function(schema: Option<&str>) -> String {
    format!("{}gen_random_uuid()", format_function_schema(schema))
}

/// Sequential UUIDs fragment an index less when used as a generated key.
pub fn uuid_sequence_function(schema: Option<&str>) -> String {
    format!("{}uuid_generate_v1mc()", format_function_schema(schema))
}

pub fn reset_database_statements(db_name: &str) -> [String; 2] {
    let database = Database::new(db_name);
    [database.drop_statement(), database.create_statement()]
}

/// Drops and recreates `db_name`. `client` must be connected to another
/// database.
pub async fn reset(client: &PostgresClient, db_name: &str) -> Result<(), PostgresError> {
    for statement in reset_database_statements(db_name) {
        client.batch_execute(&statement).await?;
    }

    info!("Database {} reset", db_name);
    Ok(())
}
