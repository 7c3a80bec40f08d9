pub mod manifest;
pub use manifest::{Manifest, ManifestError, Operation};

mod database;
pub use database::{
    postgres::{
        admin::{
            check_extension, ensure_extension_installed, get_column_metadata, get_primary_keys,
            get_user_tables, install_extension, random_uuid_function, reflect_table,
            register_crypto, register_uuid, reset, reset_database_statements,
            uuid_sequence_function, InstallExtensionError, ReflectTableError, CRYPTO_EXTENSION,
            UUID_OSSP_EXTENSION,
        },
        client::{
            connection_string, PostgresClient, PostgresConnectionError, PostgresError,
            PostgresSession, PostgresTransaction, StagingSession, StagingTransaction, ToSql,
        },
        copy::{copy_from_csv_sql, encode_records, CopyError, CopyFrom, CopyOptions},
        ddl::{
            compile_column, compile_create_table, compile_create_temporary_table,
            compile_drop_table, compile_primary_key, compile_qualified_name,
        },
        dml::{
            compile_truncate_table, create_insert_statement, delete_joined_table_sql,
            format_upsert, format_upsert_expert, insert, insert_many, upsert_records, ParamStyle,
            ReconciliationStatement, StatementError, UpsertPrimaryKey, DEFAULT_TABLE_ALIAS,
            INSERT_CHUNK_SIZE,
        },
        encodings::{get_postgres_encoding, EncodingNotSupported},
        sql::{execute_transaction, execute_transactions},
        staged::{OperationKind, StagedMutation, StagedMutationError, StagedMutationResult},
        staging::{generate_staging_name, StagingKind, StagingTable, STAGING_RANDOM_RANGE},
        table::{
            make_delete_table, order_table_columns, split_qualified_name, Column, Database,
            PrimaryKey, Schema, Table, TableError, View, DEFAULT_SCHEMA, DELETE_TABLE_PREFIX,
        },
    },
    sql_type_wrapper::SqlValue,
};

mod logger;
pub use logger::{level_from_verbosity, setup_info_logger, setup_logger};

// export 3rd party dependencies
pub use async_trait::async_trait;
pub use tokio::main as pgstage_main;
pub use tokio_postgres::types::Type as PgType;
pub use tracing::level_filters::LevelFilter;
