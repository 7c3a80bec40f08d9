//! Data manipulation statements.
//!
//! Row-wise helpers bind one record per execution. The reconciliation
//! statement is the set-based form used after a batch has been staged.

use tokio_postgres::types::ToSql;
use tracing::debug;

use crate::database::{
    postgres::{
        client::{PostgresError, StagingSession},
        sql::rollback,
        table::Table,
    },
    sql_type_wrapper::SqlValue,
};

/// Alias given to the target table so conflict clauses can say `current.col`.
pub const DEFAULT_TABLE_ALIAS: &str = "current";

pub const INSERT_CHUNK_SIZE: usize = 2500;

/// Postgres caps a single statement at this many bind parameters.
const MAX_BIND_PARAMETERS: usize = 65_535;

#[derive(thiserror::Error, Debug)]
pub enum StatementError {
    #[error("Table {0} has no primary key and the operation needs one")]
    PrimaryKeyRequired(String),

    #[error("Record {row} has {found} values but {expected} columns were expected")]
    InvalidRecord { row: usize, expected: usize, found: usize },

    #[error("{0}")]
    Postgres(#[from] PostgresError),
}

/// Placeholder flavour. `Pyformat` renders `%s` and `Named` renders
/// `%(column)s` for statement text that is compared or handed to other
/// drivers, `Numbered` renders `$n` for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    Pyformat,
    Named,
    Numbered,
}

impl ParamStyle {
    fn placeholders(&self, column_names: &[String], offset: usize) -> String {
        column_names
            .iter()
            .enumerate()
            .map(|(i, name)| match self {
                ParamStyle::Pyformat => "%s".to_string(),
                ParamStyle::Named => format!("%({})s", name),
                ParamStyle::Numbered => format!("${}", offset + i + 1),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn create_insert_statement(
    qualified_name: &str,
    column_names: &[String],
    table_alias: Option<&str>,
    style: ParamStyle,
) -> String {
    let alias = table_alias.map(|alias| format!(" AS {}", alias)).unwrap_or_default();

    format!(
        "INSERT INTO {}{} ({}) VALUES ({})",
        qualified_name,
        alias,
        column_names.join(", "),
        style.placeholders(column_names, 0)
    )
}

pub fn format_upsert(
    qualified_name: &str,
    column_names: &[String],
    constraint: &[String],
    clause: &str,
    style: ParamStyle,
) -> String {
    let insert_template =
        create_insert_statement(qualified_name, column_names, Some(DEFAULT_TABLE_ALIAS), style);

    format_upsert_expert(&insert_template, column_names, constraint, clause)
}

/// Appends the `ON CONFLICT` clause to an insert template.
///
/// When every column is part of `constraint` there is nothing to update and
/// the clause becomes `DO NOTHING`; `clause` is dropped in that case. A single
/// updated column is wrapped in `ROW(...)`.
pub fn format_upsert_expert(
    insert_template: &str,
    column_names: &[String],
    constraint: &[String],
    clause: &str,
) -> String {
    let constraint_str = constraint.join(", ");
    let non_key_columns: Vec<&String> =
        column_names.iter().filter(|column| !constraint.contains(*column)).collect();

    if non_key_columns.is_empty() {
        return format!("{} ON CONFLICT ({}) DO NOTHING", insert_template, constraint_str);
    }

    let non_key_str =
        non_key_columns.iter().map(|column| column.as_str()).collect::<Vec<_>>().join(", ");
    let excluded_str = non_key_columns
        .iter()
        .map(|column| format!("EXCLUDED.{}", column))
        .collect::<Vec<_>>()
        .join(", ");
    let row_source = if non_key_columns.len() == 1 {
        format!("ROW({})", excluded_str)
    } else {
        format!("({})", excluded_str)
    };

    format!(
        "{} ON CONFLICT ({}) DO UPDATE SET ({}) = {} {};",
        insert_template, constraint_str, non_key_str, row_source, clause
    )
}

/// Deletes the rows of `qualified_name` whose key matches a row of
/// `removing_name`.
pub fn delete_joined_table_sql(
    qualified_name: &str,
    removing_name: &str,
    primary_key: &[String],
) -> String {
    let where_clause = primary_key
        .iter()
        .map(|key| format!("t.{}=d.{}", key, key))
        .collect::<Vec<_>>()
        .join(" AND ");

    format!("DELETE FROM {} t USING {} d WHERE {}", qualified_name, removing_name, where_clause)
}

pub fn compile_truncate_table(qualified_name: &str) -> String {
    format!("TRUNCATE {} CASCADE;", qualified_name)
}

/// The set-based statement applying a staged batch to its target.
///
/// Built from schema only, so one instance serves every batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationStatement {
    sql: String,
}

impl ReconciliationStatement {
    /// `INSERT ... SELECT` from the staging table with an `ON CONFLICT` on the
    /// target's key. When a key repeats inside the batch the last staged row
    /// wins.
    pub fn upsert(
        target: &Table,
        staging_name: &str,
        clause: Option<&str>,
    ) -> Result<Self, StatementError> {
        let primary_key = target.primary_key_columns();
        if primary_key.is_empty() {
            return Err(StatementError::PrimaryKeyRequired(target.qualified_name()));
        }

        let column_str = target.column_names().join(", ");
        let key_str = primary_key.join(", ");
        let insert_template = format!(
            "INSERT INTO {} AS {} ({})\n  SELECT DISTINCT ON ({}) {} FROM {}\n  ORDER BY {}, ctid DESC\n",
            target.qualified_name(),
            DEFAULT_TABLE_ALIAS,
            column_str,
            key_str,
            column_str,
            staging_name,
            key_str
        );

        let sql = format_upsert_expert(
            &insert_template,
            &target.column_names(),
            primary_key,
            clause.unwrap_or_default(),
        );

        Ok(ReconciliationStatement { sql })
    }

    pub fn delete(target: &Table, staging_name: &str) -> Result<Self, StatementError> {
        let primary_key = target.primary_key_columns();
        if primary_key.is_empty() {
            return Err(StatementError::PrimaryKeyRequired(target.qualified_name()));
        }

        let sql = delete_joined_table_sql(&target.qualified_name(), staging_name, primary_key);

        Ok(ReconciliationStatement { sql })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

fn validate_records(column_count: usize, records: &[Vec<SqlValue>]) -> Result<(), StatementError> {
    match records.iter().enumerate().find(|(_, record)| record.len() != column_count) {
        Some((row, record)) => Err(StatementError::InvalidRecord {
            row,
            expected: column_count,
            found: record.len(),
        }),
        None => Ok(()),
    }
}

fn as_params(values: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    values.iter().map(|value| value as &(dyn ToSql + Sync)).collect()
}

/// Runs `query` once per record inside a single transaction.
async fn execute_per_record(
    session: &mut dyn StagingSession,
    query: &str,
    records: &[Vec<SqlValue>],
) -> Result<u64, StatementError> {
    debug!("Row statement: {}", query);
    let mut transaction = session.transaction().await?;

    let mut affected = 0;
    for record in records {
        match transaction.execute(query, &as_params(record)).await {
            Ok(rows) => affected += rows,
            Err(e) => {
                rollback(transaction.as_mut()).await;
                return Err(e.into());
            }
        }
    }

    transaction.commit().await?;
    Ok(affected)
}

pub async fn insert(
    session: &mut dyn StagingSession,
    qualified_name: &str,
    column_names: &[String],
    records: &[Vec<SqlValue>],
) -> Result<u64, StatementError> {
    validate_records(column_names.len(), records)?;

    let query = create_insert_statement(qualified_name, column_names, None, ParamStyle::Numbered);
    execute_per_record(session, &query, records).await
}

/// Multi-row `VALUES` insert, `chunk_size` records per statement, all in one
/// transaction.
pub async fn insert_many(
    session: &mut dyn StagingSession,
    qualified_name: &str,
    column_names: &[String],
    records: &[Vec<SqlValue>],
    chunk_size: usize,
) -> Result<u64, StatementError> {
    validate_records(column_names.len(), records)?;
    if records.is_empty() || column_names.is_empty() {
        return Ok(0);
    }

    let chunk_size = chunk_size.clamp(1, (MAX_BIND_PARAMETERS / column_names.len()).max(1));
    let column_str = column_names.join(", ");

    let mut transaction = session.transaction().await?;

    let mut affected = 0;
    for chunk in records.chunks(chunk_size) {
        let values = (0..chunk.len())
            .map(|i| {
                format!(
                    "({})",
                    ParamStyle::Numbered.placeholders(column_names, i * column_names.len())
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!("INSERT INTO {} ({}) VALUES {}", qualified_name, column_str, values);
        let params: Vec<&(dyn ToSql + Sync)> =
            chunk.iter().flat_map(|record| as_params(record)).collect();

        match transaction.execute(&query, &params).await {
            Ok(rows) => affected += rows,
            Err(e) => {
                rollback(transaction.as_mut()).await;
                return Err(e.into());
            }
        }
    }

    transaction.commit().await?;
    debug!("Inserted {} rows into {}", affected, qualified_name);
    Ok(affected)
}

pub async fn upsert_records(
    session: &mut dyn StagingSession,
    records: &[Vec<SqlValue>],
    upsert_statement: &str,
) -> Result<u64, StatementError> {
    execute_per_record(session, upsert_statement, records).await
}

/// Row-wise upsert keyed on the primary key.
#[derive(Debug, Clone)]
pub struct UpsertPrimaryKey {
    query: String,
    column_count: usize,
}

impl UpsertPrimaryKey {
    pub fn new(
        qualified_name: &str,
        column_names: &[String],
        primary_key_names: &[String],
        clause: Option<&str>,
        style: ParamStyle,
    ) -> Result<Self, StatementError> {
        if primary_key_names.is_empty() {
            return Err(StatementError::PrimaryKeyRequired(qualified_name.to_string()));
        }

        let query = format_upsert(
            qualified_name,
            column_names,
            primary_key_names,
            clause.unwrap_or_default(),
            style,
        );

        Ok(UpsertPrimaryKey { query, column_count: column_names.len() })
    }

    pub fn from_table(table: &Table, clause: Option<&str>) -> Result<Self, StatementError> {
        Self::new(
            &table.qualified_name(),
            &table.column_names(),
            table.primary_key_columns(),
            clause,
            ParamStyle::Numbered,
        )
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub async fn run(
        &self,
        session: &mut dyn StagingSession,
        records: &[Vec<SqlValue>],
    ) -> Result<u64, StatementError> {
        validate_records(self.column_count, records)?;
        upsert_records(session, records, &self.query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::postgres::{
        table::{Column, PrimaryKey},
        test_session::MockSession,
    };

    fn squeeze(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn reports() -> Table {
        Table::new(
            "reports",
            vec![
                Column::new("ticker", "CHAR(4)", false),
                Column::new("report_date", "DATE", true),
                Column::new("score", "INT", true),
            ],
            PrimaryKey::new(["ticker"]),
        )
        .unwrap()
    }

    #[test]
    fn test_create_insert_statement() {
        assert_eq!(
            create_insert_statement("tname", &names(&["one"]), None, ParamStyle::Pyformat),
            "INSERT INTO tname (one) VALUES (%s)"
        );
        assert_eq!(
            create_insert_statement(
                "public.t",
                &names(&["a", "b"]),
                Some("current"),
                ParamStyle::Numbered
            ),
            "INSERT INTO public.t AS current (a, b) VALUES ($1, $2)"
        );
        assert_eq!(
            create_insert_statement("tname", &names(&["one", "two"]), None, ParamStyle::Named),
            "INSERT INTO tname (one, two) VALUES (%(one)s, %(two)s)"
        );
    }

    #[test]
    fn test_format_upsert_named() {
        let statement =
            format_upsert("t", &names(&["a", "b"]), &names(&["a"]), "", ParamStyle::Named);

        assert_eq!(
            squeeze(&statement),
            "INSERT INTO t AS current (a, b) VALUES (%(a)s, %(b)s) \
             ON CONFLICT (a) DO UPDATE SET (b) = ROW(EXCLUDED.b) ;"
        );
    }

    #[test]
    fn test_format_upsert() {
        let statement = format_upsert(
            "upsert_test1",
            &names(&["ticker", "report_date", "score"]),
            &names(&["ticker"]),
            "WHERE current.report_date < EXCLUDED.report_date",
            ParamStyle::Pyformat,
        );

        assert_eq!(
            statement,
            "INSERT INTO upsert_test1 AS current (ticker, report_date, score) VALUES (%s, %s, %s) \
             ON CONFLICT (ticker) DO UPDATE SET (report_date, score) = \
             (EXCLUDED.report_date, EXCLUDED.score) WHERE current.report_date < EXCLUDED.report_date;"
        );
    }

    #[test]
    fn test_format_upsert_single_non_key_column() {
        let statement = format_upsert(
            "t",
            &names(&["id", "value"]),
            &names(&["id"]),
            "",
            ParamStyle::Pyformat,
        );

        assert_eq!(
            squeeze(&statement),
            "INSERT INTO t AS current (id, value) VALUES (%s, %s) \
             ON CONFLICT (id) DO UPDATE SET (value) = ROW(EXCLUDED.value) ;"
        );
    }

    #[test]
    fn test_upsert_when_all_columns_are_primary_keys() {
        let upserter = UpsertPrimaryKey::new(
            "foobar",
            &names(&["foo", "bar"]),
            &names(&["foo", "bar"]),
            None,
            ParamStyle::Pyformat,
        )
        .unwrap();

        assert_eq!(
            upserter.query(),
            "INSERT INTO foobar AS current (foo, bar) VALUES (%s, %s) ON CONFLICT (foo, bar) DO NOTHING"
        );
    }

    #[test]
    fn test_upsert_requires_primary_key() {
        let result =
            UpsertPrimaryKey::new("t", &names(&["a"]), &[], None, ParamStyle::Numbered);

        assert!(matches!(result, Err(StatementError::PrimaryKeyRequired(name)) if name == "t"));
    }

    #[test]
    fn test_set_clause_lists_exactly_non_key_columns() {
        let statement = ReconciliationStatement::upsert(&reports(), "stage", None).unwrap();

        assert!(statement
            .sql()
            .contains("SET (report_date, score) = (EXCLUDED.report_date, EXCLUDED.score)"));
        assert!(!statement.sql().contains("EXCLUDED.ticker"));
    }

    #[test]
    fn test_delete_joined_table_sql() {
        assert_eq!(
            delete_joined_table_sql("table_foo", "delete_from_foo", &names(&["city", "state"])),
            "DELETE FROM table_foo t USING delete_from_foo d WHERE t.city=d.city AND t.state=d.state"
        );
    }

    #[test]
    fn test_compile_truncate_table() {
        assert_eq!(
            compile_truncate_table("my_schema.my_table"),
            "TRUNCATE my_schema.my_table CASCADE;"
        );
    }

    #[test]
    fn test_reconciliation_upsert() {
        let statement = ReconciliationStatement::upsert(
            &reports(),
            "tmp_bulk_upsert_7_reports",
            Some("WHERE current.report_date < EXCLUDED.report_date"),
        )
        .unwrap();

        assert_eq!(
            squeeze(statement.sql()),
            "INSERT INTO public.reports AS current (ticker, report_date, score) \
             SELECT DISTINCT ON (ticker) ticker, report_date, score FROM tmp_bulk_upsert_7_reports \
             ORDER BY ticker, ctid DESC \
             ON CONFLICT (ticker) DO UPDATE SET (report_date, score) = \
             (EXCLUDED.report_date, EXCLUDED.score) WHERE current.report_date < EXCLUDED.report_date;"
        );
    }

    #[test]
    fn test_reconciliation_upsert_key_collapse() {
        let pairs = Table::new(
            "pairs",
            vec![Column::new("foo", "INT", false), Column::new("bar", "INT", false)],
            PrimaryKey::new(["foo", "bar"]),
        )
        .unwrap();

        let statement =
            ReconciliationStatement::upsert(&pairs, "stage", Some("WHERE 1 = 1")).unwrap();

        assert!(statement.sql().ends_with("ON CONFLICT (foo, bar) DO NOTHING"));
        assert!(!statement.sql().contains("DO UPDATE"));
        assert!(!statement.sql().contains("WHERE 1 = 1"));
    }

    #[test]
    fn test_reconciliation_delete() {
        let statement = ReconciliationStatement::delete(&reports(), "stage").unwrap();

        assert_eq!(
            statement.sql(),
            "DELETE FROM public.reports t USING stage d WHERE t.ticker=d.ticker"
        );
    }

    #[test]
    fn test_reconciliation_requires_primary_key() {
        let unkeyed =
            Table::new("logs", vec![Column::new("line", "TEXT", true)], PrimaryKey::default())
                .unwrap();

        assert!(matches!(
            ReconciliationStatement::upsert(&unkeyed, "stage", None),
            Err(StatementError::PrimaryKeyRequired(_))
        ));
        assert!(matches!(
            ReconciliationStatement::delete(&unkeyed, "stage"),
            Err(StatementError::PrimaryKeyRequired(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_runs_in_one_transaction() {
        let mut session = MockSession::default();
        let records = vec![vec![SqlValue::from("a")], vec![SqlValue::from("b")]];

        let affected =
            insert(&mut session, "public.t", &names(&["name"]), &records).await.unwrap();

        assert_eq!(affected, 2);
        assert_eq!(
            session.statements,
            vec![
                "BEGIN",
                "INSERT INTO public.t (name) VALUES ($1)",
                "INSERT INTO public.t (name) VALUES ($1)",
                "COMMIT"
            ]
        );
    }

    #[tokio::test]
    async fn test_insert_many_chunks() {
        let mut session = MockSession::default();
        let records: Vec<Vec<SqlValue>> =
            (0..5).map(|i| vec![SqlValue::Int(i), SqlValue::Null]).collect();

        insert_many(&mut session, "t", &names(&["a", "b"]), &records, 2).await.unwrap();

        assert_eq!(session.statements.len(), 5);
        assert_eq!(session.statements[1], "INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4)");
        assert_eq!(session.statements[3], "INSERT INTO t (a, b) VALUES ($1, $2)");
        assert_eq!(session.statements[4], "COMMIT");
    }

    #[tokio::test]
    async fn test_upsert_rolls_back_on_failure() {
        let mut session = MockSession::failing_on("ON CONFLICT");
        let upserter = UpsertPrimaryKey::from_table(&reports(), None).unwrap();
        let records = vec![vec![SqlValue::from("AAPL"), SqlValue::Null, SqlValue::Int(5)]];

        let result = upserter.run(&mut session, &records).await;

        assert!(matches!(result, Err(StatementError::Postgres(_))));
        assert_eq!(session.statements.last().map(String::as_str), Some("ROLLBACK"));
        assert!(!session.statements.iter().any(|s| s == "COMMIT"));
    }

    #[tokio::test]
    async fn test_invalid_record_fails_before_io() {
        let mut session = MockSession::default();
        let records = vec![vec![SqlValue::Int(1), SqlValue::Int(2)]];

        let result = insert(&mut session, "t", &names(&["a"]), &records).await;

        assert!(matches!(
            result,
            Err(StatementError::InvalidRecord { row: 0, expected: 1, found: 2 })
        ));
        assert!(session.statements.is_empty());
    }
}
