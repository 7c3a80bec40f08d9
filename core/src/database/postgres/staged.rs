//! Staged bulk mutations.
//!
//! A batch is loaded with COPY into a temporary staging table and applied to
//! the target with one set-based statement:
//!
//! ```text
//! BEGIN
//! CREATE TEMPORARY TABLE <staging> (...)
//! COPY <staging> FROM STDIN ...
//! INSERT INTO <target> ... ON CONFLICT ... | DELETE FROM <target> t USING <staging> d ...
//! DROP TABLE IF EXISTS <staging>
//! COMMIT
//! ```
//!
//! Any failure rolls the whole transaction back, so the target is never left
//! half applied. The transaction is a guard: dropping a `run` future part way,
//! for example under a caller's timeout, rolls it back as well.

use tokio::io::AsyncRead;
use tokio_postgres::error::SqlState;
use tracing::{debug, error, info};

use crate::database::{
    postgres::{
        client::{PostgresError, StagingSession, StagingTransaction},
        copy::{copy_from_csv_sql, encode_records, CopyError, CopyOptions},
        dml::{ReconciliationStatement, StatementError},
        encodings::EncodingNotSupported,
        sql::rollback,
        staging::{StagingKind, StagingTable},
        table::{Table, TableError},
    },
    sql_type_wrapper::SqlValue,
};

#[derive(thiserror::Error, Debug)]
pub enum StagedMutationError {
    #[error("{0}")]
    Schema(#[from] TableError),

    #[error("Table {0} has no primary key and the operation needs one")]
    PrimaryKeyRequired(String),

    #[error("Staging table {0} already exists")]
    DuplicateStagingTable(String),

    #[error("{0}")]
    EncodingNotSupported(#[from] EncodingNotSupported),

    #[error("Bulk load into {table} failed: {source}")]
    LoadFormat { table: String, source: PostgresError },

    #[error("Reconciliation against {table} failed: {source}")]
    Reconciliation { table: String, source: PostgresError },

    #[error("Record {row} has {found} values but {expected} columns were expected")]
    InvalidRecord { row: usize, expected: usize, found: usize },

    #[error("{0}")]
    Postgres(#[from] PostgresError),
}

impl From<StatementError> for StagedMutationError {
    fn from(value: StatementError) -> Self {
        match value {
            StatementError::PrimaryKeyRequired(table) => {
                StagedMutationError::PrimaryKeyRequired(table)
            }
            StatementError::InvalidRecord { row, expected, found } => {
                StagedMutationError::InvalidRecord { row, expected, found }
            }
            StatementError::Postgres(e) => StagedMutationError::Postgres(e),
        }
    }
}

impl From<CopyError> for StagedMutationError {
    fn from(value: CopyError) -> Self {
        match value {
            CopyError::EncodingNotSupported(e) => StagedMutationError::EncodingNotSupported(e),
            CopyError::InvalidRecord { row, expected, found } => {
                StagedMutationError::InvalidRecord { row, expected, found }
            }
            CopyError::Postgres(e) => StagedMutationError::Postgres(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Insert staged rows, updating the non-key columns of rows whose key
    /// already exists. `clause` is appended after the `DO UPDATE SET`, for
    /// example `WHERE current.updated_at < EXCLUDED.updated_at`.
    Upsert { clause: Option<String> },
    /// Remove every target row whose key appears in the staged batch.
    Delete,
}

impl OperationKind {
    fn staging_kind(&self) -> StagingKind {
        match self {
            OperationKind::Upsert { .. } => StagingKind::Upsert,
            OperationKind::Delete => StagingKind::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedMutationResult {
    pub staging_table: String,
    pub staged_rows: u64,
    pub affected_rows: u64,
}

/// One staged operation against one target table.
///
/// The staging descriptor, COPY directive and reconciliation statement are
/// built once here and reused by every `run`. Runs on the same instance must
/// not overlap; concurrent callers each build their own instance.
#[derive(Debug, Clone)]
pub struct StagedMutation {
    target: Table,
    kind: OperationKind,
    options: CopyOptions,
    staging: StagingTable,
    copy_sql: String,
    reconciliation: ReconciliationStatement,
}

impl StagedMutation {
    pub fn new(
        target: Table,
        kind: OperationKind,
        options: CopyOptions,
    ) -> Result<Self, StagedMutationError> {
        if target.primary_key().is_empty() {
            return Err(StagedMutationError::PrimaryKeyRequired(target.qualified_name()));
        }

        let staging = StagingTable::new(kind.staging_kind(), &target);
        let copy_sql = copy_from_csv_sql(staging.name(), &options)?;
        let reconciliation = match &kind {
            OperationKind::Upsert { clause } => {
                ReconciliationStatement::upsert(&target, staging.name(), clause.as_deref())?
            }
            OperationKind::Delete => ReconciliationStatement::delete(&target, staging.name())?,
        };

        Ok(StagedMutation { target, kind, options, staging, copy_sql, reconciliation })
    }

    pub fn upsert(
        target: Table,
        clause: Option<String>,
        options: CopyOptions,
    ) -> Result<Self, StagedMutationError> {
        Self::new(target, OperationKind::Upsert { clause }, options)
    }

    pub fn delete(target: Table, options: CopyOptions) -> Result<Self, StagedMutationError> {
        Self::new(target, OperationKind::Delete, options)
    }

    pub fn target(&self) -> &Table {
        &self.target
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn staging_table(&self) -> &StagingTable {
        &self.staging
    }

    pub fn copy_sql(&self) -> &str {
        &self.copy_sql
    }

    pub fn reconciliation(&self) -> &ReconciliationStatement {
        &self.reconciliation
    }

    /// Columns the loaded stream must carry, in order. Delete batches only
    /// carry the key.
    pub fn staged_columns(&self) -> Vec<String> {
        self.staging.column_names()
    }

    /// Loads the delimited stream described by the copy options and applies it.
    pub async fn run(
        &self,
        session: &mut dyn StagingSession,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<StagedMutationResult, StagedMutationError> {
        let mut staging_created = false;

        let outcome = {
            let mut transaction = session.transaction().await?;

            let outcome =
                match self.apply(transaction.as_mut(), reader, &mut staging_created).await {
                    Ok(result) => {
                        transaction.commit().await.map(|_| result).map_err(Into::into)
                    }
                    Err(e) => Err(e),
                };

            if outcome.is_err() {
                rollback(transaction.as_mut()).await;
            }

            outcome
        };

        match outcome {
            Ok(result) => {
                info!(
                    "{} staged rows applied to {}, {} rows affected",
                    result.staged_rows,
                    self.target.qualified_name(),
                    result.affected_rows
                );
                Ok(result)
            }
            Err(e) => {
                error!("Staged mutation on {} failed: {}", self.target.qualified_name(), e);
                if staging_created {
                    self.drop_staging(session).await;
                }
                Err(e)
            }
        }
    }

    /// Encodes typed records with the copy options and runs them. Records are
    /// checked against `staged_columns` before anything is sent.
    pub async fn run_records(
        &self,
        session: &mut dyn StagingSession,
        records: &[Vec<SqlValue>],
    ) -> Result<StagedMutationResult, StagedMutationError> {
        let encoded = encode_records(&self.staged_columns(), &self.options, records)?;
        let mut reader: &[u8] = &encoded;
        self.run(session, &mut reader).await
    }

    async fn apply(
        &self,
        transaction: &mut dyn StagingTransaction,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        staging_created: &mut bool,
    ) -> Result<StagedMutationResult, StagedMutationError> {
        let create_statement = self.staging.create_statement();
        debug!("Creating staging table: {}", create_statement);
        transaction.batch_execute(&create_statement).await.map_err(|e| {
            if e.code() == Some(&SqlState::DUPLICATE_TABLE) {
                StagedMutationError::DuplicateStagingTable(self.staging.name().to_string())
            } else {
                StagedMutationError::Postgres(e)
            }
        })?;
        *staging_created = true;

        debug!("Loading staging table: {}", self.copy_sql);
        let staged_rows = transaction.copy_in(&self.copy_sql, reader).await.map_err(|source| {
            StagedMutationError::LoadFormat { table: self.staging.name().to_string(), source }
        })?;

        debug!("Reconciling: {}", self.reconciliation.sql());
        let affected_rows =
            transaction.execute(self.reconciliation.sql(), &[]).await.map_err(|source| {
                StagedMutationError::Reconciliation {
                    table: self.target.qualified_name(),
                    source,
                }
            })?;

        transaction.batch_execute(&self.staging.drop_statement()).await?;

        Ok(StagedMutationResult {
            staging_table: self.staging.name().to_string(),
            staged_rows,
            affected_rows,
        })
    }

    /// Only called for a staging table this run created; a name clash leaves
    /// the other owner's table alone.
    async fn drop_staging(&self, session: &mut dyn StagingSession) {
        // the rollback normally discards the staging table already
        if let Err(e) = session.batch_execute(&self.staging.drop_statement()).await {
            error!("Could not drop staging table {}: {}", self.staging.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use tokio::{io::ReadBuf, time::timeout};

    use super::*;
    use crate::database::postgres::{
        table::{Column, PrimaryKey},
        test_session::MockSession,
    };

    /// Never yields a byte, like a client that stopped sending.
    struct StalledReader;

    impl AsyncRead for StalledReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    fn prices() -> Table {
        Table::new(
            "prices",
            vec![
                Column::new("ticker", "TEXT", false),
                Column::new("day", "DATE", false),
                Column::new("close", "NUMERIC", true),
            ],
            PrimaryKey::new(["ticker", "day"]),
        )
        .unwrap()
    }

    fn upsert() -> StagedMutation {
        StagedMutation::upsert(prices(), None, CopyOptions::default()).unwrap()
    }

    fn record(ticker: &str, day: &str, close: Option<&str>) -> Vec<SqlValue> {
        vec![SqlValue::from(ticker), SqlValue::from(day), SqlValue::from(close)]
    }

    #[tokio::test]
    async fn test_upsert_statement_order() {
        let mutation = upsert();
        let staging = mutation.staging_table().name().to_string();
        let mut session = MockSession::default();
        let mut reader: &[u8] = b"ticker,day,close\nAAPL,2020-01-02,300.35\n";

        let result = mutation.run(&mut session, &mut reader).await.unwrap();

        assert_eq!(session.statements.len(), 6);
        assert_eq!(session.statements[0], "BEGIN");
        assert!(session.statements[1].starts_with(&format!("CREATE TEMPORARY TABLE {} (", staging)));
        assert!(session.statements[2].starts_with(&format!("COPY {} FROM STDIN", staging)));
        assert!(session.statements[3].starts_with("INSERT INTO public.prices AS current"));
        assert!(session.statements[3].contains(&format!("FROM {}", staging)));
        assert_eq!(session.statements[4], format!("DROP TABLE IF EXISTS {};", staging));
        assert_eq!(session.statements[5], "COMMIT");

        assert_eq!(result.staging_table, staging);
        assert_eq!(result.staged_rows, 2);
        assert_eq!(result.affected_rows, 1);
    }

    #[tokio::test]
    async fn test_delete_stages_key_only() {
        let mutation = StagedMutation::delete(prices(), CopyOptions::default()).unwrap();
        let mut session = MockSession::default();

        mutation
            .run_records(&mut session, &[vec![SqlValue::from("AAPL"), SqlValue::from("2020-01-02")]])
            .await
            .unwrap();

        let staging = mutation.staging_table().name();
        assert!(staging.starts_with("tmp_bulk_delete_"));
        assert_eq!(mutation.staged_columns(), vec!["ticker", "day"]);
        assert_eq!(
            session.statements[3],
            format!(
                "DELETE FROM public.prices t USING {} d WHERE t.ticker=d.ticker AND t.day=d.day",
                staging
            )
        );
        assert_eq!(
            std::str::from_utf8(&session.copied).unwrap(),
            "\"ticker\",\"day\"\n\"AAPL\",\"2020-01-02\"\n"
        );
    }

    #[tokio::test]
    async fn test_load_failure_rolls_back_and_drops() {
        let mutation = upsert();
        let staging = mutation.staging_table().name().to_string();
        let mut session = MockSession::failing_on("COPY");

        let result = mutation.run_records(&mut session, &[record("AAPL", "2020-01-02", None)]).await;

        assert!(matches!(result, Err(StagedMutationError::LoadFormat { table, .. }) if table == staging));
        assert!(!session.statements.iter().any(|s| s == "COMMIT"));
        assert!(!session.statements.iter().any(|s| s.starts_with("INSERT")));
        assert_eq!(
            session.statements[session.statements.len() - 2..],
            ["ROLLBACK".to_string(), format!("DROP TABLE IF EXISTS {};", staging)]
        );
    }

    #[tokio::test]
    async fn test_failed_create_leaves_staging_table_alone() {
        let mutation = upsert();
        let mut session = MockSession::failing_on("CREATE TEMPORARY TABLE");

        let result = mutation.run_records(&mut session, &[record("AAPL", "2020-01-02", None)]).await;

        assert!(matches!(result, Err(StagedMutationError::Postgres(_))));
        assert_eq!(session.statements.last().map(String::as_str), Some("ROLLBACK"));
        assert!(!session.statements.iter().any(|s| s.starts_with("DROP")));
    }

    #[tokio::test]
    async fn test_cancelled_run_rolls_back() {
        let mutation = upsert();
        let mut session = MockSession::default();
        let mut reader = StalledReader;

        let result =
            timeout(Duration::from_millis(20), mutation.run(&mut session, &mut reader)).await;

        assert!(result.is_err());
        assert!(session.statements[2].starts_with("COPY"));
        assert_eq!(session.statements.last().map(String::as_str), Some("ROLLBACK"));
        assert!(!session.statements.contains(&"COMMIT".to_string()));
    }

    #[tokio::test]
    async fn test_reconciliation_failure_rolls_back() {
        let mutation = upsert();
        let mut session = MockSession::failing_on("ON CONFLICT");

        let result = mutation.run_records(&mut session, &[record("AAPL", "2020-01-02", None)]).await;

        assert!(matches!(
            result,
            Err(StagedMutationError::Reconciliation { table, .. }) if table == "public.prices"
        ));
        assert!(session.statements.contains(&"ROLLBACK".to_string()));
        assert!(!session.statements.contains(&"COMMIT".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_record_fails_before_io() {
        let mutation = upsert();
        let mut session = MockSession::default();

        let result = mutation
            .run_records(&mut session, &[record("AAPL", "2020-01-02", None), vec![SqlValue::Null]])
            .await;

        assert!(matches!(
            result,
            Err(StagedMutationError::InvalidRecord { row: 1, expected: 3, found: 1 })
        ));
        assert!(session.statements.is_empty());
    }

    #[tokio::test]
    async fn test_key_collapse_reconciles_with_do_nothing() {
        let pairs = Table::new(
            "pairs",
            vec![Column::new("foo", "INT", false), Column::new("bar", "INT", false)],
            PrimaryKey::new(["foo", "bar"]),
        )
        .unwrap();
        let mutation = StagedMutation::upsert(pairs, None, CopyOptions::default()).unwrap();

        assert!(mutation.reconciliation().sql().ends_with("ON CONFLICT (foo, bar) DO NOTHING"));
        assert!(!mutation.reconciliation().sql().contains("DO UPDATE"));
    }

    #[test]
    fn test_primary_key_required_before_io() {
        let unkeyed =
            Table::new("logs", vec![Column::new("line", "TEXT", true)], PrimaryKey::default())
                .unwrap();

        assert!(matches!(
            StagedMutation::upsert(unkeyed.clone(), None, CopyOptions::default()),
            Err(StagedMutationError::PrimaryKeyRequired(name)) if name == "public.logs"
        ));
        assert!(matches!(
            StagedMutation::delete(unkeyed, CopyOptions::default()),
            Err(StagedMutationError::PrimaryKeyRequired(_))
        ));
    }

    #[test]
    fn test_unknown_encoding_fails_at_construction() {
        let options = CopyOptions { encoding: "klingon".to_string(), ..Default::default() };

        assert!(matches!(
            StagedMutation::upsert(prices(), None, options),
            Err(StagedMutationError::EncodingNotSupported(_))
        ));
    }

    #[test]
    fn test_concurrent_instances_use_distinct_staging_tables() {
        let first = upsert();
        let second = upsert();

        assert_ne!(first.staging_table().name(), second.staging_table().name());
    }

    #[test]
    fn test_copy_targets_staging_table() {
        let mutation = upsert();

        assert!(mutation
            .copy_sql()
            .starts_with(&format!("COPY {} FROM STDIN", mutation.staging_table().name())));
    }
}
