//! In-memory `StagingSession` for unit tests.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_postgres::types::ToSql;

use crate::database::postgres::client::{PostgresError, StagingSession, StagingTransaction};

/// Records every statement it is handed, including the one that fails.
///
/// Transactions show up as `BEGIN`, `COMMIT` and `ROLLBACK`; a transaction
/// dropped while still open records `ROLLBACK` like the real guard. COPY data
/// is kept in `copied` and its directive in `statements`.
#[derive(Default)]
pub struct MockSession {
    pub statements: Vec<String>,
    pub copied: Vec<u8>,
    pub fail_on: Option<String>,
}

impl MockSession {
    pub fn failing_on(pattern: &str) -> Self {
        MockSession { fail_on: Some(pattern.to_string()), ..Default::default() }
    }

    fn record(&mut self, sql: &str) -> Result<(), PostgresError> {
        self.statements.push(sql.to_string());

        match &self.fail_on {
            Some(pattern) if sql.contains(pattern.as_str()) => {
                let message = format!("injected failure on {}", pattern);
                Err(PostgresError::CopyStream(std::io::Error::other(message)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl StagingSession for MockSession {
    async fn batch_execute(&mut self, sql: &str) -> Result<(), PostgresError> {
        self.record(sql)
    }

    async fn transaction<'a>(
        &'a mut self,
    ) -> Result<Box<dyn StagingTransaction + 'a>, PostgresError> {
        self.record("BEGIN")?;
        Ok(Box::new(MockTransaction { session: self, open: true }))
    }
}

pub struct MockTransaction<'a> {
    session: &'a mut MockSession,
    open: bool,
}

impl MockTransaction<'_> {
    fn record(&mut self, sql: &str) -> Result<(), PostgresError> {
        if !self.open {
            return Err(PostgresError::TransactionClosed);
        }
        self.session.record(sql)
    }
}

#[async_trait]
impl StagingTransaction for MockTransaction<'_> {
    async fn batch_execute(&mut self, sql: &str) -> Result<(), PostgresError> {
        self.record(sql)
    }

    async fn execute(
        &mut self,
        sql: &str,
        _params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, PostgresError> {
        self.record(sql)?;
        Ok(1)
    }

    async fn copy_in(
        &mut self,
        directive: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, PostgresError> {
        self.record(directive)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let rows = data.iter().filter(|byte| **byte == b'\n').count() as u64;
        self.session.copied.extend(data);
        Ok(rows)
    }

    async fn commit(&mut self) -> Result<(), PostgresError> {
        let result = self.record("COMMIT");
        self.open = false;
        result
    }

    async fn rollback(&mut self) -> Result<(), PostgresError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.session.record("ROLLBACK")
    }
}

impl Drop for MockTransaction<'_> {
    fn drop(&mut self) {
        if self.open {
            self.session.statements.push("ROLLBACK".to_string());
        }
    }
}
