use tracing::{debug, error, warn};

use crate::database::postgres::client::{PostgresError, StagingSession, StagingTransaction};

/// Rolls back `transaction`. A failure is only logged, the caller is already
/// returning the error that caused the rollback.
pub async fn rollback(transaction: &mut dyn StagingTransaction) {
    if let Err(e) = transaction.rollback().await {
        error!("Rollback failed: {}", e);
    }
}

/// Runs every statement in one transaction. The first failure rolls the whole
/// transaction back and is returned.
pub async fn execute_transaction<S: AsRef<str>>(
    session: &mut dyn StagingSession,
    statements: &[S],
) -> Result<(), PostgresError> {
    let mut transaction = session.transaction().await?;

    for statement in statements {
        let statement = statement.as_ref();
        debug!("Executing: {}", statement);
        if let Err(e) = transaction.batch_execute(statement).await {
            rollback(transaction.as_mut()).await;
            return Err(e);
        }
    }

    transaction.commit().await
}

/// Best effort: every statement gets its own transaction and a failing one is
/// rolled back and skipped. Returns the indexes of the statements that failed.
pub async fn execute_transactions<S: AsRef<str>>(
    session: &mut dyn StagingSession,
    statements: &[S],
) -> Result<Vec<usize>, PostgresError> {
    let mut failed = Vec::new();

    for (index, statement) in statements.iter().enumerate() {
        let statement = statement.as_ref();
        let mut transaction = session.transaction().await?;

        match transaction.batch_execute(statement).await {
            Ok(()) => transaction.commit().await?,
            Err(e) => {
                warn!("Statement {} failed and was rolled back: {} - {}", index, statement, e);
                transaction.rollback().await?;
                failed.push(index);
            }
        }
    }

    Ok(failed)
}
