use std::{env, time::Duration};

use async_trait::async_trait;
use bb8::{Pool, PooledConnection, RunError};
use bb8_postgres::PostgresConnectionManager;
use bytes::{Bytes, BytesMut};
use dotenv::dotenv;
use futures::{pin_mut, SinkExt};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    task,
    time::timeout,
};
pub use tokio_postgres::types::ToSql;
use tokio_postgres::{
    config::SslMode, error::SqlState, Config, CopyInSink, Error as PgError, Row, ToStatement,
    Transaction as PgTransaction,
};
use tracing::{debug, error};

/// Size of each chunk pushed down a COPY stream.
const COPY_CHUNK_SIZE: usize = 64 * 1024;

pub fn connection_string() -> Result<String, env::VarError> {
    dotenv().ok();
    let connection = env::var("DATABASE_URL")?;
    Ok(connection)
}

#[derive(thiserror::Error, Debug)]
pub enum PostgresConnectionError {
    #[error("The database connection string is wrong please check your environment: {0}")]
    DatabaseConnectionConfigWrong(#[from] env::VarError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] tokio_postgres::Error),

    #[error("Can not connect to the database please make sure your connection string is correct")]
    CanNotConnectToDatabase,

    #[error("Could not parse connection string make sure it is correctly formatted")]
    CouldNotParseConnectionString,

    #[error("Could not create tls connector")]
    CouldNotCreateTlsConnector,
}

#[derive(thiserror::Error, Debug)]
pub enum PostgresError {
    #[error("PgError {0}")]
    PgError(#[from] PgError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] RunError<tokio_postgres::Error>),

    #[error("Could not read the copy stream: {0}")]
    CopyStream(#[from] std::io::Error),

    #[error("The transaction has already been committed or rolled back")]
    TransactionClosed,
}

impl PostgresError {
    /// The server's SQLSTATE, when the error came back from the server.
    pub fn code(&self) -> Option<&SqlState> {
        match self {
            PostgresError::PgError(e) => e.code(),
            _ => None,
        }
    }
}

/// One exclusively owned connection. Statements outside a transaction run in
/// autocommit; staged work runs on a transaction handed out by `transaction`.
#[async_trait]
pub trait StagingSession: Send {
    async fn batch_execute(&mut self, sql: &str) -> Result<(), PostgresError>;

    /// Opens a transaction. Dropping the handle without `commit` rolls it
    /// back, so a cancelled caller never leaves the connection mid transaction.
    async fn transaction<'a>(
        &'a mut self,
    ) -> Result<Box<dyn StagingTransaction + 'a>, PostgresError>;
}

/// An open transaction on a `StagingSession`.
#[async_trait]
pub trait StagingTransaction: Send {
    async fn batch_execute(&mut self, sql: &str) -> Result<(), PostgresError>;

    async fn execute(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, PostgresError>;

    /// Streams `reader` to the server as the data of the `COPY ... FROM STDIN`
    /// directive, returning the number of rows copied.
    async fn copy_in(
        &mut self,
        directive: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, PostgresError>;

    async fn commit(&mut self) -> Result<(), PostgresError>;

    /// Rolling back a finished transaction is a no-op.
    async fn rollback(&mut self) -> Result<(), PostgresError>;
}

type PostgresPool = Pool<PostgresConnectionManager<MakeTlsConnector>>;

pub struct PostgresSession<'a> {
    connection: PooledConnection<'a, PostgresConnectionManager<MakeTlsConnector>>,
}

#[async_trait]
impl StagingSession for PostgresSession<'_> {
    async fn batch_execute(&mut self, sql: &str) -> Result<(), PostgresError> {
        self.connection.batch_execute(sql).await.map_err(PostgresError::PgError)
    }

    async fn transaction<'a>(
        &'a mut self,
    ) -> Result<Box<dyn StagingTransaction + 'a>, PostgresError> {
        let transaction = self.connection.transaction().await?;
        Ok(Box::new(PostgresTransaction { transaction: Some(transaction) }))
    }
}

pub struct PostgresTransaction<'a> {
    transaction: Option<PgTransaction<'a>>,
}

impl<'a> PostgresTransaction<'a> {
    fn open(&self) -> Result<&PgTransaction<'a>, PostgresError> {
        self.transaction.as_ref().ok_or(PostgresError::TransactionClosed)
    }
}

#[async_trait]
impl StagingTransaction for PostgresTransaction<'_> {
    async fn batch_execute(&mut self, sql: &str) -> Result<(), PostgresError> {
        self.open()?.batch_execute(sql).await.map_err(PostgresError::PgError)
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, PostgresError> {
        self.open()?.execute(sql, params).await.map_err(PostgresError::PgError)
    }

    async fn copy_in(
        &mut self,
        directive: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, PostgresError> {
        let sink: CopyInSink<Bytes> = self.open()?.copy_in(directive).await?;
        pin_mut!(sink);

        let mut buffer = BytesMut::with_capacity(COPY_CHUNK_SIZE);
        loop {
            buffer.reserve(COPY_CHUNK_SIZE);
            // dropping the sink before `finish` aborts the COPY on the server
            let read = reader.read_buf(&mut buffer).await?;
            if read == 0 {
                break;
            }
            sink.send(buffer.split().freeze()).await?;
        }

        let rows = sink.finish().await?;
        Ok(rows)
    }

    async fn commit(&mut self) -> Result<(), PostgresError> {
        let transaction = self.transaction.take().ok_or(PostgresError::TransactionClosed)?;
        transaction.commit().await.map_err(PostgresError::PgError)
    }

    async fn rollback(&mut self) -> Result<(), PostgresError> {
        match self.transaction.take() {
            Some(transaction) => transaction.rollback().await.map_err(PostgresError::PgError),
            None => Ok(()),
        }
    }
}

pub struct PostgresClient {
    pool: PostgresPool,
}

impl PostgresClient {
    /// Connects using `DATABASE_URL` (a `.env` file is honoured).
    pub async fn new() -> Result<Self, PostgresConnectionError> {
        let connection_str = connection_string()?;
        Self::connect(&connection_str).await
    }

    pub async fn connect(connection_str: &str) -> Result<Self, PostgresConnectionError> {
        async fn _new(
            connection_str: &str,
            disable_ssl: bool,
        ) -> Result<PostgresClient, PostgresConnectionError> {
            let mut config: Config = connection_str
                .parse()
                .map_err(|_| PostgresConnectionError::CouldNotParseConnectionString)?;

            if disable_ssl {
                config.ssl_mode(SslMode::Disable);
            }

            let connector = TlsConnector::builder()
                .build()
                .map_err(|_| PostgresConnectionError::CouldNotCreateTlsConnector)?;
            let tls_connector = MakeTlsConnector::new(connector);

            let (client, connection) =
                match timeout(Duration::from_millis(5000), config.connect(tls_connector.clone()))
                    .await
                {
                    Ok(Ok((client, connection))) => (client, connection),
                    Ok(Err(e)) => {
                        // retry without ssl if ssl has been attempted and failed
                        if !disable_ssl &&
                            config.get_ssl_mode() != SslMode::Disable &&
                            !connection_str.contains("sslmode=require")
                        {
                            return Box::pin(_new(connection_str, true)).await;
                        }
                        error!("Error connecting to database: {}", e);
                        return Err(PostgresConnectionError::CanNotConnectToDatabase);
                    }
                    Err(e) => {
                        error!("Timeout connecting to database: {}", e);
                        return Err(PostgresConnectionError::CanNotConnectToDatabase);
                    }
                };

            let connection_handle = task::spawn(connection);

            if client.query_one("SELECT 1", &[]).await.is_err() {
                return Err(PostgresConnectionError::CanNotConnectToDatabase);
            }

            drop(client);
            match connection_handle.await {
                Ok(Ok(())) => (),
                Ok(Err(_)) | Err(_) => return Err(PostgresConnectionError::CanNotConnectToDatabase),
            }

            let manager = PostgresConnectionManager::new(config, tls_connector);
            let pool = Pool::builder().build(manager).await?;

            debug!("Connected to postgres");

            Ok(PostgresClient { pool })
        }

        _new(connection_str, false).await
    }

    /// Checks a connection out of the pool for exclusive use until the session
    /// is dropped.
    pub async fn session(&self) -> Result<PostgresSession<'_>, PostgresError> {
        let connection = self.pool.get().await?;
        Ok(PostgresSession { connection })
    }

    pub async fn batch_execute(&self, sql: &str) -> Result<(), PostgresError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(sql).await.map_err(PostgresError::PgError)
    }

    pub async fn execute<T>(
        &self,
        query: &T,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, PostgresError>
    where
        T: ?Sized + ToStatement,
    {
        let conn = self.pool.get().await?;
        conn.execute(query, params).await.map_err(PostgresError::PgError)
    }

    pub async fn query<T>(
        &self,
        query: &T,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, PostgresError>
    where
        T: ?Sized + ToStatement,
    {
        let conn = self.pool.get().await?;
        let rows = conn.query(query, params).await.map_err(PostgresError::PgError)?;
        Ok(rows)
    }

    pub async fn query_one_or_none<T>(
        &self,
        query: &T,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, PostgresError>
    where
        T: ?Sized + ToStatement,
    {
        let conn = self.pool.get().await?;
        let row = conn.query_opt(query, params).await.map_err(PostgresError::PgError)?;
        Ok(row)
    }
}
