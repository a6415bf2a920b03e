//! Postgres sessions backed by sqlx
//!
//! Each workload task owns one [`PgConnection`]; there is no pool because a
//! task never runs more than one transaction at a time and a broken
//! connection is simply dropped and re-established by the driver.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use std::time::Duration;
use tracing::debug;

use crate::endpoint::NodeEndpoint;
use crate::error::WorkloadError;
use crate::workload::{Connector, NodeSession, TxFailure, TxOutput, TxRequest};

const TRANSFER_DEBIT: &str = "UPDATE bank_test SET amount = amount - $1 WHERE uid = $2";
const TRANSFER_CREDIT: &str = "UPDATE bank_test SET amount = amount + $1 WHERE uid = $2";
const SUM_TOTAL: &str = "SELECT sum(amount)::bigint FROM bank_test";

/// Connection options for an endpoint
pub fn connect_options(endpoint: &NodeEndpoint) -> PgConnectOptions {
    let options = PgConnectOptions::new()
        .host(&endpoint.host)
        .port(endpoint.port)
        .username(&endpoint.user)
        .database(&endpoint.database)
        .application_name("mtm-harness");
    match &endpoint.password {
        Some(password) => options.password(password),
        None => options,
    }
}

/// `CREATE EXTENSION` statement with `name` quoted as an identifier
pub fn create_extension_sql(name: &str) -> String {
    format!("CREATE EXTENSION IF NOT EXISTS \"{}\"", name.replace('"', "\"\""))
}

/// Opens [`PgSession`]s with a bounded connect time
#[derive(Debug, Clone)]
pub struct PgConnector {
    connect_timeout: Duration,
    extension: Option<String>,
}

impl PgConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            extension: None,
        }
    }

    /// Also create `extension` on the first node when preparing the schema
    pub fn with_extension(mut self, extension: Option<String>) -> Self {
        self.extension = extension;
        self
    }

    async fn open(&self, endpoint: &NodeEndpoint) -> Result<PgConnection, WorkloadError> {
        let connect_error = |reason: String| WorkloadError::Connect {
            node: endpoint.name.clone(),
            reason,
        };
        let options = connect_options(endpoint);
        tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&options))
            .await
            .map_err(|_| connect_error(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| connect_error(e.to_string()))
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<Box<dyn NodeSession>, WorkloadError> {
        let conn = self.open(endpoint).await?;
        debug!(node = %endpoint, "Connected");
        Ok(Box::new(PgSession { conn }))
    }

    async fn prepare(&self, endpoint: &NodeEndpoint, accounts: u32) -> Result<(), WorkloadError> {
        let mut conn = self.open(endpoint).await?;
        if let Some(extension) = &self.extension {
            sqlx::query(&create_extension_sql(extension))
                .execute(&mut conn)
                .await?;
            debug!(node = %endpoint, extension = %extension, "Extension present");
        }
        sqlx::query("DROP TABLE IF EXISTS bank_test")
            .execute(&mut conn)
            .await?;
        sqlx::query("CREATE TABLE bank_test(uid int PRIMARY KEY, amount int)")
            .execute(&mut conn)
            .await?;
        sqlx::query("INSERT INTO bank_test SELECT g, 0 FROM generate_series(0, $1) AS g")
            .bind(i32::try_from(accounts).map_err(|_| {
                WorkloadError::Failed(format!("{} accounts exceed the int column", accounts))
            })?)
            .execute(&mut conn)
            .await?;
        conn.close().await?;
        Ok(())
    }
}

/// One open connection to a node
pub struct PgSession {
    conn: PgConnection,
}

#[async_trait]
impl NodeSession for PgSession {
    async fn execute(&mut self, request: &TxRequest) -> Result<TxOutput, TxFailure> {
        let mut tx = self.conn.begin().await.map_err(TxFailure::at_begin)?;

        let total = match *request {
            TxRequest::Transfer { from, to, amount } => {
                sqlx::query(TRANSFER_DEBIT)
                    .bind(amount)
                    .bind(from as i32)
                    .execute(&mut *tx)
                    .await
                    .map_err(TxFailure::in_body)?;
                sqlx::query(TRANSFER_CREDIT)
                    .bind(amount)
                    .bind(to as i32)
                    .execute(&mut *tx)
                    .await
                    .map_err(TxFailure::in_body)?;
                None
            }
            TxRequest::SumTotal => sqlx::query_scalar::<_, Option<i64>>(SUM_TOTAL)
                .fetch_one(&mut *tx)
                .await
                .map_err(TxFailure::in_body)?,
        };

        tx.commit().await.map_err(TxFailure::in_body)?;
        Ok(TxOutput { total })
    }
}
