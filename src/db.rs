use chrono::prelude::*;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool, Postgres};
use std::time::Duration;
use tokio::time;
use tracing::{debug, info};

use crate::codec::DecodedValue;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("reading has {actual} values but table {table} expects {expected}")]
    Arity {
        table: String,
        expected: usize,
        actual: usize,
    },
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("insert failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("persisting reading timed out after {0:?}")]
    Timeout(Duration),
}

/// One decoded poll result, bound positionally to one table row.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub taken_at: DateTime<Utc>,
    pub values: Vec<DecodedValue>,
}

impl Reading {
    pub fn new(values: Vec<DecodedValue>) -> Self {
        Self {
            taken_at: Utc::now(),
            values,
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait ReadingSink {
    /// Store one reading as one row. Either the whole row is committed or
    /// nothing is.
    async fn persist(&mut self, reading: &Reading) -> Result<(), PersistenceError>;
}

/// Fixed-schema target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    pub table: String,
    pub columns: usize,
}

impl TableTarget {
    pub fn insert_statement(&self) -> String {
        let placeholders = (1..=self.columns)
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("INSERT INTO {} VALUES ({})", self.table, placeholders)
    }

    fn check_arity(&self, reading: &Reading) -> Result<(), PersistenceError> {
        if reading.values.len() == self.columns {
            Ok(())
        } else {
            Err(PersistenceError::Arity {
                table: self.table.clone(),
                expected: self.columns,
                actual: reading.values.len(),
            })
        }
    }
}

/// Accepts `name` or `schema.name`, each part an unquoted SQL identifier.
pub fn is_valid_table_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

#[derive(Debug)]
enum Connector {
    PerCall(PgConnectOptions),
    Pooled(PgPool),
}

/// PostgreSQL sink, one transaction per reading.
#[derive(Debug)]
pub struct PgSink {
    target: TableTarget,
    connector: Connector,
    timeout: Duration,
}

impl PgSink {
    /// Opens and closes a connection around every insert.
    pub fn per_call(options: PgConnectOptions, target: TableTarget, timeout: Duration) -> Self {
        Self {
            target,
            connector: Connector::PerCall(options),
            timeout,
        }
    }

    /// Checks connections out of a pool that connects lazily on first use.
    pub fn pooled(
        options: PgConnectOptions,
        max_connections: u32,
        target: TableTarget,
        timeout: Duration,
    ) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect_lazy_with(options);
        Self {
            target,
            connector: Connector::Pooled(pool),
            timeout,
        }
    }

    pub fn target(&self) -> &TableTarget {
        &self.target
    }

    pub async fn close(&self) {
        if let Connector::Pooled(pool) = &self.connector {
            pool.close().await;
        }
    }

    async fn insert(&self, reading: &Reading) -> Result<(), PersistenceError> {
        let sql = self.target.insert_statement();
        let mut query = sqlx::query::<Postgres>(&sql);
        for value in &reading.values {
            query = match *value {
                // postgres has no one-byte integer
                DecodedValue::I8(v) => query.bind(i16::from(v)),
                DecodedValue::I16(v) => query.bind(v),
                DecodedValue::I32(v) => query.bind(v),
                DecodedValue::F32(v) => query.bind(v),
            };
        }

        match &self.connector {
            Connector::PerCall(options) => {
                let mut conn = PgConnection::connect_with(options)
                    .await
                    .map_err(PersistenceError::Connect)?;
                let mut tx = conn.begin().await.map_err(PersistenceError::Connect)?;
                query
                    .execute(&mut *tx)
                    .await
                    .map_err(PersistenceError::Query)?;
                tx.commit().await.map_err(PersistenceError::Query)?;
                if let Err(e) = conn.close().await {
                    debug!("closing database connection failed: {}", e);
                }
            }
            Connector::Pooled(pool) => {
                let mut tx = pool.begin().await.map_err(PersistenceError::Connect)?;
                query
                    .execute(&mut *tx)
                    .await
                    .map_err(PersistenceError::Query)?;
                tx.commit().await.map_err(PersistenceError::Query)?;
            }
        }

        Ok(())
    }
}

impl ReadingSink for PgSink {
    async fn persist(&mut self, reading: &Reading) -> Result<(), PersistenceError> {
        self.target.check_arity(reading)?;

        time::timeout(self.timeout, self.insert(reading))
            .await
            .map_err(|_| PersistenceError::Timeout(self.timeout))??;

        info!(
            "Inserted reading taken at {} into {}",
            reading.taken_at.to_rfc3339(),
            self.target.table
        );
        Ok(())
    }
}
