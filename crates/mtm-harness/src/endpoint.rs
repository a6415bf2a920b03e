//! Cluster node endpoints

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{HarnessError, Result};

/// Connection details for one cluster member
///
/// `name` is the identifier the partition tool knows the node by
/// (`node1`, `node2`, ...); the rest is plain Postgres connection data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeEndpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub database: String,
}

impl NodeEndpoint {
    /// Endpoint with default credentials (`postgres@host:port/postgres`)
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            user: "postgres".to_string(),
            password: None,
            database: "postgres".to_string(),
        }
    }

    /// Parse a libpq keyword/value string such as
    /// `dbname=postgres user=postgres host=127.0.0.1 port=5433`
    pub fn from_conninfo(name: impl Into<String>, conninfo: &str) -> Result<Self> {
        let mut endpoint = Self::new(name, "127.0.0.1", 5432);
        for pair in conninfo.split_whitespace() {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| HarnessError::Config(format!("Malformed conninfo entry: {}", pair)))?;
            match key {
                "host" | "hostaddr" => endpoint.host = value.to_string(),
                "port" => {
                    endpoint.port = value
                        .parse()
                        .map_err(|_| HarnessError::Config(format!("Invalid port: {}", value)))?
                }
                "user" => endpoint.user = value.to_string(),
                "password" => endpoint.password = Some(value.to_string()),
                "dbname" => endpoint.database = value.to_string(),
                other => {
                    tracing::debug!(key = other, "Ignoring conninfo keyword");
                }
            }
        }
        Ok(endpoint)
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}@{}:{}/{})",
            self.name, self.user, self.host, self.port, self.database
        )
    }
}
