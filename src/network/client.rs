//! Network Client
//!
//! Opens the single connection a slave keeps to its master.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{ConnectionId, ConnectionTable};
use crate::error::{Error, Result};

/// Dialing side of a slave
pub struct NetworkClient {
    table: Arc<ConnectionTable>,
    connect_timeout: Duration,
}

impl NetworkClient {
    /// Create a client registering its connection in `table`
    pub fn new(table: Arc<ConnectionTable>, connect_timeout: Duration) -> Self {
        Self {
            table,
            connect_timeout,
        }
    }

    /// Connect to `address` and start driving the connection
    pub async fn connect(&self, address: &str) -> Result<ConnectionId> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        let stream = match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: format!("timed out after {:?}", self.connect_timeout),
                })
            }
        };
        stream.set_nodelay(true)?;

        let id = self.table.attach(stream);
        tracing::info!("Connected to master at {} (connection {})", address, id);
        Ok(id)
    }
}
