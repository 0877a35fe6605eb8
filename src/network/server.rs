//! Network Server
//!
//! Accepts slave connections on the master and hands each socket to the
//! connection table.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use super::ConnectionTable;
use crate::error::{Error, Result};

/// Listening side of the master
pub struct NetworkServer {
    listener: TcpListener,
    table: Arc<ConnectionTable>,
}

impl NetworkServer {
    /// Bind the listening socket
    pub async fn bind(address: &str, table: Arc<ConnectionTable>) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| Error::Network(format!("cannot listen on {}: {}", address, e)))?;
        tracing::info!("Network server listening on {}", listener.local_addr()?);
        Ok(Self { listener, table })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let _ = socket.set_nodelay(true);
                            let id = self.table.attach(socket);
                            tracing::info!("Accepted connection {} from {}", id, addr);
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TransportEvent;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_accepts_and_reports_connections() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = ConnectionTable::new(tx);
        let server = NetworkServer::bind("127.0.0.1:0", Arc::clone(&table)).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(server.run(stop_rx));

        let _client = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(rx.recv().await, Some(TransportEvent::Connected(_))));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = ConnectionTable::new(tx);
        let first = NetworkServer::bind("127.0.0.1:0", Arc::clone(&table)).await.unwrap();
        let taken = first.local_addr().unwrap().to_string();

        let err = NetworkServer::bind(&taken, table).await.err().unwrap();
        assert!(matches!(err, Error::Network(_)));
    }
}
