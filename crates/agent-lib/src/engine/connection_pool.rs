//! Persistent connection pool
//!
//! A fixed set of slots, one per worker. A slot holds at most one open
//! connection; a slot whose connection closed or failed is reconnected by
//! the next holder. Checked-out slots go back to the pool when their guard
//! is dropped.

use super::worker_pool::PoolError;
use crate::runtime::{self, Connection, ConnectionFactory};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// One reusable connection slot
#[derive(Debug)]
struct ConnectionSlot {
    index: usize,
    connection: Option<Connection>,
}

/// Bounded pool of reusable runtime connections
pub struct ConnectionPool {
    factory: ConnectionFactory,
    size: usize,
    home: mpsc::Sender<ConnectionSlot>,
    available: Mutex<mpsc::Receiver<ConnectionSlot>>,
}

impl ConnectionPool {
    /// Create `size` empty slots; connections are opened on first use
    pub fn new(factory: ConnectionFactory, size: usize) -> Self {
        let size = size.max(1);
        let (home, available) = mpsc::channel(size);
        for index in 0..size {
            // Capacity equals the slot count, so this never fails
            let _ = home.try_send(ConnectionSlot {
                index,
                connection: None,
            });
        }

        Self {
            factory,
            size,
            home,
            available: Mutex::new(available),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently sitting in the pool
    pub fn available(&self) -> usize {
        self.home.max_capacity() - self.home.capacity()
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let slot = self
            .available
            .lock()
            .await
            .recv()
            .await
            .ok_or(PoolError::Closed)?;

        Ok(PooledConnection {
            slot: Some(slot),
            factory: self.factory.clone(),
            home: self.home.clone(),
        })
    }

    /// Open a connection in every slot so the first poll does not pay for it
    pub async fn connect_all(&self) -> runtime::Result<()> {
        let mut guards = Vec::with_capacity(self.size);
        for _ in 0..self.size {
            match self.acquire().await {
                Ok(guard) => guards.push(guard),
                Err(_) => break,
            }
        }
        for guard in &mut guards {
            guard.connection().await?;
        }
        debug!(connections = guards.len(), "Connection pool warmed up");
        Ok(())
    }
}

/// A checked-out slot; returns to its pool on drop
#[derive(Debug)]
pub struct PooledConnection {
    slot: Option<ConnectionSlot>,
    factory: ConnectionFactory,
    home: mpsc::Sender<ConnectionSlot>,
}

impl PooledConnection {
    /// Slot index, stable for the lifetime of the pool
    pub fn index(&self) -> usize {
        self.slot.as_ref().map_or(0, |slot| slot.index)
    }

    /// The slot's connection, reconnecting first if it is missing or closed
    pub async fn connection(&mut self) -> runtime::Result<&mut Connection> {
        let factory = &self.factory;
        let slot = self
            .slot
            .as_mut()
            .ok_or(runtime::RuntimeError::StreamClosed)?;

        match slot.connection.take() {
            Some(connection) if !connection.is_closed() => Ok(slot.connection.insert(connection)),
            stale => {
                if stale.is_some() {
                    debug!(slot = slot.index, "Pooled connection closed, reconnecting");
                }
                let connection = factory.connect().await?;
                Ok(slot.connection.insert(connection))
            }
        }
    }

    /// Drop the slot's connection so the next holder reconnects
    pub fn invalidate(&mut self) {
        if let Some(slot) = self.slot.as_mut() {
            slot.connection = None;
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            // Only fails once the pool itself is gone
            let _ = self.home.try_send(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Transport;
    use std::time::Duration;

    fn unreachable_factory() -> ConnectionFactory {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        ConnectionFactory::new(Transport::Tcp(address)).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let pool = ConnectionPool::new(unreachable_factory(), 2);
        assert_eq!(pool.available(), 2);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.index(), second.index());
        assert_eq!(pool.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err());

        drop(first);
        assert_eq!(pool.available(), 1);
        let third = tokio::time::timeout(Duration::from_millis(50), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        drop(second);
        drop(third);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_slot_count_never_changes() {
        let pool = ConnectionPool::new(unreachable_factory(), 3);
        for _ in 0..10 {
            let mut guard = pool.acquire().await.unwrap();
            guard.invalidate();
        }
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.size(), 3);
    }

    #[tokio::test]
    async fn test_failed_connect_keeps_slot() {
        let pool = ConnectionPool::new(unreachable_factory(), 1);
        {
            let mut guard = pool.acquire().await.unwrap();
            assert!(guard.connection().await.is_err());
        }
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_zero_size_is_one_slot() {
        let pool = ConnectionPool::new(unreachable_factory(), 0);
        assert_eq!(pool.size(), 1);
        assert!(pool.acquire().await.is_ok());
    }
}
