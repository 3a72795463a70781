use std::collections::BTreeSet;
use std::sync::Mutex;

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{Error, Result};

const PORT_RANGE: u16 = 100;

/// Hands out free local ports, never the same one twice per invocation.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    reserved: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16) -> Self {
        Self {
            start,
            end: start.saturating_add(PORT_RANGE - 1),
            reserved: Mutex::new(BTreeSet::new()),
        }
    }

    /// Finds a port that can be bound on localhost and reserves it.
    ///
    /// # Errors
    /// [`Error::NoFreePort`] when every port of the range is taken.
    pub async fn allocate(&self, owner: &str) -> Result<u16> {
        let mut port = self.start;
        loop {
            if self.reserve(port) && Self::is_free(port).await {
                debug!(owner, port, "allocated port");
                return Ok(port);
            }
            if port == self.end {
                return Err(Error::NoFreePort {
                    start: self.start,
                    end: self.end,
                });
            }
            port += 1;
        }
    }

    pub fn allocated(&self) -> Vec<u16> {
        self.reserved
            .lock()
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default()
    }

    // Reservation happens before probing so concurrent callers never race
    // for the same port. A busy port stays reserved.
    fn reserve(&self, port: u16) -> bool {
        self.reserved
            .lock()
            .map(|mut r| r.insert(port))
            .unwrap_or(false)
    }

    async fn is_free(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn never_hands_out_the_same_port_twice() {
        let ports = PortAllocator::new(41000);
        let first = ports.allocate("a").await.unwrap();
        let second = ports.allocate("b").await.unwrap();
        assert_ne!(first, second);
        assert!(first >= 41000 && second <= 41099);
    }

    #[tokio::test]
    async fn skips_ports_in_use() {
        let busy = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        let ports = PortAllocator::new(busy_port);
        let allocated = ports.allocate("a").await.unwrap();
        assert_ne!(allocated, busy_port);
    }

    #[tokio::test]
    async fn reports_exhausted_range() {
        let ports = PortAllocator {
            start: 41500,
            end: 41500,
            reserved: Mutex::new(BTreeSet::from([41500])),
        };
        let err = ports.allocate("a").await.unwrap_err();
        assert_eq!(err.to_string(), "no free port available in 41500..=41500");
    }
}
