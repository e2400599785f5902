use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Hands out host ports for instances from a fixed inclusive range.
///
/// A port is taken from the moment it is leased until the instance using it is
/// destroyed. Leases that are dropped without being committed go back to the
/// pool, so a failed provisioning attempt never strands a port.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    taken: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            taken: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }

    /// Mark ports of already-running instances as taken.
    pub fn reserve(&self, ports: impl IntoIterator<Item = u16>) {
        self.lock().extend(ports);
    }

    /// Lease the lowest free port, or `None` if the range is exhausted.
    pub fn lease(&self) -> Option<PortLease> {
        let mut taken = self.lock();
        let port = self.range.clone().find(|port| !taken.contains(port))?;
        taken.insert(port);
        Some(PortLease {
            port,
            allocator: self.clone(),
            committed: false,
        })
    }

    pub fn release(&self, port: u16) {
        self.lock().remove(&port);
    }

    pub fn is_taken(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        self.taken.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct PortLease {
    port: u16,
    allocator: PortAllocator,
    committed: bool,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Keep the port taken after the lease goes out of scope.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if !self.committed {
            self.allocator.release(self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_lowest_free_port() {
        let ports = PortAllocator::new(6000..=6002);
        ports.reserve([6000]);

        let lease = ports.lease().unwrap();
        assert_eq!(lease.port(), 6001);
    }

    #[test]
    fn dropped_lease_returns_port() {
        let ports = PortAllocator::new(6000..=6000);
        {
            let lease = ports.lease().unwrap();
            assert!(ports.is_taken(lease.port()));
            assert!(ports.lease().is_none());
        }
        assert!(!ports.is_taken(6000));
        assert_eq!(ports.lease().unwrap().port(), 6000);
    }

    #[test]
    fn committed_lease_keeps_port_until_released() {
        let ports = PortAllocator::new(6000..=6001);
        ports.lease().unwrap().commit();

        assert!(ports.is_taken(6000));
        assert_eq!(ports.lease().unwrap().port(), 6001);

        ports.release(6000);
        assert!(!ports.is_taken(6000));
    }
}
