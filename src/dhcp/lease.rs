//! Lease records shared by the v4 and v6 servers.
//!
//! A table is generic over the address family; the client key is the raw
//! client identifier (MAC for v4, DUID for v6). All mutation happens while
//! the owning server holds its lock, which is what makes allocate-and-insert
//! atomic.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Offered,
    Bound,
    Released,
    Expired,
}

#[derive(Debug, Clone)]
pub struct Lease<A> {
    pub client_id: Vec<u8>,
    pub address: A,
    pub state: LeaseState,
    pub acquired: DateTime<Utc>,
    pub duration: Duration,
}

impl<A: Copy> Lease<A> {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired + self.duration
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() < now
    }

    /// Offered or bound and not yet expired: the address is taken.
    pub fn holds_address(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, LeaseState::Offered | LeaseState::Bound) && !self.is_expired(now)
    }
}

#[derive(Debug, Default)]
pub struct LeaseTable<A> {
    leases: Vec<Lease<A>>,
}

impl<A: Copy + Eq> LeaseTable<A> {
    pub fn new() -> Self {
        Self { leases: Vec::new() }
    }

    pub fn find(&self, client_id: &[u8]) -> Option<&Lease<A>> {
        self.leases.iter().find(|l| l.client_id == client_id)
    }

    pub fn find_mut(&mut self, client_id: &[u8]) -> Option<&mut Lease<A>> {
        self.leases.iter_mut().find(|l| l.client_id == client_id)
    }

    /// No two active leases may hold the same address at any instant.
    pub fn address_in_use(&self, address: A, now: DateTime<Utc>) -> bool {
        self.leases
            .iter()
            .any(|l| l.address == address && l.holds_address(now))
    }

    /// Replaces any previous lease for the client.
    pub fn insert(&mut self, lease: Lease<A>) {
        self.leases.retain(|l| l.client_id != lease.client_id);
        self.leases.push(lease);
    }

    pub fn remove(&mut self, client_id: &[u8]) -> Option<Lease<A>> {
        let idx = self.leases.iter().position(|l| l.client_id == client_id)?;
        Some(self.leases.swap_remove(idx))
    }

    /// Marks overdue offered/bound leases expired; returns how many flipped.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let mut flipped = 0;
        for lease in &mut self.leases {
            if matches!(lease.state, LeaseState::Offered | LeaseState::Bound)
                && lease.is_expired(now)
            {
                lease.state = LeaseState::Expired;
                flipped += 1;
            }
        }
        flipped
    }

    pub fn bound_count(&self, now: DateTime<Utc>) -> usize {
        self.leases
            .iter()
            .filter(|l| l.state == LeaseState::Bound && !l.is_expired(now))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lease<A>> {
        self.leases.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn lease(client: u8, addr: Ipv4Addr, state: LeaseState, secs: i64) -> Lease<Ipv4Addr> {
        Lease {
            client_id: vec![client],
            address: addr,
            state,
            acquired: Utc::now(),
            duration: Duration::seconds(secs),
        }
    }

    #[test]
    fn active_lease_holds_its_address() {
        let mut table = LeaseTable::new();
        let addr = Ipv4Addr::new(10, 0, 10, 100);
        table.insert(lease(1, addr, LeaseState::Bound, 3600));
        assert!(table.address_in_use(addr, Utc::now()));
        assert!(!table.address_in_use(Ipv4Addr::new(10, 0, 10, 101), Utc::now()));
    }

    #[test]
    fn released_lease_frees_the_address() {
        let mut table = LeaseTable::new();
        let addr = Ipv4Addr::new(10, 0, 10, 100);
        table.insert(lease(1, addr, LeaseState::Released, 3600));
        assert!(!table.address_in_use(addr, Utc::now()));
    }

    #[test]
    fn sweep_expires_overdue_leases() {
        let mut table = LeaseTable::new();
        let addr = Ipv4Addr::new(10, 0, 10, 100);
        let mut overdue = lease(1, addr, LeaseState::Bound, 10);
        overdue.acquired = Utc::now() - Duration::seconds(60);
        table.insert(overdue);
        table.insert(lease(2, Ipv4Addr::new(10, 0, 10, 101), LeaseState::Bound, 3600));

        assert_eq!(table.sweep(Utc::now()), 1);
        assert_eq!(table.find(&[1]).unwrap().state, LeaseState::Expired);
        assert_eq!(table.find(&[2]).unwrap().state, LeaseState::Bound);
        assert!(!table.address_in_use(addr, Utc::now()));
    }

    #[test]
    fn insert_replaces_previous_client_lease() {
        let mut table = LeaseTable::new();
        table.insert(lease(1, Ipv4Addr::new(10, 0, 10, 100), LeaseState::Offered, 60));
        table.insert(lease(1, Ipv4Addr::new(10, 0, 10, 105), LeaseState::Bound, 3600));
        assert_eq!(table.iter().count(), 1);
        assert_eq!(table.find(&[1]).unwrap().address, Ipv4Addr::new(10, 0, 10, 105));
    }
}
