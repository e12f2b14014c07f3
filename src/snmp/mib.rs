//! Ordered OID -> typed-value store backing each SNMP agent.
//!
//! Keys live in a `BTreeMap`, so lexicographic NEXT is one `range` call and
//! walk-file ingest of 10^5 entries stays O(N log N). Writers take the write
//! lock; readers (including dynamic-entry callbacks) run under the read lock.
//!
//! Dynamic entries resolve through a callback at read time and win over the
//! stored value; the stored value is retained so a later SET has something to
//! replace. sysUpTime is the canonical dynamic entry.

use std::collections::Bound::{Excluded, Unbounded};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::oid::Oid;
use super::value::MibValue;

pub type DynamicFn = Arc<dyn Fn() -> MibValue + Send + Sync>;

struct MibEntry {
    value: MibValue,
    dynamic: Option<DynamicFn>,
}

#[derive(Default)]
pub struct MibStore {
    entries: RwLock<BTreeMap<Oid, MibEntry>>,
}

impl MibStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the stored value. An existing dynamic resolver is
    /// kept and still wins on reads.
    pub fn set(&self, oid: Oid, value: MibValue) {
        let mut map = self.entries.write().expect("mib lock poisoned");
        match map.get_mut(&oid) {
            Some(entry) => entry.value = value,
            None => {
                map.insert(oid, MibEntry { value, dynamic: None });
            }
        }
    }

    /// Registers a dynamic entry. `fallback` is what SET overwrites and what
    /// a walk dump shows when the callback is unavailable.
    pub fn set_dynamic(&self, oid: Oid, resolver: DynamicFn, fallback: MibValue) {
        let mut map = self.entries.write().expect("mib lock poisoned");
        map.insert(
            oid,
            MibEntry { value: fallback, dynamic: Some(resolver) },
        );
    }

    pub fn get(&self, oid: &Oid) -> Option<MibValue> {
        let map = self.entries.read().expect("mib lock poisoned");
        map.get(oid).map(resolve)
    }

    /// Smallest key strictly greater than `oid`, or `None` at the end of the
    /// MIB view.
    pub fn next(&self, oid: &Oid) -> Option<(Oid, MibValue)> {
        let map = self.entries.read().expect("mib lock poisoned");
        map.range((Excluded(oid.clone()), Unbounded))
            .next()
            .map(|(k, entry)| (k.clone(), resolve(entry)))
    }

    pub fn contains(&self, oid: &Oid) -> bool {
        self.entries.read().expect("mib lock poisoned").contains_key(oid)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("mib lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialized snapshot in iteration order.
    pub fn dump(&self) -> Vec<(Oid, MibValue)> {
        let map = self.entries.read().expect("mib lock poisoned");
        map.iter().map(|(k, entry)| (k.clone(), resolve(entry))).collect()
    }
}

fn resolve(entry: &MibEntry) -> MibValue {
    match &entry.dynamic {
        Some(f) => f(),
        None => entry.value.clone(),
    }
}

/// Well-known OIDs used by the agents, the interface scaffold and the trap
/// emitter.
pub mod well_known {
    use super::Oid;

    pub fn sys_descr() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 2, 1, 1, 1, 0])
    }

    pub fn sys_object_id() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 2, 1, 1, 2, 0])
    }

    pub fn sys_uptime() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 2, 1, 1, 3, 0])
    }

    pub fn sys_contact() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 2, 1, 1, 4, 0])
    }

    pub fn sys_name() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 2, 1, 1, 5, 0])
    }

    pub fn sys_location() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 2, 1, 1, 6, 0])
    }

    pub fn sys_services() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 2, 1, 1, 7, 0])
    }

    pub fn if_number() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 2, 1, 2, 1, 0])
    }

    /// ifTable column for one interface index: 1.3.6.1.2.1.2.2.1.<col>.<idx>
    pub fn if_column(column: u32, index: u32) -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 2, 1, 2, 2, 1, column, index])
    }

    pub const IF_DESCR: u32 = 2;
    pub const IF_TYPE: u32 = 3;
    pub const IF_SPEED: u32 = 5;
    pub const IF_PHYS_ADDRESS: u32 = 6;
    pub const IF_OPER_STATUS: u32 = 8;
    pub const IF_IN_OCTETS: u32 = 10;
    pub const IF_IN_DISCARDS: u32 = 13;
    pub const IF_IN_ERRORS: u32 = 14;
    pub const IF_OUT_OCTETS: u32 = 16;
    pub const IF_OUT_DISCARDS: u32 = 19;
    pub const IF_OUT_ERRORS: u32 = 20;

    /// dot3StatsFCSErrors.<idx>
    pub fn dot3_fcs_errors(index: u32) -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 2, 1, 10, 7, 2, 1, 3, index])
    }

    /// hrProcessorLoad.1
    pub fn cpu_load() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 2, 1, 25, 3, 3, 1, 2, 1])
    }

    /// Memory used percentage (host-resources style scalar the tool exposes).
    pub fn memory_used() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 2, 1, 25, 2, 3, 1, 6, 1])
    }

    /// Disk used percentage.
    pub fn disk_used() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 2, 1, 25, 2, 3, 1, 6, 2])
    }

    /// Interface utilization percentage (enterprise scalar).
    pub fn if_utilization() -> Oid {
        enterprise().extend(&[2, 1])
    }

    /// Private enterprise arc for this simulator.
    pub fn enterprise() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 4, 1, 51515])
    }

    pub fn snmp_trap_oid() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 6, 3, 1, 1, 4, 1, 0])
    }

    pub fn trap_cold_start() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 6, 3, 1, 1, 5, 1])
    }

    pub fn trap_link_down() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 6, 3, 1, 1, 5, 3])
    }

    pub fn trap_link_up() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 6, 3, 1, 1, 5, 4])
    }

    pub fn trap_auth_failure() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 6, 3, 1, 1, 5, 5])
    }

    pub fn trap_high_cpu() -> Oid {
        enterprise().extend(&[1, 1])
    }

    pub fn trap_high_memory() -> Oid {
        enterprise().extend(&[1, 2])
    }

    pub fn trap_high_disk() -> Oid {
        enterprise().extend(&[1, 3])
    }

    pub fn trap_interface_errors() -> Oid {
        enterprise().extend(&[1, 4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn oid(s: &str) -> Oid {
        s.parse().unwrap()
    }

    #[test]
    fn next_is_strictly_greater_in_numeric_order() {
        let store = MibStore::new();
        store.set(oid("1.3.6.1.2.1.1.1.0"), MibValue::string("a"));
        store.set(oid("1.3.6.1.2.1.1.2.0"), MibValue::string("b"));
        store.set(oid("1.3.6.1.2.1.1.10.0"), MibValue::string("c"));

        let (next, _) = store.next(&oid("1.3.6.1.2.1.1")).unwrap();
        assert_eq!(next, oid("1.3.6.1.2.1.1.1.0"));
        let (next, _) = store.next(&oid("1.3.6.1.2.1.1.2.0")).unwrap();
        assert_eq!(next, oid("1.3.6.1.2.1.1.10.0"));
        assert!(store.next(&oid("1.3.6.1.2.1.1.10.0")).is_none());
    }

    #[test]
    fn next_from_before_first_key() {
        let store = MibStore::new();
        store.set(oid("1.3.6.1"), MibValue::Null);
        let (next, _) = store.next(&oid("0.0")).unwrap();
        assert_eq!(next, oid("1.3.6.1"));
    }

    #[test]
    fn dynamic_wins_on_read_but_set_value_is_kept() {
        let store = MibStore::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        store.set_dynamic(
            oid("1.3.6.1.2.1.1.3.0"),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                MibValue::TimeTicks(777)
            }),
            MibValue::TimeTicks(0),
        );

        assert_eq!(store.get(&oid("1.3.6.1.2.1.1.3.0")), Some(MibValue::TimeTicks(777)));
        // SET replaces the fallback; the read path still resolves dynamically.
        store.set(oid("1.3.6.1.2.1.1.3.0"), MibValue::TimeTicks(5));
        assert_eq!(store.get(&oid("1.3.6.1.2.1.1.3.0")), Some(MibValue::TimeTicks(777)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = MibStore::new();
        store.set(oid("1.3.6.1.9"), MibValue::Integer32(17));
        assert_eq!(store.get(&oid("1.3.6.1.9")), Some(MibValue::Integer32(17)));
        store.set(oid("1.3.6.1.9"), MibValue::Integer32(18));
        assert_eq!(store.get(&oid("1.3.6.1.9")), Some(MibValue::Integer32(18)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn dump_preserves_iteration_order() {
        let store = MibStore::new();
        store.set(oid("1.3.6.1.2.1.2.2.1.2.1"), MibValue::string("eth0"));
        store.set(oid("1.3.6.1.2.1.1.1.0"), MibValue::string("descr"));
        store.set(oid("1.3.6.1.2.1.1.10.0"), MibValue::Null);
        store.set(oid("1.3.6.1.2.1.1.2.0"), MibValue::Null);
        let dump = store.dump();
        let keys: Vec<String> = dump.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(
            keys,
            vec![
                "1.3.6.1.2.1.1.1.0",
                "1.3.6.1.2.1.1.2.0",
                "1.3.6.1.2.1.1.10.0",
                "1.3.6.1.2.1.2.2.1.2.1",
            ]
        );
    }
}
