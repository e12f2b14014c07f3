//! Per-device SNMPv2c agent.
//!
//! Each agent owns its MIB store exclusively. Construction seeds the system
//! group from device properties, wires the dynamic entries (sysUpTime, the
//! interface counters with error-injection calibration, the resource gauges)
//! and finally ingests the walk file, whose values override seeded ones while
//! dynamic resolvers keep winning on reads.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::config::{validate_walk_path, ConfigError, DeviceConfig};
use crate::core::device::DeviceCounters;
use crate::errorinj::{calibrated_counter, ErrorKind, ErrorStateManager};

use super::ber::{self, BoundValue, Pdu, PduKind, SnmpMessage};
use super::mib::{well_known, MibStore};
use super::oid::Oid;
use super::value::MibValue;
use super::walk;

/// Baselines reported when no error injection is active.
const BASELINE_CPU: i32 = 5;
const BASELINE_MEMORY: u32 = 20;
const BASELINE_DISK: u32 = 35;

#[derive(Debug, PartialEq, Eq)]
pub enum AgentOutcome {
    /// Encoded Response message, ready for the UDP reply.
    Response(Vec<u8>),
    /// Community mismatch: discard, optionally emit authenticationFailure.
    AuthenticationFailure,
    /// Not something this agent answers (undecodable, wrong version...).
    Discard,
}

pub struct SnmpAgent {
    community: String,
    store: MibStore,
    started: Instant,
    auth_failures: AtomicU64,
}

impl SnmpAgent {
    pub fn new(
        cfg: &DeviceConfig,
        walk_base: Option<&Path>,
        counters: Arc<DeviceCounters>,
        errors: Arc<ErrorStateManager>,
    ) -> Result<Self, ConfigError> {
        let snmp = &cfg.snmp;
        let store = MibStore::new();
        let started = Instant::now();

        seed_system_group(&store, cfg, started);
        seed_interface_group(&store, cfg, counters, errors.clone());
        seed_resource_gauges(&store, cfg, errors);

        if let Some(path) = &snmp.walk_file {
            let resolved = validate_walk_path(path, walk_base)?;
            let report = walk::load_walk_file(&resolved).map_err(|e| ConfigError::WalkPath {
                path: resolved.clone(),
                reason: e.to_string(),
            })?;
            let loaded = report.entries.len();
            for (oid, value) in report.entries {
                store.set(oid, value);
            }
            info!(
                "device {}: loaded {} OIDs from {} ({} skipped)",
                cfg.name,
                loaded,
                resolved.display(),
                report.skipped
            );
        }

        Ok(Self {
            community: snmp.community.clone(),
            store,
            started,
            auth_failures: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &MibStore {
        &self.store
    }

    /// Hundredths of a second since the agent started.
    pub fn uptime_ticks(&self) -> u32 {
        (self.started.elapsed().as_millis() / 10) as u32
    }

    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Relaxed)
    }

    /// Runs one request message against the store.
    pub fn handle_message(&self, bytes: &[u8]) -> AgentOutcome {
        let msg = match ber::decode_message(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("undecodable SNMP message: {e}");
                return AgentOutcome::Discard;
            }
        };
        // SNMPv1 (0) and v2c (1) both carry community auth.
        if msg.version != 0 && msg.version != 1 {
            return AgentOutcome::Discard;
        }
        if msg.community != self.community.as_bytes() {
            self.auth_failures.fetch_add(1, Relaxed);
            return AgentOutcome::AuthenticationFailure;
        }

        let bindings = match msg.pdu.kind {
            PduKind::Get => self.do_get(&msg.pdu),
            PduKind::GetNext => self.do_getnext(&msg.pdu),
            PduKind::GetBulk => self.do_getbulk(&msg.pdu),
            PduKind::Set => self.do_set(&msg.pdu),
            _ => return AgentOutcome::Discard,
        };

        let response = SnmpMessage {
            version: msg.version,
            community: msg.community,
            pdu: Pdu {
                kind: PduKind::Response,
                request_id: msg.pdu.request_id,
                error_status: 0,
                error_index: 0,
                bindings,
            },
        };
        AgentOutcome::Response(ber::encode_message(&response))
    }

    fn do_get(&self, pdu: &Pdu) -> Vec<(Oid, BoundValue)> {
        pdu.bindings
            .iter()
            .map(|(oid, _)| match self.store.get(oid) {
                Some(value) => (oid.clone(), BoundValue::Value(value)),
                None => (oid.clone(), BoundValue::NoSuchObject),
            })
            .collect()
    }

    fn do_getnext(&self, pdu: &Pdu) -> Vec<(Oid, BoundValue)> {
        pdu.bindings
            .iter()
            .map(|(oid, _)| match self.store.next(oid) {
                Some((next, value)) => (next, BoundValue::Value(value)),
                None => (oid.clone(), BoundValue::EndOfMibView),
            })
            .collect()
    }

    /// RFC 3416 semantics: the first `non_repeaters` variables get a single
    /// NEXT; the rest advance round-robin up to `max_repetitions` times, each
    /// variable stopping once it reports EndOfMibView.
    fn do_getbulk(&self, pdu: &Pdu) -> Vec<(Oid, BoundValue)> {
        let non_repeaters = pdu.error_status.max(0) as usize;
        let max_repetitions = pdu.error_index.max(0) as usize;
        let mut out = Vec::new();

        for (oid, _) in pdu.bindings.iter().take(non_repeaters) {
            match self.store.next(oid) {
                Some((next, value)) => out.push((next, BoundValue::Value(value))),
                None => out.push((oid.clone(), BoundValue::EndOfMibView)),
            }
        }

        let repeaters: Vec<&(Oid, BoundValue)> =
            pdu.bindings.iter().skip(non_repeaters).collect();
        let mut cursors: Vec<Option<Oid>> =
            repeaters.iter().map(|(oid, _)| Some(oid.clone())).collect();

        for _ in 0..max_repetitions {
            let mut progressed = false;
            for cursor in cursors.iter_mut() {
                let Some(position) = cursor else { continue };
                match self.store.next(position) {
                    Some((next, value)) => {
                        out.push((next.clone(), BoundValue::Value(value)));
                        *cursor = Some(next);
                        progressed = true;
                    }
                    None => {
                        out.push((position.clone(), BoundValue::EndOfMibView));
                        *cursor = None;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        out
    }

    /// SET updates or inserts without type promotion checks; the loader is
    /// responsible for walk-file type fidelity.
    fn do_set(&self, pdu: &Pdu) -> Vec<(Oid, BoundValue)> {
        for (oid, bound) in &pdu.bindings {
            if let BoundValue::Value(value) = bound {
                self.store.set(oid.clone(), value.clone());
            }
        }
        pdu.bindings.clone()
    }
}

fn seed_system_group(store: &MibStore, cfg: &DeviceConfig, started: Instant) {
    let snmp = &cfg.snmp;
    let descr = snmp
        .sysdescr
        .clone()
        .or_else(|| cfg.properties.get("sysDescr").cloned())
        .unwrap_or_else(|| format!("{} {}", cfg.kind, cfg.name));
    store.set(well_known::sys_descr(), MibValue::string(descr));

    let object_id = cfg
        .properties
        .get("sysObjectID")
        .and_then(|s| s.parse::<Oid>().ok())
        .unwrap_or_else(|| well_known::enterprise().extend(&[3, 1]));
    store.set(well_known::sys_object_id(), MibValue::Oid(object_id));

    store.set_dynamic(
        well_known::sys_uptime(),
        Arc::new(move || MibValue::TimeTicks((started.elapsed().as_millis() / 10) as u32)),
        MibValue::TimeTicks(0),
    );

    let contact = snmp
        .syscontact
        .clone()
        .or_else(|| cfg.properties.get("sysContact").cloned())
        .unwrap_or_default();
    store.set(well_known::sys_contact(), MibValue::string(contact));

    let name = snmp
        .sysname
        .clone()
        .or_else(|| cfg.properties.get("sysName").cloned())
        .unwrap_or_else(|| cfg.name.clone());
    store.set(well_known::sys_name(), MibValue::string(name));

    let location = snmp
        .syslocation
        .clone()
        .or_else(|| cfg.properties.get("sysLocation").cloned())
        .unwrap_or_default();
    store.set(well_known::sys_location(), MibValue::string(location));

    store.set(well_known::sys_services(), MibValue::Integer32(72));
}

fn seed_interface_group(
    store: &MibStore,
    cfg: &DeviceConfig,
    counters: Arc<DeviceCounters>,
    errors: Arc<ErrorStateManager>,
) {
    let if_name = cfg
        .properties
        .get("interface")
        .cloned()
        .unwrap_or_else(|| "eth0".to_string());
    let device_ip = cfg.ips.first().copied();

    store.set(well_known::if_number(), MibValue::Integer32(1));
    store.set(
        well_known::if_column(well_known::IF_DESCR, 1),
        MibValue::string(&if_name),
    );
    // ethernetCsmacd(6)
    store.set(
        well_known::if_column(well_known::IF_TYPE, 1),
        MibValue::Integer32(6),
    );
    store.set(
        well_known::if_column(well_known::IF_SPEED, 1),
        MibValue::Gauge32(1_000_000_000),
    );
    store.set(
        well_known::if_column(well_known::IF_PHYS_ADDRESS, 1),
        MibValue::OctetString(cfg.mac.bytes().to_vec()),
    );
    store.set(
        well_known::if_column(well_known::IF_OPER_STATUS, 1),
        MibValue::Integer32(1),
    );

    let c = counters.clone();
    store.set_dynamic(
        well_known::if_column(well_known::IF_IN_OCTETS, 1),
        Arc::new(move || MibValue::Counter32(c.octets_in.load(Relaxed) as u32)),
        MibValue::Counter32(0),
    );
    let c = counters.clone();
    store.set_dynamic(
        well_known::if_column(well_known::IF_OUT_OCTETS, 1),
        Arc::new(move || MibValue::Counter32(c.octets_out.load(Relaxed) as u32)),
        MibValue::Counter32(0),
    );

    let c = counters.clone();
    let e = errors.clone();
    let name = if_name.clone();
    store.set_dynamic(
        well_known::if_column(well_known::IF_IN_ERRORS, 1),
        Arc::new(move || {
            let base = c.in_errors.load(Relaxed);
            let magnitude = device_ip
                .and_then(|ip| e.magnitude(ip, &name, ErrorKind::InterfaceErrors))
                .unwrap_or(0);
            MibValue::Counter32(calibrated_counter(base, magnitude) as u32)
        }),
        MibValue::Counter32(0),
    );

    let c = counters.clone();
    let e = errors.clone();
    let name = if_name.clone();
    store.set_dynamic(
        well_known::if_column(well_known::IF_IN_DISCARDS, 1),
        Arc::new(move || {
            let base = c.in_discards.load(Relaxed);
            let magnitude = device_ip
                .and_then(|ip| e.magnitude(ip, &name, ErrorKind::Discards))
                .unwrap_or(0);
            MibValue::Counter32(calibrated_counter(base, magnitude) as u32)
        }),
        MibValue::Counter32(0),
    );

    let c = counters;
    let e = errors;
    let name = if_name;
    store.set_dynamic(
        well_known::dot3_fcs_errors(1),
        Arc::new(move || {
            let base = c.in_errors.load(Relaxed);
            let magnitude = device_ip
                .and_then(|ip| e.magnitude(ip, &name, ErrorKind::Fcs))
                .unwrap_or(0);
            MibValue::Counter32(calibrated_counter(base, magnitude) as u32)
        }),
        MibValue::Counter32(0),
    );
}

fn seed_resource_gauges(store: &MibStore, cfg: &DeviceConfig, errors: Arc<ErrorStateManager>) {
    let if_name = cfg
        .properties
        .get("interface")
        .cloned()
        .unwrap_or_else(|| "eth0".to_string());
    let device_ip = cfg.ips.first().copied();

    let e = errors.clone();
    let name = if_name.clone();
    store.set_dynamic(
        well_known::cpu_load(),
        Arc::new(move || {
            let value = device_ip
                .and_then(|ip| e.magnitude(ip, &name, ErrorKind::Cpu))
                .map(|m| m as i32)
                .unwrap_or(BASELINE_CPU);
            MibValue::Integer32(value)
        }),
        MibValue::Integer32(BASELINE_CPU),
    );

    let e = errors.clone();
    let name = if_name.clone();
    store.set_dynamic(
        well_known::memory_used(),
        Arc::new(move || {
            let value = device_ip
                .and_then(|ip| e.magnitude(ip, &name, ErrorKind::Memory))
                .map(|m| m as u32)
                .unwrap_or(BASELINE_MEMORY);
            MibValue::Gauge32(value)
        }),
        MibValue::Gauge32(BASELINE_MEMORY),
    );

    let e = errors.clone();
    let name = if_name.clone();
    store.set_dynamic(
        well_known::disk_used(),
        Arc::new(move || {
            let value = device_ip
                .and_then(|ip| e.magnitude(ip, &name, ErrorKind::Disk))
                .map(|m| m as u32)
                .unwrap_or(BASELINE_DISK);
            MibValue::Gauge32(value)
        }),
        MibValue::Gauge32(BASELINE_DISK),
    );

    let e = errors;
    let name = if_name;
    store.set_dynamic(
        well_known::if_utilization(),
        Arc::new(move || {
            let value = device_ip
                .and_then(|ip| e.magnitude(ip, &name, ErrorKind::Utilization))
                .map(|m| m as u32)
                .unwrap_or(0);
            MibValue::Gauge32(value)
        }),
        MibValue::Gauge32(0),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use mac_address::MacAddress;
    use std::net::IpAddr;
    use std::time::Duration;

    fn request(kind: PduKind, oids: &[&str], status: i32, index: i32) -> Vec<u8> {
        let bindings = oids
            .iter()
            .map(|s| (s.parse().unwrap(), BoundValue::Unspecified))
            .collect();
        ber::encode_message(&SnmpMessage {
            version: 1,
            community: b"public".to_vec(),
            pdu: Pdu {
                kind,
                request_id: 7,
                error_status: status,
                error_index: index,
                bindings,
            },
        })
    }

    fn response(outcome: AgentOutcome) -> Pdu {
        match outcome {
            AgentOutcome::Response(bytes) => ber::decode_message(&bytes).unwrap().pdu,
            other => panic!("expected response, got {other:?}"),
        }
    }

    fn agent() -> SnmpAgent {
        agent_with_errors(Arc::new(ErrorStateManager::new()))
    }

    fn agent_with_errors(errors: Arc<ErrorStateManager>) -> SnmpAgent {
        let mut cfg = DeviceConfig::new("r1", "router", MacAddress::new([2, 0, 0, 0, 0, 1]));
        cfg.ips.push("10.0.0.5".parse::<IpAddr>().unwrap());
        cfg.snmp.enabled = true;
        cfg.snmp.sysdescr = Some("Test Router".into());
        SnmpAgent::new(&cfg, None, Arc::new(DeviceCounters::default()), errors).unwrap()
    }

    #[test]
    fn get_returns_exact_value() {
        let agent = agent();
        let pdu = response(agent.handle_message(&request(PduKind::Get, &["1.3.6.1.2.1.1.1.0"], 0, 0)));
        assert_eq!(
            pdu.bindings[0].1,
            BoundValue::Value(MibValue::string("Test Router"))
        );
    }

    #[test]
    fn get_unknown_oid_is_no_such_object() {
        let agent = agent();
        let pdu = response(agent.handle_message(&request(PduKind::Get, &["1.3.9.9.9"], 0, 0)));
        assert_eq!(pdu.bindings[0].1, BoundValue::NoSuchObject);
    }

    #[test]
    fn getnext_walks_the_system_group_in_order() {
        let agent = agent();
        let pdu = response(agent.handle_message(&request(PduKind::GetNext, &["1.3.6.1.2.1.1"], 0, 0)));
        assert_eq!(pdu.bindings[0].0, well_known::sys_descr());

        let pdu = response(agent.handle_message(&request(
            PduKind::GetNext,
            &["1.3.6.1.2.1.1.1.0"],
            0,
            0,
        )));
        assert_eq!(pdu.bindings[0].0, well_known::sys_object_id());
    }

    #[test]
    fn getnext_past_the_end_is_end_of_mib_view() {
        let agent = agent();
        let pdu = response(agent.handle_message(&request(PduKind::GetNext, &["9.9.9"], 0, 0)));
        assert_eq!(pdu.bindings[0].1, BoundValue::EndOfMibView);
    }

    #[test]
    fn getbulk_with_zero_repetitions_returns_no_repeated_variables() {
        let agent = agent();
        let pdu = response(agent.handle_message(&request(
            PduKind::GetBulk,
            &["1.3.6.1.2.1.1", "1.3.6.1.2.1.2"],
            1,
            0,
        )));
        // One non-repeater answered, zero repetitions for the second OID.
        assert_eq!(pdu.bindings.len(), 1);
    }

    #[test]
    fn getbulk_repeats_up_to_max_repetitions() {
        let agent = agent();
        let pdu = response(agent.handle_message(&request(
            PduKind::GetBulk,
            &["1.3.6.1.2.1.1"],
            0,
            3,
        )));
        assert_eq!(pdu.bindings.len(), 3);
        assert_eq!(pdu.bindings[0].0, well_known::sys_descr());
        assert_eq!(pdu.bindings[1].0, well_known::sys_object_id());
        assert_eq!(pdu.bindings[2].0, well_known::sys_uptime());
    }

    #[test]
    fn set_inserts_and_get_reads_back() {
        let agent = agent();
        let set = ber::encode_message(&SnmpMessage {
            version: 1,
            community: b"public".to_vec(),
            pdu: Pdu {
                kind: PduKind::Set,
                request_id: 1,
                error_status: 0,
                error_index: 0,
                bindings: vec![(
                    "1.3.6.1.4.1.51515.9.0".parse().unwrap(),
                    BoundValue::Value(MibValue::Integer32(17)),
                )],
            },
        });
        let _ = agent.handle_message(&set);
        let pdu = response(agent.handle_message(&request(
            PduKind::Get,
            &["1.3.6.1.4.1.51515.9.0"],
            0,
            0,
        )));
        assert_eq!(pdu.bindings[0].1, BoundValue::Value(MibValue::Integer32(17)));
    }

    #[test]
    fn wrong_community_is_an_auth_failure() {
        let agent = agent();
        let msg = ber::encode_message(&SnmpMessage {
            version: 1,
            community: b"private".to_vec(),
            pdu: Pdu {
                kind: PduKind::Get,
                request_id: 1,
                error_status: 0,
                error_index: 0,
                bindings: vec![],
            },
        });
        assert_eq!(agent.handle_message(&msg), AgentOutcome::AuthenticationFailure);
        assert_eq!(agent.auth_failures(), 1);
    }

    #[test]
    fn sys_uptime_is_strictly_increasing() {
        let agent = agent();
        let first = agent.store().get(&well_known::sys_uptime()).unwrap();
        std::thread::sleep(Duration::from_millis(25));
        let second = agent.store().get(&well_known::sys_uptime()).unwrap();
        let (a, b) = (first.as_u64().unwrap(), second.as_u64().unwrap());
        assert!(b > a, "uptime went {a} -> {b}");
    }

    #[test]
    fn injected_cpu_value_is_read_back_verbatim() {
        let errors = Arc::new(ErrorStateManager::new());
        let agent = agent_with_errors(errors.clone());
        errors.set("10.0.0.5".parse().unwrap(), "eth0", ErrorKind::Cpu, 90);
        let pdu = response(agent.handle_message(&request(
            PduKind::Get,
            &["1.3.6.1.2.1.25.3.3.1.2.1"],
            0,
            0,
        )));
        assert_eq!(pdu.bindings[0].1, BoundValue::Value(MibValue::Integer32(90)));
    }

    #[test]
    fn walk_then_set_reproduces_identical_store() {
        let text = "\
.1.3.6.1.2.1.1.1.0 = STRING: \"X\"\n\
.1.3.6.1.2.1.2.2.1.10.1 = Counter32: 5\n\
.1.3.6.1.2.1.1.9.1.2.1 = OID: .1.3.6.1.4.1.1\n";
        let report = walk::parse_walk(text);
        let first = MibStore::new();
        for (oid, value) in &report.entries {
            first.set(oid.clone(), value.clone());
        }
        let second = MibStore::new();
        for (oid, value) in first.dump() {
            second.set(oid, value);
        }
        assert_eq!(first.dump(), second.dump());
    }
}
