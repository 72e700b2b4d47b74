//! Declarative zone configuration and the in-memory, lookup-optimised index
//! built from it.

use crate::enums::RecordType;
use crate::resourcerecord::{check_long_labels, parse_ipv4, parse_ipv6, DNSCharString, DomainName, InternalResourceRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

fn default_zone_ttl() -> u32 {
    14400
}
fn default_refresh() -> u32 {
    86400
}
fn default_retry() -> u32 {
    7200
}
fn default_expire() -> u32 {
    100_800
}
fn default_minimum() -> u32 {
    7200
}

fn default_proto() -> String {
    "tcp".to_string()
}

fn default_srv_priority_weight() -> u16 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SrvConfig {
    /// The service name, eg `sip` — the record is served at
    /// `_<service>._<proto>.<owner>`.
    pub service: String,
    #[serde(default = "default_proto")]
    pub proto: String,
    /// RFC2782 §4 "no service": serve a single record with target `.` and
    /// priority 0, signalling the service is explicitly not provided here.
    #[serde(default, rename = "noService")]
    pub no_service: bool,
    #[serde(default = "default_srv_priority_weight")]
    pub priority: u16,
    #[serde(default = "default_srv_priority_weight")]
    pub weight: u16,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub target: String,
}

/// One record inside a `[[zone.record]]` block. Exactly one of
/// `ipv4`/`ipv6`/`cname`/`txt`/`srv` is expected to be set per entry.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ZoneRecordConfig {
    /// The owner name, relative to the zone origin. `@` means the zone apex.
    pub host: String,
    pub ttl: Option<u32>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub cname: Option<String>,
    pub txt: Option<String>,
    pub srv: Option<SrvConfig>,
}

/// A `[[zone.mailer]]` entry: one mail exchange target for the zone apex.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MailerConfig {
    pub host: String,
    pub priority: u16,
    pub ttl: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SoaConfig {
    pub ns: String,
    pub email: String,
    pub serial: u32,
    #[serde(default = "default_refresh")]
    pub refresh: u32,
    #[serde(default = "default_retry")]
    pub retry: u32,
    #[serde(default = "default_expire")]
    pub expire: u32,
    #[serde(default = "default_minimum")]
    pub minimum: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileZone {
    pub origin: String,
    #[serde(default = "default_zone_ttl")]
    pub ttl: u32,
    pub auth: SoaConfig,
    /// Additional NS records at the zone apex, beyond `auth.ns`.
    #[serde(default, rename = "nameServer")]
    pub name_servers: Vec<String>,
    #[serde(default, rename = "record")]
    pub records: Vec<ZoneRecordConfig>,
    #[serde(default, rename = "mailer")]
    pub mailers: Vec<MailerConfig>,
}

impl FileZone {
    pub fn origin_lower(&self) -> String {
        self.origin.trim_end_matches('.').to_ascii_lowercase()
    }
}

/// Builds the fully-qualified, lowercase owner name for a `host` value that
/// is either `@` (the zone apex) or relative to `origin`.
fn fqdn(host: &str, origin: &str) -> String {
    if host == "@" || host.is_empty() {
        origin.to_string()
    } else {
        format!("{}.{}", host.trim_end_matches('.'), origin).to_ascii_lowercase()
    }
}

/// The flattened, query-time view of all configured zones: per-(name, type)
/// record buckets plus the zones themselves (for SOA/containment checks) and
/// each zone's MX mailer list, kept separate because the null-MX (RFC7505)
/// behavior depends on whether the list is empty.
#[derive(Debug, Clone, Default)]
pub struct ZoneIndex {
    /// origin (lowercase, no trailing dot) -> the zone it was built from.
    pub zones: HashMap<String, FileZone>,
    /// (owner name, record type) -> the records of that type at that name.
    pub records: HashMap<(String, RecordType), Vec<InternalResourceRecord>>,
    /// zone origin -> configured MX records (empty means "serve a null MX").
    pub mailers: HashMap<String, Vec<InternalResourceRecord>>,
}

impl ZoneIndex {
    pub fn build(zones: &[FileZone]) -> Self {
        let mut index = ZoneIndex::default();
        for zone in zones {
            index.add_zone(zone);
        }
        index
    }

    fn add_zone(&mut self, zone: &FileZone) {
        let origin = zone.origin_lower();

        let soa = InternalResourceRecord::SOA {
            zone: DomainName::from(origin.as_str()),
            mname: DomainName::from(zone.auth.ns.as_str()),
            rname: DomainName::from(zone.auth.email.as_str()),
            serial: zone.auth.serial,
            refresh: zone.auth.refresh,
            retry: zone.auth.retry,
            expire: zone.auth.expire,
            minimum: zone.auth.minimum,
            ttl: zone.ttl,
        };
        self.records
            .entry((origin.clone(), RecordType::SOA))
            .or_default()
            .push(soa);

        self.push_ns(&origin, &origin, zone.auth.ns.as_str(), zone.ttl);
        for ns in &zone.name_servers {
            self.push_ns(&origin, &origin, ns, zone.ttl);
        }

        for record in &zone.records {
            self.add_record(zone, record);
        }

        let mailers: Vec<InternalResourceRecord> = zone
            .mailers
            .iter()
            .map(|m| InternalResourceRecord::MX {
                preference: m.priority,
                exchange: Some(DomainName::from(m.host.as_str())),
                ttl: m.ttl.unwrap_or(zone.ttl),
            })
            .collect();
        self.mailers.insert(origin.clone(), mailers);

        self.zones.insert(origin, zone.clone());
    }

    fn push_ns(&mut self, apex: &str, _origin: &str, ns: &str, ttl: u32) {
        self.records
            .entry((apex.to_string(), RecordType::NS))
            .or_default()
            .push(InternalResourceRecord::NS {
                nsdname: DomainName::from(ns),
                ttl,
            });
    }

    fn add_record(&mut self, zone: &FileZone, record: &ZoneRecordConfig) {
        if check_long_labels(&record.host) {
            warn!(zone = %zone.origin, host = %record.host, "label over 63 octets, refusing to serve");
            return;
        }
        let owner = fqdn(&record.host, &zone.origin_lower());
        let ttl = record.ttl.unwrap_or(zone.ttl);

        if record.cname.is_some() && (record.ipv4.is_some() || record.ipv6.is_some() || record.host == "@") {
            warn!(zone = %zone.origin, host = %record.host, "aliased record must not carry A/AAAA or be the zone apex, rejecting");
            return;
        }

        if let Some(ipv4) = &record.ipv4 {
            match parse_ipv4(ipv4) {
                Ok(address) => self.push(owner.clone(), RecordType::A, InternalResourceRecord::A { address, ttl }),
                Err(err) => warn!(zone = %zone.origin, host = %record.host, %err, "bad ipv4 value"),
            }
        }
        if let Some(ipv6) = &record.ipv6 {
            match parse_ipv6(ipv6) {
                Ok(address) => self.push(owner.clone(), RecordType::AAAA, InternalResourceRecord::AAAA { address, ttl }),
                Err(err) => warn!(zone = %zone.origin, host = %record.host, %err, "bad ipv6 value"),
            }
        }
        if let Some(cname) = &record.cname {
            self.push(
                owner.clone(),
                RecordType::CNAME,
                InternalResourceRecord::CNAME {
                    cname: DomainName::from(cname.as_str()),
                    ttl,
                },
            );
        }
        if let Some(txt) = &record.txt {
            self.push(
                owner.clone(),
                RecordType::TXT,
                InternalResourceRecord::TXT {
                    txtdata: DNSCharString::from(txt.as_str()),
                    ttl,
                },
            );
        }
        if let Some(srv) = &record.srv {
            if srv.service.is_empty() {
                warn!(zone = %zone.origin, host = %record.host, "srv record is missing a service name, skipping");
            } else {
                let srv_owner = format!("_{}._{}.{}", srv.service, srv.proto, owner).to_ascii_lowercase();
                let record = if srv.no_service {
                    InternalResourceRecord::SRV {
                        priority: 0,
                        weight: 0,
                        port: 0,
                        target: DomainName::from("."),
                        ttl,
                    }
                } else {
                    InternalResourceRecord::SRV {
                        priority: srv.priority,
                        weight: srv.weight,
                        port: srv.port,
                        target: DomainName::from(srv.target.as_str()),
                        ttl,
                    }
                };
                self.push(srv_owner, RecordType::SRV, record);
            }
        }
    }

    fn push(&mut self, name: String, record_type: RecordType, record: InternalResourceRecord) {
        self.records.entry((name, record_type)).or_default().push(record);
    }

    /// Looks up records of a given type at an exact owner name.
    pub fn lookup(&self, name: &str, record_type: RecordType) -> Option<&[InternalResourceRecord]> {
        self.records
            .get(&(name.to_ascii_lowercase(), record_type))
            .map(|v| v.as_slice())
    }

    /// Returns the MX records to serve for `origin`'s apex: the configured
    /// mailers, or a single null MX (RFC7505) if none were configured.
    pub fn mailers_for(&self, origin: &str) -> Vec<InternalResourceRecord> {
        match self.mailers.get(&origin.to_ascii_lowercase()) {
            Some(mailers) if !mailers.is_empty() => mailers.clone(),
            _ => vec![InternalResourceRecord::MX {
                preference: 0,
                exchange: None,
                ttl: self
                    .zones
                    .get(&origin.to_ascii_lowercase())
                    .map(|z| z.ttl)
                    .unwrap_or(default_zone_ttl()),
            }],
        }
    }

    /// Finds the most specific zone that owns `name`, if any (longest-suffix
    /// match over configured origins).
    pub fn zone_for(&self, name: &str) -> Option<&FileZone> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        self.zones
            .values()
            .filter(|z| {
                let origin = z.origin_lower();
                name == origin || name.ends_with(&format!(".{origin}"))
            })
            .max_by_key(|z| z.origin_lower().len())
    }

    pub fn soa_for(&self, origin: &str) -> Option<&InternalResourceRecord> {
        self.records
            .get(&(origin.to_ascii_lowercase(), RecordType::SOA))
            .and_then(|v| v.first())
    }

    /// Overwrites the TXT bucket at `owner` with a single record. Used
    /// exclusively by the TSIG-privileged update path — not persisted to any
    /// backing file, so it does not survive a config reload.
    pub fn set_txt(&mut self, owner: &str, text: String, ttl: u32) {
        self.records.insert(
            (owner.trim_end_matches('.').to_ascii_lowercase(), RecordType::TXT),
            vec![InternalResourceRecord::TXT {
                txtdata: DNSCharString::from(text.as_str()),
                ttl,
            }],
        );
    }
}
