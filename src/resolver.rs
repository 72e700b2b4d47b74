//! Authoritative answer construction (zone index + round-robin + rule
//! engine) and recursive forwarding to a parent resolver, backed by a
//! cached answer store with CNAME-chain flattening.

use crate::enums::RecordType;
use crate::resourcerecord::InternalResourceRecord;
use crate::roundrobin::RoundRobinState;
use crate::rules::{self, RuleAction, RuleConfig};
use crate::zones::ZoneIndex;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::{RData, Record, RecordType as HickoryRecordType};
use hickory_resolver::TokioAsyncResolver;
use std::net::SocketAddr;
use tracing::warn;

/// Placeholder TTL for a rule-engine synthesized rewrite answer — these
/// records don't come from any zone or upstream response, so there is no
/// "real" TTL to preserve.
const RULE_REWRITE_TTL: u32 = 3600;
/// Bound on CNAME hops chased within a single authoritative lookup, same
/// budget as the wire-level compression-pointer chaser.
const MAX_CHASE_DEPTH: usize = crate::MAX_CNAME_CHASE;

/// What an authoritative lookup found for a question whose name falls
/// within a zone this server is configured to serve.
pub struct AuthoritativeOutcome {
    pub answers: Vec<InternalResourceRecord>,
    pub soa: Option<InternalResourceRecord>,
}

/// Looks `qname`/`qtype` up against the zone index. Returns `None` if
/// `qname` doesn't fall within any configured zone — the caller should
/// forward the query recursively in that case.
#[allow(clippy::too_many_arguments)]
pub fn authoritative_search(
    zones: &ZoneIndex,
    roundrobin: &RoundRobinState,
    rules_cfg: &[RuleConfig],
    rules_enabled: bool,
    remote_ip: &str,
    load_balance: bool,
    lazy: bool,
    qname: &str,
    qtype: RecordType,
) -> Option<AuthoritativeOutcome> {
    let qname = qname.trim_end_matches('.').to_ascii_lowercase();
    let zone = zones.zone_for(&qname)?;
    let origin = zone.origin_lower();
    let soa = zones.soa_for(&origin).cloned();

    let mut answers: Vec<InternalResourceRecord> = match qtype {
        RecordType::SOA => {
            if qname == origin {
                soa.clone().into_iter().collect()
            } else {
                vec![]
            }
        }
        RecordType::NS => zones.lookup(&qname, RecordType::NS).map(<[_]>::to_vec).unwrap_or_default(),
        RecordType::SRV => zones.lookup(&qname, RecordType::SRV).map(<[_]>::to_vec).unwrap_or_default(),
        RecordType::TXT => zones.lookup(&qname, RecordType::TXT).map(<[_]>::to_vec).unwrap_or_default(),
        RecordType::MX => {
            if qname == origin {
                zones.mailers_for(&origin)
            } else {
                vec![]
            }
        }
        RecordType::A | RecordType::AAAA | RecordType::CNAME => {
            resolve_address_or_alias(zones, roundrobin, load_balance, lazy, &qname, qtype, 0)
        }
        _ => {
            warn!(%qtype, %qname, "unsupported query type reached authoritative search, ignoring");
            vec![]
        }
    };

    if rules_enabled {
        answers = apply_rule_engine(rules_cfg, remote_ip, &qname, answers);
    }

    Some(AuthoritativeOutcome { answers, soa })
}

/// Tracks, for each answer in a chain, the owner name the rule engine (and
/// later the wire encoder) should treat it as belonging to: the question
/// name until a CNAME is seen, then that CNAME's target for everything
/// after it.
fn owners_for(qname: &str, records: &[InternalResourceRecord]) -> Vec<String> {
    let mut owner = qname.to_string();
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        out.push(owner.clone());
        if let InternalResourceRecord::CNAME { cname, .. } = record {
            owner = cname.name.clone();
        }
    }
    out
}

/// Annotates each answer with its wire owner name, by the same chain walk
/// as [owners_for]. Used once, after plugins have had a chance to rewrite
/// the answer set, to build the actual reply records.
pub fn attach_owners(qname: &str, records: Vec<InternalResourceRecord>) -> Vec<(String, InternalResourceRecord)> {
    let owners = owners_for(qname, &records);
    owners.into_iter().zip(records).collect()
}

/// Applies the rule engine to a resolved answer set. Callers are expected to
/// gate this on the rule engine being enabled — unlike [rules::evaluate],
/// this helper always evaluates (it exists so both the authoritative and
/// recursive resolution paths can share the owner-chain bookkeeping).
pub fn apply_rule_engine(
    rules_cfg: &[RuleConfig],
    remote_ip: &str,
    qname: &str,
    answers: Vec<InternalResourceRecord>,
) -> Vec<InternalResourceRecord> {
    let owners = owners_for(qname, &answers);
    let mut out = Vec::with_capacity(answers.len());
    for (owner, record) in owners.into_iter().zip(answers) {
        let action = rules::evaluate(rules_cfg, &owner, remote_ip, true);
        // A rewrite answer stands in for the original question, not for
        // whatever CNAME hop it happened to replace.
        let target = if matches!(action, RuleAction::Rewrite(_)) {
            qname.to_string()
        } else {
            owner
        };
        out.extend(rules::apply(&action, record, &target, RULE_REWRITE_TTL));
    }
    out
}

fn resolve_address_or_alias(
    zones: &ZoneIndex,
    roundrobin: &RoundRobinState,
    load_balance: bool,
    lazy: bool,
    qname: &str,
    qtype: RecordType,
    depth: usize,
) -> Vec<InternalResourceRecord> {
    if depth > MAX_CHASE_DEPTH {
        warn!(%qname, "cname chase depth exceeded in authoritative search, stopping");
        return vec![];
    }

    if qtype != RecordType::CNAME {
        let address_type = if qtype == RecordType::AAAA { RecordType::AAAA } else { RecordType::A };
        if let Some(records) = zones.lookup(qname, address_type) {
            if !records.is_empty() {
                return select_addresses(roundrobin, load_balance, address_type, qname, records);
            }
        }
    }

    if let Some(cname_records) = zones.lookup(qname, RecordType::CNAME) {
        if let Some(InternalResourceRecord::CNAME { cname, .. }) = cname_records.first() {
            let mut out = cname_records.to_vec();
            if qtype != RecordType::CNAME && !lazy {
                out.extend(resolve_address_or_alias(
                    zones,
                    roundrobin,
                    load_balance,
                    lazy,
                    &cname.name.clone(),
                    qtype,
                    depth + 1,
                ));
            }
            return out;
        }
    }

    vec![]
}

fn select_addresses(
    roundrobin: &RoundRobinState,
    load_balance: bool,
    record_type: RecordType,
    qname: &str,
    records: &[InternalResourceRecord],
) -> Vec<InternalResourceRecord> {
    if !load_balance {
        return records.to_vec();
    }
    let index = roundrobin.next_index(record_type, qname, records.len());
    records.get(index).cloned().into_iter().collect()
}

/// Builds the long-lived resolver client used to forward queries to the
/// configured parent nameserver.
pub fn build_recursive_resolver(parent: SocketAddr) -> TokioAsyncResolver {
    let group = NameServerConfigGroup::from_ips_clear(&[parent.ip()], parent.port(), true);
    let config = ResolverConfig::from_parts(None, vec![], group);
    TokioAsyncResolver::tokio(config, ResolverOpts::default())
}

/// Resolves `qname`/`qtype` against the recursive cache, falling back to a
/// live upstream lookup on a miss. Per the cache's documented simplification,
/// only the first upstream answer's TTL is kept and applied to the whole
/// set cached for a given owner/type.
pub async fn recursive_resolve(
    resolver: &TokioAsyncResolver,
    cache: &crate::cache::Cache,
    cache_enabled: bool,
    flatten_enabled: bool,
    qname: &str,
    qtype: RecordType,
) -> Vec<InternalResourceRecord> {
    let qname = qname.trim_end_matches('.').to_ascii_lowercase();

    if cache_enabled {
        let (answers, found, _ttl) = cache.get(&qname);
        if found {
            return answers;
        }
    }

    let hickory_type = to_hickory_type(qtype);
    let lookup = match resolver.lookup(qname.clone(), hickory_type).await {
        Ok(lookup) => lookup,
        Err(err) => {
            warn!(%qname, %err, "recursive lookup failed");
            return vec![];
        }
    };

    let mut first_ttl: Option<u32> = None;
    let mut chain: Vec<(String, RecordType, InternalResourceRecord)> = vec![];
    for record in lookup.record_iter() {
        let ttl = *first_ttl.get_or_insert_with(|| record.ttl());
        let owner = record.name().to_string().trim_end_matches('.').to_ascii_lowercase();
        if let Some((rtype, rr)) = convert_upstream_record(record, ttl) {
            chain.push((owner, rtype, rr));
        }
    }

    if chain.is_empty() {
        return vec![];
    }

    if !cache_enabled {
        return chain
            .into_iter()
            .filter(|(_, rtype, _)| *rtype == qtype)
            .map(|(_, _, rr)| rr)
            .collect();
    }

    let mode = if flatten_enabled {
        crate::cache::SetMode::Flatten
    } else {
        crate::cache::SetMode::Simple
    };
    let ttl = first_ttl.unwrap_or(0);

    let mut idx = 0;
    while idx < chain.len() {
        let owner = chain[idx].0.clone();
        let rtype = chain[idx].1;
        let mut batch = vec![];
        while idx < chain.len() && chain[idx].0 == owner && chain[idx].1 == rtype {
            batch.push(chain[idx].2.clone());
            idx += 1;
        }
        cache.set(mode, &owner, rtype, batch, ttl);
    }

    cache.get(&qname).0
}

fn to_hickory_type(qtype: RecordType) -> HickoryRecordType {
    match qtype {
        RecordType::A => HickoryRecordType::A,
        RecordType::AAAA => HickoryRecordType::AAAA,
        RecordType::CNAME => HickoryRecordType::CNAME,
        RecordType::TXT => HickoryRecordType::TXT,
        RecordType::MX => HickoryRecordType::MX,
        RecordType::SRV => HickoryRecordType::SRV,
        RecordType::NS => HickoryRecordType::NS,
        RecordType::SOA => HickoryRecordType::SOA,
        _ => HickoryRecordType::A,
    }
}

fn convert_upstream_record(record: &Record, ttl: u32) -> Option<(RecordType, InternalResourceRecord)> {
    match record.data() {
        Some(RData::A(addr)) => Some((RecordType::A, InternalResourceRecord::A { address: u32::from(addr.0), ttl })),
        Some(RData::AAAA(addr)) => Some((
            RecordType::AAAA,
            InternalResourceRecord::AAAA { address: u128::from(addr.0), ttl },
        )),
        Some(RData::CNAME(name)) => Some((
            RecordType::CNAME,
            InternalResourceRecord::CNAME {
                cname: crate::resourcerecord::DomainName::from(name.to_utf8().as_str()),
                ttl,
            },
        )),
        Some(RData::NS(name)) => Some((
            RecordType::NS,
            InternalResourceRecord::NS {
                nsdname: crate::resourcerecord::DomainName::from(name.to_utf8().as_str()),
                ttl,
            },
        )),
        Some(RData::MX(mx)) => Some((
            RecordType::MX,
            InternalResourceRecord::MX {
                preference: mx.preference(),
                exchange: Some(crate::resourcerecord::DomainName::from(mx.exchange().to_utf8().as_str())),
                ttl,
            },
        )),
        Some(RData::TXT(txt)) => Some((
            RecordType::TXT,
            InternalResourceRecord::TXT {
                txtdata: crate::resourcerecord::DNSCharString {
                    data: txt.txt_data().concat(),
                },
                ttl,
            },
        )),
        Some(RData::SRV(srv)) => Some((
            RecordType::SRV,
            InternalResourceRecord::SRV {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: crate::resourcerecord::DomainName::from(srv.target().to_utf8().as_str()),
                ttl,
            },
        )),
        Some(RData::SOA(soa)) => Some((
            RecordType::SOA,
            InternalResourceRecord::SOA {
                zone: crate::resourcerecord::DomainName::from(soa.mname().to_utf8().as_str()),
                mname: crate::resourcerecord::DomainName::from(soa.mname().to_utf8().as_str()),
                rname: crate::resourcerecord::DomainName::from(soa.rname().to_utf8().as_str()),
                serial: soa.serial(),
                refresh: soa.refresh() as u32,
                retry: soa.retry() as u32,
                expire: soa.expire() as u32,
                minimum: soa.minimum(),
                ttl,
            },
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resourcerecord::DomainName;
    use crate::zones::{FileZone, SoaConfig, ZoneRecordConfig};

    fn zone_with_records(records: Vec<ZoneRecordConfig>) -> FileZone {
        FileZone {
            origin: "example.com".to_string(),
            ttl: 3600,
            auth: SoaConfig {
                ns: "dns1.example.com.".to_string(),
                email: "dev.example.com.".to_string(),
                serial: 1,
                refresh: 7200,
                retry: 3600,
                expire: 1_209_600,
                minimum: 3600,
            },
            name_servers: vec![],
            records,
            mailers: vec![],
        }
    }

    #[test]
    fn returns_none_for_names_outside_any_zone() {
        let zones = ZoneIndex::build(&[zone_with_records(vec![])]);
        let roundrobin = RoundRobinState::new();
        let outcome = authoritative_search(&zones, &roundrobin, &[], true, "10.0.0.1", false, false, "other.org", RecordType::A);
        assert!(outcome.is_none());
    }

    #[test]
    fn apex_a_lookup_attaches_soa() {
        let zones = ZoneIndex::build(&[zone_with_records(vec![ZoneRecordConfig {
            host: "@".to_string(),
            ipv4: Some("1.2.3.4".to_string()),
            ..Default::default()
        }])]);
        let roundrobin = RoundRobinState::new();
        let outcome = authoritative_search(&zones, &roundrobin, &[], true, "10.0.0.1", false, false, "example.com", RecordType::A)
            .expect("zone is ours");
        assert_eq!(outcome.answers.len(), 1);
        assert!(outcome.soa.is_some());
    }

    #[test]
    fn non_lazy_cname_chase_includes_final_address() {
        let zones = ZoneIndex::build(&[zone_with_records(vec![
            ZoneRecordConfig {
                host: "www".to_string(),
                cname: Some("example.com".to_string()),
                ..Default::default()
            },
            ZoneRecordConfig {
                host: "@".to_string(),
                ipv4: Some("1.2.3.4".to_string()),
                ..Default::default()
            },
        ])]);
        let roundrobin = RoundRobinState::new();
        let outcome = authoritative_search(&zones, &roundrobin, &[], true, "10.0.0.1", false, false, "www.example.com", RecordType::A)
            .expect("zone is ours");
        assert_eq!(outcome.answers.len(), 2);
        assert_eq!(outcome.answers[0], RecordType::CNAME);
        assert_eq!(outcome.answers[1], RecordType::A);
    }

    #[test]
    fn lazy_mode_stops_at_the_cname() {
        let zones = ZoneIndex::build(&[zone_with_records(vec![
            ZoneRecordConfig {
                host: "www".to_string(),
                cname: Some("example.com".to_string()),
                ..Default::default()
            },
            ZoneRecordConfig {
                host: "@".to_string(),
                ipv4: Some("1.2.3.4".to_string()),
                ..Default::default()
            },
        ])]);
        let roundrobin = RoundRobinState::new();
        let outcome = authoritative_search(&zones, &roundrobin, &[], true, "10.0.0.1", false, true, "www.example.com", RecordType::A)
            .expect("zone is ours");
        assert_eq!(outcome.answers.len(), 1);
        assert_eq!(outcome.answers[0], RecordType::CNAME);
    }

    #[test]
    fn owners_follow_the_cname_chain() {
        let answers = vec![
            InternalResourceRecord::CNAME { cname: DomainName::from("example.com"), ttl: 60 },
            InternalResourceRecord::A { address: 0x01020304, ttl: 60 },
        ];
        let owners = owners_for("www.example.com", &answers);
        assert_eq!(owners, vec!["www.example.com".to_string(), "example.com".to_string()]);
    }

    #[test]
    fn rule_drop_removes_the_matching_answer() {
        let rules = vec![RuleConfig {
            condition: "host == \"example.com\"".to_string(),
            action: "drop".to_string(),
        }];
        let answers = vec![InternalResourceRecord::A { address: 0x01020304, ttl: 60 }];
        let out = apply_rule_engine(&rules, "10.0.0.1", "example.com", answers);
        assert!(out.is_empty());
    }
}
