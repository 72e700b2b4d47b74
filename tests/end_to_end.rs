//! Black-box, whole-message scenarios: question bytes in, answer-section
//! bytes out, against a runtime built straight from declarative zone config.

use herdns::cache::Cache;
use herdns::config::ConfigFile;
use herdns::enums::{RecordClass, RecordType};
use herdns::lifecycle::Runtime;
use herdns::plugins::script_pool::ScriptPool;
use herdns::plugins::PluginChain;
use herdns::resolver::build_recursive_resolver;
use herdns::roundrobin::RoundRobinState;
use herdns::servers::process_message;
use herdns::zones::{FileZone, MailerConfig, SoaConfig, SrvConfig, ZoneIndex, ZoneRecordConfig};
use herdns::{name_from_message, Header, Question, HEADER_BYTES};
use packed_struct::PackedStruct;
use std::net::IpAddr;

fn build_query(id: u16, qname: &str, qtype: RecordType) -> Vec<u8> {
    let header = Header {
        id,
        recursion_desired: true,
        qdcount: 1,
        ..Header::default()
    };
    let mut buf = header.pack().unwrap().to_vec();
    let question = Question {
        qname: qname.as_bytes().to_vec(),
        qtype,
        qclass: RecordClass::Internet,
    };
    buf.extend(question.to_bytes());
    buf
}

async fn runtime_for(zones: Vec<FileZone>) -> Runtime {
    let mut config = ConfigFile::default();
    config.zones = zones;
    let zones = concread::cowcell::asynch::CowCell::new(ZoneIndex::build(&config.zones));
    let pool = ScriptPool::new();
    let plugins = PluginChain::load(&config.plugins, &pool).unwrap();
    let resolver = build_recursive_resolver(config.parent_address().unwrap());
    Runtime {
        config,
        zones,
        cache: Cache::new(),
        roundrobin: RoundRobinState::new(),
        plugins,
        tsig_key: None,
        resolver,
    }
}

/// One decoded answer/authority record, enough to assert against without
/// reaching into the wire encoder's internals.
struct DecodedRecord {
    owner: Vec<u8>,
    record_type: RecordType,
    ttl: u32,
    rdata_offset: usize,
    rdata: Vec<u8>,
}

fn decode_records(buf: &[u8], mut cursor: usize, count: u16) -> Vec<DecodedRecord> {
    let mut out = vec![];
    for _ in 0..count {
        let (owner, after_name) = name_from_message(buf, cursor).expect("valid owner name");
        let record_type = RecordType::from(&u16::from_be_bytes([buf[after_name], buf[after_name + 1]]));
        let ttl = u32::from_be_bytes([
            buf[after_name + 4],
            buf[after_name + 5],
            buf[after_name + 6],
            buf[after_name + 7],
        ]);
        let rdlength = u16::from_be_bytes([buf[after_name + 8], buf[after_name + 9]]) as usize;
        let rdata_offset = after_name + 10;
        let rdata = buf[rdata_offset..rdata_offset + rdlength].to_vec();
        out.push(DecodedRecord {
            owner,
            record_type,
            ttl,
            rdata_offset,
            rdata,
        });
        cursor = rdata_offset + rdlength;
    }
    out
}

fn decode_reply(buf: &[u8]) -> (Header, Vec<DecodedRecord>, Vec<DecodedRecord>) {
    let mut header_bytes = [0u8; HEADER_BYTES];
    header_bytes.copy_from_slice(&buf[..HEADER_BYTES]);
    let header = Header::unpack(&header_bytes).unwrap();
    let question = Question::from_packets(&buf[HEADER_BYTES..]).unwrap();
    let cursor = HEADER_BYTES + question.wire_len();
    let answers = decode_records(buf, cursor, header.ancount);
    let authority_cursor = answers.last().map(|r| r.rdata_offset + r.rdata.len()).unwrap_or(cursor);
    let authorities = decode_records(buf, authority_cursor, header.nscount);
    (header, answers, authorities)
}

fn apex_zone() -> FileZone {
    FileZone {
        origin: "example.com".to_string(),
        ttl: 14400,
        auth: SoaConfig {
            ns: "dns1.example.com.".to_string(),
            email: "dev.zteo.com.".to_string(),
            serial: 1,
            refresh: 86400,
            retry: 7200,
            expire: 100_800,
            minimum: 7200,
        },
        name_servers: vec![],
        records: vec![],
        mailers: vec![],
    }
}

#[tokio::test]
async fn soa_query_returns_the_configured_soa() {
    let runtime = runtime_for(vec![apex_zone()]).await;
    let request = build_query(1, "example.com", RecordType::SOA);
    let bytes = process_message(&runtime, IpAddr::from([10, 0, 0, 1]), &request).await.expect("reply");
    let (header, answers, _) = decode_reply(&bytes);
    assert_eq!(header.ancount, 1);
    assert_eq!(answers[0].record_type, RecordType::SOA);
    assert_eq!(answers[0].ttl, 14400);
    assert_eq!(answers[0].owner, b"example.com".to_vec());
}

#[tokio::test]
async fn mx_query_returns_configured_mailers_in_order() {
    let mut zone = apex_zone();
    zone.mailers = vec![
        MailerConfig {
            host: "one.example.com".to_string(),
            priority: 0,
            ttl: Some(20),
        },
        MailerConfig {
            host: "two.example.com".to_string(),
            priority: 0,
            ttl: Some(20),
        },
    ];
    let runtime = runtime_for(vec![zone]).await;
    let request = build_query(2, "example.com", RecordType::MX);
    let bytes = process_message(&runtime, IpAddr::from([10, 0, 0, 1]), &request).await.expect("reply");
    let (header, answers, _) = decode_reply(&bytes);
    assert_eq!(header.ancount, 2);
    assert!(answers.iter().all(|a| a.record_type == RecordType::MX && a.ttl == 20));
}

#[tokio::test]
async fn mx_query_with_no_mailers_returns_null_mx() {
    let mut zone = apex_zone();
    zone.origin = "example.org".to_string();
    zone.ttl = 20;
    let runtime = runtime_for(vec![zone]).await;
    let request = build_query(3, "example.org", RecordType::MX);
    let bytes = process_message(&runtime, IpAddr::from([10, 0, 0, 1]), &request).await.expect("reply");
    let (header, answers, _) = decode_reply(&bytes);
    assert_eq!(header.ancount, 1);
    assert_eq!(answers[0].record_type, RecordType::MX);
    // preference (2 bytes) then a lone root label (one zero byte)
    assert_eq!(&answers[0].rdata[2..], &[0]);
}

#[tokio::test]
async fn a_query_chases_a_cname_to_its_target_address() {
    let mut zone = apex_zone();
    zone.ttl = 20;
    zone.records = vec![
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
    ];
    let runtime = runtime_for(vec![zone]).await;
    let request = build_query(4, "www.example.com", RecordType::A);
    let bytes = process_message(&runtime, IpAddr::from([10, 0, 0, 1]), &request).await.expect("reply");
    let (header, answers, _) = decode_reply(&bytes);
    assert_eq!(header.ancount, 2);
    assert_eq!(answers[0].record_type, RecordType::CNAME);
    assert_eq!(answers[0].owner, b"www.example.com".to_vec());
    assert_eq!(answers[1].record_type, RecordType::A);
    assert_eq!(answers[1].rdata, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn cname_query_does_not_chase_the_address() {
    let mut zone = apex_zone();
    zone.ttl = 20;
    zone.records = vec![
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
    ];
    let runtime = runtime_for(vec![zone]).await;
    let request = build_query(5, "www.example.com", RecordType::CNAME);
    let bytes = process_message(&runtime, IpAddr::from([10, 0, 0, 1]), &request).await.expect("reply");
    let (header, answers, _) = decode_reply(&bytes);
    assert_eq!(header.ancount, 1);
    assert_eq!(answers[0].record_type, RecordType::CNAME);
}

#[tokio::test]
async fn srv_query_returns_the_configured_service() {
    let mut zone = apex_zone();
    zone.ttl = 20;
    zone.records = vec![ZoneRecordConfig {
        host: "@".to_string(),
        srv: Some(SrvConfig {
            service: "sip".to_string(),
            proto: "tcp".to_string(),
            no_service: false,
            priority: 10,
            weight: 5,
            port: 0,
            target: "test.example.com".to_string(),
        }),
        ..Default::default()
    }];
    let runtime = runtime_for(vec![zone]).await;
    let request = build_query(6, "_sip._tcp.example.com", RecordType::SRV);
    let bytes = process_message(&runtime, IpAddr::from([10, 0, 0, 1]), &request).await.expect("reply");
    let (header, answers, _) = decode_reply(&bytes);
    assert_eq!(header.ancount, 1);
    assert_eq!(answers[0].record_type, RecordType::SRV);
    assert_eq!(&answers[0].rdata[0..6], &[0, 10, 0, 5, 0, 0]);
}

#[tokio::test]
async fn a_query_without_load_balancing_returns_every_address_with_soa_authority() {
    let mut zone = apex_zone();
    zone.ttl = 20;
    zone.records = vec![ZoneRecordConfig {
        host: "test".to_string(),
        ipv4: Some("1.2.3.4".to_string()),
        ..Default::default()
    }];
    // a single ipv4 per record entry, so declare three entries for the same owner
    zone.records.push(ZoneRecordConfig {
        host: "test".to_string(),
        ipv4: Some("1.2.3.5".to_string()),
        ..Default::default()
    });
    zone.records.push(ZoneRecordConfig {
        host: "test".to_string(),
        ipv4: Some("1.2.3.6".to_string()),
        ..Default::default()
    });
    let runtime = runtime_for(vec![zone]).await;
    let request = build_query(7, "test.example.com", RecordType::A);
    let bytes = process_message(&runtime, IpAddr::from([10, 0, 0, 1]), &request).await.expect("reply");
    let (header, answers, authorities) = decode_reply(&bytes);
    assert_eq!(header.ancount, 3);
    assert!(answers.iter().all(|a| a.record_type == RecordType::A));
    assert_eq!(authorities.len(), 1);
    assert_eq!(authorities[0].record_type, RecordType::SOA);
}

#[tokio::test]
async fn unprivileged_update_request_is_ignored() {
    use herdns::enums::OpCode;

    let runtime = runtime_for(vec![apex_zone()]).await;
    let mut header = Header {
        id: 8,
        opcode: OpCode::Update,
        qdcount: 1,
        ..Header::default()
    };
    header.recursion_desired = false;
    let mut request = header.pack().unwrap().to_vec();
    let question = Question {
        qname: b"example.com".to_vec(),
        qtype: RecordType::SOA,
        qclass: RecordClass::Internet,
    };
    request.extend(question.to_bytes());

    process_message(&runtime, IpAddr::from([10, 0, 0, 1]), &request).await.expect("update is still acked");

    let read_txn = runtime.zones.read().await;
    assert!(read_txn.lookup("note.example.com", RecordType::TXT).is_none());
}
