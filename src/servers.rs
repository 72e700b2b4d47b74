//! UDP/TCP listeners and the query/update handler (C8/C9): accept filter,
//! TSIG gate, pre-plugins, authoritative-or-recursive resolution, the rule
//! engine, post-plugins, and wire encoding.

use crate::enums::{OpCode, PacketType, Rcode};
use crate::error::HerdNsError;
use crate::lifecycle::Runtime;
use crate::packet_dumper::{dump_bytes, DumpType};
use crate::reply::Reply;
use crate::resolver;
use crate::resourcerecord::InternalResourceRecord;
use crate::tsig;
use crate::update;
use crate::{Header, Question, RawRecord, HEADER_BYTES, REPLY_TIMEOUT_MS, UDP_BUFFER_SIZE};
use packed_struct::PackedStruct;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Serves UDP queries on `addr` until `shutdown` is signalled. Each datagram
/// is handled on its own spawned task so a slow plugin or upstream lookup on
/// one query never holds up the next.
pub async fn udp_server(runtime: Arc<Runtime>, addr: SocketAddr, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
    let sock = Arc::new(UdpSocket::bind(addr).await?);
    info!(%addr, "udp listener started");

    loop {
        let mut buf = [0u8; UDP_BUFFER_SIZE];
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(%addr, "udp listener shutting down");
                    return Ok(());
                }
            }
            received = sock.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(value) => value,
                    Err(err) => {
                        error!(%addr, %err, "udp recv failed");
                        continue;
                    }
                };
                let runtime = runtime.clone();
                let sock = sock.clone();
                let request = buf[..len].to_vec();
                tokio::spawn(async move {
                    serve_datagram(runtime, sock, peer, request).await;
                });
            }
        }
    }
}

async fn serve_datagram(runtime: Arc<Runtime>, sock: Arc<UdpSocket>, peer: SocketAddr, request: Vec<u8>) {
    if runtime.config.capture_packets {
        dump_bytes(&request, DumpType::ClientRequest).await;
    }

    let reply = match timeout(Duration::from_millis(REPLY_TIMEOUT_MS), handle_message(&runtime, peer.ip(), &request)).await {
        Ok(Some(reply)) => reply,
        Ok(None) => return,
        Err(_) => {
            error!(%peer, "timed out building a udp reply");
            return;
        }
    };

    send_udp_reply(&sock, peer, reply).await;
}

async fn send_udp_reply(sock: &UdpSocket, peer: SocketAddr, mut reply: Reply) {
    let bytes = match reply.as_bytes() {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(%peer, %err, "failed to encode udp reply");
            return;
        }
    };

    let bytes = if bytes.len() > UDP_BUFFER_SIZE {
        let mut truncated = reply.set_truncated();
        match truncated.as_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(%peer, %err, "failed to encode truncated udp reply");
                return;
            }
        }
    } else {
        bytes
    };

    if let Err(err) = sock.send_to(&bytes, peer).await {
        error!(%peer, %err, "failed to send udp reply");
    }
}

/// Serves TCP queries on `addr` until `shutdown` is signalled. Each accepted
/// connection gets its own task and may carry several pipelined queries,
/// each framed with the RFC7766 two-byte length prefix.
pub async fn tcp_server(runtime: Arc<Runtime>, addr: SocketAddr, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "tcp listener started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(%addr, "tcp listener shutting down");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(value) => value,
                    Err(err) => {
                        error!(%addr, %err, "tcp accept failed");
                        continue;
                    }
                };
                let runtime = runtime.clone();
                let client_timeout = Duration::from_secs(runtime.config.tcp_client_timeout);
                tokio::spawn(async move {
                    if timeout(client_timeout, serve_tcp_connection(runtime, stream, peer)).await.is_err() {
                        debug!(%peer, "tcp connection idle timeout");
                    }
                });
            }
        }
    }
}

async fn serve_tcp_connection(runtime: Arc<Runtime>, mut stream: TcpStream, peer: SocketAddr) {
    loop {
        let msg_len = match stream.read_u16().await {
            Ok(value) => value as usize,
            Err(_) => return,
        };
        let mut buf = vec![0u8; msg_len];
        if let Err(err) = stream.read_exact(&mut buf).await {
            debug!(%peer, %err, "failed to read tcp message body");
            return;
        }

        if runtime.config.capture_packets {
            dump_bytes(&buf, DumpType::ClientRequest).await;
        }

        let reply = match timeout(Duration::from_millis(REPLY_TIMEOUT_MS), handle_message(&runtime, peer.ip(), &buf)).await {
            Ok(Some(reply)) => reply,
            Ok(None) => continue,
            Err(_) => {
                error!(%peer, "timed out building a tcp reply");
                continue;
            }
        };

        if let Err(err) = write_tcp_reply(&mut stream, reply).await {
            debug!(%peer, %err, "failed to write tcp reply, dropping connection");
            return;
        }
    }
}

async fn write_tcp_reply(stream: &mut TcpStream, mut reply: Reply) -> io::Result<()> {
    let bytes = reply.as_bytes().map_err(std::io::Error::from)?;
    let len = bytes.len() as u16;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    Ok(())
}

/// Everything after the question section that the query handler needs: the
/// authority records (UPDATE's payload) and, if present, the TSIG record
/// plus the offset it starts at (the "message prefix" TSIG verification is
/// computed over).
struct ParsedSections {
    authority: Vec<RawRecord>,
    tsig: Option<(RawRecord, usize)>,
}

fn parse_sections(buf: &[u8], header: &Header, question: &Question) -> Result<ParsedSections, HerdNsError> {
    let mut cursor = HEADER_BYTES + question.wire_len();

    let mut authority = Vec::with_capacity(header.nscount as usize);
    for _ in 0..header.nscount {
        let (record, next) = RawRecord::parse(buf, cursor)?;
        authority.push(record);
        cursor = next;
    }

    let mut tsig = None;
    for _ in 0..header.arcount {
        let record_start = cursor;
        let (record, next) = RawRecord::parse(buf, cursor)?;
        if record.record_type == tsig::TSIG_RECORD_TYPE {
            tsig = Some((record, record_start));
        }
        cursor = next;
    }

    Ok(ParsedSections { authority, tsig })
}

/// Builds a bare reply header/skeleton: `qdcount` reflects whether a question
/// is actually being echoed back, independent of whatever the inbound
/// header's counts claimed.
fn skeleton(header: Header, question: Option<Question>, rcode: Rcode) -> Reply {
    let mut answer_header = header.as_answer();
    answer_header.authoritative = true;
    answer_header.rcode = rcode;
    answer_header.qdcount = question.is_some() as u16;
    Reply {
        header: answer_header,
        question,
        answers: vec![],
        authorities: vec![],
        additional: vec![],
    }
}

/// Runs a single wire message through the full query/update pipeline and
/// returns the encoded reply bytes, without binding any sockets. Exposed for
/// black-box, whole-message integration tests.
pub async fn process_message(runtime: &Runtime, remote_ip: IpAddr, buf: &[u8]) -> Option<Vec<u8>> {
    let mut reply = handle_message(runtime, remote_ip, buf).await?;
    reply.as_bytes().ok()
}

/// Runs the full per-message pipeline: parse, accept-filter, TSIG gate,
/// opcode dispatch. Returns `None` when the message is malformed badly
/// enough that no reply can be meaningfully addressed back (a corrupt
/// header), matching the "never crash, sometimes just drop" contract of the
/// accept filter.
async fn handle_message(runtime: &Runtime, remote_ip: IpAddr, buf: &[u8]) -> Option<Reply> {
    if buf.len() < HEADER_BYTES {
        debug!(len = buf.len(), "message shorter than a dns header, dropping");
        return None;
    }
    let mut header_bytes = [0u8; HEADER_BYTES];
    header_bytes.copy_from_slice(&buf[0..HEADER_BYTES]);
    let header = match Header::unpack(&header_bytes) {
        Ok(header) => header,
        Err(err) => {
            debug!(%err, "failed to unpack header, dropping");
            return None;
        }
    };

    if header.qr == PacketType::Answer {
        debug!(%remote_ip, "dropping a response packet sent to a listener");
        return None;
    }

    if !matches!(header.opcode, OpCode::Query | OpCode::Notify | OpCode::Update) {
        return Some(skeleton(header, None, Rcode::NotImplemented));
    }

    if header.qdcount != 1 || header.ancount > 1 || header.nscount > 1 || header.arcount > 2 {
        return Some(skeleton(header, None, Rcode::FormatError));
    }

    let question = match Question::from_packets(&buf[HEADER_BYTES..]) {
        Ok(question) => question,
        Err(err) => {
            debug!(%err, "failed to parse question section");
            return Some(skeleton(header, None, Rcode::FormatError));
        }
    };

    let sections = match parse_sections(buf, &header, &question) {
        Ok(sections) => sections,
        Err(err) => {
            debug!(%err, "failed to parse authority/additional sections");
            return Some(skeleton(header, Some(question), Rcode::FormatError));
        }
    };

    let privileged = match &sections.tsig {
        Some((tsig_rr, prefix_len)) => match &runtime.tsig_key {
            Some(key) => match tsig::verify(key, &buf[..*prefix_len], tsig_rr) {
                Ok(()) => true,
                Err(err) => {
                    warn!(%remote_ip, %err, "tsig validation failed, returning an empty reply");
                    return Some(skeleton(header, Some(question), Rcode::NoError));
                }
            },
            None => {
                warn!(%remote_ip, "tsig record present but no key is configured, returning an empty reply");
                return Some(skeleton(header, Some(question), Rcode::NoError));
            }
        },
        None => false,
    };

    match header.opcode {
        OpCode::Update => {
            update::apply_updates(&runtime.zones, privileged, &sections.authority).await;
            Some(skeleton(header, Some(question), Rcode::NoError))
        }
        OpCode::Notify => Some(skeleton(header, Some(question), Rcode::NoError)),
        _ => Some(answer_query(runtime, remote_ip, header, question).await),
    }
}

/// The QUERY dispatch described by the query handler: pre-plugins, then
/// authoritative-or-recursive resolution (with the rule engine applied to
/// whichever path answered), then post-plugins, then wire encoding.
async fn answer_query(runtime: &Runtime, remote_ip: IpAddr, header: Header, original_question: Question) -> Reply {
    let remote_ip_string = remote_ip.to_string();
    let mut working_question = original_question.clone();
    let mut answers: Vec<InternalResourceRecord> = vec![];

    let pre_outcome = match runtime.plugins.run_pre(&remote_ip_string, &mut working_question, &mut answers) {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(%err, "pre-plugin chain aborted, replying servfail");
            return build_reply(header, original_question, vec![], None, Rcode::ServFail);
        }
    };

    if pre_outcome.deny {
        return build_reply(header, original_question, vec![], None, Rcode::Refused);
    }

    let mut soa = None;
    if !pre_outcome.done {
        if !working_question.qtype.supported() {
            debug!(qtype = %working_question.qtype, "unsupported query type, replying not implemented");
            return build_reply(header, original_question, vec![], None, Rcode::NotImplemented);
        }

        let qname = match working_question.normalized_name() {
            Ok(qname) => qname,
            Err(err) => {
                debug!(%err, "question name is not valid utf8, replying format error");
                return build_reply(header, original_question, vec![], None, Rcode::FormatError);
            }
        };

        let outcome = {
            let zones_read = runtime.zones.read().await;
            resolver::authoritative_search(
                &zones_read,
                &runtime.roundrobin,
                &runtime.config.rules,
                !runtime.config.disable_rule_engine,
                &remote_ip_string,
                runtime.config.load_balance,
                runtime.config.lazy,
                &qname,
                working_question.qtype,
            )
        };

        match outcome {
            Some(outcome) => {
                answers.extend(outcome.answers);
                soa = outcome.soa;
            }
            None => {
                let recursive_answers = resolver::recursive_resolve(
                    &runtime.resolver,
                    &runtime.cache,
                    runtime.config.cache,
                    runtime.config.flatten,
                    &qname,
                    working_question.qtype,
                )
                .await;
                let recursive_answers = if runtime.config.disable_rule_engine {
                    recursive_answers
                } else {
                    resolver::apply_rule_engine(&runtime.config.rules, &remote_ip_string, &qname, recursive_answers)
                };
                answers.extend(recursive_answers);
            }
        }
    }

    let post_outcome = match runtime.plugins.run_post(&remote_ip_string, &mut working_question, &mut answers) {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(%err, "post-plugin chain aborted, replying with what resolution already produced");
            return build_reply(header, original_question, answers, soa, Rcode::NoError);
        }
    };
    if post_outcome.deny {
        return build_reply(header, original_question, vec![], None, Rcode::Refused);
    }

    build_reply(header, original_question, answers, soa, Rcode::NoError)
}

/// Assembles the final wire reply: attaches each answer's owner name (via
/// the CNAME-chain walk), converts to wire records, and attaches the zone's
/// SOA to the authority section whenever at least one answer was emitted.
fn build_reply(
    header: Header,
    question: Question,
    answers: Vec<InternalResourceRecord>,
    soa: Option<InternalResourceRecord>,
    rcode: Rcode,
) -> Reply {
    let qname = String::from_utf8_lossy(&question.qname).to_ascii_lowercase();
    let question_bytes = question.qname.clone();

    let owned = resolver::attach_owners(&qname, answers);
    let wire_answers: Vec<crate::ResourceRecord> = owned
        .into_iter()
        .map(|(owner, record)| record.into_wire(&owner, &question_bytes))
        .collect();

    let mut authorities = vec![];
    if !wire_answers.is_empty() {
        if let Some(soa_record) = soa {
            let origin = match &soa_record {
                InternalResourceRecord::SOA { zone, .. } => zone.name.clone(),
                _ => qname.clone(),
            };
            authorities.push(soa_record.into_wire(&origin, &question_bytes));
        }
    }

    let mut answer_header = header.as_answer();
    answer_header.authoritative = true;
    answer_header.rcode = rcode;

    Reply {
        header: answer_header,
        question: Some(question),
        answers: wire_answers,
        authorities,
        additional: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use crate::enums::RecordType;
    use crate::plugins::script_pool::ScriptPool;
    use crate::plugins::PluginChain;
    use crate::zones::{FileZone, SoaConfig, ZoneIndex, ZoneRecordConfig};
    use concread::cowcell::asynch::CowCell;

    fn zone() -> FileZone {
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
            records: vec![ZoneRecordConfig {
                host: "@".to_string(),
                ipv4: Some("1.2.3.4".to_string()),
                ..Default::default()
            }],
            mailers: vec![],
        }
    }

    async fn test_runtime() -> Runtime {
        let mut config = ConfigFile::default();
        config.zones = vec![zone()];
        let zones = CowCell::new(ZoneIndex::build(&config.zones));
        let pool = ScriptPool::new();
        let plugins = PluginChain::load(&config.plugins, &pool).unwrap();
        let resolver = resolver::build_recursive_resolver(config.parent_address().unwrap());
        Runtime {
            config,
            zones,
            cache: crate::cache::Cache::new(),
            roundrobin: crate::roundrobin::RoundRobinState::new(),
            plugins,
            tsig_key: None,
            resolver,
        }
    }

    fn query_message(id: u16, qname: &[u8], qtype: RecordType) -> Vec<u8> {
        let header = Header {
            id,
            recursion_desired: true,
            qdcount: 1,
            ..Header::default()
        };
        let mut buf = header.pack().unwrap().to_vec();
        let question = Question {
            qname: qname.to_vec(),
            qtype,
            qclass: crate::enums::RecordClass::Internet,
        };
        buf.extend(question.to_bytes());
        buf
    }

    #[tokio::test]
    async fn apex_a_query_is_answered_authoritatively() {
        let runtime = test_runtime().await;
        let request = query_message(42, b"example.com", RecordType::A);
        let mut reply = handle_message(&runtime, "10.0.0.1".parse().unwrap(), &request)
            .await
            .expect("should reply");
        assert_eq!(reply.header.rcode, Rcode::NoError);
        assert_eq!(reply.answers.len(), 1);
        assert!(!reply.authorities.is_empty());
        let bytes = reply.as_bytes().expect("should encode");
        assert!(bytes.len() > HEADER_BYTES);
    }

    #[tokio::test]
    async fn out_of_zone_query_recurses_and_returns_empty_without_network() {
        let runtime = test_runtime().await;
        let request = query_message(7, b"other.org", RecordType::A);
        let reply = handle_message(&runtime, "10.0.0.1".parse().unwrap(), &request)
            .await
            .expect("should reply even on recursion failure");
        assert_eq!(reply.header.rcode, Rcode::NoError);
    }

    #[tokio::test]
    async fn malformed_message_with_too_many_questions_is_format_error() {
        let runtime = test_runtime().await;
        let mut request = query_message(1, b"example.com", RecordType::A);
        request[4] = 0;
        request[5] = 2; // qdcount = 2
        let reply = handle_message(&runtime, "10.0.0.1".parse().unwrap(), &request)
            .await
            .expect("should still reply");
        assert_eq!(reply.header.rcode, Rcode::FormatError);
        assert!(reply.question.is_none());
    }

    #[tokio::test]
    async fn response_packets_are_dropped() {
        let runtime = test_runtime().await;
        let mut request = query_message(1, b"example.com", RecordType::A);
        request[2] |= 0b1000_0000; // set QR
        assert!(handle_message(&runtime, "10.0.0.1".parse().unwrap(), &request).await.is_none());
    }

    #[tokio::test]
    async fn unprivileged_update_is_a_no_op() {
        let runtime = test_runtime().await;
        let mut header = Header {
            id: 9,
            opcode: OpCode::Update,
            qdcount: 1,
            ..Header::default()
        };
        header.recursion_desired = false;
        let mut buf = header.pack().unwrap().to_vec();
        let question = Question {
            qname: b"example.com".to_vec(),
            qtype: RecordType::SOA,
            qclass: crate::enums::RecordClass::Internet,
        };
        buf.extend(question.to_bytes());
        let reply = handle_message(&runtime, "10.0.0.1".parse().unwrap(), &buf)
            .await
            .expect("should reply");
        assert_eq!(reply.header.rcode, Rcode::NoError);
        let read_txn = runtime.zones.read().await;
        assert!(read_txn.lookup("note.example.com", RecordType::TXT).is_none());
    }
}
