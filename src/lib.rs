use crate::enums::*;
use crate::error::HerdNsError;
use packed_struct::prelude::*;
use std::fmt::Display;
use std::str::from_utf8;
use tracing::trace;

/// Configuration handling for the server
pub mod config;
pub mod enums;
pub mod error;
pub mod packet_dumper;
pub mod plugins;
pub mod reply;
pub mod resourcerecord;
pub mod resolver;
pub mod roundrobin;
pub mod rules;
pub mod servers;
pub mod tsig;
pub mod update;
pub mod zones;
/// Server boot, reload and shutdown orchestration.
pub mod lifecycle;
/// In-memory recursive-answer cache.
pub mod cache;
/// Tracing/logging setup, used by the binary entrypoint.
pub mod logging;

/// Internal limit of in-flight requests
pub const MAX_IN_FLIGHT: usize = 512;
/// The size of a DNS request header
pub const HEADER_BYTES: usize = 12;

/// The default "cancel a server response" timeout
pub const REPLY_TIMEOUT_MS: u64 = 1000;
/// The maximum size of a UDP packet <https://dnsflagday.net/2020/#dns-flag-day-2020>
pub const UDP_BUFFER_SIZE: usize = 1232;
/// How many CNAME hops the cache flattener will chase before giving up.
pub const MAX_CNAME_CHASE: usize = 32;

/// The header of a DNS transmission, either a Query or Reply. Ref [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.1) section 4.1.1.
#[derive(Debug, PackedStruct, PartialEq, Eq, Clone)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "12")]
pub struct Header {
    /// The query ID
    #[packed_field(bits = "0..=15", endian = "msb")]
    pub id: u16,
    // Is it a query or response
    #[packed_field(bits = "16", ty = "enum")]
    pub qr: PacketType, // bit 16
    #[packed_field(bits = "17..=20", ty = "enum")]
    pub opcode: OpCode, // 17-20 actually 4 bits
    #[packed_field(bits = "21")]
    pub authoritative: bool, // 21
    #[packed_field(bits = "22")]
    pub truncated: bool, // 22
    // RD - Recursion Desired - this bit may be set in a query and is copied into the response.  If RD is set, it directs the name server to pursue the query recursively.
    #[packed_field(bits = "23")]
    pub recursion_desired: bool, // 23
    #[packed_field(bits = "24")]
    pub recursion_available: bool, // 24
    /// reserved, must be all 0's
    #[packed_field(bits = "25")]
    pub z: bool, // 25-27 -
    #[packed_field(bits = "26")]
    pub ad: bool,
    #[packed_field(bits = "27")]
    pub cd: bool,
    #[packed_field(bits = "28..=31", ty = "enum")]
    pub rcode: Rcode, // bits 28-31
    /// an unsigned 16 bit integer specifying the number of entries in the question section.
    #[packed_field(bits = "32..=47", endian = "msb")]
    pub qdcount: u16, // bits 32-47
    /// an unsigned 16 bit integer specifying the number of entries in the answer section.
    #[packed_field(bits = "48..=63", endian = "msb")]
    pub ancount: u16, // 48-63
    /// an unsigned 16 bit integer specifying the number of name server resource records in the authority records section.
    #[packed_field(bits = "64..=79", endian = "msb")]
    pub nscount: u16, // 64-79
    /// an unsigned 16 bit integer specifying the number of resource records in the additional records section.
    #[packed_field(bits = "80..=95", endian = "msb")]
    pub arcount: u16, // 80-95
}

impl Default for Header {
    fn default() -> Self {
        Header {
            id: 0,
            qr: PacketType::Query,
            opcode: OpCode::Query,
            // we *are* an authoritative DNS server after all
            authoritative: true,
            truncated: false,
            recursion_desired: false,
            recursion_available: false,
            z: false,
            ad: false,
            cd: false,
            rcode: Rcode::NoError,
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }
}

impl Header {
    pub fn as_answer(self) -> Header {
        let mut response = self;
        response.qr = PacketType::Answer;
        response
    }
}

/// The answer, authority, and additional sections all share the same
/// format: a variable number of resource records, where the number of
/// records is specified in the corresponding count field in the header.
///
/// Ref [RFC1035 Section 4.1.3](https://www.rfc-editor.org/rfc/rfc1035.html#section-4.1.3)
#[derive(Clone, Debug)]
pub struct ResourceRecord {
    /// A domain name to which this resource record pertains, lowercase dotted ascii, no trailing dot.
    pub name: Vec<u8>,
    /// Two octets containing one of the RR type codes. This field specifies the meaning of the data in the RDATA field. The official name is "type".
    pub record_type: RecordType,
    /// Two octets which specify the class of the data in the RDATA field.
    pub class: RecordClass,
    /// A 32 bit unsigned integer that specifies the time interval (in seconds) that the resource record may be cached before it should be discarded.
    pub ttl: u32,
    /// A variable length string of octets that describes the resource.
    pub rdata: Vec<u8>,
}

impl ResourceRecord {
    /// Encode with an optional compression pointer back to the question name
    /// when this record's name is exactly the question name (the only
    /// compression case this server bothers with).
    pub fn as_bytes(&self, question_name: Option<&[u8]>) -> Vec<u8> {
        let mut retval: Vec<u8> = vec![];
        trace!(?self, "encoding resource record");

        retval.extend(name_as_bytes(&self.name, question_name));
        retval.extend((self.record_type as u16).to_be_bytes());
        retval.extend((self.class as u16).to_be_bytes());
        retval.extend(self.ttl.to_be_bytes());
        retval.extend((self.rdata.len() as u16).to_be_bytes());
        retval.extend(self.rdata.to_vec());
        retval
    }
}

impl From<&ResourceRecord> for Vec<u8> {
    fn from(record: &ResourceRecord) -> Self {
        record.as_bytes(None)
    }
}

impl From<ResourceRecord> for Vec<u8> {
    fn from(record: ResourceRecord) -> Self {
        Vec::<u8>::from(&record)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A DNS Question section, from Ref [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.2) section 4.1.2 "Question section format".
pub struct Question {
    /// The name which is being queried, lowercase dotted ascii, no trailing dot.
    pub qname: Vec<u8>,
    /// The Record type that is being requested, eg A, NS, MX, TXT etc.
    pub qtype: RecordType,
    /// The class, (typically IN for "Internet")
    pub qclass: RecordClass,
}

impl Display for Question {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let qname = match from_utf8(&self.qname) {
            Ok(value) => value.to_string(),
            Err(_) => format!("{:?}", self.qname),
        };
        f.write_fmt(format_args!(
            "QNAME={} QTYPE={} QCLASS={}",
            qname, self.qtype, self.qclass,
        ))
    }
}

/// Parses a DNS name starting at `input_val`, returning its lowercase dotted
/// ascii form (no trailing dot). Does not follow compression pointers — only
/// used on the question section, which per RFC1035 §4.1.2 is never
/// compressed.
pub fn get_question_qname(input_val: &[u8]) -> Result<Vec<u8>, HerdNsError> {
    if input_val.is_empty() {
        return Err(HerdNsError::InvalidName);
    }
    let mut buf = input_val;
    let mut result: Vec<u8> = vec![];
    loop {
        if buf.is_empty() {
            return Err(HerdNsError::InvalidName);
        }
        let label_len = buf[0] as usize;
        if label_len == 0 {
            break;
        } else if label_len > 63 {
            return Err(HerdNsError::InvalidName);
        }
        if buf.len() < label_len + 1 {
            return Err(HerdNsError::InvalidName);
        }
        if !result.is_empty() {
            result.push(b'.');
        }
        result.extend_from_slice(&buf[1..label_len + 1]);
        buf = &buf[label_len + 1..];
        if result.len() > 255 {
            return Err(HerdNsError::InvalidName);
        }
    }
    let result_string = from_utf8(&result)
        .map_err(|_| HerdNsError::InvalidName)?
        .to_lowercase();
    Ok(result_string.into_bytes())
}

/// Parses a DNS name starting at `offset` within the whole message `buf`,
/// following a single level of compression pointer if one is found (enough
/// for any name this server will ever be handed: qname back-references in
/// the authority/additional sections of UPDATE and TSIG-bearing messages).
/// Returns the decoded lowercase dotted name and the offset of the first
/// byte after the name *in the original buffer* (not through the pointer).
pub fn name_from_message(buf: &[u8], offset: usize) -> Result<(Vec<u8>, usize), HerdNsError> {
    let mut labels: Vec<u8> = vec![];
    let mut cursor = offset;
    let mut end_of_name: Option<usize> = None;
    let mut hops = 0usize;
    loop {
        if cursor >= buf.len() {
            return Err(HerdNsError::InvalidName);
        }
        let len_byte = buf[cursor];
        if len_byte == 0 {
            if end_of_name.is_none() {
                end_of_name = Some(cursor + 1);
            }
            break;
        }
        if len_byte & 0xC0 == 0xC0 {
            if cursor + 1 >= buf.len() {
                return Err(HerdNsError::InvalidName);
            }
            if end_of_name.is_none() {
                end_of_name = Some(cursor + 2);
            }
            hops += 1;
            if hops > MAX_CNAME_CHASE {
                return Err(HerdNsError::InvalidName);
            }
            let pointer = (((len_byte & 0x3F) as usize) << 8) | buf[cursor + 1] as usize;
            if pointer >= buf.len() {
                return Err(HerdNsError::InvalidName);
            }
            cursor = pointer;
            continue;
        }
        let label_len = len_byte as usize;
        if label_len > 63 || cursor + 1 + label_len > buf.len() {
            return Err(HerdNsError::InvalidName);
        }
        if !labels.is_empty() {
            labels.push(b'.');
        }
        labels.extend_from_slice(&buf[cursor + 1..cursor + 1 + label_len]);
        cursor += 1 + label_len;
        if labels.len() > 255 {
            return Err(HerdNsError::InvalidName);
        }
    }
    let name = from_utf8(&labels)
        .map_err(|_| HerdNsError::InvalidName)?
        .to_lowercase()
        .into_bytes();
    Ok((name, end_of_name.unwrap_or(cursor)))
}

/// Encodes a dotted lowercase ascii name as wire-format labels terminated by
/// a zero-length label. If `question_name` is provided and matches `name`
/// exactly, a single compression pointer back to the question name's offset
/// (immediately after the fixed 12-byte header) is emitted instead.
pub fn name_as_bytes(name: &[u8], question_name: Option<&[u8]>) -> Vec<u8> {
    if let Some(qname) = question_name {
        if qname == name {
            return vec![0xC0, HEADER_BYTES as u8];
        }
    }
    let mut retval: Vec<u8> = vec![];
    if !name.is_empty() {
        for label in name.split(|b| *b == b'.') {
            if label.is_empty() {
                continue;
            }
            retval.push(label.len() as u8);
            retval.extend_from_slice(label);
        }
    }
    retval.push(0);
    retval
}

/// A minimal, generic resource-record reader used for sections this server
/// doesn't need to interpret record-type-specific RDATA for (UPDATE
/// prerequisites, TSIG additional records): name, type, class, ttl and the
/// raw rdata bytes.
#[derive(Clone, Debug)]
pub struct RawRecord {
    pub name: Vec<u8>,
    pub record_type: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl RawRecord {
    /// Parses a single resource record starting at `offset` in the whole
    /// message `buf`. Returns the record plus the offset of the next byte.
    pub fn parse(buf: &[u8], offset: usize) -> Result<(Self, usize), HerdNsError> {
        let (name, mut cursor) = name_from_message(buf, offset)?;
        if cursor + 10 > buf.len() {
            return Err(HerdNsError::InvalidHeader(
                "truncated resource record".to_string(),
            ));
        }
        let record_type = u16::from_be_bytes([buf[cursor], buf[cursor + 1]]);
        let class = u16::from_be_bytes([buf[cursor + 2], buf[cursor + 3]]);
        let ttl = u32::from_be_bytes([
            buf[cursor + 4],
            buf[cursor + 5],
            buf[cursor + 6],
            buf[cursor + 7],
        ]);
        let rdlength = u16::from_be_bytes([buf[cursor + 8], buf[cursor + 9]]) as usize;
        cursor += 10;
        if cursor + rdlength > buf.len() {
            return Err(HerdNsError::InvalidHeader(
                "rdata overruns message".to_string(),
            ));
        }
        let rdata = buf[cursor..cursor + rdlength].to_vec();
        cursor += rdlength;
        Ok((
            RawRecord {
                name,
                record_type,
                class,
                ttl,
                rdata,
            },
            cursor,
        ))
    }
}

impl Question {
    pub fn normalized_name(&self) -> Result<String, HerdNsError> {
        from_utf8(&self.qname)
            .map(|value| value.to_lowercase())
            .map_err(|_| HerdNsError::InvalidName)
    }

    /// hand it the buffer and the things, and get back a [Question]
    pub fn from_packets(buf: &[u8]) -> Result<Self, HerdNsError> {
        let qname = get_question_qname(buf)?;

        // skip past the end of the question: label bytes + terminating zero
        let read_pointer = qname.len() + 2;
        if buf.len() < read_pointer + 4 {
            return Err(HerdNsError::InvalidHeader(
                "question section truncated".to_string(),
            ));
        }
        let qtype_bytes = [buf[read_pointer], buf[read_pointer + 1]];
        let qtype = RecordType::from(&u16::from_be_bytes(qtype_bytes));
        let qclass_bytes = [buf[read_pointer + 2], buf[read_pointer + 3]];
        let qclass: RecordClass = RecordClass::from(&u16::from_be_bytes(qclass_bytes));

        Ok(Question {
            qname,
            qtype,
            qclass,
        })
    }

    /// the offset of the first byte after the question section, used to
    /// find the authority/additional sections for UPDATE and TSIG.
    pub fn wire_len(&self) -> usize {
        // +2 for the leading length byte of the first label and the
        // trailing zero label, +1 per '.' replaced by a length byte.
        self.qname.len() + 2 + 4
    }

    /// turn a question into a vec of bytes to send back to the user
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut retval: Vec<u8> = vec![];
        retval.extend(name_as_bytes(&self.qname, None));
        retval.extend((self.qtype as u16).to_be_bytes());
        retval.extend((self.qclass as u16).to_be_bytes());
        retval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_qname() {
        let mut buf = vec![7];
        buf.extend(b"example");
        buf.push(3);
        buf.extend(b"com");
        buf.push(0);
        let name = get_question_qname(&buf).expect("should parse");
        assert_eq!(name, b"example.com".to_vec());
    }

    #[test]
    fn rejects_oversized_label() {
        let mut buf = vec![64];
        buf.extend(vec![b'a'; 64]);
        buf.push(0);
        assert!(get_question_qname(&buf).is_err());
    }

    #[test]
    fn round_trips_name_encoding() {
        let encoded = name_as_bytes(b"www.example.com", None);
        let (decoded, next) = name_from_message(&encoded, 0).expect("should decode");
        assert_eq!(decoded, b"www.example.com".to_vec());
        assert_eq!(next, encoded.len());
    }

    #[test]
    fn compresses_matching_question_name() {
        let encoded = name_as_bytes(b"example.com", Some(b"example.com"));
        assert_eq!(encoded, vec![0xC0, HEADER_BYTES as u8]);
    }

    #[test]
    fn follows_a_compression_pointer() {
        let mut buf = vec![0u8; HEADER_BYTES];
        buf.extend(name_as_bytes(b"example.com", None));
        let pointer_offset = buf.len();
        buf.extend(vec![0xC0, HEADER_BYTES as u8]);
        let (name, next) = name_from_message(&buf, pointer_offset).expect("should follow pointer");
        assert_eq!(name, b"example.com".to_vec());
        assert_eq!(next, pointer_offset + 2);
    }

    #[test]
    fn header_default_is_authoritative_query() {
        let header = Header::default();
        assert!(header.authoritative);
        assert_eq!(header.qr, PacketType::Query);
        let answer = header.as_answer();
        assert_eq!(answer.qr, PacketType::Answer);
    }
}
