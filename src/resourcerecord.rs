use crate::enums::RecordType;
use crate::error::HerdNsError;
use crate::name_as_bytes;
use crate::HEADER_BYTES;

use std::str::FromStr;
use tracing::trace;

/// A domain name carried inside a record's RDATA (eg a CNAME target, an MX
/// exchange, an SOA mname/rname). Stored as a lowercase dotted ascii string,
/// no trailing dot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DomainName {
    pub name: String,
}

impl DomainName {
    /// Encode with an optional compression pointer back to the question name.
    pub fn as_bytes(&self, question_name: Option<&[u8]>) -> Vec<u8> {
        name_as_bytes(self.name.as_bytes(), question_name)
    }
}

impl From<&str> for DomainName {
    fn from(input: &str) -> Self {
        DomainName {
            name: input.trim_end_matches('.').to_ascii_lowercase(),
        }
    }
}

impl From<String> for DomainName {
    fn from(name: String) -> Self {
        DomainName::from(name.as_str())
    }
}

/// `<character-string>` is a single length octet followed by that number of
/// characters. Treated as binary, up to 255 bytes of payload.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct DNSCharString {
    pub data: Vec<u8>,
}

impl From<&str> for DNSCharString {
    fn from(input: &str) -> Self {
        DNSCharString {
            data: input.as_bytes().to_vec(),
        }
    }
}

impl DNSCharString {
    /// Returns the wire bytes: length octet then the string, truncated to 255
    /// bytes of payload per RFC1035 §3.3.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut data = self.data.clone();
        data.truncate(255);
        let mut res: Vec<u8> = vec![data.len() as u8];
        res.extend(data);
        res
    }
}

/// The record types this server knows how to build and serve, scoped to
/// those named in the zone data model. `ttl` lives alongside each variant's
/// other fields so a builder can carry per-record TTL overrides.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum InternalResourceRecord {
    /// A single IPv4 host address
    A { address: u32, ttl: u32 },
    /// An IPv6 host address <https://www.rfc-editor.org/rfc/rfc3596#section-2.1>
    AAAA { address: u128, ttl: u32 },
    /// An authoritative name server for the zone apex
    NS { nsdname: DomainName, ttl: u32 },
    /// The canonical name for an alias
    CNAME { cname: DomainName, ttl: u32 },
    /// Marks the start of a zone of authority. `ttl` is the envelope TTL
    /// carried in the RR header; `minimum` is the RDATA's separate minTTL
    /// field (RFC1035 §3.3.13) and is not necessarily the same value.
    SOA {
        zone: DomainName,
        mname: DomainName,
        rname: DomainName,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: u32,
    },
    /// A mail exchange, ref RFC1035 §3.3.9. `exchange: None` encodes the
    /// RFC7505 "null MX" (a lone `.` exchange signalling "no mail").
    MX {
        preference: u16,
        exchange: Option<DomainName>,
        ttl: u32,
    },
    /// Text strings, ref RFC1035 §3.3.14
    TXT { txtdata: DNSCharString, ttl: u32 },
    /// Service location, ref RFC2782
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: DomainName,
        ttl: u32,
    },
}

impl PartialEq<RecordType> for InternalResourceRecord {
    fn eq(&self, other: &RecordType) -> bool {
        match self {
            InternalResourceRecord::A { .. } => other == &RecordType::A,
            InternalResourceRecord::AAAA { .. } => other == &RecordType::AAAA,
            InternalResourceRecord::CNAME { .. } => other == &RecordType::CNAME,
            InternalResourceRecord::MX { .. } => other == &RecordType::MX,
            InternalResourceRecord::NS { .. } => other == &RecordType::NS,
            InternalResourceRecord::SOA { .. } => other == &RecordType::SOA,
            InternalResourceRecord::SRV { .. } => other == &RecordType::SRV,
            InternalResourceRecord::TXT { .. } => other == &RecordType::TXT,
        }
    }
}

impl InternalResourceRecord {
    pub fn ttl(&self) -> u32 {
        match self {
            InternalResourceRecord::A { ttl, .. }
            | InternalResourceRecord::AAAA { ttl, .. }
            | InternalResourceRecord::NS { ttl, .. }
            | InternalResourceRecord::CNAME { ttl, .. }
            | InternalResourceRecord::MX { ttl, .. }
            | InternalResourceRecord::TXT { ttl, .. }
            | InternalResourceRecord::SRV { ttl, .. } => *ttl,
            InternalResourceRecord::SOA { ttl, .. } => *ttl,
        }
    }

    /// Builds the RDATA bytes for this record. `question` is the question
    /// name, used as the compression-pointer target for any embedded names.
    pub fn as_bytes(&self, question: &[u8]) -> Vec<u8> {
        match self {
            InternalResourceRecord::A { address, .. } => address.to_be_bytes().to_vec(),
            InternalResourceRecord::AAAA { address, .. } => address.to_be_bytes().to_vec(),
            InternalResourceRecord::TXT { txtdata, .. } => txtdata.as_bytes(),
            InternalResourceRecord::CNAME { cname, .. } => {
                trace!(?cname, "encoding CNAME rdata");
                cname.as_bytes(Some(question))
            }
            InternalResourceRecord::NS { nsdname, .. } => nsdname.as_bytes(Some(question)),
            InternalResourceRecord::SOA {
                zone: _,
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ttl: _,
            } => {
                let mut res = mname.as_bytes(Some(question));
                res.extend(rname.as_bytes(Some(question)));
                res.extend(serial.to_be_bytes());
                res.extend(refresh.to_be_bytes());
                res.extend(retry.to_be_bytes());
                res.extend(expire.to_be_bytes());
                res.extend(minimum.to_be_bytes());
                res
            }
            InternalResourceRecord::MX {
                preference,
                exchange,
                ..
            } => {
                let mut res: Vec<u8> = preference.to_be_bytes().to_vec();
                match exchange {
                    // RFC7505 null MX: a root name, never compressed.
                    None => res.extend(name_as_bytes(b"", None)),
                    Some(exchange) => res.extend(exchange.as_bytes(Some(question))),
                }
                res
            }
            InternalResourceRecord::SRV {
                priority,
                weight,
                port,
                target,
                ..
            } => {
                let mut res: Vec<u8> = priority.to_be_bytes().to_vec();
                res.extend(weight.to_be_bytes());
                res.extend(port.to_be_bytes());
                // SRV targets are never compressed, ref RFC2782.
                res.extend(target.as_bytes(None));
                res
            }
        }
    }
}

impl InternalResourceRecord {
    /// Builds the wire-level record this server actually writes into a
    /// reply, stamping on the owner name worked out by the CNAME-chain walk
    /// in [crate::resolver::attach_owners].
    pub fn into_wire(self, owner: &str, question_name: &[u8]) -> crate::ResourceRecord {
        let record_type = RecordType::from(&self);
        let ttl = self.ttl();
        let rdata = self.as_bytes(question_name);
        crate::ResourceRecord {
            name: owner.as_bytes().to_vec(),
            record_type,
            class: crate::enums::RecordClass::Internet,
            ttl,
            rdata,
        }
    }
}

/// Parses an IPv4 dotted-quad string into the big-endian u32 wire form.
pub fn parse_ipv4(input: &str) -> Result<u32, HerdNsError> {
    std::net::Ipv4Addr::from_str(input)
        .map(|v| v.into())
        .map_err(|e| HerdNsError::InvalidValue(format!("{input:?} is not an IPv4 address: {e}")))
}

/// Parses an IPv6 string into the big-endian u128 wire form.
pub fn parse_ipv6(input: &str) -> Result<u128, HerdNsError> {
    std::net::Ipv6Addr::from_str(input)
        .map(|v| v.into())
        .map_err(|e| HerdNsError::InvalidValue(format!("{input:?} is not an IPv6 address: {e}")))
}

/// tests to ensure that no label in the name is longer than 63 octets (bytes)
pub fn check_long_labels(testval: &str) -> bool {
    testval.split('.').any(|x| x.len() > 63)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_label_is_rejected() {
        assert!(!check_long_labels("hello."));
        assert!(!check_long_labels("hello.world"));
        assert!(check_long_labels(
            "foo.12345678901234567890123456789012345678901234567890123456789012345678901234567890"
        ));
    }

    #[test]
    fn eq_against_record_type() {
        assert_eq!(
            InternalResourceRecord::A {
                address: 12345,
                ttl: 1
            },
            RecordType::A
        );
        assert_eq!(
            InternalResourceRecord::AAAA {
                address: 12345,
                ttl: 1
            },
            RecordType::AAAA
        );
    }

    #[test]
    fn resourcerecord_from_ipv6_string() {
        let address = parse_ipv6("1234:5678:cafe:beef:ca75:0:4b9:e94d").expect("should parse");
        let rr = InternalResourceRecord::AAAA { address, ttl: 160 };
        assert_eq!(rr, RecordType::AAAA);
        assert_eq!(
            rr.as_bytes(b""),
            [18, 52, 86, 120, 202, 254, 190, 239, 202, 117, 0, 0, 4, 185, 233, 77].to_vec()
        );
    }

    #[test]
    fn dnscharstring_len_prefix() {
        let test: DNSCharString = "hello world".into();
        let bytes = test.as_bytes();
        assert_eq!(bytes[0], 11);
    }

    #[test]
    fn null_mx_encodes_root_name() {
        let rr = InternalResourceRecord::MX {
            preference: 0,
            exchange: None,
            ttl: 3600,
        };
        assert_eq!(rr.as_bytes(b"example.com"), vec![0, 0, 0]);
    }

    #[test]
    fn srv_target_is_never_compressed() {
        let rr = InternalResourceRecord::SRV {
            priority: 0,
            weight: 5,
            port: 5060,
            target: DomainName::from("sip.example.com"),
            ttl: 60,
        };
        let bytes = rr.as_bytes(b"sip.example.com");
        // priority, weight, port = 6 bytes, then the uncompressed target
        assert_eq!(&bytes[0..6], &[0, 0, 0, 5, 0x13, 0xC4]);
        assert!(bytes.len() > 6 + 2); // labels, not a 2-byte pointer
    }
}
