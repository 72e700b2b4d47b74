use crate::resourcerecord::InternalResourceRecord;
use packed_struct::prelude::*;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt::Display;

#[derive(Debug, Eq, PartialEq, PrimitiveEnum_u8, Copy, Clone)]
/// A four bit field that specifies kind of query in this message.
/// This value is set by the originator of a query and copied into the response.
pub enum OpCode {
    /// A standard query (QUERY)
    Query = 0,
    /// Server status request (STATUS) - accepted but not serviced
    Status = 2,
    /// Zone change notification (RFC1996)
    Notify = 4,
    /// Dynamic update (RFC2136)
    Update = 5,
    /// 1, 3, 6-15 reserved/obsolete for our purposes
    Reserved = 15,
}

impl From<u8> for OpCode {
    fn from(input: u8) -> Self {
        match input {
            0 => Self::Query,
            2 => Self::Status,
            4 => Self::Notify,
            5 => Self::Update,
            _ => Self::Reserved,
        }
    }
}

impl From<OpCode> for i32 {
    fn from(val: OpCode) -> i32 {
        match val {
            OpCode::Query => 0,
            OpCode::Status => 2,
            OpCode::Notify => 4,
            OpCode::Update => 5,
            OpCode::Reserved => 15,
        }
    }
}

#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, Eq, PartialEq)]
/// Response code, things like NOERROR, FORMATERROR, SERVFAIL etc.
pub enum Rcode {
    /// No error condition
    NoError = 0,
    /// Format error - The name server was unable to interpret the query.
    FormatError = 1,
    /// Server failure
    ServFail = 2,
    /// Name Error - the domain name referenced in the query does not exist.
    NameError = 3,
    /// Not Implemented - the requested kind of query is not supported.
    NotImplemented = 4,
    /// Refused - the server refuses to perform the specified operation.
    Refused = 5,
}

#[allow(clippy::upper_case_acronyms, dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// RRType, scoped to the types this server is specified to understand.
pub enum RecordType {
    /// A host address
    A = 1,
    /// Authoritative name server
    NS = 2,
    CNAME = 5,
    SOA = 6,
    MX = 15,
    TXT = 16,
    /// IPv6 address <https://www.rfc-editor.org/rfc/rfc3596#section-2.1>
    AAAA = 28,
    /// Service location <https://www.rfc-editor.org/rfc/rfc2782>
    SRV = 33,
    /// A request for all records (*)
    ANY = 255,
    InvalidType,
}

impl From<&u16> for RecordType {
    fn from(input: &u16) -> Self {
        match input {
            1 => Self::A,
            2 => Self::NS,
            5 => Self::CNAME,
            6 => Self::SOA,
            15 => Self::MX,
            16 => Self::TXT,
            28 => Self::AAAA,
            33 => Self::SRV,
            255 => Self::ANY,
            _ => Self::InvalidType,
        }
    }
}

impl From<String> for RecordType {
    fn from(input: String) -> Self {
        let input: RecordType = input.as_str().into();
        input
    }
}

impl From<&str> for RecordType {
    fn from(input: &str) -> Self {
        match input.to_ascii_uppercase().as_str() {
            "A" => Self::A,
            "AAAA" => Self::AAAA,
            "ANY" => Self::ANY,
            "CNAME" => Self::CNAME,
            "MX" => Self::MX,
            "NS" => Self::NS,
            "SOA" => Self::SOA,
            "SRV" => Self::SRV,
            "TXT" => Self::TXT,
            _ => Self::InvalidType,
        }
    }
}

impl From<RecordType> for &'static str {
    fn from(input: RecordType) -> &'static str {
        match input {
            RecordType::A => "A",
            RecordType::AAAA => "AAAA",
            RecordType::ANY => "ANY",
            RecordType::CNAME => "CNAME",
            RecordType::MX => "MX",
            RecordType::NS => "NS",
            RecordType::SOA => "SOA",
            RecordType::SRV => "SRV",
            RecordType::TXT => "TXT",
            RecordType::InvalidType => "",
        }
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let res: &'static str = (*self).into();
        f.write_fmt(format_args!("{res}"))
    }
}

impl RecordType {
    /// Types this server answers authoritatively or forwards recursively.
    /// `ANY` and anything unrecognized fall outside the scope this server
    /// was specified to understand and get `NotImplemented` at the door.
    pub fn supported(&self) -> bool {
        matches!(
            self,
            RecordType::A
                | RecordType::AAAA
                | RecordType::CNAME
                | RecordType::NS
                | RecordType::SOA
                | RecordType::MX
                | RecordType::TXT
                | RecordType::SRV
        )
    }
}

impl From<&InternalResourceRecord> for RecordType {
    fn from(input: &InternalResourceRecord) -> RecordType {
        match input {
            InternalResourceRecord::A { .. } => RecordType::A,
            InternalResourceRecord::AAAA { .. } => RecordType::AAAA,
            InternalResourceRecord::CNAME { .. } => RecordType::CNAME,
            InternalResourceRecord::MX { .. } => RecordType::MX,
            InternalResourceRecord::NS { .. } => RecordType::NS,
            InternalResourceRecord::SOA { .. } => RecordType::SOA,
            InternalResourceRecord::SRV { .. } => RecordType::SRV,
            InternalResourceRecord::TXT { .. } => RecordType::TXT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
/// CLASS fields appear in resource records, most entries should be IN, but
/// CHAOS is typically used for management-layer things. Ref RFC1035 3.2.4.
pub enum RecordClass {
    /// IN - Internet
    Internet = 1,
    /// CH - Chaos
    Chaos = 3,
    InvalidType = 0,
}

impl Display for RecordClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{}",
            match self {
                RecordClass::Internet => "IN",
                RecordClass::Chaos => "CHAOS",
                RecordClass::InvalidType => "Invalid",
            }
        ))
    }
}

impl From<&str> for RecordClass {
    fn from(value: &str) -> Self {
        match value {
            "IN" => RecordClass::Internet,
            "CHAOS" => RecordClass::Chaos,
            _ => RecordClass::InvalidType,
        }
    }
}

impl Serialize for RecordClass {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(format!("{self}").as_str())
    }
}

impl From<&u16> for RecordClass {
    fn from(input: &u16) -> Self {
        match input {
            1 => Self::Internet,
            3 => Self::Chaos,
            _ => Self::InvalidType,
        }
    }
}

#[derive(Debug, PrimitiveEnum_u8, Clone, Copy, Eq, PartialEq)]
pub enum PacketType {
    Query = 0,
    Answer = 1,
}

impl From<bool> for PacketType {
    fn from(input: bool) -> Self {
        match input {
            false => Self::Query,
            true => Self::Answer,
        }
    }
}
