//! TSIG (RFC2845-shaped) request signing, used to gate privileged UPDATE
//! requests. This implements the subset needed to validate-or-reject a
//! request against a single configured key: algorithm name, time signed,
//! fudge and the HMAC itself. It does not attempt full canonical-message-form
//! compatibility with other TSIG implementations (out of scope — this server
//! only needs to authenticate its own clients, not interoperate with BIND's
//! wire format).

use crate::config::SecretFile;
use crate::error::HerdNsError;
use crate::RawRecord;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// The DNS RR type code for TSIG, ref RFC2845 §2.
pub const TSIG_RECORD_TYPE: u16 = 250;

type HmacSha256 = Hmac<Sha256>;

/// A decoded TSIG key, ready to verify requests.
#[derive(Clone)]
pub struct TsigKey {
    pub name: String,
    secret: Vec<u8>,
}

impl TryFrom<&SecretFile> for TsigKey {
    type Error = HerdNsError;

    fn try_from(file: &SecretFile) -> Result<Self, HerdNsError> {
        let secret = STANDARD
            .decode(&file.signature)
            .map_err(|e| HerdNsError::ConfigError(format!("invalid base64 tsig secret: {e}")))?;
        Ok(TsigKey {
            name: file.key.to_ascii_lowercase(),
            secret,
        })
    }
}

struct TsigRdata<'a> {
    algorithm_name: Vec<u8>,
    time_signed: [u8; 6],
    fudge: u16,
    mac: &'a [u8],
}

fn parse_rdata(rdata: &[u8]) -> Result<TsigRdata<'_>, HerdNsError> {
    let (algorithm_name, mut cursor) = crate::name_from_message(rdata, 0)?;
    if cursor + 8 > rdata.len() {
        return Err(HerdNsError::TsigInvalid);
    }
    let mut time_signed = [0u8; 6];
    time_signed.copy_from_slice(&rdata[cursor..cursor + 6]);
    cursor += 6;
    let fudge = u16::from_be_bytes([rdata[cursor], rdata[cursor + 1]]);
    cursor += 2;
    let mac_size = u16::from_be_bytes([rdata[cursor], rdata[cursor + 1]]) as usize;
    cursor += 2;
    if cursor + mac_size > rdata.len() {
        return Err(HerdNsError::TsigInvalid);
    }
    let mac = &rdata[cursor..cursor + mac_size];
    Ok(TsigRdata {
        algorithm_name,
        time_signed,
        fudge,
        mac,
    })
}

/// Verifies `tsig` (a RR of type [TSIG_RECORD_TYPE] pulled from a message's
/// additional section) against `message_prefix` (the raw bytes of the
/// message up to, but not including, the TSIG RR itself).
pub fn verify(key: &TsigKey, message_prefix: &[u8], tsig: &RawRecord) -> Result<(), HerdNsError> {
    if tsig.record_type != TSIG_RECORD_TYPE {
        return Err(HerdNsError::TsigInvalid);
    }
    let owner = String::from_utf8(tsig.name.clone()).map_err(|_| HerdNsError::TsigInvalid)?;
    if owner.to_ascii_lowercase() != key.name {
        return Err(HerdNsError::TsigInvalid);
    }

    let parsed = parse_rdata(&tsig.rdata)?;

    let mut mac = HmacSha256::new_from_slice(&key.secret).map_err(|_| HerdNsError::TsigInvalid)?;
    mac.update(message_prefix);
    mac.update(owner.as_bytes());
    mac.update(&parsed.algorithm_name);
    mac.update(&parsed.time_signed);
    mac.update(&parsed.fudge.to_be_bytes());

    mac.verify_slice(parsed.mac)
        .map_err(|_| HerdNsError::TsigInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(key: &TsigKey, message_prefix: &[u8], owner: &str, algorithm_name: &[u8], time_signed: [u8; 6], fudge: u16) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&key.secret).unwrap();
        mac.update(message_prefix);
        mac.update(owner.as_bytes());
        mac.update(algorithm_name);
        mac.update(&time_signed);
        mac.update(&fudge.to_be_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    fn build_rdata(algorithm_name: &[u8], time_signed: [u8; 6], fudge: u16, mac: &[u8]) -> Vec<u8> {
        let mut rdata = algorithm_name.to_vec();
        rdata.extend(time_signed);
        rdata.extend(fudge.to_be_bytes());
        rdata.extend((mac.len() as u16).to_be_bytes());
        rdata.extend(mac);
        rdata
    }

    #[test]
    fn verifies_a_correctly_signed_request() {
        let key = TsigKey {
            name: "example-key".to_string(),
            secret: b"supersecret".to_vec(),
        };
        let message_prefix = b"pretend-dns-message-bytes";
        let algorithm_name = crate::name_as_bytes(b"hmac-sha256", None);
        let time_signed = [0, 0, 0, 0, 0, 1];
        let fudge = 300u16;
        let mac = sign(&key, message_prefix, "example-key", &algorithm_name, time_signed, fudge);
        let rdata = build_rdata(&algorithm_name, time_signed, fudge, &mac);

        let tsig = RawRecord {
            name: b"example-key".to_vec(),
            record_type: TSIG_RECORD_TYPE,
            class: 255,
            ttl: 0,
            rdata,
        };
        assert!(verify(&key, message_prefix, &tsig).is_ok());
    }

    #[test]
    fn rejects_a_bad_mac() {
        let key = TsigKey {
            name: "example-key".to_string(),
            secret: b"supersecret".to_vec(),
        };
        let algorithm_name = crate::name_as_bytes(b"hmac-sha256", None);
        let rdata = build_rdata(&algorithm_name, [0; 6], 300, b"not-a-real-mac-of-the-right-length!");
        let tsig = RawRecord {
            name: b"example-key".to_vec(),
            record_type: TSIG_RECORD_TYPE,
            class: 255,
            ttl: 0,
            rdata,
        };
        assert!(verify(&key, b"message", &tsig).is_err());
    }

    #[test]
    fn rejects_wrong_key_name() {
        let key = TsigKey {
            name: "example-key".to_string(),
            secret: b"supersecret".to_vec(),
        };
        let algorithm_name = crate::name_as_bytes(b"hmac-sha256", None);
        let rdata = build_rdata(&algorithm_name, [0; 6], 300, b"doesnt-matter");
        let tsig = RawRecord {
            name: b"someone-else".to_vec(),
            record_type: TSIG_RECORD_TYPE,
            class: 255,
            ttl: 0,
            rdata,
        };
        assert!(verify(&key, b"message", &tsig).is_err());
    }
}
