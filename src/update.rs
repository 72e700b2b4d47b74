//! TSIG-privileged dynamic update: in-memory TXT overwrites against the live
//! zone index, applied from a request's authority section.

use crate::enums::RecordType;
use crate::error::HerdNsError;
use crate::zones::ZoneIndex;
use crate::RawRecord;
use concread::cowcell::asynch::CowCell;
use std::str::from_utf8;
use tracing::{debug, warn};

/// Applies every TXT record in `authority_rrs` to `zones`, if `privileged`.
/// Non-TXT records in the authority section are ignored (§4.9 scopes this
/// handler to TXT only). An unprivileged request is logged and otherwise a
/// no-op, matching the "ignored, not an error" contract of an unauthenticated
/// UPDATE.
pub async fn apply_updates(zones: &CowCell<ZoneIndex>, privileged: bool, authority_rrs: &[RawRecord]) {
    if !privileged {
        if !authority_rrs.is_empty() {
            warn!("ignoring UPDATE authority records on an unprivileged request");
        }
        return;
    }

    for rr in authority_rrs {
        if rr.record_type != RecordType::TXT as u16 {
            continue;
        }
        let owner = match from_utf8(&rr.name) {
            Ok(value) => value.to_string(),
            Err(_) => {
                warn!("UPDATE TXT record has a non-utf8 owner name, skipping");
                continue;
            }
        };
        let text = match parse_single_text(&rr.rdata) {
            Ok(text) => text,
            Err(err) => {
                warn!(owner = %owner, %err, "rejecting UPDATE TXT record");
                continue;
            }
        };

        let mut write_txn = zones.write().await;
        write_txn.set_txt(&owner, text, rr.ttl);
        write_txn.commit().await;
        debug!(owner = %owner, "applied privileged TXT update");
    }
}

/// Parses a TXT RDATA payload that must contain exactly one
/// `<character-string>`. A second string appended after the first (or any
/// other length mismatch) is rejected rather than silently truncated.
pub fn parse_single_text(rdata: &[u8]) -> Result<String, HerdNsError> {
    if rdata.is_empty() {
        return Err(HerdNsError::InvalidValue("empty TXT rdata in UPDATE".to_string()));
    }
    let len = rdata[0] as usize;
    if rdata.len() != 1 + len {
        return Err(HerdNsError::InvalidValue(
            "UPDATE TXT rdata must contain exactly one character-string".to_string(),
        ));
    }
    from_utf8(&rdata[1..])
        .map(|s| s.to_string())
        .map_err(|_| HerdNsError::InvalidValue("UPDATE TXT rdata is not valid utf8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::{FileZone, SoaConfig};

    fn empty_index() -> CowCell<ZoneIndex> {
        let zone = FileZone {
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
            records: vec![],
            mailers: vec![],
        };
        CowCell::new(ZoneIndex::build(&[zone]))
    }

    fn single_string_rdata(text: &str) -> Vec<u8> {
        let mut rdata = vec![text.len() as u8];
        rdata.extend(text.as_bytes());
        rdata
    }

    #[test]
    fn parses_a_single_character_string() {
        let rdata = single_string_rdata("hello");
        assert_eq!(parse_single_text(&rdata).unwrap(), "hello");
    }

    #[test]
    fn rejects_trailing_bytes_after_the_first_string() {
        let mut rdata = single_string_rdata("hello");
        rdata.extend(single_string_rdata("world"));
        assert!(parse_single_text(&rdata).is_err());
    }

    #[tokio::test]
    async fn unprivileged_requests_are_ignored() {
        let zones = empty_index();
        let rr = RawRecord {
            name: b"note.example.com".to_vec(),
            record_type: RecordType::TXT as u16,
            class: 1,
            ttl: 60,
            rdata: single_string_rdata("hi"),
        };
        apply_updates(&zones, false, &[rr]).await;
        let read_txn = zones.read().await;
        assert!(read_txn.lookup("note.example.com", RecordType::TXT).is_none());
    }

    #[tokio::test]
    async fn privileged_txt_update_is_applied() {
        let zones = empty_index();
        let rr = RawRecord {
            name: b"note.example.com".to_vec(),
            record_type: RecordType::TXT as u16,
            class: 1,
            ttl: 60,
            rdata: single_string_rdata("hi"),
        };
        apply_updates(&zones, true, &[rr]).await;
        let read_txn = zones.read().await;
        let records = read_txn.lookup("note.example.com", RecordType::TXT).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn multi_string_update_is_rejected() {
        let zones = empty_index();
        let mut rdata = single_string_rdata("hi");
        rdata.extend(single_string_rdata("there"));
        let rr = RawRecord {
            name: b"note.example.com".to_vec(),
            record_type: RecordType::TXT as u16,
            class: 1,
            ttl: 60,
            rdata,
        };
        apply_updates(&zones, true, &[rr]).await;
        let read_txn = zones.read().await;
        assert!(read_txn.lookup("note.example.com", RecordType::TXT).is_none());
    }
}
