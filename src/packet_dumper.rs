use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub enum DumpType {
    ClientRequest,
}

impl core::fmt::Display for DumpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            DumpType::ClientRequest => f.write_str("client_request"),
        }
    }
}

/// Dumps the bytes of a packet to `./captures/` for offline inspection. Best
/// effort: a failure to write is logged, never panics the caller.
pub async fn dump_bytes(bytes: &[u8], dump_type: DumpType) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let filename = format!("./captures/{}-{}.cap", dump_type, now);
    let mut fh = match File::create(&filename).await {
        Ok(value) => value,
        Err(error) => {
            debug!("couldn't open {} for writing: {:?}", filename, error);
            return;
        }
    };

    match fh.write_all(bytes).await {
        Ok(_) => debug!("Successfully wrote packet to {}", &filename),
        Err(error) => debug!("Failed to write to {}: {:?}", filename, error),
    };
}
