//! Consul snapshots via the HTTP API (`GET /v1/snapshot`).
//!
//! A Consul snapshot is a gzip-compressed tar holding `meta.json`,
//! `state.bin` and a `SHA256SUMS` manifest covering both.
//!
//! `state.bin` is a msgpack header followed by records, each one type byte
//! and one msgpack value. Inspection tallies records per type while hashing;
//! the per-type sizes are approximate (the first record also carries the
//! header bytes) and only reported, never checked.

use super::{stream_error, Inspector, Snapshot, SnapshotMeta, SnapshotSource, SourceKind};
use crate::config::ConsulSettings;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use futures_util::{StreamExt, TryStreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const ARTIFACT_TOKEN: &str = "consul-snapshot.snap";

const TOKEN_HEADER: &str = "X-Consul-Token";
const INDEX_HEADER: &str = "X-Consul-Index";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const SUMS_FILE: &str = "SHA256SUMS";

/// Raft log message types, indexed by their type byte.
const MESSAGE_TYPES: [&str; 32] = [
    "Register",
    "Deregister",
    "KVS",
    "Session",
    "ACL",
    "TombstoneRequest",
    "CoordinateBatchUpdate",
    "PreparedQuery",
    "Txn",
    "Autopilot",
    "Area",
    "ACLBootstrap",
    "Intention",
    "ConnectCA",
    "ConnectCAProviderState",
    "ConnectCAConfig",
    "Index",
    "ACLTokenSet",
    "ACLTokenDelete",
    "ACLPolicySet",
    "ACLPolicyDelete",
    "ConnectCALeaf",
    "ACLBindingRuleSet",
    "ACLBindingRuleDelete",
    "ACLAuthMethodSet",
    "ACLAuthMethodDelete",
    "ChunkingState",
    "FederationState",
    "SystemMetadata",
    "ServiceVirtualIP",
    "FreeVirtualIP",
    "KindServiceNames",
];

pub struct ConsulSource {
    client: reqwest::Client,
    address: String,
    token: Option<String>,
    stale: bool,
}

impl ConsulSource {
    pub fn new(settings: &ConsulSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BackupError::Config(format!("cannot build consul client: {}", e)))?;

        Ok(Self {
            client,
            address: normalize_address(&settings.address),
            token: settings.token.clone().filter(|t| !t.is_empty()),
            stale: settings.stale,
        })
    }

    fn snapshot_url(&self) -> String {
        let mut url = format!("{}/v1/snapshot", self.address);
        if self.stale {
            url.push_str("?stale");
        }
        url
    }
}

#[async_trait]
impl SnapshotSource for ConsulSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Consul
    }

    fn artifact_token(&self) -> &'static str {
        ARTIFACT_TOKEN
    }

    async fn acquire(&self) -> Result<Snapshot> {
        let url = self.snapshot_url();
        info!(address = %self.address, stale = self.stale, "Requesting consul snapshot");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| BackupError::acquisition(format!("requesting {}", url), e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackupError::acquisition(
                format!("requesting {}", url),
                format!("HTTP {}: {}", status, body.trim()),
            ));
        }

        let position = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(index = ?position, "Consul snapshot stream opened");

        Ok(Snapshot {
            stream: resp.bytes_stream().map_err(stream_error).boxed(),
            meta: SnapshotMeta { position },
        })
    }

    fn inspector(&self) -> Option<Inspector> {
        Some(inspect)
    }
}

/// Raft metadata stored in `meta.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SnapshotInfo {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub size: u64,
    pub index: u64,
    pub term: u64,
    #[serde(default)]
    pub version: u64,
}

/// Record count and approximate encoded size for one message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeStats {
    pub name: String,
    pub count: u64,
    pub size: u64,
}

/// Per-type breakdown of `state.bin`, largest type first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateStats {
    pub types: Vec<TypeStats>,
    pub total_size: u64,
}

/// Decode the archive and check every member listed in `SHA256SUMS`.
pub fn inspect(path: &Path) -> Result<String> {
    let (info, state) = read_and_verify(path)
        .map_err(|e| BackupError::Verification(format!("consul snapshot likely corrupt: {}", e)))?;

    info!(
        id = %info.id,
        index = info.index,
        term = info.term,
        version = info.version,
        "Consul snapshot inspected"
    );

    let mut summary = format!(
        "id={} index={} term={} version={}",
        info.id, info.index, info.term, info.version
    );
    if let Some(state) = state {
        for t in &state.types {
            info!(kind = %t.name, count = t.count, approx_bytes = t.size, "Consul state records");
        }
        summary.push_str(&format!(
            " types={} approx_state_bytes={}",
            state.types.len(),
            state.total_size
        ));
    }
    Ok(summary)
}

fn read_and_verify(path: &Path) -> std::result::Result<(SnapshotInfo, Option<StateStats>), String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let mut digests: HashMap<String, String> = HashMap::new();
    let mut meta_raw = Vec::new();
    let mut sums_raw = String::new();
    let mut state = None;

    let entries = archive.entries().map_err(|e| format!("not a gzip tar archive: {}", e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| format!("reading archive entry: {}", e))?;
        let name = entry
            .path()
            .map_err(|e| e.to_string())?
            .to_string_lossy()
            .to_string();

        match name.as_str() {
            META_FILE => {
                entry.read_to_end(&mut meta_raw).map_err(|e| e.to_string())?;
                digests.insert(name.clone(), format!("{:x}", Sha256::digest(&meta_raw)));
            }
            SUMS_FILE => {
                entry.read_to_string(&mut sums_raw).map_err(|e| e.to_string())?;
            }
            STATE_FILE => {
                let mut reader = HashingReader::new(BufReader::new(&mut entry));
                match decode_state(&mut reader) {
                    Ok(stats) => state = Some(stats),
                    Err(e) => warn!(error = %e, "Consul state records not decodable, skipping statistics"),
                }
                io::copy(&mut reader, &mut io::sink()).map_err(|e| format!("reading {}: {}", name, e))?;
                digests.insert(name.clone(), reader.digest());
            }
            _ => {
                let mut hasher = Sha256::new();
                io::copy(&mut entry, &mut hasher).map_err(|e| format!("reading {}: {}", name, e))?;
                digests.insert(name.clone(), format!("{:x}", hasher.finalize()));
            }
        }
    }

    for required in [META_FILE, STATE_FILE] {
        if !digests.contains_key(required) {
            return Err(format!("missing {}", required));
        }
    }
    if sums_raw.is_empty() {
        return Err(format!("missing {}", SUMS_FILE));
    }

    let mut listed = 0;
    for line in sums_raw.lines().filter(|l| !l.trim().is_empty()) {
        let (expected, name) = line
            .split_once(char::is_whitespace)
            .map(|(sum, name)| (sum.trim(), name.trim().trim_start_matches('*')))
            .ok_or_else(|| format!("malformed {} line: {}", SUMS_FILE, line))?;
        let actual = digests
            .get(name)
            .ok_or_else(|| format!("{} lists {} which is not in the archive", SUMS_FILE, name))?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(format!("checksum mismatch for {}", name));
        }
        listed += 1;
    }
    if listed == 0 {
        return Err(format!("{} is empty", SUMS_FILE));
    }

    let info = serde_json::from_slice(&meta_raw).map_err(|e| format!("invalid {}: {}", META_FILE, e))?;
    Ok((info, state))
}

/// Walk the records of `state.bin`, leaving the reader wherever decoding stopped.
fn decode_state<R: Read>(reader: R) -> io::Result<StateStats> {
    let mut reader = CountingReader { inner: reader, consumed: 0 };

    let header = rmpv::decode::read_value(&mut reader).map_err(io::Error::other)?;
    if !header.is_map() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "state header is not a map"));
    }

    let mut by_type: BTreeMap<u8, (u64, u64)> = BTreeMap::new();
    let mut total = 0;
    loop {
        let mut kind = [0u8; 1];
        if reader.read(&mut kind)? == 0 {
            break;
        }
        rmpv::decode::read_value(&mut reader).map_err(|e| {
            io::Error::other(format!("record of type {}: {}", message_type_name(kind[0]), e))
        })?;

        let entry = by_type.entry(kind[0]).or_default();
        entry.0 += 1;
        entry.1 += reader.consumed - total;
        total = reader.consumed;
    }

    let mut types: Vec<TypeStats> = by_type
        .into_iter()
        .map(|(kind, (count, size))| TypeStats { name: message_type_name(kind), count, size })
        .collect();
    types.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.name.cmp(&b.name)));

    Ok(StateStats { types, total_size: total })
}

fn message_type_name(kind: u8) -> String {
    MESSAGE_TYPES
        .get(kind as usize)
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("Unknown({})", kind))
}

struct CountingReader<R> {
    inner: R,
    consumed: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        Ok(n)
    }
}

/// Hashes every byte handed to the caller.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, hasher: Sha256::new() }
    }

    fn digest(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn normalize_address(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use rmpv::Value;
    use tempfile::TempDir;

    const META: &[u8] = br#"{"Version":1,"ID":"2-1234-1700000000000","Index":1234,"Term":2,"Peers":null,"Configuration":{},"ConfigurationIndex":1,"Size":11}"#;
    const STATE: &[u8] = b"raft-state!";

    fn append(builder: &mut tar::Builder<GzEncoder<Vec<u8>>>, name: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }

    fn snapshot_bytes(state_in_archive: &[u8], with_sums: bool) -> Vec<u8> {
        snapshot_with(state_in_archive, STATE, with_sums)
    }

    fn snapshot_with(state_in_archive: &[u8], state_listed: &[u8], with_sums: bool) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        append(&mut builder, META_FILE, META);
        append(&mut builder, STATE_FILE, state_in_archive);
        if with_sums {
            let sums = format!(
                "{:x}  {}\n{:x}  {}\n",
                Sha256::digest(META),
                META_FILE,
                Sha256::digest(state_listed),
                STATE_FILE
            );
            append(&mut builder, SUMS_FILE, sums.as_bytes());
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn state_bin() -> Vec<u8> {
        let mut buf = Vec::new();
        let header = Value::Map(vec![(Value::from("LastIndex"), Value::from(1234u64))]);
        rmpv::encode::write_value(&mut buf, &header).unwrap();

        let records = [
            (0u8, Value::Map(vec![(Value::from("Node"), Value::from("node-1"))])),
            (
                2,
                Value::Map(vec![
                    (Value::from("Key"), Value::from("app/config")),
                    (Value::from("Value"), Value::Binary(vec![7; 64])),
                ]),
            ),
            (2, Value::Map(vec![(Value::from("Key"), Value::from("app/flag"))])),
        ];
        for (kind, value) in &records {
            buf.push(*kind);
            rmpv::encode::write_value(&mut buf, value).unwrap();
        }
        buf
    }

    fn write_snapshot(dir: &TempDir, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("consul-snapshot.snap");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_valid_snapshot_passes() {
        let dir = TempDir::new().unwrap();
        let path = write_snapshot(&dir, &snapshot_bytes(STATE, true));
        let summary = inspect(&path).unwrap();
        assert!(summary.contains("index=1234"));
        assert!(summary.contains("term=2"));
    }

    #[test]
    fn test_tampered_state_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = write_snapshot(&dir, &snapshot_bytes(b"raft-state?", true));
        let err = inspect(&path).unwrap_err();
        assert!(matches!(err, BackupError::Verification(_)));
        assert!(err.to_string().contains("likely corrupt"));
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_missing_manifest_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = write_snapshot(&dir, &snapshot_bytes(STATE, false));
        assert!(inspect(&path).unwrap_err().to_string().contains(SUMS_FILE));
    }

    #[test]
    fn test_non_archive_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = write_snapshot(&dir, b"definitely not gzip");
        assert!(matches!(inspect(&path), Err(BackupError::Verification(_))));
    }

    #[test]
    fn test_state_records_tallied_per_type() {
        let state = state_bin();
        let stats = decode_state(state.as_slice()).unwrap();

        let names: Vec<&str> = stats.types.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["KVS", "Register"]);
        assert_eq!(stats.types[0].count, 2);
        assert_eq!(stats.types[1].count, 1);
        assert_eq!(stats.total_size, state.len() as u64);
        assert_eq!(stats.types.iter().map(|t| t.size).sum::<u64>(), stats.total_size);
    }

    #[test]
    fn test_state_statistics_in_summary() {
        let dir = TempDir::new().unwrap();
        let state = state_bin();
        let path = write_snapshot(&dir, &snapshot_with(&state, &state, true));

        let summary = inspect(&path).unwrap();
        assert!(summary.contains("index=1234"));
        assert!(summary.contains("types=2"));
        assert!(summary.contains(&format!("approx_state_bytes={}", state.len())));
    }

    #[test]
    fn test_undecodable_state_still_verifies() {
        let dir = TempDir::new().unwrap();
        let full = state_bin();
        let state = &full[..full.len() - 5];
        let path = write_snapshot(&dir, &snapshot_with(state, state, true));

        let summary = inspect(&path).unwrap();
        assert!(summary.contains("term=2"));
        assert!(!summary.contains("types="));

        let tampered = write_snapshot(&dir, &snapshot_with(state, &full, true));
        assert!(inspect(&tampered).unwrap_err().to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(message_type_name(0), "Register");
        assert_eq!(message_type_name(2), "KVS");
        assert_eq!(message_type_name(31), "KindServiceNames");
        assert_eq!(message_type_name(200), "Unknown(200)");
    }

    #[test]
    fn test_snapshot_url() {
        let settings = ConsulSettings {
            address: "127.0.0.1:8500/".to_string(),
            token: Some(String::new()),
            stale: true,
        };
        let source = ConsulSource::new(&settings).unwrap();
        assert_eq!(source.snapshot_url(), "http://127.0.0.1:8500/v1/snapshot?stale");
        assert!(source.token.is_none());
        assert_eq!(source.artifact_token(), ARTIFACT_TOKEN);
    }
}
