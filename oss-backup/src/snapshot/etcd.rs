//! etcd v3 snapshots through the JSON gRPC gateway.
//!
//! `/v3/maintenance/snapshot` answers with newline-delimited JSON messages,
//! each carrying a base64 `blob` of the database. The concatenated blobs form
//! a bbolt file followed by a SHA-256 of everything before it.

use super::{stream_error, ByteStream, Inspector, Snapshot, SnapshotMeta, SnapshotSource, SourceKind};
use crate::config::EtcdSettings;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures_util::{stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const ARTIFACT_TOKEN: &str = "etcd-snapshot.db";

const AUTH_HEADER: &str = "Authorization";

/// bbolt meta page magic, little-endian at offset 16 of page 0
const BOLT_MAGIC: u32 = 0xED0C_DAED;
const BOLT_META_FLAG: u16 = 0x04;
const BOLT_HEADER_LEN: usize = 32;

/// etcd appends a SHA-256 to snapshots it streams; the database itself is
/// always a multiple of 512 bytes.
const HASH_LEN: u64 = 32;
const HASH_ALIGN: u64 = 512;

pub struct EtcdSource {
    client: reqwest::Client,
    endpoints: Vec<String>,
    credentials: Option<(String, String)>,
    command_timeout: Option<Duration>,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(default)]
    version: String,
}

#[derive(Deserialize)]
struct Frame {
    result: Option<Chunk>,
    error: Option<GatewayError>,
}

#[derive(Deserialize)]
struct Chunk {
    #[serde(default)]
    blob: Option<String>,
}

#[derive(Deserialize)]
struct GatewayError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
}

impl EtcdSource {
    pub fn new(settings: &EtcdSettings) -> Result<Self> {
        if settings.endpoints.is_empty() {
            return Err(BackupError::Config("no etcd endpoints configured".to_string()));
        }

        let mut builder = reqwest::Client::builder().connect_timeout(settings.dial_timeout);

        if let Some(ca) = &settings.cacert {
            let pem = std::fs::read(ca).map_err(|e| {
                BackupError::Config(format!("cannot read CA certificate {}: {}", ca.display(), e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                BackupError::Config(format!("cannot parse CA certificate {}: {}", ca.display(), e))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        match (&settings.cert, &settings.key) {
            (Some(cert), Some(key)) => {
                let mut pem = std::fs::read(cert).map_err(|e| {
                    BackupError::Config(format!("cannot read client certificate {}: {}", cert.display(), e))
                })?;
                pem.push(b'\n');
                pem.extend(std::fs::read(key).map_err(|e| {
                    BackupError::Config(format!("cannot read client key {}: {}", key.display(), e))
                })?);
                let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                    BackupError::Config(format!("cannot load client certificate: {}", e))
                })?;
                builder = builder.identity(identity);
            }
            (Some(_), None) | (None, Some(_)) => {
                warn!("Both a client certificate and key are needed; ignoring the one given");
            }
            (None, None) => {}
        }

        let client = builder
            .build()
            .map_err(|e| BackupError::Config(format!("cannot build etcd client: {}", e)))?;

        let tls = settings.cacert.is_some() || settings.cert.is_some();
        let credentials = match (&settings.user, &settings.password) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some((user.clone(), password.clone()))
            }
            _ => None,
        };

        Ok(Self {
            client,
            endpoints: settings
                .endpoints
                .iter()
                .map(|e| normalize_endpoint(e, tls))
                .collect(),
            credentials,
            command_timeout: settings.command_timeout,
        })
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> Result<T> {
        let resp = self.request(url, token, body).await?;
        resp.json::<T>()
            .await
            .map_err(|e| BackupError::acquisition(format!("decoding response from {}", url), e))
    }

    async fn request(
        &self,
        url: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> Result<reqwest::Response> {
        let mut request = self.client.post(url).json(&body);
        if let Some(token) = token {
            request = request.header(AUTH_HEADER, token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| BackupError::acquisition(format!("requesting {}", url), e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackupError::acquisition(
                format!("requesting {}", url),
                format!("HTTP {}: {}", status, text.trim()),
            ));
        }
        Ok(resp)
    }

    async fn snapshot_from(&self, endpoint: &str) -> Result<Snapshot> {
        let token = match &self.credentials {
            Some((name, password)) => {
                let auth: AuthResponse = self
                    .post(
                        &format!("{}/v3/auth/authenticate", endpoint),
                        None,
                        serde_json::json!({ "name": name, "password": password }),
                    )
                    .await?;
                Some(auth.token)
            }
            None => None,
        };

        let status: StatusResponse = self
            .post(
                &format!("{}/v3/maintenance/status", endpoint),
                token.as_deref(),
                serde_json::json!({}),
            )
            .await?;

        let resp = self
            .request(
                &format!("{}/v3/maintenance/snapshot", endpoint),
                token.as_deref(),
                serde_json::json!({}),
            )
            .await?;

        let position = Some(status.version).filter(|v| !v.is_empty());
        info!(endpoint = %endpoint, version = ?position, "etcd snapshot stream opened");

        Ok(Snapshot {
            stream: decode_frames(resp.bytes_stream().map_err(stream_error).boxed()),
            meta: SnapshotMeta { position },
        })
    }
}

#[async_trait]
impl SnapshotSource for EtcdSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Etcd
    }

    fn artifact_token(&self) -> &'static str {
        ARTIFACT_TOKEN
    }

    /// Endpoints are tried in order; the last failure is reported.
    async fn acquire(&self) -> Result<Snapshot> {
        let mut last_error = None;

        for endpoint in &self.endpoints {
            info!(endpoint = %endpoint, "Connecting to etcd");
            match self.snapshot_from(endpoint).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "etcd endpoint failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BackupError::Config("no etcd endpoints configured".to_string())))
    }

    fn inspector(&self) -> Option<Inspector> {
        Some(inspect)
    }

    fn deadline(&self) -> Option<Duration> {
        self.command_timeout
    }
}

/// Splits the gateway body into JSON lines and yields decoded blobs.
#[derive(Default)]
struct FrameDecoder {
    pending: Vec<u8>,
    /// Bytes of `pending` already known to hold no newline
    scanned: usize,
}

impl FrameDecoder {
    fn push(&mut self, data: &[u8]) -> io::Result<Vec<Bytes>> {
        self.pending.extend_from_slice(data);
        let mut blobs = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.pending[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset + 1;
            if let Some(blob) = decode_frame(&self.pending[start..end])? {
                blobs.push(blob);
            }
            start = end;
            self.scanned = end;
        }

        self.pending.drain(..start);
        self.scanned = self.pending.len();
        Ok(blobs)
    }

    fn finish(&mut self) -> io::Result<Vec<Bytes>> {
        self.scanned = 0;
        let line = std::mem::take(&mut self.pending);
        Ok(decode_frame(&line)?.into_iter().collect())
    }
}

fn decode_frame(line: &[u8]) -> io::Result<Option<Bytes>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let frame: Frame = serde_json::from_slice(line)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad snapshot frame: {}", e)))?;

    if let Some(err) = frame.error {
        return Err(io::Error::other(format!(
            "etcd snapshot error (code {}): {}",
            err.code, err.message
        )));
    }

    match frame.result.and_then(|c| c.blob) {
        Some(blob) if !blob.is_empty() => BASE64
            .decode(blob.as_bytes())
            .map(|b| Some(Bytes::from(b)))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad blob encoding: {}", e))),
        _ => Ok(None),
    }
}

fn decode_frames(body: ByteStream) -> ByteStream {
    stream::unfold(
        (body, FrameDecoder::default(), false),
        |(mut body, mut decoder, done)| async move {
            if done {
                return None;
            }
            match body.next().await {
                Some(Ok(chunk)) => {
                    let out = decoder.push(&chunk);
                    let failed = out.is_err();
                    Some((out, (body, decoder, failed)))
                }
                Some(Err(e)) => Some((Err(e), (body, decoder, true))),
                None => {
                    let out = decoder.finish();
                    Some((out, (body, decoder, true)))
                }
            }
        },
    )
    .map_ok(|blobs| stream::iter(blobs.into_iter().map(Ok::<Bytes, io::Error>)))
    .try_flatten()
    .boxed()
}

/// Check the bbolt header and, when present, the trailing integrity hash.
pub fn inspect(path: &Path) -> Result<String> {
    let summary = check_file(path)
        .map_err(|e| BackupError::Verification(format!("etcd snapshot likely corrupt: {}", e)))?;
    debug!(path = %path.display(), summary = %summary, "etcd snapshot inspected");
    Ok(summary)
}

fn check_file(path: &Path) -> std::result::Result<String, String> {
    let mut file = File::open(path).map_err(|e| e.to_string())?;
    let size = file.metadata().map_err(|e| e.to_string())?.len();

    let mut header = [0u8; BOLT_HEADER_LEN];
    file.read_exact(&mut header)
        .map_err(|_| format!("file too short for a bbolt database ({} bytes)", size))?;

    let flags = u16::from_le_bytes([header[8], header[9]]);
    let magic = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
    let version = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);
    let page_size = u32::from_le_bytes([header[24], header[25], header[26], header[27]]);

    if magic != BOLT_MAGIC {
        return Err(format!("bad bbolt magic {:#010x}", magic));
    }
    if flags & BOLT_META_FLAG == 0 {
        return Err(format!("first page is not a meta page (flags {:#06x})", flags));
    }

    let hashed = size % HASH_ALIGN == HASH_LEN;
    if hashed {
        let file = File::open(path).map_err(|e| e.to_string())?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();
        io::copy(&mut (&mut reader).take(size - HASH_LEN), &mut hasher).map_err(|e| e.to_string())?;

        let mut expected = [0u8; HASH_LEN as usize];
        reader.read_exact(&mut expected).map_err(|e| e.to_string())?;
        if hasher.finalize().as_slice() != expected {
            return Err("integrity hash mismatch".to_string());
        }
    }

    Ok(format!(
        "bbolt v{} page_size={} size={} integrity_hash={}",
        version,
        page_size,
        size,
        if hashed { "verified" } else { "absent" }
    ))
}

fn normalize_endpoint(endpoint: &str, tls: bool) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if tls {
        format!("https://{}", endpoint)
    } else {
        format!("http://{}", endpoint)
    }
}
