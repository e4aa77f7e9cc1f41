use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write as _,
    path::PathBuf,
};

use anyhow::Context as _;
use hyper::http::request::Parts;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt as _;

use crate::{config::EndpointConfig, redact::Redactor};

/// Sentinel `previous_request` value marking the start of a chain.
pub const HEAD_SHA: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Hard separator between the chain preamble and the request section of
/// the canonical form. Exactly 80 asterisks.
pub const SEPARATOR: &str =
    "********************************************************************************";

const SERVER_ADDRESS_PREFIX: &str = "Server Address: ";
const PORT_PREFIX: &str = "Port: ";
const PROTOCOL_PREFIX: &str = "Protocol: ";

/// Canonical representation of one proxied request.
///
/// The JSON artifact carries the decoded `body_segments`; the raw body
/// bytes only feed the canonical form and its fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedRequest {
    pub request_line: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body_segments: Vec<serde_json::Map<String, Value>>,
    pub previous_request: String,
    pub server_address: String,
    pub port: u16,
    pub protocol: String,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Builds the canonical request from a received request head and its
    /// fully buffered body, linked to `previous_request`.
    pub fn from_parts(
        parts: &Parts,
        body: &[u8],
        previous_request: &str,
        endpoint: &EndpointConfig,
    ) -> Self {
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in parts.headers.iter() {
            headers
                .entry(canonical_header_name(name.as_str()))
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        Self {
            request_line: format!("{} {} HTTP/1.1", parts.method, parts.uri),
            headers,
            body_segments: body_segments(body),
            previous_request: previous_request.to_owned(),
            server_address: endpoint.target_host.clone(),
            port: endpoint.target_port,
            protocol: endpoint.target_type.scheme().to_owned(),
            body: body.to_vec(),
        }
    }

    /// Removes the named headers entirely (case-insensitive name match).
    pub fn drop_headers(&mut self, names: &[String]) {
        self.headers
            .retain(|name, _| !names.iter().any(|dropped| dropped.eq_ignore_ascii_case(name)));
    }

    /// Scrubs secrets from every recorded surface of the request: header
    /// values, the request line, and each decoded body segment. The raw
    /// body bytes stay as received; they never reach an artifact.
    pub fn redact(&mut self, redactor: &Redactor) {
        redactor.redact_header_values(&mut self.headers);
        self.request_line = redactor.redact_str(&self.request_line);
        for segment in &mut self.body_segments {
            redactor.redact_map(segment);
        }
    }

    /// Canonical byte form, the SHA-256 preimage of [`compute_sum`].
    ///
    /// Header lines are ordered lexicographically by canonical name, one
    /// line per value with value order preserved. Exactly two newlines
    /// separate the header section from the raw body bytes.
    ///
    /// [`compute_sum`]: Self::compute_sum
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&self.previous_request);
        out.push('\n');
        out.push_str(SERVER_ADDRESS_PREFIX);
        out.push_str(&self.server_address);
        out.push('\n');
        out.push_str(PORT_PREFIX);
        out.push_str(&self.port.to_string());
        out.push('\n');
        out.push_str(PROTOCOL_PREFIX);
        out.push_str(&self.protocol);
        out.push('\n');
        out.push_str(SEPARATOR);
        out.push('\n');
        out.push_str(&self.request_line);
        out.push('\n');
        for (name, values) in &self.headers {
            for value in values {
                out.push_str(name);
                out.push_str(": ");
                out.push_str(value);
                out.push('\n');
            }
        }
        out.push_str("\n\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Inverse of [`serialize`](Self::serialize).
    pub fn deserialize(input: &[u8]) -> Result<Self, DeserializeError> {
        let marker = format!("\n{SEPARATOR}\n");
        let marker_at = find(input, marker.as_bytes()).ok_or(
            DeserializeError::InvalidSerializedForm("missing separator line"),
        )?;

        let preamble = std::str::from_utf8(&input[..marker_at])
            .map_err(|_| DeserializeError::InvalidSerializedForm("preamble is not UTF-8"))?;
        let mut lines = preamble.split('\n');
        let previous_request = lines
            .next()
            .ok_or(DeserializeError::InvalidSerializedForm("missing previous request line"))?;
        let server_address = preamble_field(lines.next(), SERVER_ADDRESS_PREFIX)?;
        let port_text = preamble_field(lines.next(), PORT_PREFIX)?;
        let protocol = preamble_field(lines.next(), PROTOCOL_PREFIX)?;
        if lines.next().is_some() {
            return Err(DeserializeError::InvalidSerializedForm(
                "unexpected extra preamble line",
            ));
        }
        let port = port_text.parse().map_err(|source| DeserializeError::InvalidPort {
            value: port_text.to_owned(),
            source,
        })?;

        let rest = &input[marker_at + marker.len()..];
        let (request_line, mut rest) = split_line(rest)?;
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        loop {
            let (line, remaining) = split_line(rest)?;
            rest = remaining;
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(": ").ok_or(
                DeserializeError::InvalidSerializedForm("malformed header line"),
            )?;
            headers.entry(name.to_owned()).or_default().push(value.to_owned());
        }
        let body = rest.strip_prefix(b"\n" as &[u8]).ok_or(
            DeserializeError::InvalidSerializedForm("missing blank line before body"),
        )?;

        Ok(Self {
            request_line: request_line.to_owned(),
            headers,
            body_segments: body_segments(body),
            previous_request: previous_request.to_owned(),
            server_address: server_address.to_owned(),
            port,
            protocol: protocol.to_owned(),
            body: body.to_vec(),
        })
    }

    /// Hex SHA-256 fingerprint over the canonical form.
    pub fn compute_sum(&self) -> String {
        let digest = Sha256::digest(self.serialize());
        let mut sum = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(sum, "{byte:02x}");
        }
        sum
    }

    /// Stable file identity for the recording this request belongs to:
    /// the fingerprint the request would have as the root of a fresh
    /// chain, i.e. with `previous_request` forced to [`HEAD_SHA`].
    pub fn recording_file_name(&self) -> String {
        if self.previous_request == HEAD_SHA {
            return self.compute_sum();
        }
        let mut root = self.clone();
        root.previous_request = HEAD_SHA.to_owned();
        root.compute_sum()
    }
}

/// Decodes a request body into structured segments, one per
/// newline-separated chunk. Each non-empty chunk becomes a JSON object,
/// a JSON array lifted under `_array`, or a `_text` record. Splitting on
/// bare `\n` is what newline-delimited JSON streams need; bodies with
/// newlines embedded in JSON strings fragment, and recorded artifacts
/// depend on that exact segmentation.
fn body_segments(body: &[u8]) -> Vec<serde_json::Map<String, Value>> {
    body.split(|byte| *byte == b'\n')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match serde_json::from_slice::<Value>(segment) {
            Ok(Value::Object(map)) => map,
            Ok(array @ Value::Array(_)) => {
                serde_json::Map::from_iter([("_array".to_owned(), array)])
            }
            _ => serde_json::Map::from_iter([(
                "_text".to_owned(),
                Value::String(String::from_utf8_lossy(segment).into_owned()),
            )]),
        })
        .collect()
}

fn preamble_field<'a>(
    line: Option<&'a str>,
    prefix: &'static str,
) -> Result<&'a str, DeserializeError> {
    line.and_then(|line| line.strip_prefix(prefix))
        .ok_or(DeserializeError::InvalidSerializedForm("malformed preamble field"))
}

fn split_line(input: &[u8]) -> Result<(&str, &[u8]), DeserializeError> {
    let end = input
        .iter()
        .position(|byte| *byte == b'\n')
        .ok_or(DeserializeError::InvalidSerializedForm("truncated request section"))?;
    let line = std::str::from_utf8(&input[..end])
        .map_err(|_| DeserializeError::InvalidSerializedForm("request section is not UTF-8"))?;
    Ok((line, &input[end + 1..]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Debug)]
pub enum DeserializeError {
    InvalidSerializedForm(&'static str),
    InvalidPort {
        value: String,
        source: std::num::ParseIntError,
    },
}

impl std::fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSerializedForm(reason) => {
                write!(f, "invalid serialized request: {reason}")
            }
            Self::InvalidPort { value, .. } => write!(f, "invalid port `{value}`"),
        }
    }
}

impl std::error::Error for DeserializeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidSerializedForm(_) => None,
            Self::InvalidPort { source, .. } => Some(source),
        }
    }
}

/// Upstream response as recorded: post-rewrite headers and the raw body
/// bytes exactly as the upstream produced them (compression preserved,
/// so secrets visible only after decompression stay in the artifact).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl RecordedResponse {
    pub fn new(status_code: u16, headers: &hyper::HeaderMap, body: Vec<u8>) -> Self {
        let mut recorded: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers.iter() {
            recorded
                .entry(canonical_header_name(name.as_str()))
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        Self {
            status_code,
            headers: recorded,
            body,
        }
    }

    pub fn redact(&mut self, redactor: &Redactor) {
        redactor.redact_header_values(&mut self.headers);
        self.body = redactor.redact_bytes(&self.body);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordInteraction {
    pub request: RecordedRequest,
    pub sha_sum: String,
    pub response: RecordedResponse,
}

/// One on-disk recording artifact. `record_id` doubles as the file stem
/// and equals the fingerprint of the chain root interaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordFile {
    pub record_id: String,
    pub interactions: Vec<RecordInteraction>,
}

/// In-memory images of every recording touched this run, rewritten to
/// disk in full on each append so a partial write can never surface as a
/// torn artifact. The first append of a run truncates whatever a prior
/// run left under the same name.
#[derive(Debug)]
pub struct RecordStore {
    recording_dir: PathBuf,
    files: HashMap<String, RecordFile>,
}

impl RecordStore {
    pub fn new(recording_dir: impl Into<PathBuf>) -> Self {
        Self {
            recording_dir: recording_dir.into(),
            files: HashMap::new(),
        }
    }

    /// Whether a recording root with this name was already seen this run.
    pub fn contains(&self, file_name: &str) -> bool {
        self.files.contains_key(file_name)
    }

    pub fn recording_path(&self, file_name: &str) -> PathBuf {
        self.recording_dir.join(format!("{file_name}.json"))
    }

    pub fn websocket_log_path(&self, file_name: &str) -> PathBuf {
        self.recording_dir.join(format!("{file_name}.websocket.log"))
    }

    /// Appends an interaction and rewrites the artifact as one contiguous
    /// payload. A failed rewrite leaves the previous durable state; the
    /// next successful append catches the artifact up.
    pub async fn append(
        &mut self,
        file_name: &str,
        interaction: RecordInteraction,
    ) -> anyhow::Result<()> {
        let file = self
            .files
            .entry(file_name.to_owned())
            .or_insert_with(|| RecordFile {
                record_id: file_name.to_owned(),
                interactions: Vec::new(),
            });
        file.interactions.push(interaction);

        let encoded = serde_json::to_string_pretty(file).context("encode record file")?;
        let path = self.recording_path(file_name);
        let mut artifact = artifact_open_options()
            .open(&path)
            .await
            .with_context(|| format!("open recording {}", path.display()))?;
        artifact
            .write_all(encoded.as_bytes())
            .await
            .with_context(|| format!("write recording {}", path.display()))?;
        artifact
            .flush()
            .await
            .with_context(|| format!("flush recording {}", path.display()))?;
        Ok(())
    }
}

/// Artifacts are world-readable test fixtures: create-or-truncate, 0644.
fn artifact_open_options() -> tokio::fs::OpenOptions {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o644);
    options
}

/// Canonical MIME header casing: first letter of each dash-separated
/// token uppercased, the rest lowercased. Keeps artifacts byte-stable no
/// matter how the client spelled the name.
pub(crate) fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;
    for ch in name.chars() {
        if ch == '-' {
            out.push('-');
            upper_next = true;
        } else if upper_next {
            out.push(ch.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(ch.to_ascii_lowercase());
        }
    }
    out
}


mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize as _, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(&encoded).map_err(de::Error::custom)
    }
}
