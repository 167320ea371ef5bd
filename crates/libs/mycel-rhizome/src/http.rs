//! The rhizome HTTP transport: a hand-rolled HTTP/1.0 server for bundle
//! import, sync enquiries, and manifest/payload fetches, plus the matching
//! client side used to drive reconciliation with a peer.
//!
//! POST bodies are RFC-2388 multipart forms, parsed by a line-oriented state
//! machine that streams part bodies straight to temporary files. The CRLF
//! preceding a boundary belongs to the boundary, so the two bytes most
//! recently written to a part file are pruned when its boundary arrives.
//! Boundaries straddling socket reads are handled naturally because lines
//! accumulate across reads.

use std::fs::File;
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use mycel_identity::RhizomeSecret;
use rand_core::{OsRng, RngCore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::bar::BAR_PREFIX_BYTES;
use crate::config::RhizomeConfig;
use crate::cursor::SyncCursor;
use crate::error::RhizomeError;
use crate::manifest::{Manifest, SERVICE_FILE};
use crate::store::{AddOutcome, RhizomeStore, PRIORITY_DEFAULT};
use crate::sync::{self, SyncAction, OP_PULL, OP_PUSH};

const HEADER_END: &[u8] = b"\r\n\r\n";
const MAX_HEAD_BYTES: usize = 8 * 1024;
const MAX_LINE_BYTES: usize = 1020;

/// A 1x1 32-bit icon, served for `GET /favicon.ico`.
const FAVICON: &[u8] = &[
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x20, 0x00, 0x30,
    0x00, 0x00, 0x00, 0x16, 0x00, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
    0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00,
];

fn lock_store(store: &Arc<Mutex<RhizomeStore>>) -> MutexGuard<'_, RhizomeStore> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Milliseconds since the epoch, for defaulted manifest fields.
fn wall_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

// request/response plumbing

pub fn find_header_end(request: &[u8]) -> Option<usize> {
    request.windows(HEADER_END.len()).position(|window| window == HEADER_END)
}

fn parse_request_line(head: &[u8]) -> Option<(String, String)> {
    let text = String::from_utf8_lossy(head);
    let line = text.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    Some((method, path))
}

fn header_value(head: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(head);
    let prefix = format!("{}:", name.to_ascii_lowercase());
    for line in text.lines() {
        let lower = line.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix(&prefix) {
            let start = line.len() - rest.len();
            return Some(line[start..].trim().to_string());
        }
    }
    None
}

fn parse_content_length(head: &[u8]) -> Option<usize> {
    header_value(head, "content-length")?.parse().ok()
}

fn parse_multipart_boundary(head: &[u8]) -> Option<String> {
    let content_type = header_value(head, "content-type")?;
    let rest = content_type.strip_prefix("multipart/form-data;")?.trim();
    let boundary = rest.strip_prefix("boundary=")?.trim();
    (boundary.len() >= 4 && boundary.len() <= 128).then(|| boundary.to_string())
}

fn build_response(status: u16, content_type: &str, body: &[u8]) -> Vec<u8> {
    let reason = match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let mut out = format!(
        "HTTP/1.0 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

fn html_response(status: u16, message: &str) -> Vec<u8> {
    build_response(status, "text/html", format!("<html><h1>{message}</h1></html>\r\n").as_bytes())
}

/// An HTTP failure to report to the client.
#[derive(Debug)]
struct HttpFailure {
    status: u16,
    message: String,
}

impl HttpFailure {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

// multipart form parsing

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MimeState {
    Initial,
    PartHeaders,
    ManifestHeaders,
    DataHeaders,
    Body,
}

const SEEN_MANIFEST: u8 = 1;
const SEEN_DATA: u8 = 2;

struct MultipartParser {
    /// The boundary with its leading `--` attached.
    boundary: Vec<u8>,
    state: MimeState,
    line: Vec<u8>,
    manifest_path: PathBuf,
    data_path: PathBuf,
    current: Option<(File, u64)>,
    fields_seen: u8,
    data_file_name: Option<String>,
    finished: bool,
}

impl MultipartParser {
    fn new(boundary: &str, manifest_path: PathBuf, data_path: PathBuf) -> Self {
        Self {
            boundary: format!("--{boundary}").into_bytes(),
            state: MimeState::Initial,
            line: Vec::new(),
            manifest_path,
            data_path,
            current: None,
            fields_seen: 0,
            data_file_name: None,
            finished: false,
        }
    }

    /// Feed raw body bytes. Returns true once the final boundary was seen.
    fn process(&mut self, bytes: &[u8]) -> Result<bool, HttpFailure> {
        for &byte in bytes {
            if self.finished {
                break;
            }
            let mut true_newline = false;
            if byte == b'\n' && self.line.last() == Some(&b'\r') {
                self.line.pop();
                true_newline = true;
            }
            if true_newline || self.line.len() > MAX_LINE_BYTES {
                if true_newline {
                    // keep the CRLF with the line so body bytes survive intact
                    self.line.push(b'\r');
                    self.line.push(b'\n');
                }
                let line = std::mem::take(&mut self.line);
                self.process_line(&line)?;
                if true_newline {
                    continue;
                }
            }
            self.line.push(byte);
        }
        Ok(self.finished)
    }

    /// Flush a trailing partial line once the declared body is consumed.
    fn finish(&mut self) -> Result<bool, HttpFailure> {
        if !self.finished && !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.process_line(&line)?;
        }
        Ok(self.finished)
    }

    fn process_line(&mut self, line: &[u8]) -> Result<(), HttpFailure> {
        let boundary_line = line.starts_with(&self.boundary);
        let end_of_form = boundary_line
            && line[self.boundary.len()..].starts_with(b"--");
        let blank_line = line == b"\r\n";

        match self.state {
            MimeState::Initial => {
                if boundary_line {
                    self.state = MimeState::PartHeaders;
                }
            }
            MimeState::PartHeaders | MimeState::ManifestHeaders | MimeState::DataHeaders => {
                if blank_line {
                    if self.state == MimeState::PartHeaders {
                        return Err(HttpFailure::new(
                            400,
                            "Malformed multi-part form POST: \
                             missing content-disposition line in MIME encoded part.",
                        ));
                    }
                    let path = if self.state == MimeState::ManifestHeaders {
                        &self.manifest_path
                    } else {
                        &self.data_path
                    };
                    let file = File::create(path).map_err(|err| {
                        HttpFailure::new(500, format!("could not open part file: {err}"))
                    })?;
                    self.current = Some((file, 0));
                    self.state = MimeState::Body;
                } else if let Some((field, filename)) = parse_content_disposition(line) {
                    if self.state != MimeState::PartHeaders {
                        return Err(HttpFailure::new(
                            400,
                            "Malformed multi-part form POST: \
                             multiple content-disposition lines in single MIME encoded part.",
                        ));
                    }
                    if field.eq_ignore_ascii_case("manifest") {
                        self.state = MimeState::ManifestHeaders;
                        self.fields_seen |= SEEN_MANIFEST;
                    } else if field.eq_ignore_ascii_case("data") {
                        self.state = MimeState::DataHeaders;
                        self.fields_seen |= SEEN_DATA;
                        self.data_file_name = filename;
                    }
                }
            }
            MimeState::Body => {
                if boundary_line {
                    self.close_part()?;
                    self.state = MimeState::PartHeaders;
                } else if let Some((file, written)) = self.current.as_mut() {
                    file.write_all(line).map_err(|err| {
                        HttpFailure::new(500, format!("part write failed: {err}"))
                    })?;
                    *written += line.len() as u64;
                }
            }
        }

        if end_of_form {
            self.close_part()?;
            self.finished = true;
        }
        Ok(())
    }

    /// The CRLF before the boundary was already written; prune it.
    fn close_part(&mut self) -> Result<(), HttpFailure> {
        if let Some((file, written)) = self.current.take() {
            let trimmed = written.saturating_sub(2);
            file.set_len(trimmed)
                .map_err(|err| HttpFailure::new(500, format!("part truncate failed: {err}")))?;
        }
        Ok(())
    }
}

fn parse_content_disposition(line: &[u8]) -> Option<(String, Option<String>)> {
    let text = std::str::from_utf8(line).ok()?;
    let rest = text.strip_prefix("Content-Disposition: form-data;")?;
    let mut name = None;
    let mut filename = None;
    for part in rest.trim_end().split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("name=") {
            name = Some(value.trim_matches('"').to_string());
        } else if let Some(value) = part.strip_prefix("filename=") {
            filename = Some(value.trim_matches('"').to_string());
        }
    }
    Some((name?, filename))
}

// server

pub struct RhizomeHttpServer {
    store: Arc<Mutex<RhizomeStore>>,
    config: RhizomeConfig,
    /// Author secret for binding bare-file bundles, when this node has one.
    author_secret: Option<RhizomeSecret>,
    temp_dir: PathBuf,
    next_conn: AtomicU64,
}

impl RhizomeHttpServer {
    pub fn new(
        store: Arc<Mutex<RhizomeStore>>,
        config: RhizomeConfig,
        author_secret: Option<RhizomeSecret>,
        temp_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self { store, config, author_secret, temp_dir, next_conn: AtomicU64::new(0) })
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = server.handle(stream, peer).await {
                                log::debug!("rz: http connection from {peer} failed: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        log::warn!("rz: http accept failed: {err}");
                        break;
                    }
                },
            }
        }
    }

    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<(), RhizomeError> {
        let mut head = Vec::new();
        let mut buf = [0u8; 4096];
        let header_end = loop {
            if let Some(end) = find_header_end(&head) {
                break end;
            }
            if head.len() > MAX_HEAD_BYTES {
                stream.write_all(&html_response(400, "Malformed request")).await?;
                return Ok(());
            }
            let read = stream.read(&mut buf).await?;
            if read == 0 {
                return Ok(());
            }
            head.extend_from_slice(&buf[..read]);
        };

        let body_start = header_end + HEADER_END.len();
        let leftover = head[body_start..].to_vec();
        let head = head[..header_end].to_vec();
        let Some((method, path)) = parse_request_line(&head) else {
            stream.write_all(&html_response(400, "Malformed request")).await?;
            return Ok(());
        };
        log::info!("rz: http {method} {path} from {peer}");

        let response = match method.as_str() {
            "GET" => self.handle_get(&path),
            "POST" => self.handle_post(&mut stream, &head, &path, peer, leftover).await?,
            _ => html_response(400, "Malformed request"),
        };
        stream.write_all(&response).await?;
        stream.shutdown().await.ok();
        Ok(())
    }

    fn handle_get(&self, path: &str) -> Vec<u8> {
        if path == "/" {
            return build_response(200, "text/html", b"<html><h1>mycel</h1></html>\r\n");
        }
        if path == "/favicon.ico" {
            return build_response(200, "image/vnd.microsoft.icon", FAVICON);
        }
        if let Some(hex_prefix) = path.strip_prefix("/rhizome/manifestbybar/") {
            return match hex::decode(hex_prefix) {
                Ok(prefix) if prefix.len() <= BAR_PREFIX_BYTES && !prefix.is_empty() => {
                    match lock_store(&self.store).manifest_by_bar_prefix(&prefix) {
                        Ok(Some(manifest)) => {
                            build_response(200, "binary/octet-stream", &manifest)
                        }
                        Ok(None) => html_response(404, "No such bundle"),
                        Err(err) => html_response(500, &err.to_string()),
                    }
                }
                _ => html_response(400, "Bad BAR prefix"),
            };
        }
        if let Some(hash) = path.strip_prefix("/rhizome/filebyhash/") {
            return match lock_store(&self.store).payload(hash) {
                Ok(Some(payload)) => build_response(200, "binary/octet-stream", &payload),
                Ok(None) => html_response(404, "No such file"),
                Err(err) => html_response(500, &err.to_string()),
            };
        }
        html_response(404, "Not found (GET)")
    }

    async fn handle_post(
        &self,
        stream: &mut TcpStream,
        head: &[u8],
        path: &str,
        peer: SocketAddr,
        leftover: Vec<u8>,
    ) -> Result<Vec<u8>, RhizomeError> {
        let addfile = self.config.addfile_uri.as_deref() == Some(path) && !path.is_empty();
        if path != "/rhizome/import" && path != "/rhizome/enquiry" && !addfile {
            return Ok(html_response(404, "Not found (POST)"));
        }
        let Some(content_length) = parse_content_length(head) else {
            return Ok(html_response(400, "POST without content-length"));
        };
        let Some(boundary) = parse_multipart_boundary(head) else {
            return Ok(html_response(
                400,
                "POST without content-type (or unsupported content-type)",
            ));
        };

        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let manifest_path = self.temp_dir.join(format!("rhizomedirect.{conn}.manifest"));
        let data_path = self.temp_dir.join(format!("rhizomedirect.{conn}.data"));
        let mut parser =
            MultipartParser::new(&boundary, manifest_path.clone(), data_path.clone());

        let result = self
            .read_form(stream, &mut parser, leftover, content_length)
            .await;
        let response = match result {
            Ok(()) => match self.dispatch_form(path, peer, addfile, &parser) {
                Ok(response) => response,
                Err(failure) => html_response(failure.status, &failure.message),
            },
            Err(failure) => html_response(failure.status, &failure.message),
        };
        // temp part files never outlive the request
        let _ = std::fs::remove_file(&manifest_path);
        let _ = std::fs::remove_file(&data_path);
        Ok(response)
    }

    async fn read_form(
        &self,
        stream: &mut TcpStream,
        parser: &mut MultipartParser,
        leftover: Vec<u8>,
        content_length: usize,
    ) -> Result<(), HttpFailure> {
        let mut consumed = leftover.len().min(content_length);
        parser.process(&leftover[..consumed])?;
        let mut buf = [0u8; 4096];
        while consumed < content_length && !parser.finished {
            let want = (content_length - consumed).min(buf.len());
            let read = stream
                .read(&mut buf[..want])
                .await
                .map_err(|err| HttpFailure::new(500, format!("read failed: {err}")))?;
            if read == 0 {
                return Err(HttpFailure::new(400, "Truncated multipart body"));
            }
            consumed += read;
            parser.process(&buf[..read])?;
        }
        if !parser.finish()? {
            return Err(HttpFailure::new(400, "Missing end-of-form boundary"));
        }
        Ok(())
    }

    fn dispatch_form(
        &self,
        path: &str,
        peer: SocketAddr,
        addfile: bool,
        parser: &MultipartParser,
    ) -> Result<Vec<u8>, HttpFailure> {
        if path == "/rhizome/import" {
            if parser.fields_seen != SEEN_MANIFEST | SEEN_DATA {
                return Err(HttpFailure::new(
                    400,
                    "/rhizome/import requires 'manifest' and 'data' fields",
                ));
            }
            return self.import_bundle(&parser.manifest_path, &parser.data_path);
        }
        if path == "/rhizome/enquiry" {
            if parser.fields_seen & SEEN_DATA == 0 {
                return Err(HttpFailure::new(404, "/rhizome/enquiry requires 'data' field"));
            }
            let request = std::fs::read(&parser.data_path)
                .map_err(|err| HttpFailure::new(500, format!("couldn't read a file: {err}")))?;
            let response = sync::fill_response(&lock_store(&self.store), &request)
                .map_err(|err| match err {
                    RhizomeError::Protocol(message) => HttpFailure::new(400, message),
                    other => HttpFailure::new(500, other.to_string()),
                })?;
            return Ok(build_response(200, "binary/octet-stream", &response));
        }
        if addfile {
            return self.add_bare_file(peer, parser);
        }
        Err(HttpFailure::new(500, "Something went wrong"))
    }

    fn import_bundle(
        &self,
        manifest_path: &std::path::Path,
        data_path: &std::path::Path,
    ) -> Result<Vec<u8>, HttpFailure> {
        let manifest_bytes = std::fs::read(manifest_path)
            .map_err(|err| HttpFailure::new(500, format!("couldn't read a file: {err}")))?;
        let payload = std::fs::read(data_path)
            .map_err(|err| HttpFailure::new(500, format!("couldn't read a file: {err}")))?;
        let manifest = Manifest::parse(&manifest_bytes)
            .map_err(|err| HttpFailure::new(400, err.to_string()))?;
        match lock_store(&self.store).add_bundle(&manifest, Some(&payload), PRIORITY_DEFAULT) {
            Ok(AddOutcome::New) => Ok(build_response(201, "text/html", b"Created")),
            Ok(AddOutcome::Replaced) => Ok(build_response(201, "text/html", b"Updated")),
            Err(RhizomeError::AlreadyPresent) | Err(RhizomeError::Stale) => {
                Ok(build_response(204, "text/html", b""))
            }
            Err(RhizomeError::Validation(message)) | Err(RhizomeError::Crypto(message)) => {
                Err(HttpFailure::new(403, message))
            }
            Err(RhizomeError::Parse(message)) => Err(HttpFailure::new(400, message)),
            Err(other) => Err(HttpFailure::new(500, other.to_string())),
        }
    }

    /// Server-side bundle creation from a bare uploaded file, only for the
    /// configured loopback client.
    fn add_bare_file(
        &self,
        peer: SocketAddr,
        parser: &MultipartParser,
    ) -> Result<Vec<u8>, HttpFailure> {
        if peer.ip() != self.config.addfile_allowed_address {
            log::debug!(
                "rz: addfile request from {peer}, only allowed from {}",
                self.config.addfile_allowed_address
            );
            return Err(HttpFailure::new(400, "Not available from here."));
        }
        if parser.fields_seen & SEEN_DATA == 0 {
            return Err(HttpFailure::new(
                400,
                "Rhizome create bundle from file API requires 'data' field",
            ));
        }
        let payload = std::fs::read(&parser.data_path)
            .map_err(|err| HttpFailure::new(500, format!("couldn't read a file: {err}")))?;

        let mut manifest = match &self.config.addfile_manifest_template {
            Some(path) => {
                let mut text = std::fs::read(path).map_err(|err| {
                    HttpFailure::new(500, format!("manifest template unreadable: {err}"))
                })?;
                text.push(0);
                Manifest::parse(&text).map_err(|err| {
                    HttpFailure::new(500, format!("manifest template invalid: {err}"))
                })?
            }
            None => Manifest::new(),
        };

        if manifest.get("service").is_none() {
            manifest.set("service", SERVICE_FILE);
        }
        if manifest.get("date").is_none() {
            manifest.set_u64("date", wall_ms());
        }
        if manifest.get("name").is_none() {
            let name = parser.data_file_name.clone().unwrap_or_else(|| "file".to_string());
            manifest.set("name", name);
        }
        manifest.set_u64("version", wall_ms());
        manifest.set_u64("filesize", payload.len() as u64);
        if payload.is_empty() {
            manifest.del("filehash");
        } else {
            manifest.set("filehash", mycel_identity::sha512_hex(&payload));
        }

        if manifest.get("id").is_none() {
            let author = match (&self.config.addfile_author, &self.author_secret) {
                (Some(_), Some(secret)) => Some(secret),
                _ => None,
            };
            manifest.create_id(OsRng, author);
        } else if let Some(secret) = self.config.addfile_bundle_secret {
            manifest.set_secret(secret).map_err(|err| {
                HttpFailure::new(
                    500,
                    format!("configured bundle secret did not verify: {err}"),
                )
            })?;
        } else {
            return Err(HttpFailure::new(
                500,
                "manifest template has a hard-wired bundle id but no bundle secret is \
                 configured; supply one or drop id= from the template",
            ));
        }

        manifest.sign().map_err(|err| HttpFailure::new(500, err.to_string()))?;
        match lock_store(&self.store).add_bundle(&manifest, Some(&payload), PRIORITY_DEFAULT) {
            Ok(_) => Ok(build_response(200, "text/plain", &manifest.to_bytes())),
            Err(err) => Err(HttpFailure::new(500, err.to_string())),
        }
    }
}

// client

async fn http_request(
    peer: SocketAddr,
    request: Vec<u8>,
) -> Result<(u16, Vec<u8>), RhizomeError> {
    let mut stream = TcpStream::connect(peer).await?;
    stream.write_all(&request).await?;
    stream.shutdown().await.ok();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let header_end = find_header_end(&response)
        .ok_or_else(|| RhizomeError::Protocol("response missing headers".into()))?;
    let head = &response[..header_end];
    let status_line = String::from_utf8_lossy(head);
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| RhizomeError::Protocol("malformed status line".into()))?;
    let mut body = response[header_end + HEADER_END.len()..].to_vec();
    if let Some(declared) = parse_content_length(head) {
        body.truncate(declared);
    }
    Ok((status, body))
}

fn multipart_post(path: &str, parts: &[(&str, &str, &[u8])]) -> Vec<u8> {
    let boundary = format!("----{:08x}{:08x}", OsRng.next_u32(), OsRng.next_u32());
    let mut body = Vec::new();
    for (name, filename, content) in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    let mut request = format!(
        "POST {path} HTTP/1.0\r\n\
         Content-Length: {}\r\n\
         Content-Type: multipart/form-data; boundary={boundary}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);
    request
}

pub async fn post_enquiry(peer: SocketAddr, body: &[u8]) -> Result<Vec<u8>, RhizomeError> {
    let request = multipart_post("/rhizome/enquiry", &[("data", "IHAVEs", body)]);
    let (status, response) = http_request(peer, request).await?;
    if status != 200 {
        return Err(RhizomeError::Protocol(format!("enquiry returned {status}")));
    }
    Ok(response)
}

pub async fn post_bundle(
    peer: SocketAddr,
    manifest: &[u8],
    payload: &[u8],
) -> Result<u16, RhizomeError> {
    let request = multipart_post(
        "/rhizome/import",
        &[("manifest", "m", manifest), ("data", "d", payload)],
    );
    let (status, _) = http_request(peer, request).await?;
    Ok(status)
}

pub async fn fetch_manifest_by_bar(
    peer: SocketAddr,
    prefix: &[u8],
) -> Result<Option<Vec<u8>>, RhizomeError> {
    let request = format!(
        "GET /rhizome/manifestbybar/{} HTTP/1.0\r\n\r\n",
        hex::encode(prefix)
    );
    let (status, body) = http_request(peer, request.into_bytes()).await?;
    match status {
        200 => Ok(Some(body)),
        404 => Ok(None),
        other => Err(RhizomeError::Protocol(format!("manifest fetch returned {other}"))),
    }
}

pub async fn fetch_payload(
    peer: SocketAddr,
    filehash: &str,
) -> Result<Option<Vec<u8>>, RhizomeError> {
    let request = format!("GET /rhizome/filebyhash/{filehash} HTTP/1.0\r\n\r\n");
    let (status, body) = http_request(peer, request.into_bytes()).await?;
    match status {
        200 => Ok(Some(body)),
        404 => Ok(None),
        other => Err(RhizomeError::Protocol(format!("payload fetch returned {other}"))),
    }
}

/// One enquiry round against a peer: post our IHAVEs, action the response.
/// Returns how many actions the peer requested.
pub async fn sync_round(
    peer: SocketAddr,
    store: &Arc<Mutex<RhizomeStore>>,
) -> Result<usize, RhizomeError> {
    let enquiry = {
        let mut cursor = SyncCursor::full_range();
        sync::build_enquiry(&lock_store(store), &mut cursor)?
    };
    let response = post_enquiry(peer, &enquiry).await?;
    let (_covered, actions) = sync::parse_response(&response)?;
    let total = actions.len();
    for action in actions {
        if let Err(err) = run_action(peer, store, &action).await {
            log::warn!("rz: sync action {} failed: {err}", action.op);
        }
    }
    Ok(total)
}

/// Fetch a bundle named by a BAR prefix from a peer and import it if it is
/// new or newer. Used both for sync pull actions and for acting on overlay
/// bundle advertisements.
pub async fn pull_by_prefix(
    peer: SocketAddr,
    store: &Arc<Mutex<RhizomeStore>>,
    bid_prefix: &[u8],
) -> Result<(), RhizomeError> {
    let Some(manifest_bytes) = fetch_manifest_by_bar(peer, bid_prefix).await? else {
        return Err(RhizomeError::NotFound);
    };
    let manifest = Manifest::parse(&manifest_bytes)?;
    let id = manifest.id()?.to_hex();
    let version = manifest.version().unwrap_or(0);
    let interesting = match lock_store(store).manifest_version(&id)? {
        Some(stored) => stored < version,
        None => true,
    };
    if !interesting {
        return Ok(());
    }
    let payload = match manifest.filesize() {
        Some(0) | None => Vec::new(),
        Some(_) => {
            let hash = manifest
                .filehash()
                .ok_or_else(|| {
                    RhizomeError::Validation("manifest missing \"filehash\" field".into())
                })?
                .to_string();
            fetch_payload(peer, &hash).await?.ok_or(RhizomeError::NotFound)?
        }
    };
    match lock_store(store).add_bundle(&manifest, Some(&payload), PRIORITY_DEFAULT) {
        Ok(_) | Err(RhizomeError::AlreadyPresent) | Err(RhizomeError::Stale) => Ok(()),
        Err(err) => Err(err),
    }
}

async fn run_action(
    peer: SocketAddr,
    store: &Arc<Mutex<RhizomeStore>>,
    action: &SyncAction,
) -> Result<(), RhizomeError> {
    match action.op {
        OP_PULL => pull_by_prefix(peer, store, &action.bid_prefix).await,
        OP_PUSH => {
            let (manifest_bytes, payload) = {
                let store = lock_store(store);
                let manifest_bytes = store
                    .manifest_by_bar_prefix(&action.bid_prefix)?
                    .ok_or(RhizomeError::NotFound)?;
                let manifest = Manifest::parse(&manifest_bytes)?;
                let payload = match manifest.filehash() {
                    Some(hash) => store.payload(hash)?.unwrap_or_default(),
                    None => Vec::new(),
                };
                (manifest_bytes, payload)
            };
            let status = post_bundle(peer, &manifest_bytes, &payload).await?;
            if (200..300).contains(&status) {
                Ok(())
            } else {
                Err(RhizomeError::Protocol(format!("import returned {status}")))
            }
        }
        other => Err(RhizomeError::Protocol(format!("unknown sync op {other}"))),
    }
}

/// Re-issue enquiries until a round yields zero actions (the conservative
/// cursor strategy): each successful action shrinks the difference between
/// the stores, so convergence is bounded by the bundle count.
pub async fn sync_with_peer(
    peer: SocketAddr,
    store: &Arc<Mutex<RhizomeStore>>,
    max_rounds: usize,
) -> Result<(), RhizomeError> {
    for round in 0..max_rounds {
        let actions = sync_round(peer, store).await?;
        log::debug!("rz: sync round {round} with {peer}: {actions} actions");
        if actions == 0 {
            return Ok(());
        }
    }
    Err(RhizomeError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> MultipartParser {
        let dir = std::env::temp_dir();
        let tag = OsRng.next_u64();
        MultipartParser::new(
            "----testboundary",
            dir.join(format!("mycel-test-{tag}.manifest")),
            dir.join(format!("mycel-test-{tag}.data")),
        )
    }

    fn form(parts: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, content) in parts {
            body.extend_from_slice(b"------testboundary\r\n");
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"f\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(b"------testboundary--\r\n");
        body
    }

    #[test]
    fn multipart_parses_two_parts() {
        let mut parser = parser();
        let body = form(&[("manifest", b"manifest-bytes".as_slice()), ("data", b"data-bytes".as_slice())]);
        assert!(parser.process(&body).expect("parse"));
        assert_eq!(parser.fields_seen, SEEN_MANIFEST | SEEN_DATA);
        assert_eq!(std::fs::read(&parser.manifest_path).expect("manifest"), b"manifest-bytes");
        assert_eq!(std::fs::read(&parser.data_path).expect("data"), b"data-bytes");
        let _ = std::fs::remove_file(&parser.manifest_path);
        let _ = std::fs::remove_file(&parser.data_path);
    }

    #[test]
    fn boundary_straddling_reads_is_found() {
        let mut parser = parser();
        let body = form(&[("data", b"payload ends with\r\nbinary tail".as_slice())]);
        // split inside the CRLF that precedes the closing boundary
        let crlf_before_final = body.len() - (b"------testboundary--\r\n".len() + 2) + 1;
        let (first, second) = body.split_at(crlf_before_final);
        assert!(!parser.process(first).expect("first half"));
        assert!(parser.process(second).expect("second half"));
        assert_eq!(
            std::fs::read(&parser.data_path).expect("data"),
            b"payload ends with\r\nbinary tail"
        );
        let _ = std::fs::remove_file(&parser.data_path);
    }

    #[test]
    fn binary_part_with_inner_crlf_survives() {
        let mut parser = parser();
        let payload = b"\x00\x01\r\n\x02\x03\r\nmore\r\n\xFF";
        let body = form(&[("data", payload.as_slice())]);
        assert!(parser.process(&body).expect("parse"));
        assert_eq!(std::fs::read(&parser.data_path).expect("data"), payload);
        let _ = std::fs::remove_file(&parser.data_path);
    }

    #[test]
    fn missing_disposition_is_a_400() {
        let mut parser = parser();
        let mut body = Vec::new();
        body.extend_from_slice(b"------testboundary\r\n\r\n");
        body.extend_from_slice(b"content\r\n");
        body.extend_from_slice(b"------testboundary--\r\n");
        let err = parser.process(&body).expect_err("must fail");
        assert_eq!(err.status, 400);
    }

    #[test]
    fn response_builder_includes_status_and_length() {
        let response = build_response(201, "text/html", b"Created");
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.0 201 Created\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
    }

    #[test]
    fn content_disposition_parsing() {
        let (name, filename) = parse_content_disposition(
            b"Content-Disposition: form-data; name=\"data\"; filename=\"IHAVEs\"\r\n",
        )
        .expect("parsed");
        assert_eq!(name, "data");
        assert_eq!(filename.as_deref(), Some("IHAVEs"));
        assert!(parse_content_disposition(b"Content-Type: text/plain\r\n").is_none());
    }
}
