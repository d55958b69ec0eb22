// src/conn.rs
//! Per-connection HTTP engine: byte accumulation with resumable cursors, the
//! line-scanner/parser state machines, resource resolution, response
//! construction, and the two-segment scatter flush.

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use log::debug;

use crate::config::{ServerConfig, TriggerMode};
use crate::http::{self, Method};
use crate::router::{RouteAction, RouteTable};
use crate::store::CredentialStore;
use crate::syscalls::{self, IoStep, MappedFile};

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

/// Main parser state. Advances forward only within one request and resets
/// atomically to RequestLine on `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckState {
    RequestLine,
    Headers,
    Body,
}

/// Line scanner result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineStatus {
    /// Terminator found; the line span is ready.
    Ok,
    /// No terminator yet; wait for more bytes.
    Open,
    /// Stray CR or LF.
    Bad,
}

/// Terminal classification of the bytes buffered so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Need more bytes; re-arm for read.
    Incomplete,
    /// Syntax error; answer with a 400-class response and close.
    Malformed,
    /// Full request parsed; ready for resource resolution.
    Ready,
}

/// Result of resource resolution for a complete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestStatus {
    File,
    BadRequest,
    NotFound,
    Forbidden,
    Internal,
}

/// Intermediate step outcome while the main state machine consumes lines.
enum Harvest {
    More,
    Complete,
    Bad,
}

/// What the caller should do after `process`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Request incomplete; re-arm for read-readiness.
    NeedRead,
    /// Response buffer populated; re-arm for write-readiness.
    NeedWrite,
    /// Unrecoverable; tear the connection down without a response.
    Close,
}

/// What the caller should do after `flush`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    /// Transport is full; re-arm for write-readiness, offsets preserved.
    Again,
    /// Response fully sent and the connection was reset for the next request.
    KeepAlive,
    /// Response fully sent; close per the request's connection policy.
    Close,
    /// Write error; mapping released, tear down.
    Error,
}

/// Capability interface the worker pool drives. `Connection` is the HTTP
/// engine; an alternative protocol engine can stand behind a `ConnHandle`
/// without the pool noticing.
pub trait Engine: Send {
    /// Pulls transport bytes into the engine. False means tear down.
    fn feed(&mut self, mode: TriggerMode) -> bool;
    /// Parses buffered bytes and builds a response when one is due.
    fn process(
        &mut self,
        routes: &RouteTable,
        store: Option<&mut dyn CredentialStore>,
    ) -> ProcessResult;
    /// Pushes pending response bytes to the transport.
    fn flush(&mut self) -> FlushResult;
    fn bytes_pending(&self) -> usize;
}

impl Engine for Connection {
    fn feed(&mut self, mode: TriggerMode) -> bool {
        Connection::feed(self, mode)
    }

    fn process(
        &mut self,
        routes: &RouteTable,
        store: Option<&mut dyn CredentialStore>,
    ) -> ProcessResult {
        Connection::process(self, routes, store)
    }

    fn flush(&mut self) -> FlushResult {
        Connection::flush(self)
    }

    fn bytes_pending(&self) -> usize {
        Connection::bytes_pending(self)
    }
}

pub struct Connection {
    fd: i32,
    peer: Option<SocketAddr>,
    config: Arc<ServerConfig>,

    read_buf: Box<[u8; READ_BUFFER_SIZE]>,
    /// Bytes received so far.
    read_idx: usize,
    /// Bytes already consumed by the line scanner.
    checked_idx: usize,
    /// Start of the line currently being scanned.
    start_line: usize,
    /// End (exclusive) of the last complete line.
    line_end: usize,

    write_buf: Box<[u8; WRITE_BUFFER_SIZE]>,
    write_idx: usize,

    check_state: CheckState,
    method: Method,
    path: String,
    keep_alive: bool,
    content_length: usize,
    host: Option<String>,
    /// Span of the request body within the read buffer.
    body: Option<(usize, usize)>,

    mapping: Option<MappedFile>,
    bytes_to_send: usize,
    bytes_have_send: usize,
}

impl Connection {
    pub fn new(fd: i32, peer: SocketAddr, config: Arc<ServerConfig>) -> Self {
        let mut conn = Self::detached(config);
        conn.fd = fd;
        conn.peer = Some(peer);
        conn
    }

    /// A connection with no socket, for parser-level use and tests.
    pub fn detached(config: Arc<ServerConfig>) -> Self {
        Self {
            fd: -1,
            peer: None,
            config,
            read_buf: Box::new([0; READ_BUFFER_SIZE]),
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            line_end: 0,
            write_buf: Box::new([0; WRITE_BUFFER_SIZE]),
            write_idx: 0,
            check_state: CheckState::RequestLine,
            method: Method::Get,
            path: String::new(),
            keep_alive: false,
            content_length: 0,
            host: None,
            body: None,
            mapping: None,
            bytes_to_send: 0,
            bytes_have_send: 0,
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body.map(|(start, end)| &self.read_buf[start..end])
    }

    /// Reinitializes request state for the next keep-alive cycle. The
    /// socket, peer, and configuration survive; cursors, parse state, and
    /// the write descriptors all go back to their initial values, and any
    /// file mapping is released.
    pub fn reset(&mut self) {
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.line_end = 0;
        self.write_idx = 0;
        self.check_state = CheckState::RequestLine;
        self.method = Method::Get;
        self.path.clear();
        self.keep_alive = false;
        self.content_length = 0;
        self.host = None;
        self.body = None;
        self.mapping = None;
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
    }

    // ---- Input accumulation ----

    /// Appends already-received bytes to the read buffer. Returns false on
    /// buffer exhaustion.
    pub fn ingest(&mut self, bytes: &[u8]) -> bool {
        if self.read_idx + bytes.len() > READ_BUFFER_SIZE {
            return false;
        }
        self.read_buf[self.read_idx..self.read_idx + bytes.len()].copy_from_slice(bytes);
        self.read_idx += bytes.len();
        true
    }

    /// Drains available socket bytes into the read buffer. Level-triggered
    /// mode performs one bounded read; edge-triggered mode loops until the
    /// socket reports would-block. False means the caller must tear the
    /// connection down: peer close, I/O error, or (edge mode) a full buffer.
    pub fn feed(&mut self, mode: TriggerMode) -> bool {
        match mode {
            TriggerMode::Level => {
                if self.read_idx >= READ_BUFFER_SIZE {
                    return false;
                }
                match syscalls::read_step(self.fd, &mut self.read_buf[self.read_idx..]) {
                    Ok(IoStep::Done(n)) => {
                        self.read_idx += n;
                        true
                    }
                    Ok(IoStep::WouldBlock) | Ok(IoStep::Closed) | Err(_) => false,
                }
            }
            TriggerMode::Edge => loop {
                if self.read_idx >= READ_BUFFER_SIZE {
                    return false;
                }
                match syscalls::read_step(self.fd, &mut self.read_buf[self.read_idx..]) {
                    Ok(IoStep::Done(n)) => self.read_idx += n,
                    Ok(IoStep::WouldBlock) => return true,
                    Ok(IoStep::Closed) | Err(_) => return false,
                }
            },
        }
    }

    // ---- Line scanner (sub-state machine) ----

    fn parse_line(&mut self) -> LineStatus {
        while self.checked_idx < self.read_idx {
            let byte = self.read_buf[self.checked_idx];
            if byte == b'\r' {
                if self.checked_idx + 1 == self.read_idx {
                    // CR at the end of the buffered bytes: terminator may
                    // still be in flight.
                    return LineStatus::Open;
                }
                if self.read_buf[self.checked_idx + 1] == b'\n' {
                    self.line_end = self.checked_idx;
                    self.checked_idx += 2;
                    return LineStatus::Ok;
                }
                return LineStatus::Bad;
            }
            if byte == b'\n' {
                if self.checked_idx > 0 && self.read_buf[self.checked_idx - 1] == b'\r' {
                    self.line_end = self.checked_idx - 1;
                    self.checked_idx += 1;
                    return LineStatus::Ok;
                }
                return LineStatus::Bad;
            }
            self.checked_idx += 1;
        }
        LineStatus::Open
    }

    // ---- Main parser ----

    fn parse_request_line(&mut self, line: &str) -> Harvest {
        let mut parts = line.split([' ', '\t']).filter(|s| !s.is_empty());
        let (Some(method), Some(target), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Harvest::Bad;
        };
        if parts.next().is_some() {
            return Harvest::Bad;
        }

        let Some(method) = Method::from_token(method.as_bytes()) else {
            return Harvest::Bad;
        };
        self.method = method;

        // HTTP/1.1 only; 1.0 and everything else is rejected, not downgraded.
        if !version.eq_ignore_ascii_case("HTTP/1.1") {
            return Harvest::Bad;
        }

        // An absolute URI is stripped down to its path.
        let mut target = target;
        for scheme in ["http://", "https://"] {
            if target.len() >= scheme.len()
                && target[..scheme.len()].eq_ignore_ascii_case(scheme)
            {
                match target[scheme.len()..].find('/') {
                    Some(i) => target = &target[scheme.len() + i..],
                    None => return Harvest::Bad,
                }
            }
        }
        if !target.starts_with('/') {
            return Harvest::Bad;
        }

        self.path = if target == "/" {
            format!("/{}", self.config.default_document)
        } else {
            target.to_string()
        };
        self.check_state = CheckState::Headers;
        Harvest::More
    }

    fn parse_header(&mut self, line: &str) -> Harvest {
        if line.is_empty() {
            if self.content_length > 0 {
                self.check_state = CheckState::Body;
                return Harvest::More;
            }
            return Harvest::Complete;
        }
        if let Some(value) = header_value(line, "Connection:") {
            if value.eq_ignore_ascii_case("keep-alive") {
                self.keep_alive = true;
            }
        } else if let Some(value) = header_value(line, "Content-Length:") {
            self.content_length = value.parse().unwrap_or(0);
        } else if let Some(value) = header_value(line, "Host:") {
            self.host = Some(value.to_string());
        } else {
            debug!("ignoring header: {}", line);
        }
        Harvest::More
    }

    fn parse_content(&mut self) -> Harvest {
        if self.read_idx >= self.checked_idx + self.content_length {
            self.body = Some((self.checked_idx, self.checked_idx + self.content_length));
            return Harvest::Complete;
        }
        Harvest::More
    }

    /// Runs the line scanner and the main state machine over the buffered
    /// bytes until the request is classified.
    pub fn process_read(&mut self) -> ParseStatus {
        loop {
            if self.check_state == CheckState::Body {
                // The body has no line terminator; completion is purely a
                // byte count.
                return match self.parse_content() {
                    Harvest::Complete => ParseStatus::Ready,
                    _ => ParseStatus::Incomplete,
                };
            }
            match self.parse_line() {
                LineStatus::Open => return ParseStatus::Incomplete,
                LineStatus::Bad => return ParseStatus::Malformed,
                LineStatus::Ok => {}
            }
            let line = match std::str::from_utf8(&self.read_buf[self.start_line..self.line_end]) {
                Ok(s) => s.to_string(),
                Err(_) => return ParseStatus::Malformed,
            };
            self.start_line = self.checked_idx;

            let harvest = match self.check_state {
                CheckState::RequestLine => self.parse_request_line(&line),
                CheckState::Headers => self.parse_header(&line),
                CheckState::Body => unreachable!(),
            };
            match harvest {
                Harvest::More => {}
                Harvest::Complete => return ParseStatus::Ready,
                Harvest::Bad => return ParseStatus::Malformed,
            }
        }
    }

    // ---- Resource resolution ----

    fn do_request(
        &mut self,
        routes: &RouteTable,
        store: Option<&mut dyn CredentialStore>,
    ) -> RequestStatus {
        match routes.route(&self.path, self.method == Method::Post) {
            RouteAction::Page(page) => self.path = page,
            RouteAction::Login => {
                let Some(store) = store else {
                    return RequestStatus::Internal;
                };
                self.path = match self.form_credentials() {
                    Some((user, password))
                        if store.lookup(&user).as_deref() == Some(password.as_str()) =>
                    {
                        "/welcome.html".to_string()
                    }
                    _ => "/logError.html".to_string(),
                };
            }
            RouteAction::Register => {
                let Some(store) = store else {
                    return RequestStatus::Internal;
                };
                self.path = match self.form_credentials() {
                    Some((user, password))
                        if store.lookup(&user).is_none() && store.insert(&user, &password) =>
                    {
                        "/log.html".to_string()
                    }
                    _ => "/registerError.html".to_string(),
                };
            }
        }

        let real_file = self.config.doc_root.join(&self.path[1..]);
        let meta = match std::fs::metadata(&real_file) {
            Ok(meta) => meta,
            Err(_) => return RequestStatus::NotFound,
        };
        // World-readable or nothing, same policy as a public web root.
        if meta.permissions().mode() & 0o004 == 0 {
            return RequestStatus::Forbidden;
        }
        if meta.is_dir() {
            return RequestStatus::BadRequest;
        }
        let len = meta.len() as usize;
        if len == 0 {
            // Zero-length files never get a mapping; a minimal static body
            // is substituted at response-construction time.
            self.mapping = None;
            return RequestStatus::File;
        }
        match MappedFile::open(&real_file, len) {
            Ok(map) => {
                self.mapping = Some(map);
                RequestStatus::File
            }
            Err(_) => RequestStatus::Internal,
        }
    }

    /// Extracts `user` and `password` fields from a form-encoded body.
    fn form_credentials(&self) -> Option<(String, String)> {
        let body = std::str::from_utf8(self.body_bytes()?).ok()?;
        let mut user = None;
        let mut password = None;
        for pair in body.split('&') {
            if let Some(v) = pair.strip_prefix("user=") {
                user = Some(v.to_string());
            } else if let Some(v) = pair.strip_prefix("password=") {
                password = Some(v.to_string());
            }
        }
        Some((user?, password?))
    }

    // ---- Response construction ----

    fn add_response(&mut self, args: std::fmt::Arguments<'_>) -> bool {
        if self.write_idx >= WRITE_BUFFER_SIZE {
            return false;
        }
        let text = args.to_string();
        if self.write_idx + text.len() > WRITE_BUFFER_SIZE {
            // Overflow leaves the buffer untouched; the caller sees a clean
            // failure, never a truncated response.
            return false;
        }
        self.write_buf[self.write_idx..self.write_idx + text.len()]
            .copy_from_slice(text.as_bytes());
        self.write_idx += text.len();
        true
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.add_response(format_args!("HTTP/1.1 {} {}\r\n", status, title))
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        self.add_content_length(content_len)
            && self.add_content_type()
            && self.add_date()
            && self.add_linger()
            && self.add_blank_line()
    }

    fn add_content_length(&mut self, content_len: usize) -> bool {
        self.add_response(format_args!("Content-Length: {}\r\n", content_len))
    }

    fn add_content_type(&mut self) -> bool {
        self.add_response(format_args!("Content-Type: {}\r\n", "text/html"))
    }

    fn add_date(&mut self) -> bool {
        self.add_response(format_args!(
            "Date: {}\r\n",
            httpdate::fmt_http_date(SystemTime::now())
        ))
    }

    fn add_linger(&mut self) -> bool {
        self.add_response(format_args!(
            "Connection: {}\r\n",
            if self.keep_alive { "keep-alive" } else { "close" }
        ))
    }

    fn add_blank_line(&mut self) -> bool {
        self.add_response(format_args!("\r\n"))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{}", content))
    }

    fn process_write(&mut self, status: RequestStatus) -> bool {
        let ok = match status {
            RequestStatus::File => {
                if !self.add_status_line(200, http::STATUS_200_TITLE) {
                    return false;
                }
                match self.mapping.as_ref().map(|m| m.len()) {
                    Some(len) => {
                        if !self.add_headers(len) {
                            return false;
                        }
                        // Header segment + mapped segment.
                        self.bytes_to_send = self.write_idx + len;
                        self.bytes_have_send = 0;
                        return true;
                    }
                    None => {
                        self.add_headers(http::EMPTY_FILE_BODY.len())
                            && self.add_content(http::EMPTY_FILE_BODY)
                    }
                }
            }
            RequestStatus::BadRequest => {
                // Error responses always close, whatever the client asked.
                self.keep_alive = false;
                self.add_status_line(400, http::STATUS_400_TITLE)
                    && self.add_headers(http::STATUS_400_FORM.len())
                    && self.add_content(http::STATUS_400_FORM)
            }
            RequestStatus::NotFound => {
                self.keep_alive = false;
                self.add_status_line(404, http::STATUS_404_TITLE)
                    && self.add_headers(http::STATUS_404_FORM.len())
                    && self.add_content(http::STATUS_404_FORM)
            }
            RequestStatus::Forbidden => {
                self.keep_alive = false;
                self.add_status_line(403, http::STATUS_403_TITLE)
                    && self.add_headers(http::STATUS_403_FORM.len())
                    && self.add_content(http::STATUS_403_FORM)
            }
            RequestStatus::Internal => {
                self.keep_alive = false;
                self.add_status_line(500, http::STATUS_500_TITLE)
                    && self.add_headers(http::STATUS_500_FORM.len())
                    && self.add_content(http::STATUS_500_FORM)
            }
        };
        if !ok {
            return false;
        }
        self.bytes_to_send = self.write_idx;
        self.bytes_have_send = 0;
        true
    }

    /// Parses buffered bytes and, when a full request is present, resolves
    /// it and populates the response buffer. The store handle is only
    /// touched for form submissions.
    pub fn process(
        &mut self,
        routes: &RouteTable,
        store: Option<&mut dyn CredentialStore>,
    ) -> ProcessResult {
        match self.process_read() {
            ParseStatus::Incomplete => ProcessResult::NeedRead,
            ParseStatus::Malformed => {
                if self.process_write(RequestStatus::BadRequest) {
                    ProcessResult::NeedWrite
                } else {
                    ProcessResult::Close
                }
            }
            ParseStatus::Ready => {
                debug!(
                    "request {} {} from {:?}",
                    self.method.as_str(),
                    self.path,
                    self.peer
                );
                let status = self.do_request(routes, store);
                if self.process_write(status) {
                    ProcessResult::NeedWrite
                } else {
                    self.mapping = None;
                    ProcessResult::Close
                }
            }
        }
    }

    // ---- Output ----

    /// Current scatter segments, derived from the send counters so partial
    /// writes resume at exact byte offsets.
    fn segments(&self) -> ([&[u8]; 2], usize) {
        let header_sent = self.bytes_have_send.min(self.write_idx);
        let seg0: &[u8] = &self.write_buf[header_sent..self.write_idx];
        let file_sent = self.bytes_have_send.saturating_sub(self.write_idx);
        let seg1: &[u8] = match &self.mapping {
            Some(map) => &map.as_slice()[file_sent..],
            None => &[],
        };
        let count = 1 + usize::from(!seg1.is_empty());
        ([seg0, seg1], count)
    }

    /// Scatter-writes the pending response. Each call pushes as much as the
    /// transport accepts and preserves offsets across would-block.
    pub fn flush(&mut self) -> FlushResult {
        if self.bytes_to_send == 0 {
            // Spurious write readiness with nothing pending: rotate back to
            // reading.
            self.reset();
            return FlushResult::KeepAlive;
        }
        loop {
            let (bufs, count) = self.segments();
            let step = syscalls::writev_step(self.fd, &bufs[..count]);
            match step {
                Ok(IoStep::Done(n)) if n > 0 => {
                    self.bytes_have_send += n;
                    self.bytes_to_send -= n;
                    if self.bytes_to_send == 0 {
                        self.mapping = None;
                        if self.keep_alive {
                            self.reset();
                            return FlushResult::KeepAlive;
                        }
                        return FlushResult::Close;
                    }
                }
                Ok(IoStep::Done(_)) | Ok(IoStep::WouldBlock) => return FlushResult::Again,
                Ok(IoStep::Closed) | Err(_) => {
                    self.mapping = None;
                    return FlushResult::Error;
                }
            }
        }
    }

    pub fn bytes_pending(&self) -> usize {
        self.bytes_to_send
    }

    pub fn has_mapping(&self) -> bool {
        self.mapping.is_some()
    }

    #[cfg(test)]
    pub(crate) fn parser_snapshot(&self) -> (Method, String, bool, usize, Option<String>, Vec<u8>) {
        (
            self.method,
            self.path.clone(),
            self.keep_alive,
            self.content_length,
            self.host.clone(),
            self.body_bytes().unwrap_or(&[]).to_vec(),
        )
    }

    #[cfg(test)]
    pub(crate) fn written_header(&self) -> &[u8] {
        &self.write_buf[..self.write_idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::io::Write as _;
    use std::path::PathBuf;

    fn test_config(doc_root: Option<PathBuf>) -> Arc<ServerConfig> {
        let mut cfg = ServerConfig::default();
        if let Some(root) = doc_root {
            cfg.doc_root = root;
        }
        Arc::new(cfg)
    }

    fn detached() -> Connection {
        Connection::detached(test_config(None))
    }

    fn temp_docroot(tag: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("petrel-conn-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for (name, bytes) in files {
            let path = dir.join(name);
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(bytes).unwrap();
            let mut perms = f.metadata().unwrap().permissions();
            perms.set_mode(0o644);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        dir
    }

    const GET_REQUEST: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: example.test\r\nConnection: keep-alive\r\n\r\n";

    #[test]
    fn parses_get_request_whole() {
        let mut conn = detached();
        assert!(conn.ingest(GET_REQUEST));
        assert_eq!(conn.process_read(), ParseStatus::Ready);
        assert_eq!(conn.method(), Method::Get);
        assert_eq!(conn.path(), "/index.html");
        assert_eq!(conn.host(), Some("example.test"));
        assert!(conn.keep_alive());
    }

    #[test]
    fn fragmentation_does_not_change_the_outcome() {
        let mut whole = detached();
        assert!(whole.ingest(GET_REQUEST));
        assert_eq!(whole.process_read(), ParseStatus::Ready);

        let mut split = detached();
        for (i, byte) in GET_REQUEST.iter().enumerate() {
            assert!(split.ingest(&[*byte]));
            let status = split.process_read();
            if i + 1 < GET_REQUEST.len() {
                assert_eq!(status, ParseStatus::Incomplete, "byte {}", i);
            } else {
                assert_eq!(status, ParseStatus::Ready);
            }
        }
        assert_eq!(split.parser_snapshot(), whole.parser_snapshot());
    }

    #[test]
    fn bare_slash_maps_to_default_document() {
        let mut conn = detached();
        assert!(conn.ingest(b"GET / HTTP/1.1\r\n\r\n"));
        assert_eq!(conn.process_read(), ParseStatus::Ready);
        assert_eq!(conn.path(), "/judge.html");
    }

    #[test]
    fn absolute_uri_is_stripped_to_its_path() {
        let mut conn = detached();
        assert!(conn.ingest(b"GET http://example.test/pic.html HTTP/1.1\r\n\r\n"));
        assert_eq!(conn.process_read(), ParseStatus::Ready);
        assert_eq!(conn.path(), "/pic.html");
    }

    #[test]
    fn rejects_http_1_0() {
        let mut conn = detached();
        assert!(conn.ingest(b"GET / HTTP/1.0\r\n\r\n"));
        assert_eq!(conn.process_read(), ParseStatus::Malformed);
    }

    #[test]
    fn rejects_unsupported_method() {
        let mut conn = detached();
        assert!(conn.ingest(b"PUT /a HTTP/1.1\r\n\r\n"));
        assert_eq!(conn.process_read(), ParseStatus::Malformed);
    }

    #[test]
    fn rejects_bare_lf_line_ending() {
        let mut conn = detached();
        assert!(conn.ingest(b"GET / HTTP/1.1\n\r\n"));
        assert_eq!(conn.process_read(), ParseStatus::Malformed);
    }

    #[test]
    fn trailing_cr_waits_for_the_line_feed() {
        let mut conn = detached();
        assert!(conn.ingest(b"GET / HTTP/1.1\r"));
        assert_eq!(conn.process_read(), ParseStatus::Incomplete);
        assert!(conn.ingest(b"\n\r\n"));
        assert_eq!(conn.process_read(), ParseStatus::Ready);
    }

    #[test]
    fn post_body_completes_only_when_fully_buffered() {
        let mut conn = detached();
        assert!(conn.ingest(
            b"POST /form HTTP/1.1\r\nContent-Length: 26\r\n\r\nuser=alice&pas"
        ));
        assert_eq!(conn.process_read(), ParseStatus::Incomplete);
        assert!(conn.ingest(b"sword=secret"));
        assert_eq!(conn.process_read(), ParseStatus::Ready);
        assert_eq!(conn.body_bytes(), Some(&b"user=alice&password=secret"[..]));
    }

    #[test]
    fn unknown_headers_are_ignored() {
        let mut conn = detached();
        assert!(conn.ingest(b"GET /a HTTP/1.1\r\nX-Whatever: 1\r\nHost: h\r\n\r\n"));
        assert_eq!(conn.process_read(), ParseStatus::Ready);
        assert_eq!(conn.host(), Some("h"));
    }

    #[test]
    fn missing_file_yields_404_and_drops_keep_alive() {
        let root = temp_docroot("missing", &[]);
        let mut conn = Connection::detached(test_config(Some(root)));
        assert!(conn.ingest(b"GET /nope.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n"));
        let routes = RouteTable::standard();
        assert_eq!(conn.process(&routes, None), ProcessResult::NeedWrite);
        let header = std::str::from_utf8(conn.written_header()).unwrap();
        assert!(header.starts_with("HTTP/1.1 404"));
        assert!(header.contains("Connection: close"));
        assert!(!conn.keep_alive());
    }

    #[test]
    fn directory_target_yields_400() {
        let root = temp_docroot("dir", &[]);
        std::fs::create_dir_all(root.join("sub")).unwrap();
        let mut conn = Connection::detached(test_config(Some(root)));
        assert!(conn.ingest(b"GET /sub HTTP/1.1\r\n\r\n"));
        let routes = RouteTable::standard();
        assert_eq!(conn.process(&routes, None), ProcessResult::NeedWrite);
        let header = std::str::from_utf8(conn.written_header()).unwrap();
        assert!(header.starts_with("HTTP/1.1 400"));
    }

    #[test]
    fn login_routes_to_welcome_on_match() {
        let root = temp_docroot("login", &[("welcome.html", b"<html>hi</html>")]);
        let mut conn = Connection::detached(test_config(Some(root)));
        assert!(conn.ingest(
            b"POST /2submit HTTP/1.1\r\nContent-Length: 26\r\n\r\nuser=alice&password=secret"
        ));
        let mut store = MemoryStore::new();
        store.insert("alice", "secret");
        let routes = RouteTable::standard();
        assert_eq!(
            conn.process(&routes, Some(&mut store)),
            ProcessResult::NeedWrite
        );
        assert_eq!(conn.path(), "/welcome.html");
        let header = std::str::from_utf8(conn.written_header()).unwrap();
        assert!(header.starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn register_rejects_duplicate_user() {
        let root = temp_docroot("register", &[("registerError.html", b"<html>no</html>")]);
        let mut conn = Connection::detached(test_config(Some(root)));
        assert!(conn.ingest(
            b"POST /3submit HTTP/1.1\r\nContent-Length: 26\r\n\r\nuser=alice&password=secret"
        ));
        let mut store = MemoryStore::new();
        store.insert("alice", "other");
        let routes = RouteTable::standard();
        assert_eq!(
            conn.process(&routes, Some(&mut store)),
            ProcessResult::NeedWrite
        );
        assert_eq!(conn.path(), "/registerError.html");
    }

    #[test]
    fn zero_length_file_gets_the_substitute_body() {
        let root = temp_docroot("empty", &[("empty.html", b"")]);
        let mut conn = Connection::detached(test_config(Some(root)));
        assert!(conn.ingest(b"GET /empty.html HTTP/1.1\r\n\r\n"));
        let routes = RouteTable::standard();
        assert_eq!(conn.process(&routes, None), ProcessResult::NeedWrite);
        assert!(!conn.has_mapping());
        let header = std::str::from_utf8(conn.written_header()).unwrap();
        assert!(header.contains(http::EMPTY_FILE_BODY));
        assert!(header.contains(&format!("Content-Length: {}", http::EMPTY_FILE_BODY.len())));
    }

    #[test]
    fn reset_returns_the_parser_to_its_initial_state() {
        let mut conn = detached();
        assert!(conn.ingest(GET_REQUEST));
        assert_eq!(conn.process_read(), ParseStatus::Ready);
        conn.reset();
        conn.reset();
        assert!(conn.ingest(b"GET /other.html HTTP/1.1\r\n\r\n"));
        assert_eq!(conn.process_read(), ParseStatus::Ready);
        assert_eq!(conn.path(), "/other.html");
        assert!(!conn.keep_alive());
        assert_eq!(conn.host(), None);
    }

    fn nonblocking_socketpair() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn drain(fd: i32, into: &mut Vec<u8>) {
        let mut buf = [0u8; 4096];
        loop {
            match syscalls::read_step(fd, &mut buf) {
                Ok(IoStep::Done(n)) => into.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
    }

    fn send(fd: i32, bytes: &[u8]) {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        assert_eq!(n, bytes.len() as isize);
    }

    #[test]
    fn edge_feed_drains_the_socket_in_one_call() {
        let (server_fd, client_fd) = nonblocking_socketpair();
        let peer: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut conn = Connection::new(server_fd, peer, test_config(None));

        send(client_fd, b"GET /a HTTP/1.1\r\nConnection: ");
        send(client_fd, b"keep-alive\r\n\r\n");
        assert!(conn.feed(TriggerMode::Edge));
        assert_eq!(conn.process_read(), ParseStatus::Ready);
        assert_eq!(conn.path(), "/a");
        assert!(conn.keep_alive());

        syscalls::close_fd(server_fd);
        syscalls::close_fd(client_fd);
    }

    #[test]
    fn edge_feed_rejects_an_overlong_request() {
        let (server_fd, client_fd) = nonblocking_socketpair();
        let peer: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut conn = Connection::new(server_fd, peer, test_config(None));

        let junk = vec![b'a'; READ_BUFFER_SIZE + 1];
        send(client_fd, &junk);
        // The buffer fills before the socket runs dry.
        assert!(!conn.feed(TriggerMode::Edge));

        syscalls::close_fd(server_fd);
        syscalls::close_fd(client_fd);
    }

    #[test]
    fn flush_resumes_across_would_block_and_releases_the_mapping() {
        // A payload well past the socket buffer forces several partial
        // writes before the response completes.
        let payload: Vec<u8> = (0..400_000usize).map(|i| (i % 251) as u8).collect();
        let root = temp_docroot("flush", &[("big.bin", &payload)]);
        let (server_fd, client_fd) = nonblocking_socketpair();

        let peer: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut conn = Connection::new(server_fd, peer, test_config(Some(root)));
        assert!(conn.ingest(b"GET /big.bin HTTP/1.1\r\n\r\n"));
        let routes = RouteTable::standard();
        assert_eq!(conn.process(&routes, None), ProcessResult::NeedWrite);
        assert!(conn.has_mapping());

        let mut received = Vec::new();
        let outcome = loop {
            match conn.flush() {
                FlushResult::Again => drain(client_fd, &mut received),
                other => break other,
            }
        };
        drain(client_fd, &mut received);

        assert_eq!(outcome, FlushResult::Close);
        assert_eq!(conn.bytes_pending(), 0);
        assert!(!conn.has_mapping());
        let header_end = received
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap()
            + 4;
        assert!(received.starts_with(b"HTTP/1.1 200"));
        assert_eq!(&received[header_end..], &payload[..]);

        syscalls::close_fd(server_fd);
        syscalls::close_fd(client_fd);
    }

    #[test]
    fn keep_alive_flush_resets_for_the_next_request() {
        let root = temp_docroot("ka", &[("page.html", b"<html>page</html>")]);
        let (server_fd, client_fd) = nonblocking_socketpair();
        let peer: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut conn = Connection::new(server_fd, peer, test_config(Some(root)));

        assert!(conn.ingest(b"GET /page.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n"));
        let routes = RouteTable::standard();
        assert_eq!(conn.process(&routes, None), ProcessResult::NeedWrite);
        assert_eq!(conn.flush(), FlushResult::KeepAlive);
        assert_eq!(conn.bytes_pending(), 0);

        // The engine is ready for a second request on the same socket.
        assert!(conn.ingest(b"GET /page.html HTTP/1.1\r\n\r\n"));
        assert_eq!(conn.process(&routes, None), ProcessResult::NeedWrite);
        assert_eq!(conn.flush(), FlushResult::Close);

        let mut received = Vec::new();
        drain(client_fd, &mut received);
        let responses = received
            .windows(12)
            .filter(|w| *w == b"HTTP/1.1 200")
            .count();
        assert_eq!(responses, 2);

        syscalls::close_fd(server_fd);
        syscalls::close_fd(client_fd);
    }

    #[test]
    fn claim_is_exclusive_and_close_is_once() {
        let handle = ConnHandle::new(3, detached());
        assert_eq!(handle.token(), 3);
        assert!(handle.claim());
        assert!(!handle.claim());
        handle.release_claim();
        assert!(handle.claim());
        assert!(handle.mark_closed());
        assert!(!handle.mark_closed());
        assert!(handle.is_closed());
    }
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    if line.len() >= name.len() && line[..name.len()].eq_ignore_ascii_case(name) {
        Some(line[name.len()..].trim_start_matches([' ', '\t']))
    } else {
        None
    }
}

/// Shared per-connection cell. The mutex serializes access to the engine
/// (uncontended in practice: the one-shot re-arm discipline admits one task
/// per connection at a time); the atomics arbitrate between an in-flight
/// worker and a concurrent timer eviction.
pub struct ConnHandle {
    token: usize,
    fd: i32,
    in_flight: AtomicBool,
    closed: AtomicBool,
    conn: Mutex<Box<dyn Engine>>,
}

impl ConnHandle {
    pub fn new(token: usize, conn: Connection) -> Self {
        let fd = conn.fd();
        Self {
            token,
            fd,
            in_flight: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            conn: Mutex::new(Box::new(conn)),
        }
    }

    pub fn token(&self) -> usize {
        self.token
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Engine>> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims the connection for exclusive processing or eviction. The
    /// reactor claims before dispatch; the timer tick claims before
    /// evicting. A failed claim means someone else holds the connection.
    pub fn claim(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_claim(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Marks the handle closed. Returns true exactly once, so teardown is
    /// idempotent.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
