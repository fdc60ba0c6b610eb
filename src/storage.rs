// Copyright 2026 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Non-blocking HTTP client for the remote store, multiplexing all transfers
//! over one `curl::multi::Multi` driven by the shared event loop.
//!
//! The multi handle reports socket interest and timer deadlines through its
//! callbacks; those arrive here over channels and are applied against the
//! loop's registry between ticks. The loop feeds readiness back through
//! [`StorageClient::socket_event`] and [`StorageClient::handle_timeout`] and
//! then drains completed transfers with [`StorageClient::take_completions`].

use curl::easy::{Easy2, Handler, HttpVersion, List, ReadError, WriteError};
use curl::multi::{Easy2Handle, Events, Multi, Socket};
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

use crate::config::{Config, UrlLayout};
use crate::server::Server;

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tokens at and above this value identify sockets owned by the HTTP engine;
/// the socket descriptor is recovered by subtracting the base.
pub(crate) const CURL_SOCKET_BASE: usize = usize::MAX >> 1;

const MAX_HOST_CONNECTIONS: usize = 16;
const MAX_CONNECTS: usize = 16;
const MAX_REDIRECTS: u32 = 5;
const SHA256_HEX_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageResult {
    Ok,
    Noop,
    Error,
}

#[derive(Debug)]
pub struct StorageResponse {
    pub result: StorageResult,
    pub error: String,
    pub data: Vec<u8>,
}

impl StorageResponse {
    fn ok(data: Vec<u8>) -> Self {
        Self {
            result: StorageResult::Ok,
            error: String::new(),
            data,
        }
    }

    fn noop() -> Self {
        Self {
            result: StorageResult::Noop,
            error: String::new(),
            data: Vec::new(),
        }
    }

    fn error(message: String) -> Self {
        Self {
            result: StorageResult::Error,
            error: message,
            data: Vec::new(),
        }
    }
}

/// Completion continuation: invoked exactly once, from the event loop, never
/// from within the call that scheduled the operation.
pub type StorageCallback = Box<dyn FnOnce(&mut Server, StorageResponse) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operation {
    Get,
    Head,
    Put,
    Delete,
}

/// Per-transfer state driven by libcurl's data callbacks: the upload payload
/// with its cursor, and the accumulated response body.
struct Transfer {
    upload: Vec<u8>,
    upload_pos: usize,
    response: Vec<u8>,
}

impl Transfer {
    fn new(upload: Vec<u8>) -> Self {
        Self {
            upload,
            upload_pos: 0,
            response: Vec::new(),
        }
    }
}

impl Handler for Transfer {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.response.extend_from_slice(data);
        Ok(data.len())
    }

    fn read(&mut self, into: &mut [u8]) -> Result<usize, ReadError> {
        let remaining = self.upload.len().saturating_sub(self.upload_pos);
        let to_copy = std::cmp::min(remaining, into.len());
        if to_copy > 0 {
            into[..to_copy]
                .copy_from_slice(&self.upload[self.upload_pos..self.upload_pos + to_copy]);
            self.upload_pos += to_copy;
        }
        Ok(to_copy)
    }
}

struct ActiveRequest {
    operation: Operation,
    url: String,
    handle: Easy2Handle<Transfer>,
    callback: StorageCallback,
}

/// Socket interest change reported by the multi handle's socket callback
struct SocketEvent {
    socket: Socket,
    readable: bool,
    writable: bool,
    remove: bool,
}

pub struct StorageClient {
    config: Arc<Config>,
    multi: Multi,
    requests: HashMap<usize, ActiveRequest>,
    next_token: usize,
    // sockets the engine asked the loop to observe, keyed by descriptor
    sockets: HashMap<Socket, Token>,
    socket_rx: Receiver<SocketEvent>,
    timer_rx: Receiver<Option<Duration>>,
    timer_deadline: Option<Instant>,
    // completions that must not run inside the scheduling call, e.g. handle
    // setup failures
    pending: Vec<(StorageCallback, StorageResponse)>,
}

// `curl::multi::Multi` and its handles hold raw `CURL*`/`CURLM*` pointers and
// are therefore not `Send` by default. The event loop design (see spec.md,
// "Scheduling") confines all access to a single thread for the lifetime of
// the client; nothing ever touches it concurrently, so moving the whole
// client to the thread that will run the loop is sound.
unsafe impl Send for StorageClient {}

impl StorageClient {
    pub fn new(config: Arc<Config>) -> Result<Self, curl::MultiError> {
        let mut multi = Multi::new();

        let (socket_tx, socket_rx) = channel();
        multi.socket_function(move |socket, events, _token| {
            let _ = socket_tx.send(SocketEvent {
                socket,
                readable: events.input(),
                writable: events.output(),
                remove: events.remove(),
            });
        })?;

        let (timer_tx, timer_rx) = channel();
        multi.timer_function(move |timeout| {
            let _ = timer_tx.send(timeout);
            true
        })?;

        multi.set_max_host_connections(MAX_HOST_CONNECTIONS)?;
        multi.set_max_connects(MAX_CONNECTS)?;

        Ok(Self {
            config,
            multi,
            requests: HashMap::new(),
            next_token: 0,
            sockets: HashMap::new(),
            socket_rx,
            timer_rx,
            timer_deadline: None,
            pending: Vec::new(),
        })
    }

    /// Fetch the value for a key. Resolves OK with the body, NOOP when the
    /// key does not exist, or ERROR.
    pub fn get(&mut self, hex_key: &str, callback: StorageCallback) {
        let url = build_url(&self.config, hex_key);
        debug!("GET {}", url);
        self.submit(Operation::Get, url, Vec::new(), callback);
    }

    /// Store a value. With `overwrite` the PUT is issued directly; otherwise
    /// a HEAD probe runs first and an already-present resource resolves NOOP
    /// without uploading anything.
    pub fn put(
        &mut self,
        hex_key: String,
        data: Vec<u8>,
        overwrite: bool,
        callback: StorageCallback,
    ) {
        debug!(
            "PUT {} ({} bytes, overwrite={})",
            hex_key,
            data.len(),
            overwrite
        );

        if overwrite {
            self.do_put(hex_key, data, callback);
            return;
        }

        let url = build_url(&self.config, &hex_key);
        let chained: StorageCallback = Box::new(move |server, response| match response.result {
            StorageResult::Noop => {
                debug!("HEAD check: resource doesn't exist, proceeding with PUT");
                server.storage.do_put(hex_key, data, callback);
            }
            StorageResult::Ok => {
                debug!("HEAD check: resource exists, not overwriting");
                callback(server, StorageResponse::noop());
            }
            StorageResult::Error => callback(server, response),
        });
        self.submit(Operation::Head, url, Vec::new(), chained);
    }

    fn do_put(&mut self, hex_key: String, data: Vec<u8>, callback: StorageCallback) {
        let url = build_url(&self.config, &hex_key);
        self.submit(Operation::Put, url, data, callback);
    }

    /// Delete a key. Resolves OK on 2xx, NOOP on 404, ERROR otherwise.
    pub fn remove(&mut self, hex_key: &str, callback: StorageCallback) {
        let url = build_url(&self.config, hex_key);
        debug!("DELETE {}", url);
        self.submit(Operation::Delete, url, Vec::new(), callback);
    }

    fn submit(
        &mut self,
        operation: Operation,
        url: String,
        upload: Vec<u8>,
        callback: StorageCallback,
    ) {
        let upload_len = upload.len() as u64;
        let mut easy = Easy2::new(Transfer::new(upload));

        if let Err(e) = configure_handle(&self.config, &mut easy, operation, &url, upload_len) {
            self.fail(callback, e.to_string());
            return;
        }

        let mut handle = match self.multi.add2(easy) {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(callback, e.to_string());
                return;
            }
        };

        let token = self.next_token;
        if let Err(e) = handle.set_token(token) {
            let _ = self.multi.remove2(handle);
            self.fail(callback, e.to_string());
            return;
        }
        self.next_token += 1;

        self.requests.insert(
            token,
            ActiveRequest {
                operation,
                url,
                handle,
                callback,
            },
        );
    }

    // Defer a failed submission to the next loop turn so the continuation
    // never runs inside the scheduling call.
    fn fail(&mut self, callback: StorageCallback, error: String) {
        error!("failed to start transfer: {}", error);
        self.pending.push((callback, StorageResponse::error(error)));
    }

    /// Apply queued socket-interest and timer changes from the engine against
    /// the loop's registry.
    pub fn apply_io_updates(&mut self, registry: &Registry) {
        while let Ok(event) = self.socket_rx.try_recv() {
            let fd = event.socket as RawFd;
            if event.remove {
                if self.sockets.remove(&event.socket).is_some() {
                    // the engine may already have closed the descriptor
                    let _ = registry.deregister(&mut SourceFd(&fd));
                    trace!("stopped polling socket {}", fd);
                }
            } else {
                let interest = match (event.readable, event.writable) {
                    (true, true) => Interest::READABLE | Interest::WRITABLE,
                    (false, true) => Interest::WRITABLE,
                    _ => Interest::READABLE,
                };
                let token = Token(CURL_SOCKET_BASE + event.socket as usize);
                if self.sockets.contains_key(&event.socket) {
                    if let Err(e) = registry.reregister(&mut SourceFd(&fd), token, interest) {
                        error!("failed to update socket poll: {}", e);
                    }
                } else {
                    match registry.register(&mut SourceFd(&fd), token, interest) {
                        Ok(()) => {
                            trace!("started polling socket {}", fd);
                            self.sockets.insert(event.socket, token);
                        }
                        Err(e) => error!("failed to start socket poll: {}", e),
                    }
                }
            }
        }

        while let Ok(timeout) = self.timer_rx.try_recv() {
            self.timer_deadline = timeout.map(|t| Instant::now() + t);
        }
    }

    /// Feed observed readiness for one engine socket back into the multi
    /// handle.
    pub fn socket_event(&mut self, token: Token, readable: bool, writable: bool, error: bool) {
        let socket = (token.0 - CURL_SOCKET_BASE) as Socket;
        if !self.sockets.contains_key(&socket) {
            trace!("readiness for vanished socket {}", socket);
            return;
        }

        let mut events = Events::new();
        if error {
            events.error(true);
        } else {
            events.input(readable);
            events.output(writable);
        }
        if let Err(e) = self.multi.action(socket, &events) {
            error!("socket action failed: {}", e);
        }
    }

    /// The engine's next timer deadline, if armed
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer_deadline
    }

    pub fn timer_expired(&self, now: Instant) -> bool {
        self.timer_deadline.map(|t| now >= t).unwrap_or(false)
    }

    /// Drive the engine's own timeout processing
    pub fn handle_timeout(&mut self) {
        self.timer_deadline = None;
        if let Err(e) = self.multi.timeout() {
            error!("multi timeout processing failed: {}", e);
        }
    }

    /// True when deferred completions are waiting and the loop should not
    /// block in poll
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Collect finished transfers. Each entry is removed from the registry
    /// and released before its continuation is handed back, so a
    /// continuation can never observe its own handle as active.
    pub fn take_completions(&mut self) -> Vec<(StorageCallback, StorageResponse)> {
        let mut finished: Vec<(usize, Option<String>)> = Vec::new();
        {
            let requests = &self.requests;
            self.multi.messages(|message| {
                if let Ok(token) = message.token() {
                    if let Some(request) = requests.get(&token) {
                        if let Some(result) = message.result_for2(&request.handle) {
                            let transport_error = result.err().map(|e| {
                                e.extra_description()
                                    .map(str::to_string)
                                    .unwrap_or_else(|| e.to_string())
                            });
                            finished.push((token, transport_error));
                        }
                    }
                }
            });
        }

        let mut completions = std::mem::take(&mut self.pending);
        for (token, transport_error) in finished {
            let request = match self.requests.remove(&token) {
                Some(request) => request,
                None => continue,
            };
            let ActiveRequest {
                operation,
                url,
                mut handle,
                callback,
            } = request;

            let response = match transport_error {
                Some(error) => {
                    error!("transfer error: {}", error);
                    StorageResponse::error(error)
                }
                None => {
                    let code = handle.response_code().unwrap_or(0);
                    debug!("request completed: {} HTTP {}", url, code);
                    match classify(operation, code) {
                        (StorageResult::Ok, _) => {
                            StorageResponse::ok(std::mem::take(&mut handle.get_mut().response))
                        }
                        // a 404 GET may carry an error page in its body; the
                        // peer must see an empty value
                        (StorageResult::Noop, _) => StorageResponse::noop(),
                        (StorageResult::Error, message) => {
                            StorageResponse::error(message.unwrap_or_default())
                        }
                    }
                }
            };

            if let Err(e) = self.multi.remove2(handle) {
                error!("failed to detach finished transfer: {}", e);
            }
            completions.push((callback, response));
        }
        completions
    }
}

impl Drop for StorageClient {
    fn drop(&mut self) {
        // release every in-flight transfer without running its continuation
        for (_, request) in self.requests.drain() {
            let _ = self.multi.remove2(request.handle);
        }
    }
}

fn configure_handle(
    config: &Config,
    easy: &mut Easy2<Transfer>,
    operation: Operation,
    url: &str,
    upload_len: u64,
) -> Result<(), curl::Error> {
    easy.expect_100_timeout(Duration::from_millis(0))?;
    easy.follow_location(true)?;
    easy.http_version(HttpVersion::V2TLS)?;
    easy.max_redirections(MAX_REDIRECTS)?;
    easy.signal(false)?;
    easy.tcp_keepalive(true)?;
    easy.url(url)?;

    match operation {
        Operation::Get => easy.get(true)?,
        Operation::Head => easy.nobody(true)?,
        Operation::Put => {
            easy.upload(true)?;
            easy.in_filesize(upload_len)?;
        }
        Operation::Delete => easy.custom_request("DELETE")?,
    }

    if config.bearer_token.is_some() || !config.headers.is_empty() {
        let mut headers = List::new();
        if let Some(token) = &config.bearer_token {
            headers.append(&format!("Authorization: Bearer {}", token))?;
        }
        for (name, value) in &config.headers {
            headers.append(&format!("{}: {}", name, value))?;
        }
        easy.http_headers(headers)?;
    }

    Ok(())
}

/// Map a hex key onto the configured URL layout under the origin. The origin
/// is normalised to end with a single `/`.
fn build_url(config: &Config, hex_key: &str) -> String {
    let mut url = config.url.clone();
    if !url.ends_with('/') {
        url.push('/');
    }

    match config.layout {
        UrlLayout::Bazel => {
            // action-cache entries are addressed by a SHA-256 sized hex
            // string; shorter keys are padded by cycling their own prefix
            url.push_str("ac/");
            if hex_key.len() >= SHA256_HEX_SIZE {
                url.push_str(&hex_key[..SHA256_HEX_SIZE]);
            } else {
                url.extend(hex_key.chars().cycle().take(SHA256_HEX_SIZE));
            }
        }
        UrlLayout::Flat => {
            url.push_str(hex_key);
        }
        UrlLayout::Subdirs => {
            if hex_key.len() >= 2 {
                url.push_str(&hex_key[..2]);
                url.push('/');
                url.push_str(&hex_key[2..]);
            } else {
                url.push_str(hex_key);
            }
        }
    }

    url
}

fn classify(operation: Operation, code: u32) -> (StorageResult, Option<String>) {
    let result = match operation {
        Operation::Get | Operation::Head | Operation::Delete => match code {
            200..=299 => StorageResult::Ok,
            404 => StorageResult::Noop,
            _ => StorageResult::Error,
        },
        Operation::Put => match code {
            200..=299 => StorageResult::Ok,
            409 | 412 => StorageResult::Noop,
            _ => StorageResult::Error,
        },
    };

    match result {
        StorageResult::Error => (result, Some(format!("HTTP {}", code))),
        _ => (result, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str, layout: UrlLayout) -> Config {
        Config {
            ipc_endpoint: String::new(),
            url: url.to_string(),
            idle_timeout_seconds: 0,
            bearer_token: None,
            layout,
            headers: Vec::new(),
        }
    }

    #[test]
    fn url_subdirs() {
        let c = config("https://c.example/", UrlLayout::Subdirs);
        assert_eq!(build_url(&c, "abcdef"), "https://c.example/ab/cdef");
        assert_eq!(build_url(&c, "ab"), "https://c.example/ab/");
        assert_eq!(build_url(&c, "a"), "https://c.example/a");
        assert_eq!(build_url(&c, ""), "https://c.example/");
    }

    #[test]
    fn url_flat() {
        let c = config("https://c.example/", UrlLayout::Flat);
        assert_eq!(build_url(&c, "abcdef"), "https://c.example/abcdef");
    }

    #[test]
    fn url_origin_normalised() {
        let c = config("https://c.example", UrlLayout::Flat);
        assert_eq!(build_url(&c, "ab"), "https://c.example/ab");
    }

    #[test]
    fn url_bazel_long_key_truncated() {
        let c = config("https://c.example/", UrlLayout::Bazel);
        let key = "ab".repeat(40);
        let url = build_url(&c, &key);
        assert_eq!(url, format!("https://c.example/ac/{}", &key[..64]));
    }

    #[test]
    fn url_bazel_exact_key() {
        let c = config("https://c.example/", UrlLayout::Bazel);
        let key = "0f".repeat(32);
        assert_eq!(build_url(&c, &key), format!("https://c.example/ac/{}", key));
    }

    #[test]
    fn url_bazel_short_key_padded() {
        let c = config("https://c.example/", UrlLayout::Bazel);
        let url = build_url(&c, "0123456789");
        let padded = &"0123456789".repeat(7)[..64];
        assert_eq!(url, format!("https://c.example/ac/{}", padded));
        assert_eq!(url.len(), "https://c.example/ac/".len() + 64);
    }

    #[test]
    fn url_bazel_empty_key() {
        let c = config("https://c.example/", UrlLayout::Bazel);
        assert_eq!(build_url(&c, ""), "https://c.example/ac/");
    }

    #[test]
    fn classify_get() {
        assert_eq!(classify(Operation::Get, 200).0, StorageResult::Ok);
        assert_eq!(classify(Operation::Get, 206).0, StorageResult::Ok);
        assert_eq!(classify(Operation::Get, 404).0, StorageResult::Noop);
        assert_eq!(classify(Operation::Get, 409).0, StorageResult::Error);
        assert_eq!(classify(Operation::Get, 412).0, StorageResult::Error);
        let (result, message) = classify(Operation::Get, 500);
        assert_eq!(result, StorageResult::Error);
        assert_eq!(message.as_deref(), Some("HTTP 500"));
    }

    #[test]
    fn classify_head() {
        assert_eq!(classify(Operation::Head, 200).0, StorageResult::Ok);
        assert_eq!(classify(Operation::Head, 404).0, StorageResult::Noop);
        assert_eq!(classify(Operation::Head, 403).0, StorageResult::Error);
    }

    #[test]
    fn classify_put() {
        assert_eq!(classify(Operation::Put, 200).0, StorageResult::Ok);
        assert_eq!(classify(Operation::Put, 201).0, StorageResult::Ok);
        assert_eq!(classify(Operation::Put, 409).0, StorageResult::Noop);
        assert_eq!(classify(Operation::Put, 412).0, StorageResult::Noop);
        assert_eq!(classify(Operation::Put, 404).0, StorageResult::Error);
        assert_eq!(classify(Operation::Put, 500).0, StorageResult::Error);
    }

    #[test]
    fn classify_delete() {
        assert_eq!(classify(Operation::Delete, 204).0, StorageResult::Ok);
        assert_eq!(classify(Operation::Delete, 404).0, StorageResult::Noop);
        assert_eq!(classify(Operation::Delete, 500).0, StorageResult::Error);
    }

    #[test]
    fn transfer_read_cursor() {
        let mut transfer = Transfer::new(b"abcdef".to_vec());
        let mut buf = [0u8; 4];
        assert_eq!(transfer.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(transfer.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(transfer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn transfer_write_accumulates() {
        let mut transfer = Transfer::new(Vec::new());
        assert_eq!(transfer.write(b"hello ").unwrap(), 6);
        assert_eq!(transfer.write(b"world").unwrap(), 5);
        assert_eq!(transfer.response, b"hello world");
    }
}
