// Copyright 2026 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The IPC server and the event loop it shares with the storage client.
//!
//! A single thread multiplexes the unix listener, every accepted session,
//! the HTTP engine's sockets, the engine's timer, and the idle timer that
//! supervises the whole process. All callbacks run serialised on this
//! thread; nothing blocks.

use mio::event::Event;
use mio::net::UnixListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use crate::config::Config;
use crate::protocol::{self, ParseError, Request};
use crate::session::Session;
use crate::storage::{StorageClient, StorageResponse, StorageResult, CURL_SOCKET_BASE};

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const LISTENER: Token = Token(usize::MAX);
const NEVENT: usize = 1024;

pub struct Server {
    config: Arc<Config>,
    poll: Poll,
    listener: UnixListener,
    sessions: Slab<Session>,
    pub(crate) storage: StorageClient,
    idle_deadline: Option<Instant>,
    next_session_id: u64,
    running: bool,
}

impl Server {
    /// Bind the IPC endpoint and initialise the storage client. Any error
    /// here is fatal to startup.
    pub fn new(config: Arc<Config>) -> Result<Self, std::io::Error> {
        let storage = StorageClient::new(config.clone()).map_err(|e| {
            error!("failed to initialize storage client: {}", e);
            std::io::Error::new(ErrorKind::Other, "failed to initialize storage client")
        })?;

        // a stale socket file from a previous run would make bind fail
        let _ = std::fs::remove_file(&config.ipc_endpoint);

        let mut listener = bind_restricted(&config.ipc_endpoint).map_err(|e| {
            error!("failed to bind to IPC endpoint: {}", e);
            e
        })?;

        let poll = Poll::new().map_err(|e| {
            error!("failed to create event loop: {}", e);
            e
        })?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|e| {
                error!("failed to register listener: {}", e);
                e
            })?;

        info!("IPC server listening on {}", config.ipc_endpoint);

        let mut server = Self {
            config,
            poll,
            listener,
            sessions: Slab::new(),
            storage,
            idle_deadline: None,
            next_session_id: 0,
            running: true,
        };
        server.reset_idle_timer();
        Ok(server)
    }

    /// Run the event loop until a STOP request is handled, the idle timer
    /// fires, or a protocol violation forces shutdown.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(NEVENT);

        while self.running {
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!("event loop error: {}", e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    token if token.0 >= CURL_SOCKET_BASE => {
                        if event.is_error() {
                            self.storage.socket_event(token, false, false, true);
                        } else {
                            self.storage.socket_event(
                                token,
                                event.is_readable(),
                                event.is_writable(),
                                false,
                            );
                        }
                        self.drive_storage();
                    }
                    token => self.handle_session_event(token, event),
                }
            }

            self.check_timers();
            self.drive_storage();
        }

        self.teardown();
    }

    /// Accept pending connections, greet each peer, and re-arm the idle
    /// timer.
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    self.reset_idle_timer();

                    let id = self.next_session_id;
                    self.next_session_id += 1;

                    let mut session = Session::new(stream, id);
                    session.send(protocol::greeting());
                    let _ = session.flush();

                    let entry = self.sessions.vacant_entry();
                    session.set_token(Token(entry.key()));
                    if session.register(&self.poll).is_ok() {
                        debug!("client connected");
                        entry.insert(session);
                    } else {
                        // a failed register is all-or-nothing for epoll, so
                        // there is nothing to deregister; dropping the
                        // session closes the stream
                        error!("failed to register client connection");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("connection error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_session_event(&mut self, token: Token, event: &Event) {
        if !self.sessions.contains(token.0) {
            trace!("event for non-existent session: {}", token.0);
            return;
        }
        if event.is_error() {
            self.close_session(token);
            return;
        }
        if event.is_writable() {
            self.do_write(token);
        }
        if event.is_readable() {
            self.do_read(token);
        }
    }

    fn do_read(&mut self, token: Token) {
        let result = match self.sessions.get_mut(token.0) {
            Some(session) => session.read(),
            None => return,
        };

        match result {
            Ok(0) => {}
            Ok(bytes) => {
                trace!("read {} bytes for session {}", bytes, token.0);
                self.reset_idle_timer();
                self.handle_data(token);
            }
            Err(e) => {
                debug!("read error: {}", e);
                self.close_session(token);
                return;
            }
        }

        // EOF is only acted on after buffered requests have been decoded
        if self
            .sessions
            .get(token.0)
            .map(|s| s.is_eof())
            .unwrap_or(false)
        {
            debug!("client disconnected");
            self.close_session(token);
        }
    }

    fn do_write(&mut self, token: Token) {
        let mut close = false;
        if let Some(session) = self.sessions.get_mut(token.0) {
            match session.flush() {
                Ok(()) => {
                    if !session.write_pending() {
                        // done writing, drop the writable interest
                        close = session.reregister(&self.poll).is_err();
                    }
                }
                Err(e) => {
                    debug!("write failed: {}", e);
                    close = true;
                }
            }
        }
        if close {
            self.close_session(token);
        }
    }

    /// Decode and dispatch every complete request in the session's
    /// accumulator.
    fn handle_data(&mut self, token: Token) {
        loop {
            if !self.running {
                return;
            }
            let request = match self.sessions.get_mut(token.0) {
                Some(session) => protocol::parse(&mut session.read_buffer),
                None => return,
            };
            match request {
                Ok(Request::Get { key }) => self.handle_get(token, &key),
                Ok(Request::Put {
                    key,
                    value,
                    overwrite,
                }) => self.handle_put(token, &key, value, overwrite),
                Ok(Request::Remove { key }) => self.handle_remove(token, &key),
                Ok(Request::Stop) => {
                    info!("STOP request received");
                    if let Some(id) = self.session_id(token) {
                        self.send(token, id, protocol::ok_response());
                    }
                    self.initiate_shutdown();
                    return;
                }
                Err(ParseError::Incomplete) => return,
                Err(ParseError::UnknownRequestType(t)) => {
                    // a corrupted frame stream cannot be resynchronised;
                    // shut down without responding
                    error!("unknown request type: {}", t);
                    self.initiate_shutdown();
                    return;
                }
            }
        }
    }

    fn handle_get(&mut self, token: Token, key: &[u8]) {
        let hex_key = protocol::format_hex(key);
        debug!("GET request for key {}", hex_key);
        let id = match self.session_id(token) {
            Some(id) => id,
            None => return,
        };
        self.storage.get(
            &hex_key,
            Box::new(move |server, response| {
                if response.result == StorageResult::Ok {
                    server.send(token, id, protocol::value_header(response.data.len() as u64));
                    server.send(token, id, response.data);
                } else {
                    server.send_simple_response(token, id, "GET", &response);
                }
            }),
        );
    }

    fn handle_put(&mut self, token: Token, key: &[u8], value: Vec<u8>, overwrite: bool) {
        let hex_key = protocol::format_hex(key);
        let id = match self.session_id(token) {
            Some(id) => id,
            None => return,
        };
        self.storage.put(
            hex_key,
            value,
            overwrite,
            Box::new(move |server, response| {
                server.send_simple_response(token, id, "PUT", &response);
            }),
        );
    }

    fn handle_remove(&mut self, token: Token, key: &[u8]) {
        let hex_key = protocol::format_hex(key);
        debug!("REMOVE request for key {}", hex_key);
        let id = match self.session_id(token) {
            Some(id) => id,
            None => return,
        };
        self.storage.remove(
            &hex_key,
            Box::new(move |server, response| {
                server.send_simple_response(token, id, "REMOVE", &response);
            }),
        );
    }

    fn send_simple_response(
        &mut self,
        token: Token,
        id: u64,
        operation: &str,
        response: &StorageResponse,
    ) {
        match response.result {
            StorageResult::Ok => self.send(token, id, protocol::ok_response()),
            StorageResult::Noop => self.send(token, id, protocol::noop_response()),
            StorageResult::Error => {
                error!("{} failed: {}", operation, response.error);
                self.send(token, id, protocol::error_response(&response.error));
            }
        }
    }

    /// Enqueue one response blob for a session and flush opportunistically.
    /// Responses for a session that has since closed (or whose slab key was
    /// reused) are dropped.
    fn send(&mut self, token: Token, id: u64, blob: Vec<u8>) {
        let mut close = false;
        if let Some(session) = self.sessions.get_mut(token.0) {
            if session.id() != id {
                trace!("dropping response for closed session");
                return;
            }
            session.send(blob);
            match session.flush() {
                Ok(()) => close = session.reregister(&self.poll).is_err(),
                Err(e) => {
                    debug!("write failed: {}", e);
                    close = true;
                }
            }
        } else {
            trace!("dropping response for closed session");
        }
        if close {
            self.close_session(token);
        }
    }

    fn session_id(&self, token: Token) -> Option<u64> {
        self.sessions.get(token.0).map(|s| s.id())
    }

    fn close_session(&mut self, token: Token) {
        if self.sessions.contains(token.0) {
            let mut session = self.sessions.remove(token.0);
            let _ = session.deregister(&self.poll);
            session.close();
        }
    }

    /// Process the storage client's completions and apply its queued
    /// socket/timer changes. Continuations may schedule follow-up transfers
    /// (conditional PUT), so completions are drained to a fixed point.
    fn drive_storage(&mut self) {
        loop {
            let completions = self.storage.take_completions();
            if completions.is_empty() {
                break;
            }
            for (callback, response) in completions {
                callback(self, response);
            }
        }
        self.storage.apply_io_updates(self.poll.registry());
    }

    fn check_timers(&mut self) {
        let now = Instant::now();
        if let Some(deadline) = self.idle_deadline {
            if now >= deadline {
                info!("idle timeout reached, shutting down");
                self.initiate_shutdown();
                return;
            }
        }
        if self.storage.timer_expired(now) {
            self.storage.handle_timeout();
        }
    }

    /// (Re)arm the idle timer; a zero timeout disables supervision
    fn reset_idle_timer(&mut self) {
        if self.config.idle_timeout_seconds > 0 {
            self.idle_deadline =
                Some(Instant::now() + Duration::from_secs(self.config.idle_timeout_seconds));
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        if self.storage.has_pending() {
            return Some(Duration::ZERO);
        }

        let mut next = self.idle_deadline;
        if let Some(deadline) = self.storage.next_deadline() {
            next = Some(next.map_or(deadline, |n| n.min(deadline)));
        }
        next.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn initiate_shutdown(&mut self) {
        info!("shutting down");
        self.running = false;
    }

    fn teardown(&mut self) {
        let _ = std::fs::remove_file(&self.config.ipc_endpoint);
        let tokens: Vec<Token> = self.sessions.iter().map(|(key, _)| Token(key)).collect();
        for token in tokens {
            self.close_session(token);
        }
        // in-flight transfers are released, without their continuations,
        // when the storage client drops
    }
}

// The socket file must not be world-accessible; bind under a restrictive
// creation mask.
fn bind_restricted<P: AsRef<Path>>(path: P) -> Result<UnixListener, std::io::Error> {
    let old_umask = unsafe { libc::umask(0o077) };
    let listener = UnixListener::bind(path);
    unsafe {
        libc::umask(old_umask);
    }
    listener
}
