// Copyright 2026 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Unix-stream session wrapper for one accepted cache client

use bytes::BytesMut;
use mio::net::UnixStream;
use mio::{Interest, Poll, Token};

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};

pub const MIN_BUFFER_SIZE: usize = 1024; // 1 KiB

/// A `Session` is the complete state of one accepted IPC connection: the
/// stream, the accumulator of not-yet-decoded request bytes, and the ordered
/// queue of response blobs awaiting transmission.
pub struct Session {
    token: Token,
    id: u64,
    stream: UnixStream,
    pub read_buffer: BytesMut,
    write_queue: VecDeque<Vec<u8>>,
    // offset of transmitted bytes within the front blob
    write_pos: usize,
    eof: bool,
    tmp_buffer: [u8; MIN_BUFFER_SIZE],
}

impl Session {
    pub fn new(stream: UnixStream, id: u64) -> Self {
        Self {
            token: Token(0),
            id,
            stream,
            read_buffer: BytesMut::with_capacity(MIN_BUFFER_SIZE),
            write_queue: VecDeque::new(),
            write_pos: 0,
            eof: false,
            tmp_buffer: [0; MIN_BUFFER_SIZE],
        }
    }

    /// Identity that survives slab-key reuse; completions arriving after this
    /// session closed must not be delivered to a successor on the same token.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_token(&mut self, token: Token) {
        self.token = token;
    }

    /// Register the `Session` with the event loop
    pub fn register(&mut self, poll: &Poll) -> Result<(), std::io::Error> {
        let interest = self.readiness();
        poll.registry()
            .register(&mut self.stream, self.token, interest)
    }

    /// Reregister the `Session` with the event loop
    pub fn reregister(&mut self, poll: &Poll) -> Result<(), std::io::Error> {
        let interest = self.readiness();
        poll.registry()
            .reregister(&mut self.stream, self.token, interest)
    }

    /// Deregister the `Session` from the event loop
    pub fn deregister(&mut self, poll: &Poll) -> Result<(), std::io::Error> {
        poll.registry().deregister(&mut self.stream)
    }

    /// Reads from the stream into the accumulator until the stream would
    /// block. A zero-length read marks the session as closed by the peer, but
    /// any bytes already buffered are still returned for decoding first.
    pub fn read(&mut self) -> Result<usize, std::io::Error> {
        let mut total_bytes = 0;
        loop {
            match self.stream.read(&mut self.tmp_buffer) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(bytes) => {
                    self.read_buffer.extend_from_slice(&self.tmp_buffer[0..bytes]);
                    total_bytes += bytes;
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    _ => {
                        trace!("error reading from session: {}", e);
                        return Err(e);
                    }
                },
            }
        }
        Ok(total_bytes)
    }

    /// True once the peer has closed its end of the stream
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Append one response blob to the write queue. Blobs are transmitted in
    /// the order they are enqueued.
    pub fn send(&mut self, blob: Vec<u8>) {
        self.write_queue.push_back(blob);
    }

    /// Flush queued blobs front-to-back until the queue is empty or the
    /// stream would block; a partial write leaves the cursor in the front
    /// blob so ordering is never disturbed.
    pub fn flush(&mut self) -> Result<(), std::io::Error> {
        while let Some(front) = self.write_queue.front() {
            // a drained (or empty) front blob needs no write; `write` with an
            // empty buffer reports 0, which is not an error
            if self.write_pos == front.len() {
                self.write_queue.pop_front();
                self.write_pos = 0;
                continue;
            }
            match self.stream.write(&front[self.write_pos..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "wrote zero bytes",
                    ));
                }
                Ok(bytes) => {
                    self.write_pos += bytes;
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    _ => return Err(e),
                },
            }
        }
        Ok(())
    }

    /// Return true if there are still blobs awaiting transmission
    pub fn write_pending(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Get the set of readiness events the session is waiting for
    fn readiness(&self) -> Interest {
        if self.write_queue.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    pub fn close(&mut self) {
        trace!("closing session");
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::net::UnixStream as StdUnixStream;

    fn pair() -> (Session, StdUnixStream) {
        let (a, b) = StdUnixStream::pair().expect("failed to create socket pair");
        a.set_nonblocking(true)
            .expect("failed to set non-blocking");
        (Session::new(UnixStream::from_std(a), 0), b)
    }

    #[test]
    fn blobs_flush_in_order() {
        let (mut session, mut peer) = pair();
        session.send(vec![0x00]);
        session.send(vec![0x01, 0x02]);
        session.send(vec![0x03]);
        session.flush().expect("flush failed");
        assert!(!session.write_pending());

        let mut received = [0u8; 4];
        peer.read_exact(&mut received).expect("read failed");
        assert_eq!(received, [0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn empty_blobs_are_popped_without_writing() {
        let (mut session, mut peer) = pair();
        session.send(vec![0x01]);
        session.send(Vec::new());
        session.send(vec![0x02]);
        session.flush().expect("flush failed");
        assert!(!session.write_pending());

        let mut received = [0u8; 2];
        peer.read_exact(&mut received).expect("read failed");
        assert_eq!(received, [0x01, 0x02]);
    }

    #[test]
    fn flush_of_only_an_empty_blob_succeeds() {
        // a zero-length value sent after its header blob must complete the
        // response rather than look like a failed write
        let (mut session, _peer) = pair();
        session.send(Vec::new());
        session.flush().expect("flush failed");
        assert!(!session.write_pending());
    }

    #[test]
    fn partial_write_resumes_mid_queue() {
        let (mut session, mut peer) = pair();

        // first blob is larger than the socket buffer, so flush() stalls on
        // WouldBlock with the second blob still queued
        let first: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let second = vec![0xee; 4096];
        session.send(first.clone());
        session.send(second.clone());

        session.flush().expect("flush failed");
        assert!(session.write_pending());

        // drain the peer between rounds of write readiness; the cursor must
        // resume mid-queue without reordering the blobs
        let mut received = Vec::new();
        let mut buf = [0u8; 65536];
        while received.len() < first.len() + second.len() {
            let bytes = peer.read(&mut buf).expect("read failed");
            assert!(bytes > 0);
            received.extend_from_slice(&buf[..bytes]);
            session.flush().expect("flush failed");
        }

        assert!(!session.write_pending());
        assert_eq!(&received[..first.len()], &first[..]);
        assert_eq!(&received[first.len()..], &second[..]);
    }

    #[test]
    fn read_accumulates() {
        let (mut session, mut peer) = pair();
        peer.write_all(&[0x01, 0x02]).expect("write failed");
        // wait for delivery; socketpairs are immediate but read is
        // non-blocking
        let bytes = session.read().expect("read failed");
        assert_eq!(bytes, 2);
        assert_eq!(&session.read_buffer[..], &[0x01, 0x02]);
        assert!(!session.is_eof());
    }

    #[test]
    fn read_detects_eof() {
        let (mut session, peer) = pair();
        drop(peer);
        let bytes = session.read().expect("read failed");
        assert_eq!(bytes, 0);
        assert!(session.is_eof());
    }

    #[test]
    fn data_before_eof_is_kept() {
        let (mut session, mut peer) = pair();
        peer.write_all(&[0x03]).expect("write failed");
        drop(peer);
        let bytes = session.read().expect("read failed");
        assert_eq!(bytes, 1);
        assert!(session.is_eof());
        assert_eq!(&session.read_buffer[..], &[0x03]);
    }
}
