//! Data-channel streaming with per-chunk acknowledgements.
//!
//! After negotiation the device opens a TCP connection back to the host
//! and the image is pushed as raw 1024-byte chunks:
//!
//! ```text
//! host                       device
//!  |  chunk (1024 bytes)  ->   |
//!  |  <-  short free-form ack  |
//!  |  ...                      |
//!  |  last chunk          ->   |
//!  |  <-  reply containing OK  |   (may arrive only after flashing)
//! ```
//!
//! Acknowledgements are free-form; only a reply containing `OK` counts
//! as confirmation. Many devices ack intermediate chunks with byte
//! counts and send the `OK` once the whole image is verified.

use log::{debug, trace, warn};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::is_interrupted_requested;
use crate::protocol::{CHUNK_ACK_MAX, CHUNK_SIZE, RESULT_REPLY_MAX};

/// Connection the image is streamed over.
///
/// `TcpStream` is the production implementation; tests substitute a
/// scripted double. The timeout applies to subsequent reads.
pub trait DataStream: Read + Write {
    /// Set the read timeout for subsequent reads.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl DataStream for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// Streaming configuration options.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Timeout for each per-chunk acknowledgement read.
    pub ack_timeout: Duration,
    /// Timeout for each result-phase read.
    pub result_timeout: Duration,
    /// Maximum result-phase reads before giving up.
    pub result_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            result_timeout: Duration::from_secs(30),
            result_attempts: 10,
        }
    }
}

/// How a completed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Device acknowledged the upload with a reply containing `OK`.
    Confirmed,
    /// Device spoke during the result phase but never said `OK`; carries
    /// its last words. Typically the device rebooted into the new image
    /// before flushing the confirmation.
    Degraded(String),
}

/// Streams an image over an accepted data connection.
pub struct StreamTransfer<'a, S: DataStream> {
    stream: &'a mut S,
    config: StreamConfig,
}

impl<'a, S: DataStream> StreamTransfer<'a, S> {
    /// Create a transfer with default timeouts.
    pub fn new(stream: &'a mut S) -> Self {
        Self {
            stream,
            config: StreamConfig::default(),
        }
    }

    /// Create a transfer with custom configuration.
    pub fn with_config(stream: &'a mut S, config: StreamConfig) -> Self {
        Self { stream, config }
    }

    /// Push `total` bytes from `source`, invoking `progress` with
    /// `(sent, total)` after every acknowledged chunk.
    pub fn transfer<R, F>(&mut self, source: &mut R, total: u64, mut progress: F) -> Result<StreamOutcome>
    where
        R: Read,
        F: FnMut(u64, u64),
    {
        debug!("Streaming {total} bytes in {CHUNK_SIZE}-byte chunks");
        self.stream.set_read_timeout(Some(self.config.ack_timeout))?;

        let mut chunk = [0u8; CHUNK_SIZE];
        let mut sent: u64 = 0;
        let mut last_reply = String::new();

        loop {
            if is_interrupted_requested() {
                return Err(Error::Interrupted);
            }

            let n = fill_chunk(source, &mut chunk)?;
            if n == 0 {
                break;
            }

            if let Err(e) = self.stream.write_all(&chunk[..n]) {
                return Err(Error::Transfer { sent, source: e });
            }
            if let Err(e) = self.stream.flush() {
                return Err(Error::Transfer { sent, source: e });
            }

            let mut ack = [0u8; CHUNK_ACK_MAX];
            last_reply = match self.stream.read(&mut ack) {
                Ok(got) => String::from_utf8_lossy(&ack[..got]).into_owned(),
                Err(e) => return Err(Error::Transfer { sent, source: e }),
            };
            trace!("Chunk ack: {last_reply:?}");

            sent += n as u64;
            progress(sent, total);
        }

        if last_reply.contains("OK") {
            debug!("Device confirmed the upload with the last chunk ack");
            return Ok(StreamOutcome::Confirmed);
        }

        self.wait_for_result()
    }

    /// Wait for the device's verdict after the last chunk.
    ///
    /// Devices flash and verify the image once the stream ends, so the
    /// `OK` can arrive long after the last chunk ack. Some firmware
    /// reboots without flushing it at all; anything the device said is
    /// reported as a degraded confirmation.
    fn wait_for_result(&mut self) -> Result<StreamOutcome> {
        debug!("Waiting for final confirmation...");
        self.stream.set_read_timeout(Some(self.config.result_timeout))?;

        let mut last_words: Option<String> = None;
        for attempt in 1..=self.config.result_attempts {
            if is_interrupted_requested() {
                return Err(Error::Interrupted);
            }

            let mut buf = [0u8; RESULT_REPLY_MAX];
            match self.stream.read(&mut buf) {
                Ok(0) => trace!("Result wait: connection closed (attempt {attempt})"),
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                    if text.contains("OK") {
                        debug!("Device confirmed the upload");
                        return Ok(StreamOutcome::Confirmed);
                    }
                    trace!("Result wait: {text:?} (attempt {attempt})");
                    last_words = Some(text);
                }
                Err(e) if is_timeout(&e) => trace!("Result wait: timeout (attempt {attempt})"),
                Err(e) => trace!("Result wait: {e} (attempt {attempt})"),
            }
        }

        match last_words {
            Some(text) => {
                warn!("Device never confirmed with OK; last reply: {text:?}");
                Ok(StreamOutcome::Degraded(text))
            }
            None => Err(Error::NoConfirmation),
        }
    }
}

/// Read until `buf` is full or the source is exhausted.
///
/// The device acknowledges per full chunk, so a short chunk anywhere but
/// the end of the image would stall both sides waiting for each other.
fn fill_chunk<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;

    /// One scripted reply unit for the mock connection.
    enum Reply {
        Data(&'static [u8]),
        Eof,
        ErrKind(io::ErrorKind),
    }

    /// Mock data connection: scripted reads, captured writes.
    ///
    /// Each `read` consumes one scripted reply, keeping the ack cadence
    /// explicit. An exhausted script behaves like a read timeout.
    struct MockStream {
        replies: VecDeque<Reply>,
        written: Vec<u8>,
        timeouts: Vec<Option<Duration>>,
        write_limit: Option<usize>,
    }

    impl MockStream {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: replies.into(),
                written: Vec::new(),
                timeouts: Vec::new(),
                write_limit: None,
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.replies.pop_front() {
                Some(Reply::Data(data)) => {
                    let n = buf.len().min(data.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Reply::Eof) => Ok(0),
                Some(Reply::ErrKind(kind)) => Err(io::Error::new(kind, "scripted failure")),
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(limit) = self.write_limit {
                if self.written.len() + buf.len() > limit {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"));
                }
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl DataStream for MockStream {
        fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
            self.timeouts.push(timeout);
            Ok(())
        }
    }

    fn short_config() -> StreamConfig {
        StreamConfig {
            ack_timeout: Duration::from_millis(100),
            result_timeout: Duration::from_millis(100),
            result_attempts: 3,
        }
    }

    #[test]
    fn test_transfer_exact_chunk_confirmed_by_last_ack() {
        let data = vec![0x42u8; CHUNK_SIZE];
        let mut stream = MockStream::new(vec![Reply::Data(b"OK")]);

        let mut progress_calls = 0;
        let outcome = StreamTransfer::with_config(&mut stream, short_config())
            .transfer(&mut Cursor::new(&data), data.len() as u64, |sent, total| {
                assert_eq!(total, CHUNK_SIZE as u64);
                assert_eq!(sent, CHUNK_SIZE as u64);
                progress_calls += 1;
            })
            .unwrap();

        assert_eq!(outcome, StreamOutcome::Confirmed);
        assert_eq!(stream.written, data);
        assert_eq!(progress_calls, 1);
    }

    #[test]
    fn test_transfer_multi_chunk_with_remainder() {
        // Two full chunks plus a 5-byte tail; devices often ack
        // intermediate chunks with plain byte counts.
        let data = vec![0xA5u8; CHUNK_SIZE * 2 + 5];
        let mut stream = MockStream::new(vec![
            Reply::Data(b"1024"),
            Reply::Data(b"1024"),
            Reply::Data(b"5 OK"),
        ]);

        let mut progress_log = Vec::new();
        let outcome = StreamTransfer::with_config(&mut stream, short_config())
            .transfer(&mut Cursor::new(&data), data.len() as u64, |sent, total| {
                progress_log.push((sent, total));
            })
            .unwrap();

        assert_eq!(outcome, StreamOutcome::Confirmed);
        assert_eq!(stream.written, data);
        let total = data.len() as u64;
        assert_eq!(
            progress_log,
            vec![(1024, total), (2048, total), (2053, total)]
        );
    }

    #[test]
    fn test_transfer_confirmed_during_result_wait() {
        // Last chunk acked with a byte count only; the OK arrives in the
        // result phase once the device finished flashing.
        let data = vec![0x11u8; CHUNK_SIZE];
        let mut stream = MockStream::new(vec![Reply::Data(b"1024"), Reply::Data(b"OK")]);

        let outcome = StreamTransfer::with_config(&mut stream, short_config())
            .transfer(&mut Cursor::new(&data), data.len() as u64, |_, _| {})
            .unwrap();

        assert_eq!(outcome, StreamOutcome::Confirmed);
        // One timeout for the ack phase, one for the result phase.
        assert_eq!(stream.timeouts.len(), 2);
        assert_eq!(stream.timeouts[0], Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_transfer_degraded_when_device_never_says_ok() {
        let data = vec![0x33u8; 100];
        let mut stream = MockStream::new(vec![
            Reply::Data(b"100"),
            Reply::Data(b"REBOOT"),
            Reply::Eof,
        ]);

        let outcome = StreamTransfer::with_config(&mut stream, short_config())
            .transfer(&mut Cursor::new(&data), data.len() as u64, |_, _| {})
            .unwrap();

        assert_eq!(outcome, StreamOutcome::Degraded("REBOOT".into()));
    }

    #[test]
    fn test_transfer_silent_result_phase_is_an_error() {
        let data = vec![0x33u8; 100];
        let mut stream = MockStream::new(vec![Reply::Data(b"100")]);

        let result = StreamTransfer::with_config(&mut stream, short_config())
            .transfer(&mut Cursor::new(&data), data.len() as u64, |_, _| {});

        assert!(matches!(result, Err(Error::NoConfirmation)));
    }

    #[test]
    fn test_transfer_ack_failure_is_fatal_with_offset() {
        // First chunk acked, then the connection resets. Mid-stream
        // failures never fall through to the result phase.
        let data = vec![0x7Eu8; CHUNK_SIZE * 2 + 10];
        let mut stream = MockStream::new(vec![
            Reply::Data(b"1024"),
            Reply::ErrKind(io::ErrorKind::ConnectionReset),
        ]);

        let result = StreamTransfer::with_config(&mut stream, short_config())
            .transfer(&mut Cursor::new(&data), data.len() as u64, |_, _| {});

        match result {
            Err(Error::Transfer { sent, .. }) => assert_eq!(sent, CHUNK_SIZE as u64),
            other => panic!("expected Transfer error, got {other:?}"),
        }
    }

    #[test]
    fn test_transfer_write_failure_is_fatal_with_offset() {
        let data = vec![0x55u8; CHUNK_SIZE * 2];
        let mut stream = MockStream::new(vec![Reply::Data(b"1024")]);
        stream.write_limit = Some(CHUNK_SIZE);

        let result = StreamTransfer::with_config(&mut stream, short_config())
            .transfer(&mut Cursor::new(&data), data.len() as u64, |_, _| {});

        match result {
            Err(Error::Transfer { sent, .. }) => assert_eq!(sent, CHUNK_SIZE as u64),
            other => panic!("expected Transfer error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_chunk_ack_keeps_streaming() {
        // A zero-byte ack read is recorded as empty and streaming
        // continues; the device closing early surfaces later.
        let data = vec![0x99u8; CHUNK_SIZE * 2];
        let mut stream = MockStream::new(vec![Reply::Eof, Reply::Data(b"OK")]);

        let outcome = StreamTransfer::with_config(&mut stream, short_config())
            .transfer(&mut Cursor::new(&data), data.len() as u64, |_, _| {})
            .unwrap();

        assert_eq!(outcome, StreamOutcome::Confirmed);
        assert_eq!(stream.written, data);
    }

    /// Reader that returns at most a few bytes per call.
    struct Dribble<'a> {
        data: &'a [u8],
        pos: usize,
    }

    impl Read for Dribble<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(7).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_fill_chunk_tolerates_short_reads() {
        let data: Vec<u8> = (0..20u8).collect();
        let mut source = Dribble {
            data: &data,
            pos: 0,
        };

        let mut buf = [0u8; 16];
        assert_eq!(fill_chunk(&mut source, &mut buf).unwrap(), 16);
        assert_eq!(&buf[..16], &data[..16]);
        assert_eq!(fill_chunk(&mut source, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &data[16..]);
        assert_eq!(fill_chunk(&mut source, &mut buf).unwrap(), 0);
    }
}
