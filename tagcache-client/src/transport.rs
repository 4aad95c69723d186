//! # Buffered Transport
//!
//! Purpose: Line-delimited reads and coalesced writes over any byte stream,
//! with the offset bookkeeping hidden behind two small buffer types.
//!
//! ## Design Principles
//! 1. **Enforced Offsets**: `ReadBuffer` keeps `consumed <= filled <= capacity`
//!    private; callers only see `read_line`/`try_read_line`/`clear`.
//! 2. **Bounded Lines**: the read buffer grows up to a configured ceiling; a
//!    full buffer without a newline is a protocol error, not more allocation.
//! 3. **Coalesced Writes**: small frames accumulate in the write buffer;
//!    frames larger than the buffer bypass it after flushing what is queued.
//! 4. **Stream-Generic**: both buffers work on `Read`/`Write`, so tests drive
//!    them with in-memory streams.

use std::io::{self, ErrorKind, Read, Write};

use bytes::{Bytes, BytesMut};

use tagcache_common::{ProtocolError, TagCacheError, TagCacheResult};

/// Initial read buffer size; also the write coalescing window.
pub const DEFAULT_BUFFER_BYTES: usize = 8 * 1024;

/// Read side of a connection.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: Vec<u8>,
    consumed: usize,
    filled: usize,
    max_capacity: usize,
}

impl ReadBuffer {
    /// Creates a buffer that starts small and may grow to `max_capacity`.
    pub fn new(max_capacity: usize) -> Self {
        let initial = DEFAULT_BUFFER_BYTES.min(max_capacity).max(1);
        ReadBuffer {
            buf: vec![0u8; initial],
            consumed: 0,
            filled: 0,
            max_capacity: max_capacity.max(initial),
        }
    }

    /// Bytes received but not yet returned as lines.
    pub fn pending(&self) -> usize {
        self.filled - self.consumed
    }

    /// Drops buffered bytes, e.g. after a reconnect.
    pub fn clear(&mut self) {
        self.consumed = 0;
        self.filled = 0;
    }

    /// Reads one line (without its `\n`), blocking on the reader as needed.
    ///
    /// # Errors
    /// - `Io(UnexpectedEof)` when the peer closes the stream.
    /// - `Io` for read failures, including timeouts.
    /// - `Protocol(LineTooLong)` when no newline fits in the buffer.
    pub fn read_line<R: Read>(&mut self, reader: &mut R) -> TagCacheResult<Bytes> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            self.fill_from(reader)?;
        }
    }

    /// Like [`read_line`](Self::read_line) for non-blocking readers: returns
    /// `Ok(None)` as soon as the reader would block.
    pub fn try_read_line<R: Read>(&mut self, reader: &mut R) -> TagCacheResult<Option<Bytes>> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            match self.fill_from(reader) {
                Ok(()) => {}
                Err(TagCacheError::Io(err)) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err),
            }
        }
    }

    fn take_line(&mut self) -> Option<Bytes> {
        let window = &self.buf[self.consumed..self.filled];
        let pos = window.iter().position(|&b| b == b'\n')?;
        let line = Bytes::copy_from_slice(&window[..pos]);
        self.consumed += pos + 1;
        if self.consumed == self.filled {
            self.clear();
        }
        Some(line)
    }

    fn fill_from<R: Read>(&mut self, reader: &mut R) -> TagCacheResult<()> {
        self.compact();
        if self.filled == self.buf.len() {
            if self.buf.len() >= self.max_capacity {
                return Err(ProtocolError::LineTooLong {
                    capacity: self.max_capacity,
                }
                .into());
            }
            let grown = (self.buf.len() * 2).min(self.max_capacity);
            self.buf.resize(grown, 0);
        }
        loop {
            match reader.read(&mut self.buf[self.filled..]) {
                Ok(0) => {
                    return Err(io::Error::new(ErrorKind::UnexpectedEof, "connection closed by server").into());
                }
                Ok(n) => {
                    self.filled += n;
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Moves unread bytes to the start of the buffer.
    fn compact(&mut self) {
        if self.consumed == 0 {
            return;
        }
        self.buf.copy_within(self.consumed..self.filled, 0);
        self.filled -= self.consumed;
        self.consumed = 0;
    }
}

/// Write side of a connection.
#[derive(Debug)]
pub struct WriteBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        WriteBuffer {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes queued but not yet sent.
    pub fn used(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Queues a frame, flushing first when it would overflow the buffer.
    ///
    /// Frames larger than the buffer are sent directly.
    pub fn write_frame<W: Write>(&mut self, writer: &mut W, frame: &[u8]) -> TagCacheResult<()> {
        if frame.len() > self.capacity {
            self.flush(writer)?;
            send_all(writer, frame)?;
            return Ok(());
        }
        if self.buf.len() + frame.len() > self.capacity {
            self.flush(writer)?;
        }
        self.buf.extend_from_slice(frame);
        Ok(())
    }

    /// Sends everything queued. A no-op when nothing is queued.
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> TagCacheResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let result = send_all(writer, &self.buf);
        // After a failed send the stream position is unknown; nothing queued survives.
        self.buf.clear();
        result
    }
}

fn send_all<W: Write>(writer: &mut W, mut data: &[u8]) -> TagCacheResult<()> {
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => {
                return Err(io::Error::new(ErrorKind::WriteZero, "socket accepted no bytes").into());
            }
            Ok(n) => data = &data[n..],
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serves `data` in chunks of at most `chunk` bytes, then reports EOF or WouldBlock.
    struct ChunkedReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        would_block_at_end: bool,
    }

    impl ChunkedReader {
        fn new(data: &[u8], chunk: usize) -> Self {
            ChunkedReader {
                data: data.to_vec(),
                pos: 0,
                chunk,
                would_block_at_end: false,
            }
        }
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.data.len() {
                if self.would_block_at_end {
                    return Err(io::Error::new(ErrorKind::WouldBlock, "empty"));
                }
                return Ok(0);
            }
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Accepts at most `limit` bytes per write call and records everything.
    struct RecordingWriter {
        written: Vec<u8>,
        calls: usize,
        limit: usize,
        fail: bool,
    }

    impl RecordingWriter {
        fn new(limit: usize) -> Self {
            RecordingWriter {
                written: Vec::new(),
                calls: 0,
                limit,
                fail: false,
            }
        }
    }

    impl Write for RecordingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "closed"));
            }
            self.calls += 1;
            let n = self.limit.min(buf.len());
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reads_lines_across_partial_reads() {
        let mut reader = ChunkedReader::new(b"VALUE\thello\nNF\nOK\n", 3);
        let mut buf = ReadBuffer::new(64 * 1024);
        assert_eq!(&buf.read_line(&mut reader).unwrap()[..], b"VALUE\thello");
        assert_eq!(&buf.read_line(&mut reader).unwrap()[..], b"NF");
        assert_eq!(&buf.read_line(&mut reader).unwrap()[..], b"OK");
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn keeps_unread_bytes_between_calls() {
        let mut reader = ChunkedReader::new(b"A\nB\nC", 64);
        let mut buf = ReadBuffer::new(64 * 1024);
        assert_eq!(&buf.read_line(&mut reader).unwrap()[..], b"A");
        assert_eq!(buf.pending(), 3);
        assert_eq!(&buf.read_line(&mut reader).unwrap()[..], b"B");
        // "C" has no terminator and the stream ends.
        let err = buf.read_line(&mut reader).unwrap_err();
        assert!(matches!(err, TagCacheError::Io(ref e) if e.kind() == ErrorKind::UnexpectedEof));
    }

    #[test]
    fn grows_then_reports_line_too_long() {
        let mut long = vec![b'x'; DEFAULT_BUFFER_BYTES + 10];
        long.push(b'\n');
        let mut reader = ChunkedReader::new(&long, 4096);
        let mut buf = ReadBuffer::new(DEFAULT_BUFFER_BYTES * 2);
        let line = buf.read_line(&mut reader).unwrap();
        assert_eq!(line.len(), DEFAULT_BUFFER_BYTES + 10);

        let endless = vec![b'y'; DEFAULT_BUFFER_BYTES * 3];
        let mut reader = ChunkedReader::new(&endless, 4096);
        let mut buf = ReadBuffer::new(DEFAULT_BUFFER_BYTES);
        let err = buf.read_line(&mut reader).unwrap_err();
        assert!(matches!(
            err,
            TagCacheError::Protocol(ProtocolError::LineTooLong { capacity }) if capacity == DEFAULT_BUFFER_BYTES
        ));
    }

    #[test]
    fn try_read_line_returns_none_when_blocked() {
        let mut reader = ChunkedReader::new(b"OK\npart", 64);
        reader.would_block_at_end = true;
        let mut buf = ReadBuffer::new(64 * 1024);
        assert_eq!(&buf.try_read_line(&mut reader).unwrap().unwrap()[..], b"OK");
        assert!(buf.try_read_line(&mut reader).unwrap().is_none());
        assert_eq!(buf.pending(), 4);
    }

    #[test]
    fn coalesces_small_frames() {
        let mut writer = RecordingWriter::new(usize::MAX);
        let mut buf = WriteBuffer::new(32);
        buf.write_frame(&mut writer, b"GET\ta\n").unwrap();
        buf.write_frame(&mut writer, b"GET\tb\n").unwrap();
        assert_eq!(writer.calls, 0);
        assert_eq!(buf.used(), 12);
        buf.flush(&mut writer).unwrap();
        assert_eq!(writer.calls, 1);
        assert_eq!(writer.written, b"GET\ta\nGET\tb\n");
        // Flushing an empty buffer performs no write.
        buf.flush(&mut writer).unwrap();
        assert_eq!(writer.calls, 1);
    }

    #[test]
    fn overflow_flushes_before_buffering() {
        let mut writer = RecordingWriter::new(usize::MAX);
        let mut buf = WriteBuffer::new(16);
        buf.write_frame(&mut writer, b"0123456789").unwrap();
        buf.write_frame(&mut writer, b"abcdefghij").unwrap();
        assert_eq!(writer.written, b"0123456789");
        assert_eq!(buf.used(), 10);
    }

    #[test]
    fn large_frames_bypass_the_buffer_with_partial_writes() {
        let mut writer = RecordingWriter::new(7);
        let mut buf = WriteBuffer::new(16);
        buf.write_frame(&mut writer, b"head").unwrap();
        let big = vec![b'z'; 40];
        buf.write_frame(&mut writer, &big).unwrap();
        assert_eq!(buf.used(), 0);
        assert_eq!(&writer.written[..4], b"head");
        assert_eq!(&writer.written[4..], &big[..]);
    }

    #[test]
    fn failed_flush_discards_queued_bytes() {
        let mut writer = RecordingWriter::new(usize::MAX);
        writer.fail = true;
        let mut buf = WriteBuffer::new(16);
        buf.write_frame(&mut writer, b"PUT").unwrap();
        assert!(matches!(buf.flush(&mut writer), Err(TagCacheError::Io(_))));
        assert_eq!(buf.used(), 0);
    }
}
