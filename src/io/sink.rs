//! Buffered, seekable byte sinks for the capture stream.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::debug;
use recorder_errors::{enverr, usage, ErrorCode, RecorderResult};

use super::compress;

/// Ring capacity of the file sink. Large enough that the kernel sees big
/// sequential writes even under allocation storms.
pub const FILE_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Byte sink consumed by the record writer.
///
/// Sinks are terminal-failure objects: after the first error every further
/// call reports `SinkClosed` so the capture path can drop records cheaply.
pub trait RecordSink: Send {
    fn write_all(&mut self, data: &[u8]) -> RecorderResult<()>;

    /// Reposition the underlying stream. Buffered bytes are drained first.
    fn seek(&mut self, position: SeekFrom) -> RecorderResult<u64>;

    fn flush(&mut self) -> RecorderResult<()>;

    /// Called once when capture stops. File sinks use this to run the block
    /// compressor; the default is a flush.
    fn finalize(&mut self) -> RecorderResult<()> {
        self.flush()
    }

    /// Produce the sink the forked child will write through. Parent and
    /// child never share buffers.
    fn clone_in_child_process(&self) -> RecorderResult<Box<dyn RecordSink>>;
}

fn sink_closed() -> recorder_errors::RecorderError {
    usage!(ErrorCode::SinkClosed, "sink is in a failed state")
}

/// File-backed sink with a private ring buffer.
pub struct FileSink {
    file: File,
    path: PathBuf,
    buffer: Vec<u8>,
    capacity: usize,
    compress_level: Option<u32>,
    failed: bool,
}

impl FileSink {
    pub fn create(path: &Path, compress_level: Option<u32>) -> RecorderResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|err| {
                enverr!(
                    ErrorCode::Io,
                    "cannot create capture file '{}': {}",
                    path.display(),
                    err
                )
            })?;
        Ok(Self::from_file(file, path.to_path_buf(), FILE_BUFFER_SIZE, compress_level))
    }

    fn from_file(file: File, path: PathBuf, capacity: usize, compress_level: Option<u32>) -> Self {
        Self {
            file,
            path,
            buffer: Vec::with_capacity(capacity),
            capacity,
            compress_level,
            failed: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_capacity_for_tests(
        path: &Path,
        capacity: usize,
        compress_level: Option<u32>,
    ) -> RecorderResult<Self> {
        let mut sink = Self::create(path, compress_level)?;
        sink.capacity = capacity;
        sink.buffer = Vec::with_capacity(capacity);
        Ok(sink)
    }

    fn drain(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            self.file.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    fn fail<T>(&mut self, err: io::Error) -> RecorderResult<T> {
        self.failed = true;
        Err(enverr!(
            ErrorCode::Io,
            "capture file '{}' write failed: {}",
            self.path.display(),
            err
        ))
    }
}

impl RecordSink for FileSink {
    fn write_all(&mut self, data: &[u8]) -> RecorderResult<()> {
        if self.failed {
            return Err(sink_closed());
        }
        if data.len() > self.capacity - self.buffer.len() {
            if let Err(err) = self.drain() {
                return self.fail(err);
            }
        }
        if data.len() >= self.capacity {
            if let Err(err) = self.file.write_all(data) {
                return self.fail(err);
            }
        } else {
            self.buffer.extend_from_slice(data);
        }
        Ok(())
    }

    fn seek(&mut self, position: SeekFrom) -> RecorderResult<u64> {
        if self.failed {
            return Err(sink_closed());
        }
        match self.drain().and_then(|()| self.file.seek(position)) {
            Ok(offset) => Ok(offset),
            Err(err) => self.fail(err),
        }
    }

    fn flush(&mut self) -> RecorderResult<()> {
        if self.failed {
            return Err(sink_closed());
        }
        match self.drain().and_then(|()| self.file.flush()) {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err),
        }
    }

    fn finalize(&mut self) -> RecorderResult<()> {
        self.flush()?;
        let Some(level) = self.compress_level else {
            return Ok(());
        };
        match compress_in_place(&self.path, level) {
            Ok(()) => {
                debug!("compressed capture file {}", self.path.display());
                Ok(())
            }
            Err(err) => self.fail(err),
        }
    }

    fn clone_in_child_process(&self) -> RecorderResult<Box<dyn RecordSink>> {
        let mut file = self.file.try_clone().map_err(|err| {
            enverr!(ErrorCode::Io, "cannot duplicate capture fd: {}", err)
        })?;
        file.seek(SeekFrom::End(0))
            .map_err(|err| enverr!(ErrorCode::Io, "cannot seek cloned capture fd: {}", err))?;
        Ok(Box::new(Self::from_file(
            file,
            self.path.clone(),
            self.capacity,
            self.compress_level,
        )))
    }
}

fn compress_in_place(path: &Path, level: u32) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut input = File::open(path)?;
    let output = File::create(&tmp)?;
    let output = compress::encode(&mut input, output, level)?;
    output.sync_all()?;
    fs::rename(&tmp, path)
}

/// Streaming sink feeding a live reader over TCP. The writer side acts as
/// the server: the listener is bound eagerly so the port is known, but the
/// connection is only accepted on the first write.
pub struct SocketSink {
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
    failed: bool,
}

impl SocketSink {
    pub fn bind(port: u16) -> RecorderResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).map_err(|err| {
            enverr!(ErrorCode::Io, "cannot bind capture port {}: {}", port, err)
        })?;
        Ok(Self {
            listener: Some(listener),
            stream: None,
            buffer: Vec::with_capacity(libc::PIPE_BUF),
            failed: false,
        })
    }

    /// The bound port, for handing to the reader side.
    pub fn port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
    }

    fn ensure_open(&mut self) -> io::Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener consumed"))?;
        let (stream, peer) = listener.accept()?;
        debug!("capture stream connected from {}", peer);
        self.stream = Some(stream);
        Ok(())
    }

    /// Write through `send(2)` so a vanished peer raises an error here
    /// instead of delivering SIGPIPE to the host process.
    fn send_all(stream: &TcpStream, mut data: &[u8]) -> io::Result<()> {
        let fd = stream.as_raw_fd();
        while !data.is_empty() {
            let sent = unsafe {
                libc::send(
                    fd,
                    data.as_ptr().cast(),
                    data.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if sent < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            data = &data[sent as usize..];
        }
        Ok(())
    }

    fn drain(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        if !self.buffer.is_empty() {
            let stream = self.stream.as_ref().expect("stream open");
            Self::send_all(stream, &self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    fn fail<T>(&mut self, err: io::Error) -> RecorderResult<T> {
        self.failed = true;
        Err(enverr!(ErrorCode::Io, "capture socket write failed: {}", err))
    }
}

impl RecordSink for SocketSink {
    fn write_all(&mut self, data: &[u8]) -> RecorderResult<()> {
        if self.failed {
            return Err(sink_closed());
        }
        if self.buffer.len() + data.len() > libc::PIPE_BUF {
            if let Err(err) = self.drain() {
                return self.fail(err);
            }
        }
        if data.len() >= libc::PIPE_BUF {
            if let Err(err) = self
                .ensure_open()
                .and_then(|()| Self::send_all(self.stream.as_ref().expect("stream open"), data))
            {
                return self.fail(err);
            }
        } else {
            self.buffer.extend_from_slice(data);
        }
        Ok(())
    }

    fn seek(&mut self, _position: SeekFrom) -> RecorderResult<u64> {
        Err(usage!(ErrorCode::Io, "socket sinks are not seekable"))
    }

    fn flush(&mut self) -> RecorderResult<()> {
        if self.failed {
            return Err(sink_closed());
        }
        match self.drain() {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err),
        }
    }

    fn clone_in_child_process(&self) -> RecorderResult<Box<dyn RecordSink>> {
        // The peer owns the other end of this stream; a forked child must
        // open its own capture channel instead of interleaving with the
        // parent.
        Err(enverr!(
            ErrorCode::Io,
            "socket sinks cannot follow a fork"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn file_sink_slides_the_ring_through_the_kernel() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.bin");
        let mut sink =
            FileSink::with_capacity_for_tests(&path, 8, None).expect("sink");

        sink.write_all(b"abcd").expect("write");
        sink.write_all(b"efg").expect("write");
        // Next chunk does not fit the remainder: the filled portion slides.
        sink.write_all(b"hijk").expect("write");
        sink.flush().expect("flush");

        assert_eq!(fs::read(&path).expect("read"), b"abcdefghijk");
    }

    #[test]
    fn oversized_chunks_bypass_the_ring() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.bin");
        let mut sink =
            FileSink::with_capacity_for_tests(&path, 8, None).expect("sink");

        sink.write_all(b"0123456789abcdef").expect("write");
        sink.flush().expect("flush");
        assert_eq!(fs::read(&path).expect("read"), b"0123456789abcdef");
    }

    #[test]
    fn seek_drains_buffered_bytes_first() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.bin");
        let mut sink =
            FileSink::with_capacity_for_tests(&path, 64, None).expect("sink");

        sink.write_all(b"header--").expect("write");
        sink.write_all(b"body").expect("write");
        sink.seek(SeekFrom::Start(0)).expect("seek");
        sink.write_all(b"HEADER--").expect("write");
        sink.flush().expect("flush");

        assert_eq!(fs::read(&path).expect("read"), b"HEADER--body");
    }

    #[test]
    fn finalize_compresses_and_renames_atomically() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.bin");
        let mut sink =
            FileSink::with_capacity_for_tests(&path, 64, Some(6)).expect("sink");

        sink.write_all(b"payload payload payload").expect("write");
        sink.finalize().expect("finalize");

        let bytes = fs::read(&path).expect("read");
        assert_eq!(bytes[..2], compress::COMPRESSION_MAGIC);
        let mut decoded = Vec::new();
        compress::decode_stream(std::io::Cursor::new(bytes))
            .read_to_end(&mut decoded)
            .expect("decode");
        assert_eq!(decoded, b"payload payload payload");
        assert!(!dir.path().join("capture.bin.tmp").exists());
    }

    #[test]
    fn cloned_file_sink_appends_to_the_end() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.bin");
        let mut sink =
            FileSink::with_capacity_for_tests(&path, 64, None).expect("sink");
        sink.write_all(b"parent").expect("write");
        sink.flush().expect("flush");

        let mut child = sink.clone_in_child_process().expect("clone");
        child.write_all(b"+child").expect("write");
        child.flush().expect("flush");

        assert_eq!(fs::read(&path).expect("read"), b"parent+child");
    }

    #[test]
    fn socket_sink_streams_to_a_connected_reader() {
        let mut sink = SocketSink::bind(0).expect("bind");
        let port = sink.port().expect("port");

        let reader = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes).expect("read");
            bytes
        });

        sink.write_all(b"live ").expect("write");
        sink.write_all(b"records").expect("write");
        sink.flush().expect("flush");
        drop(sink);

        assert_eq!(reader.join().expect("join"), b"live records");
    }
}
