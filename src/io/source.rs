//! Buffered byte sources for replay.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use recorder_errors::{enverr, ErrorCode, RecorderResult};

use super::compress;

/// Byte source consumed by the record reader. Readers treat a short read as
/// end-of-stream; `is_open` distinguishes a concurrent close from EOF.
pub trait RecordSource: Read + Send {
    fn is_open(&self) -> bool;

    fn close(&mut self);

    /// Fill `buf` completely. Returns `false` on a short read past the end
    /// of the stream.
    fn read_exact_buf(&mut self, buf: &mut [u8]) -> bool {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => return false,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
        true
    }

    /// Read bytes into `out` until `delim` or end of stream. The delimiter
    /// is consumed but not stored. Returns `false` when the stream ended
    /// before any byte was read.
    fn getline(&mut self, out: &mut Vec<u8>, delim: u8) -> bool {
        out.clear();
        let mut byte = [0u8; 1];
        loop {
            match self.read(&mut byte) {
                Ok(0) => return !out.is_empty(),
                Ok(_) => {
                    if byte[0] == delim {
                        return true;
                    }
                    out.push(byte[0]);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return !out.is_empty(),
            }
        }
    }
}

/// File-backed source. Compressed captures are sniffed by magic and decoded
/// transparently.
pub struct FileSource {
    reader: BufReader<Box<dyn Read + Send>>,
    open: bool,
}

impl FileSource {
    pub fn open(path: &Path) -> RecorderResult<Self> {
        let mut file = File::open(path).map_err(|err| {
            enverr!(
                ErrorCode::Io,
                "cannot open capture file '{}': {}",
                path.display(),
                err
            )
        })?;

        let mut magic = [0u8; 2];
        let sniffed = match file.read(&mut magic) {
            Ok(n) => n,
            Err(err) => {
                return Err(enverr!(
                    ErrorCode::Io,
                    "cannot read capture file '{}': {}",
                    path.display(),
                    err
                ))
            }
        };

        let prefix = io::Cursor::new(magic[..sniffed].to_vec());
        let chained: Box<dyn Read + Send> = Box::new(prefix.chain(file));
        let inner: Box<dyn Read + Send> =
            if sniffed == 2 && magic == compress::COMPRESSION_MAGIC {
                compress::decode_stream(chained)
            } else {
                chained
            };
        Ok(Self {
            reader: BufReader::new(inner),
            open: true,
        })
    }
}

impl Read for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open {
            return Ok(0);
        }
        self.reader.read(buf)
    }
}

impl RecordSource for FileSource {
    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// Socket-backed source for live captures. A [`SocketSourceHandle`] can shut
/// the connection down from another thread; the reading thread then observes
/// a short read and `is_open` reports false.
pub struct SocketSource {
    stream: Arc<TcpStream>,
    open: Arc<AtomicBool>,
}

/// Cross-thread close handle for a [`SocketSource`].
#[derive(Clone)]
pub struct SocketSourceHandle {
    stream: Arc<TcpStream>,
    open: Arc<AtomicBool>,
}

impl SocketSourceHandle {
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

impl SocketSource {
    pub fn connect(port: u16) -> RecorderResult<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).map_err(|err| {
            enverr!(ErrorCode::Io, "cannot connect to capture port {}: {}", port, err)
        })?;
        Ok(Self {
            stream: Arc::new(stream),
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn handle(&self) -> SocketSourceHandle {
        SocketSourceHandle {
            stream: self.stream.clone(),
            open: self.open.clone(),
        }
    }
}

impl Read for SocketSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open.load(Ordering::SeqCst) {
            return Ok(0);
        }
        match (&*self.stream).read(buf) {
            Ok(0) => {
                self.open.store(false, Ordering::SeqCst);
                Ok(0)
            }
            other => other,
        }
    }
}

impl RecordSource for SocketSource {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.handle().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::sink::FileSink;
    use crate::io::RecordSink;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn plain_files_read_back_verbatim() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.bin");
        std::fs::write(&path, b"one\ntwo\n").expect("write");

        let mut source = FileSource::open(&path).expect("open");
        let mut line = Vec::new();
        assert!(source.getline(&mut line, b'\n'));
        assert_eq!(line, b"one");
        assert!(source.getline(&mut line, b'\n'));
        assert_eq!(line, b"two");
        assert!(!source.getline(&mut line, b'\n'));
    }

    #[test]
    fn short_reads_past_eof_report_false() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.bin");
        std::fs::write(&path, b"abc").expect("write");

        let mut source = FileSource::open(&path).expect("open");
        let mut buf = [0u8; 2];
        assert!(source.read_exact_buf(&mut buf));
        assert!(!source.read_exact_buf(&mut buf));
    }

    #[test]
    fn compressed_captures_are_sniffed_and_decoded() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.bin");
        let mut sink =
            FileSink::with_capacity_for_tests(&path, 64, Some(1)).expect("sink");
        sink.write_all(b"record bytes").expect("write");
        sink.finalize().expect("finalize");

        let mut source = FileSource::open(&path).expect("open");
        let mut buf = [0u8; 12];
        assert!(source.read_exact_buf(&mut buf));
        assert_eq!(&buf, b"record bytes");
    }

    #[test]
    fn socket_source_observes_concurrent_close() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            stream.write_all(b"xx").expect("write");
            // Keep the connection open until the client shuts it down.
            let mut scratch = [0u8; 1];
            let _ = stream.read(&mut scratch);
        });

        let mut source = SocketSource::connect(port).expect("connect");
        let handle = source.handle();
        let mut buf = [0u8; 2];
        assert!(source.read_exact_buf(&mut buf));

        handle.close();
        assert!(!source.read_exact_buf(&mut buf));
        assert!(!source.is_open());
        server.join().expect("join");
    }
}
