//! Byte-level transport for capture streams: buffered seekable sinks on the
//! write side, buffered sources on the replay side, and the block-compressor
//! seam used when a capture file is finalized.

mod compress;
mod sink;
mod source;

pub use compress::{decode_stream, encode, COMPRESSION_MAGIC};
pub use sink::{FileSink, RecordSink, SocketSink, FILE_BUFFER_SIZE};
pub use source::{FileSource, RecordSource, SocketSource, SocketSourceHandle};

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{Cursor, Read};
    use std::sync::{Arc, Mutex};

    use recorder_errors::RecorderResult;

    use super::{RecordSink, RecordSource};

    /// In-memory sink whose backing buffer stays observable after the writer
    /// takes ownership. `clone_in_child_process` yields an independent buffer
    /// registered on the shared child list, mirroring fork isolation.
    pub struct VecSink {
        data: Arc<Mutex<Vec<u8>>>,
        children: Arc<Mutex<Vec<Arc<Mutex<Vec<u8>>>>>>,
        position: usize,
    }

    impl VecSink {
        pub fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
            let data = Arc::new(Mutex::new(Vec::new()));
            let sink = Self {
                data: data.clone(),
                children: Arc::new(Mutex::new(Vec::new())),
                position: 0,
            };
            (sink, data)
        }

        pub fn child_buffers(&self) -> Arc<Mutex<Vec<Arc<Mutex<Vec<u8>>>>>> {
            self.children.clone()
        }
    }

    impl RecordSink for VecSink {
        fn write_all(&mut self, data: &[u8]) -> RecorderResult<()> {
            let mut guard = self.data.lock().expect("vec sink lock");
            let end = self.position + data.len();
            if guard.len() < end {
                guard.resize(end, 0);
            }
            guard[self.position..end].copy_from_slice(data);
            self.position = end;
            Ok(())
        }

        fn seek(&mut self, position: std::io::SeekFrom) -> RecorderResult<u64> {
            let guard = self.data.lock().expect("vec sink lock");
            self.position = match position {
                std::io::SeekFrom::Start(offset) => offset as usize,
                std::io::SeekFrom::End(offset) => (guard.len() as i64 + offset) as usize,
                std::io::SeekFrom::Current(offset) => (self.position as i64 + offset) as usize,
            };
            Ok(self.position as u64)
        }

        fn flush(&mut self) -> RecorderResult<()> {
            Ok(())
        }

        fn clone_in_child_process(&self) -> RecorderResult<Box<dyn RecordSink>> {
            let data = Arc::new(Mutex::new(Vec::new()));
            self.children
                .lock()
                .expect("vec sink children lock")
                .push(data.clone());
            Ok(Box::new(VecSink {
                data,
                children: self.children.clone(),
                position: 0,
            }))
        }
    }

    /// In-memory source over a byte buffer.
    pub struct BufferSource {
        cursor: Cursor<Vec<u8>>,
        open: bool,
    }

    impl BufferSource {
        pub fn new(bytes: Vec<u8>) -> Self {
            Self {
                cursor: Cursor::new(bytes),
                open: true,
            }
        }
    }

    impl Read for BufferSource {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.cursor.read(buf)
        }
    }

    impl RecordSource for BufferSource {
        fn is_open(&self) -> bool {
            self.open
        }

        fn close(&mut self) {
            self.open = false;
        }
    }
}
