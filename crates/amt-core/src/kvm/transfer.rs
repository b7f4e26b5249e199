use super::frame::{Chunk, CHUNK_SIZE};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

/// A file being pushed to the remote console.
#[derive(Debug)]
pub struct DownloadContext {
    pub id: Value,
    file: File,
    sent: u64,
}

impl DownloadContext {
    pub fn open(id: Value, path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self { id, file, sent: 0 })
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Reads the next chunk. A chunk with the final header means the file is
    /// exhausted.
    pub fn next_chunk(&mut self) -> io::Result<Chunk> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;
        while filled < CHUNK_SIZE {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        self.sent += filled as u64;
        Ok(Chunk::from_read(buf))
    }
}

/// A file being received from the remote console.
#[derive(Debug)]
pub struct UploadContext {
    pub reqid: Option<Value>,
    file: File,
}

impl UploadContext {
    pub fn create(reqid: Option<Value>, path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { reqid, file })
    }

    pub fn write(&mut self, payload: &[u8]) -> io::Result<()> {
        self.file.write_all(payload)
    }
}
