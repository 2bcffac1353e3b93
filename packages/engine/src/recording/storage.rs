// packages/engine/src/recording/storage.rs
//! Window file storage on the local file system
//!
//! One file per hour window under `root_dir`, named by the window start.
//! Files are created with a [`FileHeader`] and only ever appended to.

use crate::recording::codec::{BlockHeader, FileHeader, BLOCK_HEADER_SIZE, FILE_HEADER_SIZE};
use crate::recording::window::Window;
use crate::utils::errors::{EngineError, Result};
use chrono::FixedOffset;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A window file found in the root directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub window: Window,
    pub path: PathBuf,
}

/// Window file storage rooted at one directory
#[derive(Debug, Clone)]
pub struct WindowStorage {
    root_dir: PathBuf,
    offset: FixedOffset,
}

impl WindowStorage {
    /// Create the storage, creating `root_dir` if needed
    pub fn new(root_dir: impl Into<PathBuf>, offset: FixedOffset) -> Result<Self> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir, offset })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn file_name(&self, window: Window) -> String {
        window.file_name(self.offset)
    }

    /// Open the file of `window` for appending, creating it with a header if absent
    pub fn open_for_append(&self, window: Window) -> Result<WindowFile> {
        let name = self.file_name(window);
        let path = self.root_dir.join(&name);

        let file = match OpenOptions::new().append(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let start = u32::try_from(window.start_unix()).map_err(|_| {
                    EngineError::TimestampOutOfRange(format!("window {} does not fit u32", window))
                })?;
                file.write_all(&FileHeader::new(start).encode())?;
                info!("Created window file {:?}", path);
                file
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Appending to existing window file {:?}", path);
                OpenOptions::new().append(true).open(&path)?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(WindowFile { window, path, file })
    }

    /// Window files in name order, which is chronological
    pub fn list_files(&self) -> Result<Vec<StoredFile>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some(window) = Window::parse_file_name(&name, self.offset) else {
                debug!("Ignoring foreign file {:?} in store directory", name);
                continue;
            };
            files.push(StoredFile {
                path: entry.path(),
                name,
                window,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    pub fn remove(&self, file: &StoredFile) -> Result<()> {
        fs::remove_file(&file.path)?;
        Ok(())
    }

    /// Open a window file for sequential block reads
    pub fn open_blocks(&self, file: &StoredFile) -> Result<Option<BlockReader>> {
        let mut reader = BufReader::new(File::open(&file.path)?);
        let mut header = [0u8; FILE_HEADER_SIZE];
        if read_full(&mut reader, &mut header)? < FILE_HEADER_SIZE {
            // header not fully written yet
            return Ok(None);
        }
        let header = FileHeader::decode(&header).map_err(|reason| EngineError::CorruptFile {
            path: file.path.clone(),
            reason,
        })?;

        Ok(Some(BlockReader {
            window: Window::from_start_unix(header.window_start_unix as i64),
            reader,
        }))
    }
}

/// Open, append-only file of the current window
pub struct WindowFile {
    window: Window,
    path: PathBuf,
    file: File,
}

impl WindowFile {
    pub fn window(&self) -> Window {
        self.window
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append header and payload with a single write
    pub fn append_block(&mut self, header: &BlockHeader, payload: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
        record.extend_from_slice(&header.encode());
        record.extend_from_slice(payload);
        self.file.write_all(&record)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Sequential reader over the blocks of one window file
pub struct BlockReader {
    window: Window,
    reader: BufReader<File>,
}

impl BlockReader {
    /// Window recorded in the file header
    pub fn window(&self) -> Window {
        self.window
    }

    /// Next block header, or `None` at the end of the complete blocks
    pub fn next_header(&mut self) -> Result<Option<BlockHeader>> {
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        let read = read_full(&mut self.reader, &mut buf)?;
        if read < BLOCK_HEADER_SIZE {
            if read > 0 {
                debug!("Partial block header at end of window {}", self.window);
            }
            return Ok(None);
        }
        BlockHeader::decode(&buf).map(Some)
    }

    /// Append the payload of `header` to `out`; false if the payload is not fully written
    pub fn read_payload(&mut self, header: &BlockHeader, out: &mut Vec<u8>) -> Result<bool> {
        let start = out.len();
        let size = header.compressed_size as usize;
        out.resize(start + size, 0);
        let read = read_full(&mut self.reader, &mut out[start..])?;
        if read < size {
            out.truncate(start);
            debug!("Partial block payload at end of window {}", self.window);
            return Ok(false);
        }
        Ok(true)
    }

    pub fn skip_payload(&mut self, header: &BlockHeader) -> Result<()> {
        self.reader.seek_relative(header.compressed_size as i64)?;
        Ok(())
    }
}

/// Read until `buf` is full or EOF, returning the bytes read
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
