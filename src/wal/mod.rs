//! Segmented, CRC-checked, append-only chunk log.
//!
//! This is the storage substrate shared by the three durable structures in
//! the database: each memtable owns one log as its WAL, each value-log
//! partition is one log, and each index partition persists its edits into
//! one. A log is a directory plus a file extension; segment files are named
//! `<segment_id:09>{ext}` and roll once the active segment would exceed the
//! configured size.
//!
//! # Segment Format
//!
//! ```text
//! +------------------+
//! | Header (8 bytes) |  magic u32 | version u16 | reserved u16
//! +------------------+
//! | Chunk 1          |
//! +------------------+
//! | Chunk 2          |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Chunk Format
//!
//! ```text
//! +-----------+----------------+-----------+
//! |len:u32    | payload        |crc32:u32  |
//! +-----------+----------------+-----------+
//! | 4 bytes   | variable       | 4 bytes   |
//! +-----------+----------------+-----------+
//! ```
//!
//! Multi-byte integers are big-endian. The CRC32 covers the payload only.
//! A truncated chunk at the tail of the last segment is treated as a crash
//! artifact and ends sequential reads cleanly; a checksum mismatch anywhere
//! else surfaces as corruption.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::error::{Error, Result};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const SEGMENT_MAGIC: u32 = 0x454D_4252;
const SEGMENT_VERSION: u16 = 1;
/// Size of the per-segment header; also the offset of the first chunk.
pub const SEGMENT_HEADER_SIZE: u64 = 8;
/// Framing overhead per chunk: length prefix plus checksum.
pub const CHUNK_OVERHEAD: u64 = 8;

const FIRST_SEGMENT_ID: u32 = 1;

/// Location of one chunk within a segmented log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPosition {
    pub segment_id: u32,
    pub offset: u64,
}

/// Options for opening a segmented log.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Directory the segment files live in.
    pub dir_path: PathBuf,
    /// File extension, including the leading dot (e.g. `.wal`, `.vlog.2`).
    pub segment_ext: String,
    /// Size at which the active segment rolls.
    pub segment_size: u64,
    /// Fsync after every single write.
    pub sync: bool,
    /// Chunk cache capacity in entries; 0 disables the cache.
    pub block_cache: usize,
}

struct Segment {
    path: PathBuf,
    file: Mutex<File>,
}

struct WalInner {
    dir_path: PathBuf,
    segment_ext: String,
    segment_size: u64,
    always_sync: bool,
    /// Read handles for every segment, the active one included.
    segments: BTreeMap<u32, Segment>,
    active_id: u32,
    active_size: u64,
    writer: BufWriter<File>,
    pending: Vec<Vec<u8>>,
}

/// A segmented append-only chunk log.
pub struct Wal {
    inner: RwLock<WalInner>,
    cache: Option<Mutex<Cache<(u32, u64), Vec<u8>>>>,
}

fn segment_file_name(id: u32, ext: &str) -> String {
    format!("{:09}{}", id, ext)
}

fn parse_segment_id(file_name: &str, ext: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(ext)?;
    if stem.len() != 9 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn write_segment_header(file: &mut File) -> Result<()> {
    file.write_u32::<BigEndian>(SEGMENT_MAGIC)?;
    file.write_u16::<BigEndian>(SEGMENT_VERSION)?;
    file.write_u16::<BigEndian>(0)?;
    Ok(())
}

/// Walks chunk frames from the header onward and returns the offset after
/// the last intact one.
fn scan_valid_len(file: &mut File) -> Result<u64> {
    let total = file.metadata()?.len();
    file.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE))?;
    let mut reader = BufReader::new(file.try_clone()?);
    let mut valid_end = SEGMENT_HEADER_SIZE;
    loop {
        if valid_end + CHUNK_OVERHEAD > total {
            break;
        }
        let len = match reader.read_u32::<BigEndian>() {
            Ok(len) => u64::from(len),
            Err(_) => break,
        };
        if valid_end + CHUNK_OVERHEAD + len > total {
            break;
        }
        let mut payload = vec![0u8; len as usize];
        if reader.read_exact(&mut payload).is_err() {
            break;
        }
        let stored_crc = match reader.read_u32::<BigEndian>() {
            Ok(crc) => crc,
            Err(_) => break,
        };
        if CRC32.checksum(&payload) != stored_crc {
            break;
        }
        valid_end += CHUNK_OVERHEAD + len;
    }
    Ok(valid_end)
}

fn check_segment_header(file: &mut File, path: &Path) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let magic = file.read_u32::<BigEndian>()?;
    let version = file.read_u16::<BigEndian>()?;
    if magic != SEGMENT_MAGIC {
        return Err(Error::Corruption(format!(
            "bad segment magic in {}",
            path.display()
        )));
    }
    if version != SEGMENT_VERSION {
        return Err(Error::Corruption(format!(
            "unsupported segment version {} in {}",
            version,
            path.display()
        )));
    }
    Ok(())
}

impl Wal {
    /// Opens the log, discovering any existing segment files for the
    /// configured extension and positioning the writer at the end of the
    /// newest one.
    pub fn open(opts: WalOptions) -> Result<Self> {
        std::fs::create_dir_all(&opts.dir_path)?;

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&opts.dir_path)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| parse_segment_id(n, &opts.segment_ext)) {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut segments = BTreeMap::new();
        for &id in &ids {
            let path = opts.dir_path.join(segment_file_name(id, &opts.segment_ext));
            let mut file = File::open(&path)?;
            if file.metadata()?.len() >= SEGMENT_HEADER_SIZE {
                check_segment_header(&mut file, &path)?;
            }
            segments.insert(
                id,
                Segment {
                    path,
                    file: Mutex::new(file),
                },
            );
        }

        let active_id = ids.last().copied().unwrap_or(FIRST_SEGMENT_ID);
        let active_path = opts
            .dir_path
            .join(segment_file_name(active_id, &opts.segment_ext));
        let mut active_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&active_path)?;

        let mut active_size = active_file.metadata()?.len();
        if active_size < SEGMENT_HEADER_SIZE {
            // Brand new segment, or a header torn by a crash.
            active_file.set_len(0)?;
            write_segment_header(&mut active_file)?;
            active_file.sync_all()?;
            active_size = SEGMENT_HEADER_SIZE;
        } else {
            // Drop any chunk torn by a crash so new appends stay reachable
            // by sequential readers.
            let valid_end = scan_valid_len(&mut active_file)?;
            if valid_end < active_size {
                tracing::warn!(
                    path = %active_path.display(),
                    truncated = active_size - valid_end,
                    "truncating torn tail of active segment"
                );
                active_file.set_len(valid_end)?;
                active_file.sync_all()?;
                active_size = valid_end;
            }
        }
        active_file.seek(SeekFrom::Start(active_size))?;

        if !segments.contains_key(&active_id) {
            // Independent read handle: readers seek, so they must not share
            // a file cursor with the writer.
            segments.insert(
                active_id,
                Segment {
                    file: Mutex::new(File::open(&active_path)?),
                    path: active_path,
                },
            );
        }

        let cache = match opts.block_cache {
            0 => None,
            n => Some(Mutex::new(Cache::new(n))),
        };

        Ok(Self {
            inner: RwLock::new(WalInner {
                dir_path: opts.dir_path,
                segment_ext: opts.segment_ext,
                segment_size: opts.segment_size,
                always_sync: opts.sync,
                segments,
                active_id,
                active_size,
                writer: BufWriter::new(active_file),
                pending: Vec::new(),
            }),
            cache,
        })
    }

    /// Appends one chunk and returns its position. The chunk is readable as
    /// soon as this returns; it is durable once [`Wal::sync`] succeeds
    /// (immediately, when the log was opened with `sync: true`).
    pub fn write(&self, payload: &[u8]) -> Result<ChunkPosition> {
        let mut inner = self.inner.write()?;
        let pos = inner.append_chunk(payload)?;
        inner.writer.flush()?;
        if inner.always_sync {
            inner.writer.get_ref().sync_all()?;
        }
        Ok(pos)
    }

    /// Buffers a chunk to be written by the next [`Wal::write_all`].
    pub fn pending_writes(&self, payload: Vec<u8>) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).pending.push(payload);
    }

    /// Writes all buffered chunks and returns their positions in buffer
    /// order. The buffer is cleared even on failure.
    pub fn write_all(&self) -> Result<Vec<ChunkPosition>> {
        let mut inner = self.inner.write()?;
        let pending = std::mem::take(&mut inner.pending);
        let mut positions = Vec::with_capacity(pending.len());
        for payload in &pending {
            positions.push(inner.append_chunk(payload)?);
        }
        inner.writer.flush()?;
        if inner.always_sync {
            inner.writer.get_ref().sync_all()?;
        }
        Ok(positions)
    }

    /// Reads the chunk at `pos`. Only flushed chunks are visible.
    pub fn read(&self, pos: ChunkPosition) -> Result<Vec<u8>> {
        if let Some(cache) = &self.cache {
            if let Some(chunk) = cache.lock()?.get(&(pos.segment_id, pos.offset)) {
                return Ok(chunk);
            }
        }

        let inner = self.inner.read()?;
        let segment = inner.segments.get(&pos.segment_id).ok_or_else(|| {
            Error::InvalidData(format!("unknown segment {}", pos.segment_id))
        })?;

        let mut file = segment.file.lock()?;
        file.seek(SeekFrom::Start(pos.offset))?;
        let len = file.read_u32::<BigEndian>()? as usize;
        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;
        let stored_crc = file.read_u32::<BigEndian>()?;
        drop(file);
        drop(inner);

        if CRC32.checksum(&payload) != stored_crc {
            return Err(Error::Corruption(format!(
                "chunk checksum mismatch at segment {} offset {}",
                pos.segment_id, pos.offset
            )));
        }

        if let Some(cache) = &self.cache {
            cache
                .lock()?
                .insert((pos.segment_id, pos.offset), payload.clone());
        }
        Ok(payload)
    }

    /// Flushes buffered writes and fsyncs the active segment.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.write()?;
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Sequential reader over every chunk in every segment, oldest first.
    pub fn reader(&self) -> Result<WalReader> {
        let mut inner = self.inner.write()?;
        inner.writer.flush()?;
        let segments: Vec<(u32, PathBuf)> = inner
            .segments
            .iter()
            .map(|(id, seg)| (*id, seg.path.clone()))
            .collect();
        Ok(WalReader {
            segments,
            index: 0,
            current: None,
        })
    }

    /// Renames every segment file to carry `new_ext`. The log keeps working
    /// against the renamed files.
    pub fn rename_ext(&self, new_ext: &str) -> Result<()> {
        let mut inner = self.inner.write()?;
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;

        let dir = inner.dir_path.clone();
        for (id, segment) in inner.segments.iter_mut() {
            let new_path = dir.join(segment_file_name(*id, new_ext));
            std::fs::rename(&segment.path, &new_path)?;
            segment.path = new_path;
        }
        inner.segment_ext = new_ext.to_string();
        Ok(())
    }

    /// Removes every segment file. The log must not be used afterwards.
    pub fn delete(&self) -> Result<()> {
        let inner = self.inner.write()?;
        for segment in inner.segments.values() {
            if let Err(e) = std::fs::remove_file(&segment.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Flushes and fsyncs; the log may still be used afterwards.
    pub fn close(&self) -> Result<()> {
        self.sync()
    }
}

impl WalInner {
    fn append_chunk(&mut self, payload: &[u8]) -> Result<ChunkPosition> {
        let frame_size = payload.len() as u64 + CHUNK_OVERHEAD;
        if self.active_size > SEGMENT_HEADER_SIZE
            && self.active_size + frame_size > self.segment_size
        {
            self.roll_segment()?;
        }

        let pos = ChunkPosition {
            segment_id: self.active_id,
            offset: self.active_size,
        };
        self.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        self.writer.write_all(payload)?;
        self.writer.write_u32::<BigEndian>(CRC32.checksum(payload))?;
        self.active_size += frame_size;
        Ok(pos)
    }

    fn roll_segment(&mut self) -> Result<()> {
        // Seal the old segment before any chunk lands in the new one.
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        let new_id = self.active_id + 1;
        let path = self
            .dir_path
            .join(segment_file_name(new_id, &self.segment_ext));
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        write_segment_header(&mut file)?;

        // Independent read handle so reader seeks cannot move the writer's
        // cursor.
        self.segments.insert(
            new_id,
            Segment {
                file: Mutex::new(File::open(&path)?),
                path,
            },
        );
        self.active_id = new_id;
        self.active_size = SEGMENT_HEADER_SIZE;
        self.writer = BufWriter::new(file);
        Ok(())
    }
}

/// Iterator over `(chunk, position)` pairs across all segments in order.
pub struct WalReader {
    segments: Vec<(u32, PathBuf)>,
    index: usize,
    current: Option<SegmentReader>,
}

struct SegmentReader {
    segment_id: u32,
    reader: BufReader<File>,
    offset: u64,
}

impl WalReader {
    fn open_next(&mut self) -> Result<bool> {
        while self.index < self.segments.len() {
            let (id, path) = &self.segments[self.index];
            self.index += 1;
            let file = File::open(path)?;
            if file.metadata()?.len() < SEGMENT_HEADER_SIZE {
                continue;
            }
            let mut reader = BufReader::new(file);
            reader.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE))?;
            self.current = Some(SegmentReader {
                segment_id: *id,
                reader,
                offset: SEGMENT_HEADER_SIZE,
            });
            return Ok(true);
        }
        Ok(false)
    }

    fn is_last_segment(&self) -> bool {
        self.index >= self.segments.len()
    }

    fn read_next(&mut self) -> Result<Option<(Vec<u8>, ChunkPosition)>> {
        loop {
            if self.current.is_none() && !self.open_next()? {
                return Ok(None);
            }
            let last = self.is_last_segment();
            let segment = self.current.as_mut().expect("segment reader present");

            let len = match segment.reader.read_u32::<BigEndian>() {
                Ok(len) => len as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.current = None;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            let tail_result = segment
                .reader
                .read_exact(&mut payload)
                .and_then(|_| segment.reader.read_exact(&mut crc_buf));
            if let Err(e) = tail_result {
                if e.kind() == std::io::ErrorKind::UnexpectedEof && last {
                    // Torn final chunk from a crash mid-append.
                    tracing::warn!(
                        segment_id = segment.segment_id,
                        offset = segment.offset,
                        "dropping truncated chunk at log tail"
                    );
                    self.current = None;
                    return Ok(None);
                }
                return Err(Error::Corruption(format!(
                    "truncated chunk in segment {} at offset {}",
                    segment.segment_id, segment.offset
                )));
            }

            let stored_crc = u32::from_be_bytes(crc_buf);
            if CRC32.checksum(&payload) != stored_crc {
                if last {
                    tracing::warn!(
                        segment_id = segment.segment_id,
                        offset = segment.offset,
                        "dropping chunk with bad checksum at log tail"
                    );
                    self.current = None;
                    return Ok(None);
                }
                return Err(Error::Corruption(format!(
                    "chunk checksum mismatch in segment {} at offset {}",
                    segment.segment_id, segment.offset
                )));
            }

            let pos = ChunkPosition {
                segment_id: segment.segment_id,
                offset: segment.offset,
            };
            segment.offset += len as u64 + CHUNK_OVERHEAD;
            return Ok(Some((payload, pos)));
        }
    }
}

impl Iterator for WalReader {
    type Item = Result<(Vec<u8>, ChunkPosition)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn test_options(dir: &TempDir) -> WalOptions {
        WalOptions {
            dir_path: dir.path().to_path_buf(),
            segment_ext: ".wal".to_string(),
            segment_size: 1024 * 1024,
            sync: false,
            block_cache: 0,
        }
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_options(&dir)).unwrap();

        let p1 = wal.write(b"first").unwrap();
        let p2 = wal.write(b"second").unwrap();

        assert_eq!(wal.read(p1).unwrap(), b"first");
        assert_eq!(wal.read(p2).unwrap(), b"second");
        assert_ne!(p1, p2);
    }

    #[test]
    fn test_reader_yields_in_order() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_options(&dir)).unwrap();

        let mut expected = Vec::new();
        for i in 0..50 {
            let payload = format!("chunk-{i}").into_bytes();
            let pos = wal.write(&payload).unwrap();
            expected.push((payload, pos));
        }

        let got: Vec<_> = wal
            .reader()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_segment_roll() {
        let dir = TempDir::new().unwrap();
        let mut opts = test_options(&dir);
        opts.segment_size = 128;
        let wal = Wal::open(opts).unwrap();

        let mut positions = Vec::new();
        for i in 0..20 {
            positions.push(wal.write(format!("payload-{i:04}").as_bytes()).unwrap());
        }

        let max_segment = positions.iter().map(|p| p.segment_id).max().unwrap();
        assert!(max_segment > 1, "writes should have rolled segments");

        // Random reads work across segments.
        for (i, pos) in positions.iter().enumerate() {
            assert_eq!(wal.read(*pos).unwrap(), format!("payload-{i:04}").as_bytes());
        }

        // Sequential reads cross segment boundaries in order.
        let chunks: Vec<_> = wal
            .reader()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(chunks.len(), 20);
    }

    #[test]
    fn test_pending_writes_batch() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_options(&dir)).unwrap();

        wal.pending_writes(b"a".to_vec());
        wal.pending_writes(b"b".to_vec());
        wal.pending_writes(b"c".to_vec());
        let positions = wal.write_all().unwrap();
        assert_eq!(positions.len(), 3);
        assert_eq!(wal.read(positions[1]).unwrap(), b"b");

        // Buffer drained.
        assert!(wal.write_all().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_recovers_positions() {
        let dir = TempDir::new().unwrap();
        let p1;
        {
            let wal = Wal::open(test_options(&dir)).unwrap();
            p1 = wal.write(b"persisted").unwrap();
            wal.sync().unwrap();
        }
        let wal = Wal::open(test_options(&dir)).unwrap();
        assert_eq!(wal.read(p1).unwrap(), b"persisted");

        // Appends continue after the recovered tail.
        let p2 = wal.write(b"more").unwrap();
        assert!(p2.offset > p1.offset || p2.segment_id > p1.segment_id);
        let chunks: Vec<_> = wal
            .reader()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(test_options(&dir)).unwrap();
            wal.write(b"complete").unwrap();
            wal.sync().unwrap();
        }
        // Simulate a crash mid-append: a length prefix with no payload.
        let path = dir.path().join(segment_file_name(1, ".wal"));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_be_bytes()).unwrap();
        file.write_all(b"par").unwrap();

        let wal = Wal::open(test_options(&dir)).unwrap();
        let chunks: Vec<_> = wal
            .reader()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, b"complete");
    }

    #[test]
    fn test_rename_ext() {
        let dir = TempDir::new().unwrap();
        let mut opts = test_options(&dir);
        opts.segment_ext = ".tvlog.0".to_string();
        let wal = Wal::open(opts).unwrap();
        let pos = wal.write(b"moved").unwrap();

        wal.rename_ext(".vlog.0").unwrap();
        assert!(dir.path().join("000000001.vlog.0").exists());
        assert!(!dir.path().join("000000001.tvlog.0").exists());
        assert_eq!(wal.read(pos).unwrap(), b"moved");

        // Reopens under the new extension.
        drop(wal);
        let mut opts = test_options(&dir);
        opts.segment_ext = ".vlog.0".to_string();
        let wal = Wal::open(opts).unwrap();
        assert_eq!(wal.read(pos).unwrap(), b"moved");
    }

    #[test]
    fn test_delete_removes_files() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_options(&dir)).unwrap();
        wal.write(b"doomed").unwrap();
        wal.delete().unwrap();
        assert!(!dir.path().join("000000001.wal").exists());
    }

    #[test]
    fn test_block_cache_serves_repeat_reads() {
        let dir = TempDir::new().unwrap();
        let mut opts = test_options(&dir);
        opts.block_cache = 16;
        let wal = Wal::open(opts).unwrap();

        let pos = wal.write(b"cached").unwrap();
        assert_eq!(wal.read(pos).unwrap(), b"cached");
        assert_eq!(wal.read(pos).unwrap(), b"cached");
        let (hits, _) = wal.cache.as_ref().unwrap().lock().unwrap().stats();
        assert!(hits >= 1);
    }

    #[test]
    fn test_empty_value_chunk() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_options(&dir)).unwrap();
        let pos = wal.write(b"").unwrap();
        assert_eq!(wal.read(pos).unwrap(), Vec::<u8>::new());
    }
}
