//! Write-Ahead Log (WAL) for durability.
//!
//! Format: each entry is `[4-byte CRC32][4-byte length][JSON payload]\n`.
//! On open, every valid entry is replayed and a corrupt or truncated tail
//! is cut off so later appends start on a frame boundary.

use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

const HEADER_LEN: u64 = 8;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Fsync policy for the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    /// Fsync after every write.
    Always,
    /// Fsync when the caller asks (`Wal::sync`).
    #[default]
    Batch,
    /// Never explicitly fsync (OS decides).
    None,
}

/// An append-only write-ahead log of `R` records.
pub struct Wal<R> {
    writer: BufWriter<File>,
    path: PathBuf,
    fsync: FsyncPolicy,
    entries_written: u64,
    _record: PhantomData<fn(R)>,
}

impl<R> std::fmt::Debug for Wal<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("fsync", &self.fsync)
            .field("entries_written", &self.entries_written)
            .finish_non_exhaustive()
    }
}

impl<R: Serialize + DeserializeOwned> Wal<R> {
    /// Open or create the WAL at `path`, returning it with every record
    /// recovered from a previous run.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<(Self, Vec<R>), WalError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let (records, valid_len) = Self::read_valid(path)?;

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "WAL {:?}: discarding {} bytes of corrupt tail",
                path,
                file.metadata()?.len() - valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        tracing::info!("WAL opened at {:?}: {} records recovered", path, records.len());
        Ok((
            Self {
                writer: BufWriter::new(file),
                path: path.to_path_buf(),
                fsync,
                entries_written: 0,
                _record: PhantomData,
            },
            records,
        ))
    }

    /// Append a record to the WAL.
    pub fn append(&mut self, record: &R) -> Result<(), WalError> {
        write_frame(&mut self.writer, &serde_json::to_vec(record)?)?;
        self.writer.flush()?;

        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_data()?;
        }

        self.entries_written += 1;
        Ok(())
    }

    /// Make appended records durable. Under [`FsyncPolicy::None`] this only
    /// hands them to the OS.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        if self.fsync != FsyncPolicy::None {
            self.writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Number of entries appended since open.
    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the whole log with `records`.
    ///
    /// The new contents are written to a sibling file and renamed into
    /// place, so a crash leaves either the old log or the new one.
    pub fn rewrite<'a, I>(&mut self, records: I) -> Result<(), WalError>
    where
        I: IntoIterator<Item = &'a R>,
        R: 'a,
    {
        let tmp = self.path.with_extension("compact");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for record in records {
                write_frame(&mut out, &serde_json::to_vec(record)?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        tracing::debug!("WAL {:?} rewritten", self.path);
        Ok(())
    }

    /// Replay all valid entries from a WAL file without opening it for
    /// writing. Stops at the first corrupt entry.
    pub fn replay(path: &Path) -> Result<Vec<R>, WalError> {
        Ok(Self::read_valid(path)?.0)
    }

    fn read_valid(path: &Path) -> Result<(Vec<R>, u64), WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((vec![], 0)),
            Err(e) => return Err(WalError::Io(e)),
        };

        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut offset = 0u64;

        loop {
            let mut header = [0u8; HEADER_LEN as usize];
            match read_full(&mut reader, &mut header)? {
                Fill::Complete => {}
                Fill::Empty => break,
                Fill::Partial => {
                    tracing::warn!("WAL truncated in header at entry {}", records.len());
                    break;
                }
            }
            let expected_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

            // Payload plus trailing newline.
            let mut body = vec![0u8; len + 1];
            if read_full(&mut reader, &mut body)? != Fill::Complete {
                tracing::warn!("WAL truncated mid-entry at entry {}", records.len());
                break;
            }
            let payload = &body[..len];

            let mut hasher = Hasher::new();
            hasher.update(payload);
            let actual_crc = hasher.finalize();
            if actual_crc != expected_crc || body[len] != b'\n' {
                tracing::warn!(
                    "WAL CRC mismatch at entry {}: expected {:#010x}, got {:#010x}; stopping replay",
                    records.len(),
                    expected_crc,
                    actual_crc
                );
                break;
            }

            match serde_json::from_slice(payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("WAL entry {} undecodable ({}); stopping replay", records.len(), e);
                    break;
                }
            }
            offset += HEADER_LEN + len as u64 + 1;
        }

        Ok((records, offset))
    }
}

fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let crc = hasher.finalize();
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "WAL entry too large"))?;

    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(payload)?;
    w.write_all(b"\n")
}

#[derive(Debug, PartialEq, Eq)]
enum Fill {
    Complete,
    Partial,
    Empty,
}

fn read_full<Rd: Read>(reader: &mut Rd, buf: &mut [u8]) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(match filled {
        0 if !buf.is_empty() => Fill::Empty,
        n if n == buf.len() => Fill::Complete,
        _ => Fill::Partial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Entry {
        Mark(u64),
        Blob { key: String, data: Vec<u8> },
    }

    fn blob(key: &str, data: &str) -> Entry {
        Entry::Blob {
            key: key.to_string(),
            data: data.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_wal_write_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let (mut wal, old) = Wal::<Entry>::open(&wal_path, FsyncPolicy::Always).unwrap();
            assert!(old.is_empty());
            wal.append(&blob("k1", "v1")).unwrap();
            wal.append(&Entry::Mark(7)).unwrap();
            wal.append(&blob("k3", "v3")).unwrap();
            assert_eq!(wal.entries_written(), 3);
        }

        let records = Wal::<Entry>::replay(&wal_path).unwrap();
        assert_eq!(records, vec![blob("k1", "v1"), Entry::Mark(7), blob("k3", "v3")]);
    }

    #[test]
    fn test_wal_replay_missing_file() {
        let dir = TempDir::new().unwrap();
        let records = Wal::<Entry>::replay(&dir.path().join("empty.wal")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_wal_open_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("a/b/acceptor.wal");
        let (mut wal, _) = Wal::<Entry>::open(&wal_path, FsyncPolicy::None).unwrap();
        wal.append(&Entry::Mark(1)).unwrap();
        assert!(wal_path.exists());
    }

    #[test]
    fn test_wal_truncated_tail_is_cut_on_open() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("trunc.wal");

        {
            let (mut wal, _) = Wal::<Entry>::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&blob("k1", "v1")).unwrap();
            wal.append(&blob("k2", "v2")).unwrap();
            wal.append(&blob("k3", "v3")).unwrap();
        }
        {
            let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
            let len = file.metadata().unwrap().len();
            file.set_len(len - 5).unwrap();
        }

        // Reopen, recover two entries, then append after the cut.
        {
            let (mut wal, old) = Wal::<Entry>::open(&wal_path, FsyncPolicy::Always).unwrap();
            assert_eq!(old, vec![blob("k1", "v1"), blob("k2", "v2")]);
            wal.append(&Entry::Mark(4)).unwrap();
        }

        let records = Wal::<Entry>::replay(&wal_path).unwrap();
        assert_eq!(records, vec![blob("k1", "v1"), blob("k2", "v2"), Entry::Mark(4)]);
    }

    #[test]
    fn test_wal_crc_corruption_stops_replay() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("crc.wal");

        {
            let (mut wal, _) = Wal::<Entry>::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&Entry::Mark(1)).unwrap();
            wal.append(&Entry::Mark(2)).unwrap();
        }
        {
            // Flip a payload byte of the second entry.
            let first_len = Wal::<Entry>::read_valid(&wal_path).unwrap().1;
            let mut file = OpenOptions::new().read(true).write(true).open(&wal_path).unwrap();
            let len = file.metadata().unwrap().len();
            let pos = first_len + (len - first_len) / 2 + 2;
            file.seek(SeekFrom::Start(pos)).unwrap();
            file.write_all(b"#").unwrap();
        }

        let records = Wal::<Entry>::replay(&wal_path).unwrap();
        assert_eq!(records, vec![Entry::Mark(1)]);
    }

    #[test]
    fn test_wal_rewrite_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("compact.wal");

        let (mut wal, _) = Wal::<Entry>::open(&wal_path, FsyncPolicy::Batch).unwrap();
        for i in 0..10 {
            wal.append(&Entry::Mark(i)).unwrap();
        }
        let keep = vec![Entry::Mark(8), Entry::Mark(9)];
        wal.rewrite(&keep).unwrap();
        wal.append(&Entry::Mark(10)).unwrap();
        wal.sync().unwrap();

        let records = Wal::<Entry>::replay(&wal_path).unwrap();
        assert_eq!(records, vec![Entry::Mark(8), Entry::Mark(9), Entry::Mark(10)]);
        assert!(!wal_path.with_extension("compact").exists());
    }

    #[test]
    fn test_fsync_policy_from_yaml_name() {
        let p: FsyncPolicy = serde_json::from_str("\"always\"").unwrap();
        assert_eq!(p, FsyncPolicy::Always);
        assert_eq!(FsyncPolicy::default(), FsyncPolicy::Batch);
    }
}
