use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Written once at the head of every log file.
const MAGIC: &[u8; 8] = b"BKNGWAL1";

fn encode_record<T: Serialize>(writer: &mut impl Write, record: &T) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

fn open_for_append(path: &Path) -> io::Result<File> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if file.metadata()?.len() == 0 {
        file.write_all(MAGIC)?;
    }
    Ok(file)
}

/// Outcome of reading a log back from disk.
#[derive(Debug)]
pub struct Replay<T> {
    pub records: Vec<T>,
    /// True when a torn or corrupt tail was discarded.
    pub truncated: bool,
    /// Byte length of the intact prefix.
    pub valid_len: u64,
}

/// Append-only write-ahead log of `T` records.
///
/// File layout: `MAGIC` then entries of `[u32 len][bincode T][u32 crc32]`.
/// A torn last entry (crash mid-write) fails its length or CRC check and is
/// dropped on replay together with everything after it.
pub struct Wal<T> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    _record: PhantomData<fn(T)>,
}

impl<T: Serialize + DeserializeOwned> Wal<T> {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_for_append(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    /// Append and fsync one record.
    #[cfg(test)]
    pub fn append(&mut self, record: &T) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record without syncing; `flush_sync` commits the batch.
    pub fn append_buffered(&mut self, record: &T) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as exactly `records`: write a sibling temp file,
    /// fsync it, rename it over the log, then reopen for appends.
    pub fn compact(&mut self, records: &[T]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            writer.write_all(MAGIC)?;
            for record in records {
                encode_record(&mut writer, record)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.writer = BufWriter::new(open_for_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact record. A missing file is an empty log; a file with
    /// a foreign header is an error rather than silently ignored.
    pub fn replay(path: &Path) -> io::Result<Replay<T>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay { records: Vec::new(), truncated: false, valid_len: 0 });
            }
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        let mut magic = [0u8; 8];
        match reader.read_exact(&mut magic) {
            Ok(()) if &magic == MAGIC => {}
            Ok(()) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "not a bookings WAL"));
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(Replay { records, truncated: true, valid_len: 0 });
            }
            Err(e) => return Err(e),
        }

        let mut valid_len = MAGIC.len() as u64;
        let truncated = loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break false,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            match reader
                .read_exact(&mut payload)
                .and_then(|()| reader.read_exact(&mut crc_buf))
            {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break true,
                Err(e) => return Err(e),
            }

            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break true;
            }
            match bincode::deserialize::<T>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break true,
            }
            valid_len += 8 + len as u64;
        };

        Ok(Replay { records, truncated, valid_len })
    }

    /// Cut a torn tail off so new appends land right after the last intact record.
    pub fn truncate_to(path: &Path, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(len)?;
        file.sync_all()
    }
}
