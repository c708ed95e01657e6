use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// File signature, written once at offset 0.
pub const MAGIC: &[u8; 8] = b"STAYWAL1";

/// Larger length prefixes can only come from a corrupt entry.
const MAX_ENTRY_LEN: usize = 16 << 20;

/// Encode a single event as `[u32 len][bincode][u32 crc32]`.
fn encode_event(writer: &mut Vec<u8>, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Outcome of reading a WAL file from the start.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the intact prefix (header + whole entries).
    pub valid_len: u64,
    /// Bytes after the intact prefix: a torn write or corruption.
    pub discarded: u64,
}

/// File operations the log needs beyond [`Write`].
pub trait LogFile: Write {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_all()
    }
}

/// Append-only write-ahead log of [`Event`]s.
///
/// Entries are length-prefixed and CRC-checked. Opening a log replays it and
/// cuts off anything past the last intact entry, so a crash mid-write never
/// shadows entries appended after restart.
///
/// Appends collect in memory until [`Wal::flush_sync`]. A failed flush drops
/// them and truncates the file back to the last synced length, so events
/// reported as failed can never reach disk with a later batch. If that
/// truncation fails too, the log refuses further appends.
pub struct Wal<F = File> {
    file: F,
    pending: Vec<u8>,
    pending_events: u64,
    /// File length covered by the last successful sync.
    synced_len: u64,
    path: PathBuf,
    appends: u64,
    broken: bool,
}

impl Wal {
    /// Open (or create) the log at `path`, returning it with the events it holds.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let synced_len = if replay.valid_len == 0 {
            file.set_len(0)?;
            file.write_all(MAGIC)?;
            file.sync_all()?;
            MAGIC.len() as u64
        } else {
            if replay.discarded > 0 {
                warn!(
                    "WAL {}: discarding {} trailing bytes after {} intact events",
                    path.display(),
                    replay.discarded,
                    replay.events.len()
                );
                file.set_len(replay.valid_len)?;
                file.sync_all()?;
            }
            replay.valid_len
        };

        Ok((Self::with_file(file, path.to_path_buf(), synced_len), replay.events))
    }

    /// Read every intact event. A missing or empty file is an empty log; a
    /// file with a foreign header is an error.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Ok(Replay::default());
        }

        let mut reader = BufReader::new(file);
        let mut header = [0u8; 8];
        match reader.read_exact(&mut header) {
            Ok(()) if &header == MAGIC => {}
            Ok(()) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{} is not a staybook WAL", path.display()),
                ));
            }
            // Crashed while writing the header: nothing was ever committed.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(Replay {
                    discarded: file_len,
                    ..Replay::default()
                });
            }
            Err(e) => return Err(e),
        }

        let mut events = Vec::new();
        let mut valid_len = MAGIC.len() as u64;
        while let Some((event, size)) = read_entry(&mut reader)? {
            events.push(event);
            valid_len += size;
        }

        Ok(Replay {
            events,
            valid_len,
            discarded: file_len - valid_len,
        })
    }
}

impl<F: LogFile> Wal<F> {
    /// Wrap an append-mode file whose first `synced_len` bytes are durable.
    fn with_file(file: F, path: PathBuf, synced_len: u64) -> Self {
        Self {
            file,
            pending: Vec::new(),
            pending_events: 0,
            synced_len,
            path,
            appends: 0,
            broken: false,
        }
    }

    /// Buffer one event. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.check_usable()?;
        let mark = self.pending.len();
        if let Err(e) = encode_event(&mut self.pending, event) {
            self.pending.truncate(mark);
            return Err(e);
        }
        self.pending_events += 1;
        Ok(())
    }

    /// Write buffered entries and fsync the file. On failure the buffered
    /// entries are discarded, not retried.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.check_usable()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        let result = self
            .file
            .write_all(&self.pending)
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync());
        match result {
            Ok(()) => {
                self.synced_len += self.pending.len() as u64;
                self.appends += self.pending_events;
                self.pending.clear();
                self.pending_events = 0;
                Ok(())
            }
            Err(e) => {
                self.discard_pending();
                Err(e)
            }
        }
    }

    /// Drop buffered entries and cut the file back to the last synced length.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_events = 0;
        if let Err(e) = self.file.truncate(self.synced_len) {
            warn!(
                "WAL {}: rollback to {} bytes failed, refusing appends: {e}",
                self.path.display(),
                self.synced_len
            );
            self.broken = true;
        }
    }

    fn check_usable(&self) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::other("WAL is unusable after a failed rollback"));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events made durable through this handle.
    pub fn appends(&self) -> u64 {
        self.appends
    }
}

/// Read one entry. `None` on clean EOF, a torn entry, or a CRC/decode failure.
fn read_entry(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_ENTRY_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, len as u64 + 8))),
        Err(_) => Ok(None),
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
