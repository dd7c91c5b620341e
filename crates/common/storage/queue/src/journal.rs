// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Append-only journal file of [`JournalRecord`]s.
//!
//! The journal is owned by exactly one queue worker, so appends never race.
//! Each record is framed into a buffer and handed to the OS in one write;
//! whether it is also forced to disk depends on the [`SyncPolicy`].
//!
//! Reading goes through [`JournalReader`], which serves both replay at
//! startup and read-behind while the queue is larger than its memory budget.

use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{BufReader, BufWriter, ErrorKind as IoErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use snafu::{ResultExt, ensure};
use tracing::{debug, info};

use crate::{
    SyncPolicy,
    crc::verify_frame_crc,
    error::{IoSnafu, JournalCorruptedSnafu, Result},
    item::Item,
    record::{CRC_SIZE, FORMAT_VERSION, HEADER_LEN, JournalRecord, LENGTH_SIZE, MAGIC, header},
};

/// Suffix of the temporary file a rewrite builds next to the journal.
pub const COMPACT_SUFFIX: &str = ".compact";

/// A frame running past the end of the file is only taken for a torn write
/// when at most this many bytes follow its start.
const MAX_TORN_TAIL: u64 = 64 * 1024 * 1024;

/// Counters written at the top of a rewritten journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub next_id:  u64,
    pub next_xid: u64,
}

pub struct Journal {
    path:      PathBuf,
    file:      File,
    size:      u64,
    policy:    SyncPolicy,
    /// Bytes written since the last fsync.
    dirty:     bool,
    last_sync: Instant,
    scratch:   BytesMut,
}

impl Journal {
    /// Opens the journal at `path`, creating it with a fresh header when it
    /// does not exist. A file too short to hold the header is reset.
    pub fn open(path: impl AsRef<Path>, policy: SyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context(IoSnafu { path: path.clone() })?;
        let mut size = file.metadata().context(IoSnafu { path: path.clone() })?.len();

        if size < HEADER_LEN {
            file.set_len(0).context(IoSnafu { path: path.clone() })?;
            file.write_all(&header()).context(IoSnafu { path: path.clone() })?;
            file.sync_all().context(IoSnafu { path: path.clone() })?;
            size = HEADER_LEN;
            debug!(path = ?path, "Created journal");
        } else {
            check_header(&mut file, &path)?;
        }
        file.seek(SeekFrom::Start(size)).context(IoSnafu { path: path.clone() })?;

        Ok(Self {
            path,
            file,
            size,
            policy,
            dirty: false,
            last_sync: Instant::now(),
            scratch: BytesMut::with_capacity(4096),
        })
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Current length of the file in bytes, header included.
    pub const fn size(&self) -> u64 { self.size }

    pub const fn set_policy(&mut self, policy: SyncPolicy) { self.policy = policy; }

    /// A reader over every record in the journal.
    pub fn reader(&self) -> Result<JournalReader> { JournalReader::open(&self.path, HEADER_LEN) }

    /// A reader positioned at `offset`, which must be a frame boundary.
    pub fn reader_at(&self, offset: u64) -> Result<JournalReader> {
        JournalReader::open(&self.path, offset)
    }

    /// Appends one record. Returns once the record is in the OS page cache,
    /// or on disk under [`SyncPolicy::Always`].
    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        self.scratch.clear();
        record.encode_frame(&mut self.scratch);
        self.file
            .write_all(&self.scratch)
            .context(IoSnafu { path: self.path.clone() })?;
        self.size += self.scratch.len() as u64;
        self.dirty = true;
        if self.policy == SyncPolicy::Always {
            self.sync()?;
        }
        Ok(())
    }

    /// When the next interval sync falls due, if one is owed.
    pub fn sync_deadline(&self) -> Option<Instant> {
        match self.policy {
            SyncPolicy::Interval(interval) if self.dirty => Some(self.last_sync + interval),
            _ => None,
        }
    }

    /// Performs an interval sync if it has fallen due.
    pub fn check_sync(&mut self) -> Result<()> {
        if self.sync_deadline().is_some_and(|deadline| deadline <= Instant::now()) {
            self.sync()?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        if self.dirty {
            self.file
                .sync_data()
                .context(IoSnafu { path: self.path.clone() })?;
            self.dirty = false;
        }
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Cuts the file back to `offset`, discarding a torn tail.
    pub fn truncate(&mut self, offset: u64) -> Result<()> {
        self.file
            .set_len(offset)
            .context(IoSnafu { path: self.path.clone() })?;
        self.file
            .seek(SeekFrom::Start(offset))
            .context(IoSnafu { path: self.path.clone() })?;
        self.file
            .sync_all()
            .context(IoSnafu { path: self.path.clone() })?;
        self.size = offset;
        Ok(())
    }

    /// Replaces the journal with a minimal one describing the same state:
    /// the checkpoint, each open reservation as an add immediately reserved,
    /// then every pending item. Built beside the journal and renamed over it.
    pub fn rewrite<'a>(
        &mut self,
        checkpoint: Checkpoint,
        reserved: impl IntoIterator<Item = (u64, &'a Item)>,
        pending: impl IntoIterator<Item = &'a Item>,
    ) -> Result<()> {
        let before = self.size;
        let tmp_path = compact_path(&self.path);
        let tmp = File::create(&tmp_path).context(IoSnafu { path: tmp_path.clone() })?;
        let mut writer = BufWriter::new(tmp);
        let mut buf = BytesMut::with_capacity(4096);

        buf.extend_from_slice(&header());
        JournalRecord::Continue {
            next_id:  checkpoint.next_id,
            next_xid: checkpoint.next_xid,
        }
        .encode_frame(&mut buf);
        for (xid, item) in reserved {
            JournalRecord::Add(item.clone()).encode_frame(&mut buf);
            JournalRecord::RemoveTentative(xid).encode_frame(&mut buf);
            flush_scratch(&mut writer, &mut buf, &tmp_path)?;
        }
        for item in pending {
            JournalRecord::Add(item.clone()).encode_frame(&mut buf);
            flush_scratch(&mut writer, &mut buf, &tmp_path)?;
        }
        flush_scratch(&mut writer, &mut buf, &tmp_path)?;

        let tmp = writer
            .into_inner()
            .map_err(std::io::IntoInnerError::into_error)
            .context(IoSnafu { path: tmp_path.clone() })?;
        tmp.sync_all().context(IoSnafu { path: tmp_path.clone() })?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).context(IoSnafu { path: self.path.clone() })?;
        sync_parent(&self.path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .context(IoSnafu { path: self.path.clone() })?;
        self.size = file
            .seek(SeekFrom::End(0))
            .context(IoSnafu { path: self.path.clone() })?;
        self.file = file;
        self.dirty = false;
        self.last_sync = Instant::now();

        info!(path = ?self.path, before, after = self.size, "Rewrote journal");
        Ok(())
    }

    /// Syncs and releases the file.
    pub fn close(mut self) -> Result<()> { self.sync() }

    /// Swaps the handle for a read-only one, so every later write fails the
    /// way a failing disk would.
    #[cfg(test)]
    pub(crate) fn make_read_only(&mut self) -> Result<()> {
        self.file = File::open(&self.path).context(IoSnafu { path: self.path.clone() })?;
        Ok(())
    }

    /// Closes and deletes the journal.
    pub fn erase(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != IoErrorKind::NotFound => Err(e).context(IoSnafu { path }),
            _ => {
                info!(path = ?path, "Erased journal");
                Ok(())
            }
        }
    }
}

fn flush_scratch(writer: &mut BufWriter<File>, buf: &mut BytesMut, path: &Path) -> Result<()> {
    writer
        .write_all(buf)
        .context(IoSnafu { path: path.to_path_buf() })?;
    buf.clear();
    Ok(())
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .context(IoSnafu { path: parent.to_path_buf() })?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> { Ok(()) }

fn check_header(file: &mut File, path: &Path) -> Result<()> {
    let mut buf = [0u8; HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_exact(&mut buf))
        .context(IoSnafu { path: path.to_path_buf() })?;
    ensure!(
        &buf[..4] == MAGIC,
        JournalCorruptedSnafu {
            path:   path.to_path_buf(),
            offset: 0u64,
            reason: "bad magic",
        }
    );
    ensure!(
        buf[4] == FORMAT_VERSION,
        JournalCorruptedSnafu {
            path:   path.to_path_buf(),
            offset: 4u64,
            reason: format!("unsupported format version {}", buf[4]),
        }
    );
    Ok(())
}

/// The temporary path used while rewriting the journal at `path`.
pub fn compact_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(COMPACT_SUFFIX);
    PathBuf::from(name)
}

/// Outcome of reading one frame.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A record and the offset just past its frame.
    Record(JournalRecord, u64),
    /// Clean end of file.
    End,
    /// The last frame is incomplete or fails its checksum; everything from
    /// `offset` on is a torn write.
    Torn { offset: u64, reason: &'static str },
}

/// Sequential reader over journal frames.
///
/// A checksum failure on the final frame is a torn write, and so is a frame
/// that runs past the end of the file when nothing intact follows its start.
/// A checksum failure with more data after it, an overrunning frame with
/// intact frames behind it, or a frame that passes its checksum but does not
/// decode, is corruption.
pub struct JournalReader {
    path:     PathBuf,
    reader:   BufReader<File>,
    position: u64,
    /// File length as last observed. Refreshed when a frame seems to run past
    /// it, since the journal may have grown since.
    end:      u64,
}

impl JournalReader {
    pub fn open(path: impl AsRef<Path>, offset: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).context(IoSnafu { path: path.clone() })?;
        let end = file.metadata().context(IoSnafu { path: path.clone() })?.len();
        if offset == HEADER_LEN && end >= HEADER_LEN {
            check_header(&mut file, &path)?;
        }
        file.seek(SeekFrom::Start(offset))
            .context(IoSnafu { path: path.clone() })?;
        Ok(Self {
            path,
            reader: BufReader::with_capacity(64 * 1024, file),
            position: offset,
            end,
        })
    }

    /// Offset of the next frame.
    pub const fn position(&self) -> u64 { self.position }

    pub fn next_record(&mut self) -> Result<ReadOutcome> {
        let start = self.position;
        if !self.available(LENGTH_SIZE as u64)? {
            return Ok(if start == self.end {
                ReadOutcome::End
            } else {
                ReadOutcome::Torn {
                    offset: start,
                    reason: "incomplete length prefix",
                }
            });
        }

        let mut length_buf = [0u8; LENGTH_SIZE];
        self.read_exact(&mut length_buf)?;
        let length = u32::from_le_bytes(length_buf);
        let frame_len = (LENGTH_SIZE + CRC_SIZE) as u64 + u64::from(length);

        if !self.available(frame_len)? {
            if let Some(reason) = self.overrun_damage(start)? {
                return JournalCorruptedSnafu {
                    path: self.path.clone(),
                    offset: start,
                    reason: format!("frame length {length} {reason}"),
                }
                .fail();
            }
            return Ok(ReadOutcome::Torn {
                offset: start,
                reason: "incomplete frame",
            });
        }

        let mut payload = vec![0u8; length as usize];
        self.read_exact(&mut payload)?;
        let mut crc_buf = [0u8; CRC_SIZE];
        self.read_exact(&mut crc_buf)?;
        let stored = u32::from_le_bytes(crc_buf);

        if !verify_frame_crc(length, &payload, stored) {
            if start + frame_len >= self.end {
                return Ok(ReadOutcome::Torn {
                    offset: start,
                    reason: "checksum mismatch on final frame",
                });
            }
            return JournalCorruptedSnafu {
                path:   self.path.clone(),
                offset: start,
                reason: "checksum mismatch",
            }
            .fail();
        }

        let record = JournalRecord::decode(Bytes::from(payload)).map_err(|e| {
            JournalCorruptedSnafu {
                path:   self.path.clone(),
                offset: start,
                reason: e.to_string(),
            }
            .build()
        })?;
        self.position = start + frame_len;
        Ok(ReadOutcome::Record(record, self.position))
    }

    /// Decides whether the frame at `start`, which runs past the end of the
    /// file, is damaged rather than torn. A torn write leaves a prefix of a
    /// single frame, so an intact frame anywhere behind `start` means the
    /// length prefix itself is bad.
    fn overrun_damage(&self, start: u64) -> Result<Option<&'static str>> {
        let remaining = self.end.saturating_sub(start);
        if remaining > MAX_TORN_TAIL {
            return Ok(Some("runs past the end of the file with too much data behind it"));
        }

        let mut file = File::open(&self.path).context(IoSnafu { path: self.path.clone() })?;
        file.seek(SeekFrom::Start(start))
            .context(IoSnafu { path: self.path.clone() })?;
        let mut tail = Vec::with_capacity(remaining as usize);
        file.take(remaining)
            .read_to_end(&mut tail)
            .context(IoSnafu { path: self.path.clone() })?;

        let intact = (1..tail.len()).any(|offset| starts_with_frame(&tail[offset..]));
        Ok(intact.then_some("runs past the end of the file but intact frames follow"))
    }

    /// Whether `len` bytes from the current position exist in the file.
    fn available(&mut self, len: u64) -> Result<bool> {
        if self.position + len <= self.end {
            return Ok(true);
        }
        self.end = self
            .reader
            .get_ref()
            .metadata()
            .context(IoSnafu { path: self.path.clone() })?
            .len();
        Ok(self.position + len <= self.end)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader
            .read_exact(buf)
            .context(IoSnafu { path: self.path.clone() })?;
        self.position += buf.len() as u64;
        Ok(())
    }
}

/// Whether `buf` begins with a complete frame that passes its checksum.
fn starts_with_frame(buf: &[u8]) -> bool {
    let Some((prefix, rest)) = buf.split_first_chunk::<LENGTH_SIZE>() else {
        return false;
    };
    let length = u32::from_le_bytes(*prefix);
    let Some(&opcode) = rest.first() else {
        return false;
    };
    if !JournalRecord::plausible_length(opcode, length) {
        return false;
    }
    let Some((payload, rest)) = rest.split_at_checked(length as usize) else {
        return false;
    };
    rest.first_chunk::<CRC_SIZE>()
        .is_some_and(|crc| verify_frame_crc(length, payload, u32::from_le_bytes(*crc)))
}
