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

//! Journal records and their on-disk framing.
//!
//! ## File layout
//!
//! ```text
//! ┌──────────────────────┬─────────┬─────────┬─────┐
//! │ header: "SPQJ" ver 1 │ frame 0 │ frame 1 │ ... │
//! └──────────────────────┴─────────┴─────────┴─────┘
//! ```
//!
//! ## Frame
//!
//! ```text
//! ┌───────────────┬────────────┬────────────────┬───────────────┐
//! │  Length (4B)  │ Opcode (1B)│ Body (Length-1)│  CRC32 (4B)   │
//! │ little-endian │            │                │ little-endian │
//! └───────────────┴────────────┴────────────────┴───────────────┘
//! ```
//!
//! Length counts the opcode and body. The CRC covers the length field and
//! the payload (see [`crate::crc`]).
//!
//! ## Bodies
//!
//! | opcode | record            | body                                          |
//! |--------|-------------------|-----------------------------------------------|
//! | 0x01   | `Add`             | id u64, added ms i64, flags u8, [expiry ms i64], data |
//! | 0x02   | `Remove`          | empty                                         |
//! | 0x03   | `RemoveTentative` | xid u64                                       |
//! | 0x04   | `Confirm`         | xid u64                                       |
//! | 0x05   | `Unremove`        | xid u64                                       |
//! | 0x06   | `SavedXid`        | xid u64                                       |
//! | 0x07   | `Continue`        | next id u64, next xid u64                     |

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::{crc::frame_crc, item::Item};

pub(crate) const MAGIC: &[u8; 4] = b"SPQJ";
pub(crate) const FORMAT_VERSION: u8 = 1;
/// Magic, version and three reserved bytes.
pub const HEADER_LEN: u64 = 8;

pub(crate) const LENGTH_SIZE: usize = 4;
pub(crate) const CRC_SIZE: usize = 4;

/// Opcode, id, added time, flags and expiry ahead of an item's data.
const ADD_OVERHEAD: u64 = 1 + 8 + 8 + 1 + 8;
/// Largest item data whose `Add` payload length still fits the u32 prefix.
pub const MAX_ITEM_LEN: u64 = u32::MAX as u64 - ADD_OVERHEAD;

const OP_ADD: u8 = 0x01;
const OP_REMOVE: u8 = 0x02;
const OP_REMOVE_TENTATIVE: u8 = 0x03;
const OP_CONFIRM: u8 = 0x04;
const OP_UNREMOVE: u8 = 0x05;
const OP_SAVED_XID: u8 = 0x06;
const OP_CONTINUE: u8 = 0x07;

const FLAG_EXPIRES: u8 = 0x01;

/// One state transition of a queue. Replaying every record of a journal in
/// order from empty state reproduces the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// Append an item to the pending tail.
    Add(Item),
    /// Drop the pending head permanently.
    Remove,
    /// Move the pending head into reservation `xid`.
    RemoveTentative(u64),
    /// Delete reservation `xid`.
    Confirm(u64),
    /// Return reservation `xid` to pending.
    Unremove(u64),
    /// The xid counter is at least this value.
    SavedXid(u64),
    /// Counters carried across a rewrite.
    Continue { next_id: u64, next_xid: u64 },
}

impl JournalRecord {
    const fn opcode(&self) -> u8 {
        match self {
            Self::Add(_) => OP_ADD,
            Self::Remove => OP_REMOVE,
            Self::RemoveTentative(_) => OP_REMOVE_TENTATIVE,
            Self::Confirm(_) => OP_CONFIRM,
            Self::Unremove(_) => OP_UNREMOVE,
            Self::SavedXid(_) => OP_SAVED_XID,
            Self::Continue { .. } => OP_CONTINUE,
        }
    }

    /// Appends the framed record to `buf` and returns the frame length.
    pub(crate) fn encode_frame(&self, buf: &mut BytesMut) -> usize {
        let start = buf.len();
        buf.put_u32_le(0);
        buf.put_u8(self.opcode());
        match self {
            Self::Add(item) => {
                buf.put_u64_le(item.id);
                buf.put_i64_le(item.added_at.timestamp_millis());
                match item.expires_at {
                    Some(expires_at) => {
                        buf.put_u8(FLAG_EXPIRES);
                        buf.put_i64_le(expires_at.timestamp_millis());
                    }
                    None => buf.put_u8(0),
                }
                buf.put_slice(&item.data);
            }
            Self::Remove => {}
            Self::RemoveTentative(xid)
            | Self::Confirm(xid)
            | Self::Unremove(xid)
            | Self::SavedXid(xid) => buf.put_u64_le(*xid),
            Self::Continue { next_id, next_xid } => {
                buf.put_u64_le(*next_id);
                buf.put_u64_le(*next_xid);
            }
        }

        // callers bound item data by MAX_ITEM_LEN
        let payload_len = (buf.len() - start - LENGTH_SIZE) as u32;
        buf[start..start + LENGTH_SIZE].copy_from_slice(&payload_len.to_le_bytes());
        let crc = frame_crc(payload_len, &buf[start + LENGTH_SIZE..]);
        buf.put_u32_le(crc);
        buf.len() - start
    }

    /// Whether `length` is a possible payload length for a frame whose
    /// payload starts with `opcode`.
    pub(crate) const fn plausible_length(opcode: u8, length: u32) -> bool {
        match opcode {
            OP_ADD => length as u64 >= ADD_OVERHEAD - 8,
            OP_REMOVE => length == 1,
            OP_REMOVE_TENTATIVE | OP_CONFIRM | OP_UNREMOVE | OP_SAVED_XID => length == 9,
            OP_CONTINUE => length == 17,
            _ => false,
        }
    }

    /// Decodes a verified frame payload (opcode plus body).
    pub(crate) fn decode(mut payload: Bytes) -> Result<Self, DecodeError> {
        let opcode = payload.try_get_u8().map_err(|_| DecodeError::Empty)?;
        let record = match opcode {
            OP_ADD => {
                let id = read_u64(&mut payload)?;
                let added_at = read_time(&mut payload)?;
                let flags = payload.try_get_u8().map_err(|_| DecodeError::Short)?;
                let expires_at = if flags & FLAG_EXPIRES == 0 {
                    None
                } else {
                    Some(read_time(&mut payload)?)
                };
                Self::Add(Item {
                    id,
                    data: payload,
                    added_at,
                    expires_at,
                })
            }
            OP_REMOVE => Self::Remove,
            OP_REMOVE_TENTATIVE => Self::RemoveTentative(read_u64(&mut payload)?),
            OP_CONFIRM => Self::Confirm(read_u64(&mut payload)?),
            OP_UNREMOVE => Self::Unremove(read_u64(&mut payload)?),
            OP_SAVED_XID => Self::SavedXid(read_u64(&mut payload)?),
            OP_CONTINUE => Self::Continue {
                next_id:  read_u64(&mut payload)?,
                next_xid: read_u64(&mut payload)?,
            },
            other => return Err(DecodeError::UnknownOpcode(other)),
        };
        Ok(record)
    }
}

impl fmt::Display for JournalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add(item) => {
                write!(f, "ADD id={} size={} added={}", item.id, item.size(), item.added_at)?;
                if let Some(expires_at) = item.expires_at {
                    write!(f, " expires={expires_at}")?;
                }
                Ok(())
            }
            Self::Remove => f.write_str("REM"),
            Self::RemoveTentative(xid) => write!(f, "RSV xid={xid}"),
            Self::Confirm(xid) => write!(f, "ACK xid={xid}"),
            Self::Unremove(xid) => write!(f, "UNR xid={xid}"),
            Self::SavedXid(xid) => write!(f, "XID {xid}"),
            Self::Continue { next_id, next_xid } => {
                write!(f, "CONT next_id={next_id} next_xid={next_xid}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodeError {
    Empty,
    Short,
    BadTimestamp,
    UnknownOpcode(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty record"),
            Self::Short => f.write_str("record body too short"),
            Self::BadTimestamp => f.write_str("timestamp out of range"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode {op:#04x}"),
        }
    }
}

fn read_u64(buf: &mut Bytes) -> Result<u64, DecodeError> {
    buf.try_get_u64_le().map_err(|_| DecodeError::Short)
}

fn read_time(buf: &mut Bytes) -> Result<DateTime<Utc>, DecodeError> {
    let millis = buf.try_get_i64_le().map_err(|_| DecodeError::Short)?;
    DateTime::from_timestamp_millis(millis).ok_or(DecodeError::BadTimestamp)
}

pub(crate) fn header() -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[..4].copy_from_slice(MAGIC);
    header[4] = FORMAT_VERSION;
    header
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::crc::verify_frame_crc;

    fn item(id: u64, expires: bool) -> Item {
        let added_at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        Item {
            id,
            data: Bytes::from(format!("payload-{id}")),
            added_at,
            expires_at: expires.then(|| added_at + chrono::Duration::seconds(30)),
        }
    }

    fn split_frame(frame: &[u8]) -> Bytes {
        let length = u32::from_le_bytes(frame[..4].try_into().unwrap());
        let payload = &frame[4..4 + length as usize];
        let crc = u32::from_le_bytes(frame[4 + length as usize..].try_into().unwrap());
        assert!(verify_frame_crc(length, payload, crc));
        Bytes::copy_from_slice(payload)
    }

    #[test_case(JournalRecord::Add(item(7, false)) ; "add")]
    #[test_case(JournalRecord::Add(item(8, true)) ; "add with expiry")]
    #[test_case(JournalRecord::Remove ; "remove")]
    #[test_case(JournalRecord::RemoveTentative(3) ; "reserve")]
    #[test_case(JournalRecord::Continue { next_id: 9, next_xid: 4 } ; "continue")]
    fn test_frame_decodes_back(record: JournalRecord) {
        let mut buf = BytesMut::new();
        let len = record.encode_frame(&mut buf);
        assert_eq!(len, buf.len());
        assert_eq!(JournalRecord::decode(split_frame(&buf)).unwrap(), record);
    }

    #[test]
    fn test_reject_unknown_opcode() {
        let err = JournalRecord::decode(Bytes::from_static(&[0x7f, 0, 0])).unwrap_err();
        assert_eq!(err, DecodeError::UnknownOpcode(0x7f));
    }

    #[test]
    fn test_reject_short_body() {
        let err = JournalRecord::decode(Bytes::from_static(&[OP_CONFIRM, 1, 2])).unwrap_err();
        assert_eq!(err, DecodeError::Short);
    }
}
