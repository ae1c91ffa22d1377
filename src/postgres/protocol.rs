//! Payloads exchanged inside CopyData frames once a connection is in
//! CopyBoth mode.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

pub const XLOG_DATA_TAG: u8 = b'w';
pub const PRIMARY_KEEPALIVE_TAG: u8 = b'k';
pub const STANDBY_STATUS_UPDATE_TAG: u8 = b'r';

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: u64 = 946_684_800;

const XLOG_DATA_HEADER_LEN: usize = 24;
const KEEPALIVE_LEN: usize = 17;

#[derive(Debug, Clone, PartialEq)]
pub enum CopyBothMessage {
    /// WAL data carrying one output plugin message.
    XLogData {
        wal_start: u64,
        wal_end: u64,
        server_time: i64,
        data: Bytes,
    },
    /// Primary keepalive.
    Keepalive {
        wal_end: u64,
        server_time: i64,
        reply_requested: bool,
    },
}

impl CopyBothMessage {
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Protocol("Empty CopyData message".to_string()));
        }

        let tag = data.get_u8();
        match tag {
            XLOG_DATA_TAG => {
                if data.remaining() < XLOG_DATA_HEADER_LEN {
                    return Err(Error::Protocol(format!(
                        "Invalid XLogData message size: {}",
                        data.remaining() + 1
                    )));
                }
                let wal_start = data.get_u64();
                let wal_end = data.get_u64();
                let server_time = data.get_i64();
                Ok(CopyBothMessage::XLogData {
                    wal_start,
                    wal_end,
                    server_time,
                    data,
                })
            }
            PRIMARY_KEEPALIVE_TAG => {
                if data.remaining() < KEEPALIVE_LEN {
                    return Err(Error::Protocol(format!(
                        "Invalid keepalive message size: {}",
                        data.remaining() + 1
                    )));
                }
                Ok(CopyBothMessage::Keepalive {
                    wal_end: data.get_u64(),
                    server_time: data.get_i64(),
                    reply_requested: data.get_u8() != 0,
                })
            }
            other => Err(Error::Protocol(format!(
                "Unknown CopyData message tag: {:?}",
                other as char
            ))),
        }
    }
}

/// Microseconds since the PostgreSQL epoch.
pub fn pg_epoch_micros(now: SystemTime) -> i64 {
    let pg_epoch = UNIX_EPOCH + Duration::from_secs(PG_EPOCH_OFFSET_SECS);
    match now.duration_since(pg_epoch) {
        Ok(d) => d.as_micros() as i64,
        Err(_) => 0,
    }
}

/// Standby status update reporting `lsn` as written, flushed and applied.
pub fn standby_status_update(lsn: u64, now: SystemTime, reply_requested: bool) -> Bytes {
    let mut payload = BytesMut::with_capacity(34);
    payload.put_u8(STANDBY_STATUS_UPDATE_TAG);
    payload.put_u64(lsn);
    payload.put_u64(lsn);
    payload.put_u64(lsn);
    payload.put_i64(pg_epoch_micros(now));
    payload.put_u8(u8::from(reply_requested));
    payload.freeze()
}
