use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use bytes::{Buf, Bytes};
use log::{debug, warn};

use crate::decode::Timestamp;
use crate::error::{Result, TrackerError};

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_NANOS: u32 = 0xa1b2_3c4d;
const GLOBAL_HEADER: usize = 24;
const RECORD_HEADER: usize = 16;
/// 单条记录的上限, 防止损坏的长度字段导致巨量分配
const MAX_RECORD: u32 = 256 * 1024;

#[derive(Debug, Clone)]
pub struct SavefileRecord {
    pub timestamp: Timestamp,
    /// original length on the wire
    pub wire_len: u32,
    pub data: Bytes,
}

/// Reader for classic libpcap savefiles, either byte order, micro- or
/// nanosecond timestamps.
pub struct SavefileReader<R> {
    inner: R,
    little_endian: bool,
    nanos: bool,
    linktype: u32,
    snaplen: u32,
    records: u64,
}

impl SavefileReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        debug!("opened savefile {}", path.as_ref().display());
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> SavefileReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let mut header = [0u8; GLOBAL_HEADER];
        inner.read_exact(&mut header)?;
        let mut buf = &header[..];
        let raw_magic = buf.get_u32();
        let (little_endian, nanos) = match (raw_magic, raw_magic.swap_bytes()) {
            (MAGIC_MICROS, _) => (false, false),
            (MAGIC_NANOS, _) => (false, true),
            (_, MAGIC_MICROS) => (true, false),
            (_, MAGIC_NANOS) => (true, true),
            _ => {
                return Err(TrackerError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("not a pcap savefile (magic {:#010x})", raw_magic),
                )))
            }
        };
        let read_u32 = |buf: &mut &[u8]| {
            if little_endian {
                buf.get_u32_le()
            } else {
                buf.get_u32()
            }
        };
        // version major/minor, thiszone, sigfigs
        buf.advance(12);
        let snaplen = read_u32(&mut buf);
        let linktype = read_u32(&mut buf) & 0x0fff_ffff;
        debug!(
            "savefile: linktype={} snaplen={} little_endian={} nanos={}",
            linktype, snaplen, little_endian, nanos
        );
        Ok(Self {
            inner,
            little_endian,
            nanos,
            linktype,
            snaplen,
            records: 0,
        })
    }

    pub fn linktype(&self) -> u32 {
        self.linktype
    }

    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    fn read_u32(&self, buf: &mut &[u8]) -> u32 {
        if self.little_endian {
            buf.get_u32_le()
        } else {
            buf.get_u32()
        }
    }

    /// `Ok(None)` at a clean end of file; a record cut short by the end of
    /// file is reported as an error.
    pub fn next_record(&mut self) -> Result<Option<SavefileRecord>> {
        let mut header = [0u8; RECORD_HEADER];
        match read_full(&mut self.inner, &mut header)? {
            0 => return Ok(None),
            RECORD_HEADER => {}
            n => {
                warn!("savefile truncated inside record header ({} bytes)", n);
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
        let mut buf = &header[..];
        let secs = self.read_u32(&mut buf);
        let frac = self.read_u32(&mut buf);
        let incl_len = self.read_u32(&mut buf);
        let wire_len = self.read_u32(&mut buf);
        if incl_len > MAX_RECORD {
            return Err(TrackerError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record {} claims {} bytes", self.records + 1, incl_len),
            )));
        }
        let mut data = vec![0u8; incl_len as usize];
        self.inner.read_exact(&mut data)?;
        self.records += 1;

        let micros = if self.nanos { frac / 1000 } else { frac };
        Ok(Some(SavefileRecord {
            timestamp: Timestamp::from_secs_micros(secs as u64, micros),
            wire_len,
            data: Bytes::from(data),
        }))
    }
}

impl<R: Read> Iterator for SavefileReader<R> {
    type Item = Result<SavefileRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
