//! Packet codec - announcement and acknowledgment framing
//!
//! All numeric fields are fixed-width, unsigned, big-endian. Every datagram
//! ends with a CRC-32 of the bytes preceding it.
//!
//! ```text
//! packet  := magic:u16 version:u8 flags:u8 sequence:u32 count:u16
//!            record*count props crc:u32
//! record  := str(name) str(type) alias_present:u8 [str(alias)] props
//! props   := count:u16 (str(key) str(value))*count
//! str     := len:u16 utf8*len
//! ack     := magic:u16 version:u8 sequence:u32 status:u8 crc:u32
//! ```

use std::ops::Range;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::contracts::{AckStatus, Acknowledgment, Announcement, GlobalProperties, Properties, Record};
use crate::errors::{RecsyncError, Result};

/// Protocol magic, ASCII "RC"
pub const MAGIC: u16 = 0x5243;

/// Fixed packet header length
pub const HEADER_LEN: usize = 10;

/// CRC-32 trailer length
pub const CHECKSUM_LEN: usize = 4;

/// Acknowledgment datagram length
pub const ACK_LEN: usize = 12;

/// Flag bit: more packets of the same batch follow
pub const FLAG_CONTINUATION: u8 = 0x01;

/// Smallest accepted `max_packet_size`
pub const MIN_PACKET_SIZE: usize = 64;

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// One encoded announcement datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub sequence: u32,
    /// Indices into the record slice passed to [`PacketCodec::encode`]
    pub records: Range<usize>,
    pub continuation: bool,
    pub bytes: Bytes,
}

/// Announcement codec bounded by a maximum datagram size
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(crate::MAX_PACKET_SIZE)
    }
}

fn str_len(s: &str) -> usize {
    2 + s.len()
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_properties(buf: &mut BytesMut, props: &Properties) {
    buf.put_u16(props.len() as u16);
    for (key, value) in props.iter() {
        put_str(buf, key);
        put_str(buf, value);
    }
}

fn put_record(buf: &mut BytesMut, record: &Record) {
    put_str(buf, &record.name);
    put_str(buf, &record.record_type);
    match &record.alias {
        Some(alias) => {
            buf.put_u8(1);
            put_str(buf, alias);
        }
        None => buf.put_u8(0),
    }
    put_properties(buf, &record.properties);
}

fn seal(mut buf: BytesMut) -> Bytes {
    let crc = crc32fast::hash(&buf);
    buf.put_u32(crc);
    buf.freeze()
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Encoded size of a property list
    pub fn properties_len(props: &Properties) -> usize {
        2 + props.iter().map(|(k, v)| str_len(k) + str_len(v)).sum::<usize>()
    }

    /// Encoded size of one record
    pub fn record_len(record: &Record) -> usize {
        str_len(&record.name)
            + str_len(&record.record_type)
            + 1
            + record.alias.as_deref().map_or(0, str_len)
            + Self::properties_len(&record.properties)
    }

    /// Packet overhead that does not depend on the records carried
    fn fixed_len(globals: &GlobalProperties) -> usize {
        HEADER_LEN + Self::properties_len(globals) + CHECKSUM_LEN
    }

    /// Check that `globals` alone fit in one packet
    pub fn check_globals(&self, globals: &GlobalProperties) -> Result<()> {
        let required = Self::fixed_len(globals);
        if required > self.max_packet_size || globals.len() > u16::MAX as usize {
            return Err(RecsyncError::PacketTooLarge {
                required,
                available: self.max_packet_size,
            });
        }
        Ok(())
    }

    /// Check that `record` fits in a packet of its own alongside `globals`
    pub fn check_fits(&self, record: &Record, globals: &GlobalProperties) -> Result<()> {
        let required = Self::fixed_len(globals) + Self::record_len(record);
        if required > self.max_packet_size || record.properties.len() > u16::MAX as usize {
            return Err(RecsyncError::PacketTooLarge {
                required,
                available: self.max_packet_size,
            });
        }
        Ok(())
    }

    /// Pack `records` into as few packets as fit under the size limit
    ///
    /// Records keep their input order. `next_sequence` is called once per
    /// packet produced. Every packet but the last carries the continuation
    /// flag.
    ///
    /// # Errors
    /// Returns `RecsyncError::PacketTooLarge` if a single record cannot fit in
    /// a packet of its own. No sequence numbers are consumed in that case.
    pub fn encode<F>(
        &self,
        records: &[&Record],
        globals: &GlobalProperties,
        mut next_sequence: F,
    ) -> Result<Vec<EncodedPacket>>
    where
        F: FnMut() -> u32,
    {
        self.check_globals(globals)?;
        let fixed = Self::fixed_len(globals);

        let mut groups: Vec<Range<usize>> = Vec::new();
        let mut start = 0;
        let mut size = fixed;
        for (idx, record) in records.iter().enumerate() {
            self.check_fits(record, globals)?;
            let len = Self::record_len(record);
            let count = idx - start;
            if count > 0 && (size + len > self.max_packet_size || count == u16::MAX as usize) {
                groups.push(start..idx);
                start = idx;
                size = fixed;
            }
            size += len;
        }
        if start < records.len() {
            groups.push(start..records.len());
        }

        let last = groups.len().saturating_sub(1);
        let packets = groups
            .into_iter()
            .enumerate()
            .map(|(n, range)| {
                let sequence = next_sequence();
                let continuation = n < last;
                let bytes = self.encode_one(&records[range.clone()], globals, sequence, continuation);
                EncodedPacket {
                    sequence,
                    records: range,
                    continuation,
                    bytes,
                }
            })
            .collect();
        Ok(packets)
    }

    fn encode_one(
        &self,
        records: &[&Record],
        globals: &GlobalProperties,
        sequence: u32,
        continuation: bool,
    ) -> Bytes {
        let len = Self::fixed_len(globals) + records.iter().map(|r| Self::record_len(r)).sum::<usize>();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u16(MAGIC);
        buf.put_u8(crate::PROTOCOL_VERSION);
        buf.put_u8(if continuation { FLAG_CONTINUATION } else { 0 });
        buf.put_u32(sequence);
        buf.put_u16(records.len() as u16);
        for record in records {
            put_record(&mut buf, record);
        }
        put_properties(&mut buf, globals);
        debug_assert_eq!(buf.len() + CHECKSUM_LEN, len);
        seal(buf)
    }

    /// Encode an acknowledgment datagram (receiver side)
    pub fn encode_ack(ack: &Acknowledgment) -> Bytes {
        let mut buf = BytesMut::with_capacity(ACK_LEN);
        buf.put_u16(MAGIC);
        buf.put_u8(crate::PROTOCOL_VERSION);
        buf.put_u32(ack.sequence);
        buf.put_u8(ack.status as u8);
        seal(buf)
    }

    /// Decode an acknowledgment datagram
    ///
    /// # Errors
    /// Returns `RecsyncError::MalformedPacket` on a wrong length, magic,
    /// version, checksum or status.
    pub fn decode_ack(datagram: &[u8]) -> Result<Acknowledgment> {
        if datagram.len() != ACK_LEN {
            return Err(RecsyncError::MalformedPacket(format!(
                "acknowledgment length {} (expected {})",
                datagram.len(),
                ACK_LEN
            )));
        }
        let mut buf = verify(datagram)?;
        check_preamble(&mut buf)?;
        let sequence = buf.get_u32();
        let status = AckStatus::try_from(buf.get_u8())?;
        Ok(Acknowledgment { sequence, status })
    }

    /// Decode an announcement packet (receiver side)
    ///
    /// # Errors
    /// Returns `RecsyncError::MalformedPacket` on truncated or inconsistent
    /// length fields, trailing bytes, bad UTF-8 or a checksum mismatch.
    pub fn decode_packet(datagram: &[u8]) -> Result<Announcement> {
        if datagram.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(RecsyncError::MalformedPacket(format!(
                "packet truncated at {} bytes",
                datagram.len()
            )));
        }
        let mut buf = verify(datagram)?;
        check_preamble(&mut buf)?;
        let flags = buf.get_u8();
        let sequence = buf.get_u32();
        let count = buf.get_u16() as usize;

        let mut records = Vec::with_capacity(count.min(buf.remaining() / 6));
        for _ in 0..count {
            records.push(get_record(&mut buf)?);
        }
        let global_properties = get_properties(&mut buf)?;
        if buf.has_remaining() {
            return Err(RecsyncError::MalformedPacket(format!(
                "{} trailing bytes after global properties",
                buf.remaining()
            )));
        }

        Ok(Announcement {
            sequence,
            continuation: flags & FLAG_CONTINUATION != 0,
            records,
            global_properties,
        })
    }
}

/// Verify the CRC trailer and return the covered body
fn verify(datagram: &[u8]) -> Result<&[u8]> {
    let (body, trailer) = datagram.split_at(datagram.len() - CHECKSUM_LEN);
    let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(RecsyncError::MalformedPacket(format!(
            "checksum mismatch: expected {:#010x}, got {:#010x}",
            expected, actual
        )));
    }
    Ok(body)
}

fn check_preamble(buf: &mut &[u8]) -> Result<()> {
    need(buf, 3, "preamble")?;
    let magic = buf.get_u16();
    if magic != MAGIC {
        return Err(RecsyncError::MalformedPacket(format!("bad magic {:#06x}", magic)));
    }
    let version = buf.get_u8();
    if version != crate::PROTOCOL_VERSION {
        return Err(RecsyncError::MalformedPacket(format!(
            "unsupported version {}",
            version
        )));
    }
    Ok(())
}

fn need(buf: &&[u8], len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(RecsyncError::MalformedPacket(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_str(buf: &mut &[u8], what: &str) -> Result<String> {
    need(buf, 2, what)?;
    let len = buf.get_u16() as usize;
    need(buf, len, what)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| RecsyncError::MalformedPacket(format!("{} is not valid UTF-8", what)))
}

fn get_properties(buf: &mut &[u8]) -> Result<Properties> {
    need(buf, 2, "property count")?;
    let count = buf.get_u16() as usize;
    let mut props = Properties::new();
    for _ in 0..count {
        let key = get_str(buf, "property key")?;
        let value = get_str(buf, "property value")?;
        if props.insert(key.clone(), value).is_some() {
            return Err(RecsyncError::MalformedPacket(format!("duplicate property key {}", key)));
        }
    }
    Ok(props)
}

fn get_record(buf: &mut &[u8]) -> Result<Record> {
    let name = get_str(buf, "record name")?;
    let record_type = get_str(buf, "record type")?;
    need(buf, 1, "alias flag")?;
    let alias = match buf.get_u8() {
        0 => None,
        1 => Some(get_str(buf, "alias")?),
        other => {
            return Err(RecsyncError::MalformedPacket(format!("bad alias flag {}", other)));
        }
    };
    let properties = get_properties(buf)?;
    Ok(Record {
        name,
        record_type,
        alias,
        properties,
    })
}
