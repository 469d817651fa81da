//! Streaming MessagePack codec.
//!
//! Replies arrive as a stream of top-level MessagePack values split across
//! arbitrary socket reads. [`FrameDecoder`] scans each value's structure as
//! its bytes arrive, keeping its position between reads, and only decodes a
//! value once its last byte has been fed.

use bytes::{Buf, BytesMut};
use rmp::Marker;

use crate::error::{Error, Result};

/// Encode one top-level value.
pub fn encode(value: &rmpv::Value) -> Result<BytesMut> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)
        .map_err(|e| Error::Protocol(format!("Failed to encode message: {}", e)))?;
    Ok(BytesMut::from(&buf[..]))
}

/// Incremental decoder for a stream of top-level values.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Leading bytes of `buffer` already scanned as part of the current value
    scanned: usize,
    /// Values still missing at each open nesting level
    open: Vec<u64>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            scanned: 0,
            open: Vec::new(),
        }
    }

    /// Append received bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Take the next complete value, or `None` if more bytes are needed.
    pub fn next_value(&mut self) -> Result<Option<rmpv::Value>> {
        if !self.scan()? {
            return Ok(None);
        }

        let frame_len = self.scanned;
        let mut cursor: &[u8] = &self.buffer[..frame_len];
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| Error::Protocol(format!("Malformed frame: {}", e)))?;

        self.buffer.advance(frame_len);
        self.scanned = 0;
        Ok(Some(value))
    }

    /// Number of buffered bytes not yet decoded.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Number of buffered bytes already scanned as part of the value in
    /// progress.
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    /// Drop any buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.open.clear();
    }

    /// Walk the value in progress from where the last call stopped. Returns
    /// true once it is completely buffered.
    fn scan(&mut self) -> Result<bool> {
        if self.open.is_empty() {
            if self.buffer.is_empty() {
                return Ok(false);
            }
            self.open.push(1);
        }

        loop {
            while self.open.last() == Some(&0) {
                self.open.pop();
            }
            if self.open.is_empty() {
                return Ok(true);
            }

            let Some(item) = item_extent(&self.buffer[self.scanned..])? else {
                return Ok(false);
            };
            if self.buffer.len() - self.scanned < item.len {
                return Ok(false);
            }

            self.scanned += item.len;
            if let Some(missing) = self.open.last_mut() {
                *missing -= 1;
            }
            if item.children > 0 {
                self.open.push(item.children);
            }
        }
    }
}

/// Size of one encoded item, not counting the items nested in it.
struct ItemExtent {
    /// Marker, length fields and scalar payload
    len: usize,
    /// Nested values that follow (map entries count twice)
    children: u64,
}

impl ItemExtent {
    fn scalar(len: usize) -> Self {
        Self { len, children: 0 }
    }

    fn container(header: usize, children: u64) -> Self {
        Self {
            len: header,
            children,
        }
    }
}

/// Measure the item at the front of `bytes`, or `None` if its header is not
/// fully buffered yet.
fn item_extent(bytes: &[u8]) -> Result<Option<ItemExtent>> {
    let Some(&first) = bytes.first() else {
        return Ok(None);
    };

    let extent = match Marker::from_u8(first) {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            ItemExtent::scalar(1)
        }
        Marker::U8 | Marker::I8 => ItemExtent::scalar(2),
        Marker::U16 | Marker::I16 => ItemExtent::scalar(3),
        Marker::U32 | Marker::I32 | Marker::F32 => ItemExtent::scalar(5),
        Marker::U64 | Marker::I64 | Marker::F64 => ItemExtent::scalar(9),
        Marker::FixExt1 => ItemExtent::scalar(3),
        Marker::FixExt2 => ItemExtent::scalar(4),
        Marker::FixExt4 => ItemExtent::scalar(6),
        Marker::FixExt8 => ItemExtent::scalar(10),
        Marker::FixExt16 => ItemExtent::scalar(18),
        Marker::FixStr(n) => ItemExtent::scalar(1 + n as usize),
        Marker::Str8 | Marker::Bin8 => return sized(bytes, 1, 0),
        Marker::Str16 | Marker::Bin16 => return sized(bytes, 2, 0),
        Marker::Str32 | Marker::Bin32 => return sized(bytes, 4, 0),
        // Ext carries a type byte after its length
        Marker::Ext8 => return sized(bytes, 1, 1),
        Marker::Ext16 => return sized(bytes, 2, 1),
        Marker::Ext32 => return sized(bytes, 4, 1),
        Marker::FixArray(n) => ItemExtent::container(1, n as u64),
        Marker::FixMap(n) => ItemExtent::container(1, 2 * n as u64),
        Marker::Array16 => return counted(bytes, 2, 1),
        Marker::Array32 => return counted(bytes, 4, 1),
        Marker::Map16 => return counted(bytes, 2, 2),
        Marker::Map32 => return counted(bytes, 4, 2),
        Marker::Reserved => {
            return Err(Error::Protocol(format!(
                "Malformed frame: reserved marker 0x{:02x}",
                first
            )))
        }
    };

    Ok(Some(extent))
}

/// Big-endian length field of `width` bytes following the marker.
fn length_field(bytes: &[u8], width: usize) -> Option<u64> {
    let field = bytes.get(1..1 + width)?;
    Some(field.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// A string, binary or ext item: header plus a payload of the given length.
fn sized(bytes: &[u8], width: usize, extra: usize) -> Result<Option<ItemExtent>> {
    let Some(payload) = length_field(bytes, width) else {
        return Ok(None);
    };
    let payload = usize::try_from(payload)
        .map_err(|_| Error::Protocol(format!("Frame payload too large: {} bytes", payload)))?;
    Ok(Some(ItemExtent::scalar(1 + width + extra + payload)))
}

/// An array or map header followed by `count * per_entry` nested values.
fn counted(bytes: &[u8], width: usize, per_entry: u64) -> Result<Option<ItemExtent>> {
    Ok(length_field(bytes, width).map(|count| ItemExtent::container(1 + width, count * per_entry)))
}
