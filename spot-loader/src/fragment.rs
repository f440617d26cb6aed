//  Copyright 2024 SRA Tools Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! The byte layout of one blob held in the Mate Bank (§3): a fixed header followed by
//! four length-prefixed byte strings. [`crate::bank`] never interprets these bytes - it
//! only stores and retrieves them by handle - so the header fields named in §3
//! (read length, orientation, strand, low-quality bit, column-space key, aligned flag,
//! template index, read-number) are packed and unpacked here instead.

use spot_index::ReadNumber;

fn read_number_tag(read: ReadNumber) -> u8 {
    match read {
        ReadNumber::One => 1,
        ReadNumber::Two => 2,
    }
}

fn read_number_from_tag(tag: u8) -> ReadNumber {
    match tag {
        2 => ReadNumber::Two,
        _ => ReadNumber::One,
    }
}

/// One read's data, held in the Mate Bank while its mate is awaited.
#[derive(Debug, Clone)]
pub struct FragmentPayload {
    pub read_number: ReadNumber,
    pub aligned: bool,
    pub reverse: bool,
    pub color_space: bool,
    pub template_len: i64,
    pub sequence: Vec<u8>,
    pub qualities: Vec<u8>,
    pub group_key: Vec<u8>,
    pub linkage_group: Option<Vec<u8>>,
}

const FLAG_ALIGNED: u8 = 0x01;
const FLAG_REVERSE: u8 = 0x02;
const FLAG_COLOR_SPACE: u8 = 0x04;
const FLAG_HAS_LINKAGE_GROUP: u8 = 0x08;

impl FragmentPayload {
    /// Packs this payload as `header || len-prefixed sequence || len-prefixed qualities ||
    /// len-prefixed group_key || len-prefixed linkage_group (if present)`. Every length
    /// prefix is a little-endian `u32`; the format is private to this crate, never
    /// persisted beyond one load.
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.aligned {
            flags |= FLAG_ALIGNED;
        }
        if self.reverse {
            flags |= FLAG_REVERSE;
        }
        if self.color_space {
            flags |= FLAG_COLOR_SPACE;
        }
        if self.linkage_group.is_some() {
            flags |= FLAG_HAS_LINKAGE_GROUP;
        }

        let mut out = Vec::with_capacity(32 + self.sequence.len() + self.qualities.len() + self.group_key.len());
        out.push(read_number_tag(self.read_number));
        out.push(flags);
        out.extend_from_slice(&self.template_len.to_le_bytes());
        push_framed(&mut out, &self.sequence);
        push_framed(&mut out, &self.qualities);
        push_framed(&mut out, &self.group_key);
        if let Some(linkage_group) = &self.linkage_group {
            push_framed(&mut out, linkage_group);
        }
        out
    }

    /// Inverse of [`Self::encode`]. Panics on malformed input; the only producer of this
    /// format is [`Self::encode`] itself, so malformed bytes indicate a bug in the Mate
    /// Bank layer, not bad input data.
    pub fn decode(bytes: &[u8]) -> Self {
        let mut cursor = Cursor::new(bytes);
        let read_number = read_number_from_tag(cursor.take_u8());
        let flags = cursor.take_u8();
        let template_len = i64::from_le_bytes(cursor.take_array());
        let sequence = cursor.take_framed().to_vec();
        let qualities = cursor.take_framed().to_vec();
        let group_key = cursor.take_framed().to_vec();
        let linkage_group = if flags & FLAG_HAS_LINKAGE_GROUP != 0 {
            Some(cursor.take_framed().to_vec())
        } else {
            None
        };
        Self {
            read_number,
            aligned: flags & FLAG_ALIGNED != 0,
            reverse: flags & FLAG_REVERSE != 0,
            color_space: flags & FLAG_COLOR_SPACE != 0,
            template_len,
            sequence,
            qualities,
            group_key,
            linkage_group,
        }
    }
}

fn push_framed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take_u8(&mut self) -> u8 {
        let value = self.bytes[self.pos];
        self.pos += 1;
        value
    }

    fn take_array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn take_framed(&mut self) -> &'a [u8] {
        let len = u32::from_le_bytes(self.take_array()) as usize;
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_field() {
        let payload = FragmentPayload {
            read_number: ReadNumber::Two,
            aligned: true,
            reverse: true,
            color_space: false,
            template_len: -350,
            sequence: b"ACGT".to_vec(),
            qualities: vec![30, 31, 32, 33],
            group_key: b"rg1".to_vec(),
            linkage_group: Some(b"BX:Z:AAAC".to_vec()),
        };
        let decoded = FragmentPayload::decode(&payload.encode());
        assert_eq!(decoded.read_number, ReadNumber::Two);
        assert!(decoded.aligned);
        assert!(decoded.reverse);
        assert_eq!(decoded.template_len, -350);
        assert_eq!(decoded.sequence, b"ACGT");
        assert_eq!(decoded.qualities, vec![30, 31, 32, 33]);
        assert_eq!(decoded.group_key, b"rg1");
        assert_eq!(decoded.linkage_group, Some(b"BX:Z:AAAC".to_vec()));
    }

    #[test]
    fn round_trips_without_linkage_group() {
        let payload = FragmentPayload {
            read_number: ReadNumber::One,
            aligned: false,
            reverse: false,
            color_space: false,
            template_len: 0,
            sequence: Vec::new(),
            qualities: Vec::new(),
            group_key: Vec::new(),
            linkage_group: None,
        };
        let decoded = FragmentPayload::decode(&payload.encode());
        assert_eq!(decoded.linkage_group, None);
        assert!(decoded.sequence.is_empty());
    }
}
