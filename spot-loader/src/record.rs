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

//! The inbound record shape (§6's "BAM decoder interface") and the small value types it
//! is built from: alignment flags, platform, and the `read_number` derived from them.

use bitflags::bitflags;
use spot_index::ReadNumber;

bitflags! {
    /// The 16 SAM/BAM flag bits named in §6, using their standard SAM bit positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u16 {
        const PAIRED          = 0x0001;
        const PROPER_PAIR     = 0x0002;
        const UNMAPPED        = 0x0004;
        const MATE_UNMAPPED   = 0x0008;
        const REVERSE         = 0x0010;
        const MATE_REVERSE    = 0x0020;
        const FIRST_IN_PAIR   = 0x0040;
        const SECOND_IN_PAIR  = 0x0080;
        const SECONDARY       = 0x0100;
        const QC_FAIL         = 0x0200;
        const DUPLICATE       = 0x0400;
        const SUPPLEMENTARY   = 0x0800;
    }
}

impl Flags {
    pub fn is_paired(self) -> bool {
        self.contains(Flags::PAIRED)
    }

    pub fn is_reverse(self) -> bool {
        self.contains(Flags::REVERSE)
    }

    pub fn is_unmapped(self) -> bool {
        self.contains(Flags::UNMAPPED)
    }

    pub fn is_secondary(self) -> bool {
        self.contains(Flags::SECONDARY)
    }

    pub fn is_supplementary(self) -> bool {
        self.contains(Flags::SUPPLEMENTARY)
    }

    pub fn is_duplicate(self) -> bool {
        self.contains(Flags::DUPLICATE)
    }

    /// `read_number` per §4.6's input shape: `1`/`2` when paired and the mate-order bit
    /// is set, `0` (unmated) otherwise.
    pub fn read_number(self) -> Option<ReadNumber> {
        if !self.is_paired() {
            return None;
        }
        if self.contains(Flags::FIRST_IN_PAIR) {
            Some(ReadNumber::One)
        } else if self.contains(Flags::SECOND_IN_PAIR) {
            Some(ReadNumber::Two)
        } else {
            None
        }
    }

    /// A record is a *primary candidate* if it is neither flagged secondary nor
    /// supplementary (§4.6 step 2/3's "primary or promotable-to-primary").
    pub fn is_primary_candidate(self) -> bool {
        !self.is_secondary() && !self.is_supplementary()
    }
}

/// The sequencing-platform hint carried on the BAM header's read-group line. Stored as a
/// small id, not the BAM header string, once resolved by the host decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    #[default]
    Unknown,
    Illumina,
    PacBio,
    OxfordNanopore,
    IonTorrent,
    Other(u16),
}

impl Platform {
    pub fn id(self) -> u16 {
        match self {
            Platform::Unknown => 0,
            Platform::Illumina => 1,
            Platform::PacBio => 2,
            Platform::OxfordNanopore => 3,
            Platform::IonTorrent => 4,
            Platform::Other(id) => id,
        }
    }
}

/// One CIGAR operation, packed as `length << 4 | code` per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CigarOp(pub u32);

impl CigarOp {
    pub const OP_MATCH: u8 = 0; // M
    pub const OP_INS: u8 = 1; // I
    pub const OP_DEL: u8 = 2; // D
    pub const OP_SOFT_CLIP: u8 = 4; // S
    pub const OP_HARD_CLIP: u8 = 5; // H

    pub fn new(length: u32, code: u8) -> Self {
        CigarOp((length << 4) | code as u32)
    }

    pub fn length(self) -> u32 {
        self.0 >> 4
    }

    pub fn code(self) -> u8 {
        (self.0 & 0xf) as u8
    }

    /// Whether this op consumes bases on the reference sequence (match/mismatch,
    /// deletion, or reference-skip).
    pub fn consumes_reference(self) -> bool {
        matches!(self.code(), Self::OP_MATCH | Self::OP_DEL) || self.code() == 3 /* N */
    }
}

/// One decoded alignment record, exactly the shape described in §6.
#[derive(Debug, Clone)]
pub struct AlignmentRecord {
    pub name: Vec<u8>,
    pub group_key: Vec<u8>,
    pub platform: Platform,
    pub flags: Flags,
    pub reference_id: Option<u32>,
    pub reference_pos: Option<i64>,
    pub mapping_quality: u8,
    pub cigar: Vec<CigarOp>,
    pub sequence: Vec<u8>,
    pub qualities: Vec<u8>,
    pub original_qualities: Option<Vec<u8>>,
    pub mate_reference_id: Option<u32>,
    pub mate_pos: Option<i64>,
    pub template_len: i64,
    pub color_space: bool,
    /// BX, or CB+UB joined, when present.
    pub linkage_group: Option<Vec<u8>>,
    pub barcode: Option<Vec<u8>>,
}

impl AlignmentRecord {
    pub fn read_number(&self) -> Option<ReadNumber> {
        self.flags.read_number()
    }

    pub fn is_aligned(&self) -> bool {
        !self.flags.is_unmapped() && self.reference_id.is_some() && self.reference_pos.is_some()
    }

    /// The clipped read length used to populate `fragment_len_{read}` (§3): the
    /// sequence length with any hard-clip prefix/suffix already excluded (hard-clipped
    /// bases are never present in `sequence` to begin with, per the BAM format, so this
    /// is simply the sequence length).
    pub fn clipped_len(&self) -> usize {
        self.sequence.len()
    }

    pub fn has_hardclip(&self) -> bool {
        self.cigar.iter().any(|op| op.code() == CigarOp::OP_HARD_CLIP)
    }
}
