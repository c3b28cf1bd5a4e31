//! Wire messages exchanged by reconciliation sessions.
//!
//! All messages are binary with fixed-width fields:
//!
//! ```text
//! frame   := version:u8 tag:u8 owner:[16] body
//! Ranges  := round:u32 count:u32 range*
//! range   := bound kind
//! bound   := 0x00 timestamp:[16] | 0x01              (Infinite)
//! kind    := 0x00                                     (Skip)
//!          | 0x01 fingerprint:[12]
//!          | 0x02 count:u32 timestamp:[16]*
//! Entries := count:u32 (timestamp:[16] len:u32 payload:[len])*
//!            need:(count:u32 timestamp:[16]*)
//!            missing:(count:u32 timestamp:[16]*)
//! Abort   := (empty)
//! ```
//!
//! Integers are big-endian. A cycle opens with round 0 and every reply
//! carries the round it answers plus one. Entry payloads pass through an
//! [`Envelope`] on the way out and back in. Encoding fails rather than
//! truncate a length that does not fit its `u32` prefix.

use crate::error::{DecodeError, EncodeError};
use crate::fingerprint::{Fingerprint, FingerprintRange, FINGERPRINT_SIZE};
use crate::payload::Entry;
use crate::timestamp::{BinaryTimestamp, OwnerId, UpperBound, BINARY_TIMESTAMP_SIZE};

/// Version byte leading every frame.
pub const PROTOCOL_VERSION: u8 = 1;

const TAG_RANGES: u8 = 0x01;
const TAG_ENTRIES: u8 = 0x02;
const TAG_ABORT: u8 = 0x03;

const BOUND_TIMESTAMP: u8 = 0x00;
const BOUND_INFINITE: u8 = 0x01;

const KIND_SKIP: u8 = 0x00;
const KIND_FINGERPRINT: u8 = 0x01;
const KIND_TIMESTAMPS: u8 = 0x02;

/// What a range carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeKind {
    /// The sender considers this range settled.
    Skip,
    /// Fingerprint of the sender's elements in the range.
    Fingerprint(Fingerprint),
    /// The sender's concrete timestamps in the range; a request for the
    /// entries it lacks.
    Timestamps(Vec<BinaryTimestamp>),
}

/// A range bounded above by `upper_bound` and below by the previous range's
/// upper bound (or the start of the timestamp space).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub upper_bound: UpperBound,
    pub kind: RangeKind,
}

impl Range {
    pub fn skip(upper_bound: UpperBound) -> Self {
        Self {
            upper_bound,
            kind: RangeKind::Skip,
        }
    }

    pub fn fingerprint(upper_bound: UpperBound, fingerprint: Fingerprint) -> Self {
        Self {
            upper_bound,
            kind: RangeKind::Fingerprint(fingerprint),
        }
    }

    pub fn timestamps(upper_bound: UpperBound, timestamps: Vec<BinaryTimestamp>) -> Self {
        Self {
            upper_bound,
            kind: RangeKind::Timestamps(timestamps),
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self.kind, RangeKind::Skip)
    }
}

impl From<FingerprintRange> for Range {
    fn from(range: FingerprintRange) -> Self {
        Range::fingerprint(range.upper_bound, range.fingerprint)
    }
}

/// A reconciliation protocol message, scoped to one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Range advertisement covering the whole timestamp space.
    Ranges {
        owner: OwnerId,
        /// Position within the cycle; 0 opens a new one
        round: u32,
        ranges: Vec<Range>,
    },
    /// Entries the receiver lacks, and timestamps the sender wants back.
    Entries {
        owner: OwnerId,
        entries: Vec<Entry>,
        need: Vec<BinaryTimestamp>,
        /// Requested timestamps the sender holds no payload for
        missing: Vec<BinaryTimestamp>,
    },
    /// The sender tore its session down.
    Abort { owner: OwnerId },
}

impl Message {
    pub fn owner(&self) -> &OwnerId {
        match self {
            Message::Ranges { owner, .. }
            | Message::Entries { owner, .. }
            | Message::Abort { owner } => owner,
        }
    }

    /// Short name for logs and errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Ranges { .. } => "ranges",
            Message::Entries { .. } => "entries",
            Message::Abort { .. } => "abort",
        }
    }

    /// Whether every range is `Skip`, i.e. the sender found nothing left to
    /// compare.
    pub fn is_converged(&self) -> bool {
        match self {
            Message::Ranges { ranges, .. } => ranges.iter().all(Range::is_skip),
            _ => false,
        }
    }

    /// Encode without payload sealing.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        self.encode_with(&Plaintext)
    }

    /// Decode without payload opening.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_with(bytes, &Plaintext)
    }

    pub fn encode_with(&self, envelope: &impl Envelope) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        out.push(PROTOCOL_VERSION);
        match self {
            Message::Ranges {
                owner,
                round,
                ranges,
            } => {
                out.push(TAG_RANGES);
                out.extend_from_slice(owner.as_bytes());
                out.extend_from_slice(&round.to_be_bytes());
                put_len(&mut out, ranges.len())?;
                for range in ranges {
                    put_range(&mut out, range)?;
                }
            }
            Message::Entries {
                owner,
                entries,
                need,
                missing,
            } => {
                out.push(TAG_ENTRIES);
                out.extend_from_slice(owner.as_bytes());
                put_len(&mut out, entries.len())?;
                for entry in entries {
                    let sealed = envelope.seal(owner, entry.payload.clone());
                    out.extend_from_slice(entry.timestamp.as_bytes());
                    put_len(&mut out, sealed.len())?;
                    out.extend_from_slice(&sealed);
                }
                put_timestamps(&mut out, need)?;
                put_timestamps(&mut out, missing)?;
            }
            Message::Abort { owner } => return Ok(abort_frame(owner)),
        }
        Ok(out)
    }

    pub fn decode_with(bytes: &[u8], envelope: &impl Envelope) -> Result<Self, DecodeError> {
        let mut reader = Reader { bytes };
        let version = reader.u8()?;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let tag = reader.u8()?;
        let owner = OwnerId(reader.array()?);
        let message = match tag {
            TAG_RANGES => {
                let round = reader.u32()?;
                let count = reader.len()?;
                let mut ranges = Vec::with_capacity(count.min(reader.remaining()));
                for _ in 0..count {
                    ranges.push(reader.range()?);
                }
                validate_ranges(&ranges)?;
                Message::Ranges {
                    owner,
                    round,
                    ranges,
                }
            }
            TAG_ENTRIES => {
                let count = reader.len()?;
                let mut entries = Vec::with_capacity(count.min(reader.remaining()));
                for _ in 0..count {
                    let timestamp = reader.timestamp()?;
                    let len = reader.len()?;
                    let sealed = reader.take(len)?.to_vec();
                    entries.push(Entry {
                        timestamp,
                        payload: envelope.open(&owner, sealed)?,
                    });
                }
                let need = reader.timestamps()?;
                let missing = reader.timestamps()?;
                Message::Entries {
                    owner,
                    entries,
                    need,
                    missing,
                }
            }
            TAG_ABORT => Message::Abort { owner },
            other => return Err(DecodeError::UnknownTag(other)),
        };
        if reader.remaining() > 0 {
            return Err(DecodeError::TrailingBytes(reader.remaining()));
        }
        Ok(message)
    }
}

/// The frame for [`Message::Abort`], which cannot fail to encode.
pub fn abort_frame(owner: &OwnerId) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + owner.as_bytes().len());
    out.push(PROTOCOL_VERSION);
    out.push(TAG_ABORT);
    out.extend_from_slice(owner.as_bytes());
    out
}

/// Seals entry payloads before they leave this process and opens them on
/// receipt. Encryption itself is provided by the caller.
pub trait Envelope {
    fn seal(&self, owner: &OwnerId, payload: Vec<u8>) -> Vec<u8>;
    fn open(&self, owner: &OwnerId, sealed: Vec<u8>) -> Result<Vec<u8>, DecodeError>;
}

/// Identity envelope for payloads that are already encrypted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl Envelope for Plaintext {
    fn seal(&self, _owner: &OwnerId, payload: Vec<u8>) -> Vec<u8> {
        payload
    }

    fn open(&self, _owner: &OwnerId, sealed: Vec<u8>) -> Result<Vec<u8>, DecodeError> {
        Ok(sealed)
    }
}

fn validate_ranges(ranges: &[Range]) -> Result<(), DecodeError> {
    let Some(last) = ranges.last() else {
        return Err(DecodeError::MalformedRanges("no ranges"));
    };
    if last.upper_bound != UpperBound::Infinite {
        return Err(DecodeError::MalformedRanges("last range must be unbounded"));
    }
    if ranges.windows(2).any(|w| w[0].upper_bound >= w[1].upper_bound) {
        return Err(DecodeError::MalformedRanges("upper bounds not increasing"));
    }
    // Each range covers [previous upper bound, own upper bound).
    let mut lower: Option<&BinaryTimestamp> = None;
    for range in ranges {
        if let RangeKind::Timestamps(timestamps) = &range.kind {
            if timestamps.windows(2).any(|w| w[0] >= w[1]) {
                return Err(DecodeError::MalformedRanges("timestamps not ascending"));
            }
            if timestamps.last().is_some_and(|t| !range.upper_bound.admits(t)) {
                return Err(DecodeError::MalformedRanges("timestamp beyond range bound"));
            }
            if let (Some(first), Some(lower)) = (timestamps.first(), lower) {
                if first < lower {
                    return Err(DecodeError::MalformedRanges("timestamp below range bound"));
                }
            }
        }
        lower = match &range.upper_bound {
            UpperBound::Timestamp(t) => Some(t),
            UpperBound::Infinite => None,
        };
    }
    Ok(())
}

fn put_len(out: &mut Vec<u8>, len: usize) -> Result<(), EncodeError> {
    let prefix = u32::try_from(len).map_err(|_| EncodeError::TooLong { len })?;
    out.extend_from_slice(&prefix.to_be_bytes());
    Ok(())
}

fn put_timestamps(out: &mut Vec<u8>, timestamps: &[BinaryTimestamp]) -> Result<(), EncodeError> {
    put_len(out, timestamps.len())?;
    for timestamp in timestamps {
        out.extend_from_slice(timestamp.as_bytes());
    }
    Ok(())
}

fn put_range(out: &mut Vec<u8>, range: &Range) -> Result<(), EncodeError> {
    match &range.upper_bound {
        UpperBound::Timestamp(t) => {
            out.push(BOUND_TIMESTAMP);
            out.extend_from_slice(t.as_bytes());
        }
        UpperBound::Infinite => out.push(BOUND_INFINITE),
    }
    match &range.kind {
        RangeKind::Skip => out.push(KIND_SKIP),
        RangeKind::Fingerprint(fingerprint) => {
            out.push(KIND_FINGERPRINT);
            out.extend_from_slice(fingerprint.as_bytes());
        }
        RangeKind::Timestamps(timestamps) => {
            out.push(KIND_TIMESTAMPS);
            put_timestamps(out, timestamps)?;
        }
    }
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.bytes.len() < n {
            return Err(DecodeError::UnexpectedEof {
                needed: n,
                remaining: self.bytes.len(),
            });
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn len(&mut self) -> Result<usize, DecodeError> {
        Ok(self.u32()? as usize)
    }

    fn timestamp(&mut self) -> Result<BinaryTimestamp, DecodeError> {
        Ok(BinaryTimestamp(self.array::<BINARY_TIMESTAMP_SIZE>()?))
    }

    fn timestamps(&mut self) -> Result<Vec<BinaryTimestamp>, DecodeError> {
        let count = self.len()?;
        let mut out = Vec::with_capacity(count.min(self.remaining() / BINARY_TIMESTAMP_SIZE));
        for _ in 0..count {
            out.push(self.timestamp()?);
        }
        Ok(out)
    }

    fn range(&mut self) -> Result<Range, DecodeError> {
        let upper_bound = match self.u8()? {
            BOUND_TIMESTAMP => UpperBound::Timestamp(self.timestamp()?),
            BOUND_INFINITE => UpperBound::Infinite,
            other => return Err(DecodeError::UnknownBoundTag(other)),
        };
        let kind = match self.u8()? {
            KIND_SKIP => RangeKind::Skip,
            KIND_FINGERPRINT => {
                RangeKind::Fingerprint(Fingerprint(self.array::<FINGERPRINT_SIZE>()?))
            }
            KIND_TIMESTAMPS => RangeKind::Timestamps(self.timestamps()?),
            other => return Err(DecodeError::UnknownRangeKind(other)),
        };
        Ok(Range { upper_bound, kind })
    }
}
