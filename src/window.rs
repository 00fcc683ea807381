//! Delta windows and their self-contained binary encoding.
//!
//! A [`DiffWindow`] turns a view of the source (`source_view_offset`,
//! `source_view_length`) plus the window's own `new_data` into exactly
//! `target_view_length` bytes of target.
//!
//! The encoding of a single window is
//!
//! ```text
//! source_view_offset source_view_length target_view_length
//! instruction_count instructions_length new_data_length
//! <instructions_length bytes of instructions> <new_data_length bytes>
//! ```
//!
//! where every integer is a big-endian base-128 varint. Each instruction is
//! a selector byte (`kind << 6 | length`, or `kind << 6` followed by a
//! varint length when the length does not fit in six bits) and a varint
//! offset. Stream framing is not part of this format: a sequence of windows
//! for one file always ends out of band (`text_delta_end`), so an empty
//! window is ordinary data.

use crate::error::DeltaError;

pub(crate) const MAX_ENCODED_UINT_LEN: usize = 10;
/// Largest target view produced or accepted for a single window.
pub const DELTA_WINDOW_MAX: usize = 64 * 1024;

const KIND_SOURCE: u8 = 0;
const KIND_TARGET: u8 = 1;
const KIND_NEW: u8 = 2;

/// One copy operation inside a [`DiffWindow`].
///
/// Offsets are relative to the window: the source view, the bytes of
/// target this window has produced so far, or the window's `new_data`.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction {
    /// Copy `length` bytes from the source view.
    CopyFromSource {
        /// Offset into the source view.
        offset: u64,
        /// Number of bytes to copy.
        length: u64,
    },
    /// Copy `length` bytes of target already produced by this window.
    ///
    /// The ranges may overlap, which repeats a run.
    CopyFromTarget {
        /// Offset into this window's target output.
        offset: u64,
        /// Number of bytes to copy.
        length: u64,
    },
    /// Copy `length` bytes from the window's new data.
    CopyFromNewData {
        /// Offset into `new_data`.
        offset: u64,
        /// Number of bytes to copy.
        length: u64,
    },
}

impl Instruction {
    /// Number of target bytes this instruction produces.
    pub fn length(&self) -> u64 {
        match *self {
            Self::CopyFromSource { length, .. }
            | Self::CopyFromTarget { length, .. }
            | Self::CopyFromNewData { length, .. } => length,
        }
    }

    /// Offset this instruction reads from.
    pub fn offset(&self) -> u64 {
        match *self {
            Self::CopyFromSource { offset, .. }
            | Self::CopyFromTarget { offset, .. }
            | Self::CopyFromNewData { offset, .. } => offset,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Self::CopyFromSource { .. } => KIND_SOURCE,
            Self::CopyFromTarget { .. } => KIND_TARGET,
            Self::CopyFromNewData { .. } => KIND_NEW,
        }
    }

    pub(crate) fn encode_selector(kind: u8, length: u64, out: &mut Vec<u8>) {
        if length > 0 && length < 0x40 {
            out.push((kind << 6) | length as u8);
        } else {
            out.push(kind << 6);
            encode_uint(length, out);
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        Self::encode_selector(self.kind(), self.length(), out);
        encode_uint(self.offset(), out);
    }
}

/// One chunk of a binary delta.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffWindow {
    /// Start of the source view, in bytes from the start of the source.
    pub source_view_offset: u64,
    /// Length of the source view.
    pub source_view_length: u64,
    /// Number of bytes this window produces.
    pub target_view_length: u64,
    /// Instructions, applied in order.
    pub instructions: Vec<Instruction>,
    /// Literal bytes referenced by [`Instruction::CopyFromNewData`].
    pub new_data: Vec<u8>,
}

impl DiffWindow {
    /// A window that produces `data` without reading any source.
    ///
    /// Empty `data` yields an empty window with no instructions, which
    /// establishes zero-length content.
    pub fn replacement(data: &[u8]) -> Self {
        let instructions = if data.is_empty() {
            Vec::new()
        } else {
            vec![Instruction::CopyFromNewData {
                offset: 0,
                length: data.len() as u64,
            }]
        };
        Self {
            source_view_offset: 0,
            source_view_length: 0,
            target_view_length: data.len() as u64,
            instructions,
            new_data: data.to_vec(),
        }
    }

    /// Splits `data` into replacement windows of at most `max_len` bytes.
    ///
    /// `max_len` is clamped to `1..=DELTA_WINDOW_MAX`. Always returns at
    /// least one window.
    pub fn replacement_windows(data: &[u8], max_len: usize) -> Vec<Self> {
        if data.is_empty() {
            return vec![Self::replacement(data)];
        }
        data.chunks(max_len.clamp(1, DELTA_WINDOW_MAX))
            .map(Self::replacement)
            .collect()
    }

    /// `true` when the window produces no bytes.
    pub fn is_empty(&self) -> bool {
        self.target_view_length == 0 && self.instructions.is_empty()
    }

    /// Checks the view lengths against [`DELTA_WINDOW_MAX`] and every
    /// instruction against the bounds of the window.
    pub fn validate(&self) -> Result<(), DeltaError> {
        check_view_lengths(self.source_view_length, self.target_view_length)?;
        let new_len = self.new_data.len() as u64;
        let mut produced = 0u64;
        for (idx, ins) in self.instructions.iter().enumerate() {
            let length = ins.length();
            if length == 0 {
                return Err(DeltaError::InvalidInstruction(format!(
                    "instruction {idx} has length zero"
                )));
            }
            let end = ins.offset().checked_add(length).ok_or_else(|| {
                DeltaError::OutOfBounds(format!("instruction {idx} offset overflows"))
            })?;
            match ins {
                Instruction::CopyFromSource { .. } if end > self.source_view_length => {
                    return Err(DeltaError::OutOfBounds(format!(
                        "instruction {idx} reads source bytes {}..{end} of a {} byte view",
                        ins.offset(),
                        self.source_view_length
                    )));
                }
                Instruction::CopyFromNewData { .. } if end > new_len => {
                    return Err(DeltaError::OutOfBounds(format!(
                        "instruction {idx} reads new data {}..{end} of {new_len} bytes",
                        ins.offset()
                    )));
                }
                Instruction::CopyFromTarget { offset, .. } if *offset >= produced => {
                    return Err(DeltaError::OutOfBounds(format!(
                        "instruction {idx} reads target offset {offset} but only {produced} bytes exist"
                    )));
                }
                _ => {}
            }
            produced = produced
                .checked_add(length)
                .filter(|p| *p <= self.target_view_length)
                .ok_or_else(|| {
                    DeltaError::LengthMismatch(format!(
                        "instruction {idx} overflows the {} byte target view",
                        self.target_view_length
                    ))
                })?;
        }
        if produced != self.target_view_length {
            return Err(DeltaError::LengthMismatch(format!(
                "instructions produce {produced} bytes, target view is {}",
                self.target_view_length
            )));
        }
        Ok(())
    }

    /// Encodes this window.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.instructions.len() * 3 + self.new_data.len());
        self.encode_into(&mut out);
        out
    }

    /// Appends the encoding of this window to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut ins = Vec::with_capacity(self.instructions.len() * 3);
        for instruction in &self.instructions {
            instruction.encode(&mut ins);
        }
        encode_uint(self.source_view_offset, out);
        encode_uint(self.source_view_length, out);
        encode_uint(self.target_view_length, out);
        encode_uint(self.instructions.len() as u64, out);
        encode_uint(ins.len() as u64, out);
        encode_uint(self.new_data.len() as u64, out);
        out.extend_from_slice(&ins);
        out.extend_from_slice(&self.new_data);
    }

    /// Decodes exactly one window from `input`.
    pub fn decode(input: &[u8]) -> Result<Self, DeltaError> {
        match Self::decode_from(input)? {
            Some((window, used)) if used == input.len() => Ok(window),
            Some((_, used)) => Err(DeltaError::LengthMismatch(format!(
                "{} trailing bytes after window",
                input.len() - used
            ))),
            None => Err(DeltaError::Truncated(format!(
                "window needs more than the {} bytes given",
                input.len()
            ))),
        }
    }

    /// Decodes the window at the start of `input`.
    ///
    /// Returns `Ok(None)` when `input` holds only part of a window, and the
    /// decoded window plus the number of bytes it occupied otherwise. The
    /// window is validated before it is returned.
    pub fn decode_from(input: &[u8]) -> Result<Option<(Self, usize)>, DeltaError> {
        let mut header = [0u64; 6];
        let mut pos = 0usize;
        for field in &mut header {
            let Some((value, used)) = try_decode_uint(&input[pos..])? else {
                return Ok(None);
            };
            *field = value;
            pos += used;
        }
        let [sview_offset, sview_len, tview_len, count, ins_len, new_len] = header;
        check_view_lengths(sview_len, tview_len)?;

        let ins_len = usize::try_from(ins_len)
            .map_err(|_| DeltaError::Corrupt("instructions length overflows usize".into()))?;
        let new_len = usize::try_from(new_len)
            .map_err(|_| DeltaError::Corrupt("new data length overflows usize".into()))?;
        if sview_offset.checked_add(sview_len).is_none() {
            return Err(DeltaError::Corrupt("source view overflows".into()));
        }
        let end = pos
            .checked_add(ins_len)
            .and_then(|n| n.checked_add(new_len))
            .ok_or_else(|| DeltaError::Corrupt("window size overflows".into()))?;
        if input.len() < end {
            return Ok(None);
        }

        let ins_bytes = &input[pos..pos + ins_len];
        let instructions = decode_instructions(ins_bytes, count)?;
        let window = Self {
            source_view_offset: sview_offset,
            source_view_length: sview_len,
            target_view_length: tview_len,
            instructions,
            new_data: input[pos + ins_len..end].to_vec(),
        };
        window.validate()?;
        Ok(Some((window, end)))
    }
}

fn check_view_lengths(sview_len: u64, tview_len: u64) -> Result<(), DeltaError> {
    let max = DELTA_WINDOW_MAX as u64;
    if tview_len > max {
        return Err(DeltaError::Corrupt(format!(
            "target view of {tview_len} bytes exceeds {max}"
        )));
    }
    if sview_len > max {
        return Err(DeltaError::Corrupt(format!(
            "source view of {sview_len} bytes exceeds {max}"
        )));
    }
    Ok(())
}

fn decode_instructions(bytes: &[u8], count: u64) -> Result<Vec<Instruction>, DeltaError> {
    let mut instructions = Vec::with_capacity(bytes.len().min(count as usize) / 2);
    let mut pos = 0usize;
    while pos < bytes.len() {
        if instructions.len() as u64 == count {
            return Err(DeltaError::LengthMismatch(format!(
                "instructions continue past the declared count of {count}"
            )));
        }
        let (instruction, used) = decode_instruction(&bytes[pos..])?;
        instructions.push(instruction);
        pos += used;
    }
    if instructions.len() as u64 != count {
        return Err(DeltaError::LengthMismatch(format!(
            "declared {count} instructions, found {}",
            instructions.len()
        )));
    }
    Ok(instructions)
}

fn decode_instruction(bytes: &[u8]) -> Result<(Instruction, usize), DeltaError> {
    let selector = bytes[0];
    let mut pos = 1usize;
    let kind = selector >> 6;
    let mut length = u64::from(selector & 0x3f);
    if length == 0 {
        let (value, used) = try_decode_uint(&bytes[pos..])?
            .ok_or_else(|| DeltaError::LengthMismatch("instruction length truncated".into()))?;
        length = value;
        pos += used;
    }
    let (offset, used) = try_decode_uint(&bytes[pos..])?
        .ok_or_else(|| DeltaError::LengthMismatch("instruction offset truncated".into()))?;
    pos += used;
    let instruction = match kind {
        KIND_SOURCE => Instruction::CopyFromSource { offset, length },
        KIND_TARGET => Instruction::CopyFromTarget { offset, length },
        KIND_NEW => Instruction::CopyFromNewData { offset, length },
        _ => {
            return Err(DeltaError::InvalidInstruction(format!(
                "selector {selector:#04x} has an invalid kind"
            )));
        }
    };
    Ok((instruction, pos))
}

pub(crate) fn encode_uint(val: u64, out: &mut Vec<u8>) {
    let mut v = val >> 7;
    let mut n = 1u32;
    while v > 0 {
        v >>= 7;
        n += 1;
    }

    while n > 1 {
        n -= 1;
        out.push((((val >> (n * 7)) | 0x80) & 0xff) as u8);
    }
    out.push((val & 0x7f) as u8);
}

/// Decodes one varint; `Ok(None)` means more input is needed.
pub(crate) fn try_decode_uint(input: &[u8]) -> Result<Option<(u64, usize)>, DeltaError> {
    let mut val: u64 = 0;
    for (idx, &b) in input.iter().enumerate() {
        if idx >= MAX_ENCODED_UINT_LEN {
            return Err(DeltaError::Corrupt("integer encoding too long".into()));
        }
        val = val
            .checked_mul(128)
            .and_then(|v| v.checked_add(u64::from(b & 0x7f)))
            .ok_or_else(|| DeltaError::Corrupt("integer overflow".into()))?;
        if (b & 0x80) == 0 {
            return Ok(Some((val, idx + 1)));
        }
    }
    Ok(None)
}
