//! svndiff streams as carried by the `svn://` protocol.
//!
//! A stream is a four byte header (`SVN\0`, `SVN\1` or `SVN\2`) followed by
//! windows. Unlike the self-contained [`DiffWindow`] encoding, svndiff
//! windows carry no instruction count and new-data instructions carry no
//! offset: new data is consumed sequentially. Versions 1 and 2 compress the
//! instruction and new-data sections with zlib and lz4 respectively.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::write::ZlibEncoder;

use crate::error::DeltaError;
use crate::window::{
    DELTA_WINDOW_MAX, DiffWindow, Instruction, MAX_ENCODED_UINT_LEN, encode_uint, try_decode_uint,
};

const SVNDIFF_HEADER_LEN: usize = 4;
const ZLIB_MIN_COMPRESS_SIZE: usize = 512;
const MAX_INSTRUCTION_LEN: usize = 2 * MAX_ENCODED_UINT_LEN + 1;
const MAX_INSTRUCTION_SECTION_LEN: usize = DELTA_WINDOW_MAX * MAX_INSTRUCTION_LEN;
pub(crate) const DEFAULT_ZLIB_LEVEL: u32 = 5;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SvndiffVersion {
    V0,
    V1,
    V2,
}

impl SvndiffVersion {
    pub(crate) fn header(self) -> [u8; 4] {
        match self {
            Self::V0 => *b"SVN\0",
            Self::V1 => *b"SVN\x01",
            Self::V2 => *b"SVN\x02",
        }
    }

    fn from_header(header: &[u8; 4]) -> Option<Self> {
        [Self::V0, Self::V1, Self::V2]
            .into_iter()
            .find(|v| &v.header() == header)
    }
}

/// Encodes the windows of one file as an svndiff stream.
#[cfg(test)]
pub(crate) fn encode_stream(
    version: SvndiffVersion,
    windows: &[DiffWindow],
    zlib_level: u32,
) -> Result<Vec<u8>, DeltaError> {
    let mut out = Vec::new();
    out.extend_from_slice(&version.header());
    for window in windows {
        encode_window(version, window, zlib_level, &mut out)?;
    }
    Ok(out)
}

pub(crate) fn encode_window(
    version: SvndiffVersion,
    window: &DiffWindow,
    zlib_level: u32,
    out: &mut Vec<u8>,
) -> Result<(), DeltaError> {
    window.validate()?;

    // New data is implicit and sequential on this wire; lay it out in
    // instruction order.
    let mut instructions = Vec::new();
    let mut new_data = Vec::new();
    for ins in &window.instructions {
        match *ins {
            Instruction::CopyFromSource { offset, length } => {
                Instruction::encode_selector(0, length, &mut instructions);
                encode_uint(offset, &mut instructions);
            }
            Instruction::CopyFromTarget { offset, length } => {
                Instruction::encode_selector(1, length, &mut instructions);
                encode_uint(offset, &mut instructions);
            }
            Instruction::CopyFromNewData { offset, length } => {
                Instruction::encode_selector(2, length, &mut instructions);
                let start = offset as usize;
                new_data.extend_from_slice(&window.new_data[start..start + length as usize]);
            }
        }
    }

    let (instructions_wire, newdata_wire) = match version {
        SvndiffVersion::V0 => (instructions, new_data),
        SvndiffVersion::V1 => (
            compress_zlib(&instructions, zlib_level)?,
            compress_zlib(&new_data, zlib_level)?,
        ),
        SvndiffVersion::V2 => (compress_lz4(&instructions), compress_lz4(&new_data)),
    };

    encode_uint(window.source_view_offset, out);
    encode_uint(window.source_view_length, out);
    encode_uint(window.target_view_length, out);
    encode_uint(instructions_wire.len() as u64, out);
    encode_uint(newdata_wire.len() as u64, out);
    out.extend_from_slice(&instructions_wire);
    out.extend_from_slice(&newdata_wire);
    Ok(())
}

fn compress_zlib(data: &[u8], zlib_level: u32) -> Result<Vec<u8>, DeltaError> {
    let mut out = Vec::new();
    encode_uint(data.len() as u64, &mut out);

    if data.len() < ZLIB_MIN_COMPRESS_SIZE || zlib_level == 0 {
        out.extend_from_slice(data);
        return Ok(out);
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(zlib_level));
    encoder
        .write_all(data)
        .map_err(|err| DeltaError::Corrupt(format!("zlib encode failed: {err}")))?;
    let compressed = encoder
        .finish()
        .map_err(|err| DeltaError::Corrupt(format!("zlib finish failed: {err}")))?;

    if compressed.len() >= data.len() {
        out.extend_from_slice(data);
    } else {
        out.extend_from_slice(&compressed);
    }
    Ok(out)
}

fn compress_lz4(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    encode_uint(data.len() as u64, &mut out);

    let compressed = lz4_flex::compress(data);
    if compressed.len() >= data.len() {
        out.extend_from_slice(data);
    } else {
        out.extend_from_slice(&compressed);
    }
    out
}

#[derive(Debug)]
struct WindowHeader {
    sview_offset: u64,
    sview_len: usize,
    tview_len: usize,
    ins_len: usize,
    new_len: usize,
    header_len: usize,
}

#[derive(Debug, Default)]
struct CursorBuf {
    buf: Vec<u8>,
    start: usize,
}

impl CursorBuf {
    fn available(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn consume(&mut self, n: usize) {
        self.start = self.start.saturating_add(n);
        if self.start >= self.buf.len() {
            self.buf.clear();
            self.start = 0;
            return;
        }
        if self.start > 4096 && self.start * 2 > self.buf.len() {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }
}

/// Incremental svndiff decoder.
///
/// Bytes arrive in arbitrary chunks through [`SvndiffDecoder::push`];
/// complete windows come out of [`SvndiffDecoder::next_window`].
#[derive(Debug, Default)]
pub(crate) struct SvndiffDecoder {
    any_input: bool,
    header: [u8; SVNDIFF_HEADER_LEN],
    header_bytes: usize,
    version: Option<SvndiffVersion>,
    buf: CursorBuf,
    pending: Option<WindowHeader>,
    last_sview_offset: u64,
    last_sview_len: u64,
}

impl SvndiffDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<(), DeltaError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.any_input = true;

        let mut input = chunk;
        if self.header_bytes < SVNDIFF_HEADER_LEN {
            let take = (SVNDIFF_HEADER_LEN - self.header_bytes).min(input.len());
            self.header[self.header_bytes..self.header_bytes + take]
                .copy_from_slice(&input[..take]);
            self.header_bytes += take;
            input = &input[take..];

            if self.header_bytes == SVNDIFF_HEADER_LEN {
                self.version = SvndiffVersion::from_header(&self.header);
                if self.version.is_none() {
                    return Err(DeltaError::Corrupt("svndiff has invalid header".into()));
                }
            }
        }

        if !input.is_empty() {
            self.buf.push(input);
        }
        Ok(())
    }

    /// `true` until the first byte arrives. Such a stream carries no
    /// windows at all, not even a header.
    pub(crate) fn is_empty(&self) -> bool {
        !self.any_input
    }

    pub(crate) fn next_window(&mut self) -> Result<Option<DiffWindow>, DeltaError> {
        let Some(version) = self.version else {
            return Ok(None);
        };

        if self.pending.is_none() {
            let avail = self.buf.available();
            let Some(header) = try_parse_window_header(avail)? else {
                if avail.len() > 5 * MAX_ENCODED_UINT_LEN {
                    return Err(DeltaError::Corrupt(
                        "svndiff contains a too-large window header".into(),
                    ));
                }
                return Ok(None);
            };
            self.pending = Some(header);
        }

        let needed = match &self.pending {
            Some(h) => h
                .header_len
                .checked_add(h.ins_len)
                .and_then(|n| n.checked_add(h.new_len))
                .ok_or_else(|| DeltaError::Corrupt("svndiff window size overflow".into()))?,
            None => return Ok(None),
        };
        if self.buf.available().len() < needed {
            return Ok(None);
        }
        let Some(header) = self.pending.take() else {
            return Ok(None);
        };

        let avail = self.buf.available();
        let base = header.header_len;
        let ins_wire = &avail[base..base + header.ins_len];
        let new_wire = &avail[base + header.ins_len..needed];
        let instructions = decode_section(version, ins_wire, MAX_INSTRUCTION_SECTION_LEN)?;
        let new_data = decode_section(version, new_wire, DELTA_WINDOW_MAX)?;
        self.buf.consume(needed);

        if header.sview_len > 0 {
            let end = header.sview_offset + header.sview_len as u64;
            let last_end = self.last_sview_offset + self.last_sview_len;
            if header.sview_offset < self.last_sview_offset || end < last_end {
                return Err(DeltaError::Corrupt(
                    "svndiff has backwards-sliding source views".into(),
                ));
            }
        }
        self.last_sview_offset = header.sview_offset;
        self.last_sview_len = header.sview_len as u64;

        let window = DiffWindow {
            source_view_offset: header.sview_offset,
            source_view_length: header.sview_len as u64,
            target_view_length: header.tview_len as u64,
            instructions: parse_instructions(&instructions, new_data.len())?,
            new_data,
        };
        window.validate()?;
        Ok(Some(window))
    }

    pub(crate) fn finish(&self) -> Result<(), DeltaError> {
        if self.is_empty() {
            return Ok(());
        }
        if self.header_bytes < SVNDIFF_HEADER_LEN {
            return Err(DeltaError::Truncated("svndiff header is incomplete".into()));
        }
        if self.pending.is_some() || !self.buf.available().is_empty() {
            return Err(DeltaError::Truncated(
                "svndiff ends inside a window".into(),
            ));
        }
        Ok(())
    }
}

fn try_parse_window_header(input: &[u8]) -> Result<Option<WindowHeader>, DeltaError> {
    let mut fields = [0u64; 5];
    let mut header_len = 0usize;
    for field in &mut fields {
        let Some((value, used)) = try_decode_uint(&input[header_len..])? else {
            return Ok(None);
        };
        *field = value;
        header_len += used;
    }
    let [sview_offset, sview_len, tview_len, ins_len, new_len] = fields;

    let too_large = |v: u64, limit: usize| usize::try_from(v).ok().filter(|v| *v <= limit);
    let (Some(sview_len), Some(tview_len), Some(ins_len), Some(new_len)) = (
        too_large(sview_len, DELTA_WINDOW_MAX),
        too_large(tview_len, DELTA_WINDOW_MAX),
        too_large(ins_len, MAX_INSTRUCTION_SECTION_LEN),
        too_large(new_len, DELTA_WINDOW_MAX + MAX_ENCODED_UINT_LEN),
    ) else {
        return Err(DeltaError::Corrupt(
            "svndiff contains a too-large window".into(),
        ));
    };
    if sview_offset.checked_add(sview_len as u64).is_none() {
        return Err(DeltaError::Corrupt(
            "svndiff contains corrupt window header".into(),
        ));
    }

    Ok(Some(WindowHeader {
        sview_offset,
        sview_len,
        tview_len,
        ins_len,
        new_len,
        header_len,
    }))
}

fn parse_instructions(bytes: &[u8], new_len: usize) -> Result<Vec<Instruction>, DeltaError> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut npos = 0u64;
    while pos < bytes.len() {
        let selector = bytes[pos];
        pos += 1;
        let mut length = u64::from(selector & 0x3f);
        if length == 0 {
            let (value, used) = try_decode_uint(&bytes[pos..])?.ok_or_else(|| {
                DeltaError::LengthMismatch("svndiff instruction truncated length".into())
            })?;
            length = value;
            pos += used;
        }
        let ins = match selector >> 6 {
            0 | 1 => {
                let (offset, used) = try_decode_uint(&bytes[pos..])?.ok_or_else(|| {
                    DeltaError::LengthMismatch("svndiff instruction missing offset".into())
                })?;
                pos += used;
                if selector >> 6 == 0 {
                    Instruction::CopyFromSource { offset, length }
                } else {
                    Instruction::CopyFromTarget { offset, length }
                }
            }
            2 => {
                let offset = npos;
                npos = npos.saturating_add(length);
                Instruction::CopyFromNewData { offset, length }
            }
            _ => {
                return Err(DeltaError::InvalidInstruction(
                    "svndiff invalid action".into(),
                ));
            }
        };
        out.push(ins);
    }
    if npos != new_len as u64 {
        return Err(DeltaError::LengthMismatch(
            "svndiff delta does not consume its new data".into(),
        ));
    }
    Ok(out)
}

fn decode_section(
    version: SvndiffVersion,
    wire: &[u8],
    limit: usize,
) -> Result<Vec<u8>, DeltaError> {
    if version == SvndiffVersion::V0 {
        return Ok(wire.to_vec());
    }

    let Some((orig_len, used)) = try_decode_uint(wire)? else {
        return Err(DeltaError::Truncated(
            "svndiff section missing size".into(),
        ));
    };
    let orig_len = usize::try_from(orig_len)
        .ok()
        .filter(|len| *len <= limit)
        .ok_or_else(|| DeltaError::Corrupt("svndiff section size too large".into()))?;

    let data = &wire[used..];
    if data.len() == orig_len {
        return Ok(data.to_vec());
    }

    let out = if version == SvndiffVersion::V1 {
        let mut out = Vec::with_capacity(orig_len);
        flate2::read::ZlibDecoder::new(data)
            .take(orig_len as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|err| DeltaError::Corrupt(format!("svndiff zlib decode failed: {err}")))?;
        out
    } else {
        lz4_flex::decompress(data, orig_len)
            .map_err(|err| DeltaError::Corrupt(format!("svndiff lz4 decode failed: {err}")))?
    };
    if out.len() != orig_len {
        return Err(DeltaError::LengthMismatch(
            "svndiff decoded section length mismatch".into(),
        ));
    }
    Ok(out)
}
