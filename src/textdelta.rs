//! Applying delta windows to a source to produce new file content.
//!
//! [`DeltaApplier`] reads source views through [`RandomAccess`] and appends
//! each window's output to a [`std::io::Write`] sink. A window is checked
//! and fully assembled before any of its bytes reach the sink, so a
//! malformed window never leaves a partial write behind.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use md5::{Digest, Md5};
use tracing::trace;

use crate::SvnError;
use crate::error::DeltaError;
use crate::window::{DiffWindow, Instruction};

const SOURCE_READ_CHUNK: usize = 8 * 1024;

/// Returns the lowercase hex MD5 digest of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Byte source that supports reads at arbitrary offsets.
pub trait RandomAccess {
    /// Total length of the source in bytes.
    fn size(&mut self) -> io::Result<u64>;

    /// Fills `buf` with the bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

fn slice_read_at(data: &[u8], offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let start = usize::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "offset out of range"))?;
    let src = start
        .checked_add(buf.len())
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of source"))?;
    buf.copy_from_slice(src);
    Ok(())
}

impl RandomAccess for &[u8] {
    fn size(&mut self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        slice_read_at(self, offset, buf)
    }
}

impl RandomAccess for Vec<u8> {
    fn size(&mut self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        slice_read_at(self, offset, buf)
    }
}

impl RandomAccess for File {
    fn size(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }
}

/// Summary of a completed delta application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedDelta {
    /// Total number of bytes written to the sink.
    pub length: u64,
    /// Hex MD5 of the bytes written to the sink.
    pub md5: String,
}

/// Applies a sequence of windows for one file, in call order.
pub struct DeltaApplier<S, W> {
    source: S,
    sink: W,
    source_len: Option<u64>,
    target_offset: u64,
    last_source_offset: u64,
    digest: Md5,
    failed: bool,
}

impl<S, W> std::fmt::Debug for DeltaApplier<S, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaApplier")
            .field("target_offset", &self.target_offset)
            .field("last_source_offset", &self.last_source_offset)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl<S: RandomAccess, W: Write> DeltaApplier<S, W> {
    /// Creates an applier reading from `source` and writing to `sink`.
    pub fn new(source: S, sink: W) -> Self {
        Self {
            source,
            sink,
            source_len: None,
            target_offset: 0,
            last_source_offset: 0,
            digest: Md5::new(),
            failed: false,
        }
    }

    /// Number of target bytes written so far.
    pub fn target_offset(&self) -> u64 {
        self.target_offset
    }

    /// Applies one window, appending its output to the sink.
    ///
    /// After an error the applier stays failed and rejects further windows.
    pub fn apply(&mut self, window: &DiffWindow) -> Result<(), SvnError> {
        if self.failed {
            return Err(SvnError::ProtocolViolation(
                "delta application already failed".into(),
            ));
        }
        let result = self.apply_inner(window);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn apply_inner(&mut self, window: &DiffWindow) -> Result<(), SvnError> {
        window.validate()?;
        if window.source_view_length > 0 {
            if window.source_view_offset < self.last_source_offset {
                return Err(DeltaError::Corrupt(format!(
                    "source view at {} slides back behind {}",
                    window.source_view_offset, self.last_source_offset
                ))
                .into());
            }
            self.last_source_offset = window.source_view_offset;
        }

        let source_view = self.read_source_view(window)?;
        let output = assemble(window, &source_view)?;
        self.sink.write_all(&output)?;
        self.digest.update(&output);
        self.target_offset += output.len() as u64;
        trace!(
            target_offset = self.target_offset,
            instructions = window.instructions.len(),
            "applied delta window"
        );
        Ok(())
    }

    fn read_source_view(&mut self, window: &DiffWindow) -> Result<Vec<u8>, SvnError> {
        let reads_source = window
            .instructions
            .iter()
            .any(|ins| matches!(ins, Instruction::CopyFromSource { .. }));
        if !reads_source {
            return Ok(Vec::new());
        }

        let source_len = match self.source_len {
            Some(len) => len,
            None => {
                let len = self.source.size()?;
                self.source_len = Some(len);
                len
            }
        };
        let end = window
            .source_view_offset
            .checked_add(window.source_view_length)
            .filter(|end| *end <= source_len)
            .ok_or_else(|| {
                DeltaError::OutOfBounds(format!(
                    "source view {}+{} exceeds the {source_len} byte source",
                    window.source_view_offset, window.source_view_length
                ))
            })?;
        let mut view = Vec::new();
        let mut chunk = [0u8; SOURCE_READ_CHUNK];
        let mut offset = window.source_view_offset;
        while offset < end {
            let n = (end - offset).min(SOURCE_READ_CHUNK as u64) as usize;
            self.source.read_at(offset, &mut chunk[..n])?;
            view.extend_from_slice(&chunk[..n]);
            offset += n as u64;
        }
        Ok(view)
    }

    /// Flushes the sink and returns it with the length and checksum of the
    /// produced content.
    pub fn finish(mut self) -> Result<(W, AppliedDelta), SvnError> {
        if self.failed {
            return Err(SvnError::ProtocolViolation(
                "delta application already failed".into(),
            ));
        }
        self.sink.flush()?;
        let applied = AppliedDelta {
            length: self.target_offset,
            md5: hex::encode(self.digest.finalize()),
        };
        Ok((self.sink, applied))
    }
}

/// Produces the output of one validated window.
fn assemble(window: &DiffWindow, source_view: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut target = Vec::new();
    for ins in &window.instructions {
        let start = ins.offset() as usize;
        let len = ins.length() as usize;
        match ins {
            Instruction::CopyFromSource { .. } => {
                let bytes = source_view.get(start..start + len).ok_or_else(|| {
                    DeltaError::OutOfBounds("source copy past the source view".into())
                })?;
                target.extend_from_slice(bytes);
            }
            Instruction::CopyFromNewData { .. } => {
                let bytes = window.new_data.get(start..start + len).ok_or_else(|| {
                    DeltaError::OutOfBounds("new data copy past the new data".into())
                })?;
                target.extend_from_slice(bytes);
            }
            Instruction::CopyFromTarget { .. } => {
                if start >= target.len() {
                    return Err(DeltaError::OutOfBounds(
                        "target copy starts beyond the produced bytes".into(),
                    ));
                }
                target.reserve(len);
                // Byte by byte so overlapping ranges repeat a run.
                for i in 0..len {
                    let b = target[start + i];
                    target.push(b);
                }
            }
        }
    }
    Ok(target)
}

/// Applies `windows` to `source` in memory and returns the new content.
pub fn apply_windows(source: &[u8], windows: &[DiffWindow]) -> Result<Vec<u8>, SvnError> {
    let mut applier = DeltaApplier::new(source, Vec::new());
    for window in windows {
        applier.apply(window)?;
    }
    let (out, _) = applier.finish()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use proptest::prelude::*;

    use super::*;

    fn window(
        sview: (u64, u64),
        tview_len: u64,
        instructions: Vec<Instruction>,
        new_data: &[u8],
    ) -> DiffWindow {
        DiffWindow {
            source_view_offset: sview.0,
            source_view_length: sview.1,
            target_view_length: tview_len,
            instructions,
            new_data: new_data.to_vec(),
        }
    }

    #[test]
    fn apply_source_and_new_data() {
        let delta = window(
            (0, 6),
            6,
            vec![
                Instruction::CopyFromSource {
                    offset: 0,
                    length: 2,
                },
                Instruction::CopyFromNewData {
                    offset: 0,
                    length: 2,
                },
                Instruction::CopyFromSource {
                    offset: 4,
                    length: 2,
                },
            ],
            b"XY",
        );
        assert_eq!(apply_windows(b"abcdef", &[delta]).unwrap(), b"abXYef");
    }

    #[test]
    fn apply_target_copy_with_overlap() {
        let delta = window(
            (0, 0),
            6,
            vec![
                Instruction::CopyFromNewData {
                    offset: 0,
                    length: 1,
                },
                Instruction::CopyFromTarget {
                    offset: 0,
                    length: 5,
                },
            ],
            b"a",
        );
        assert_eq!(apply_windows(&[], &[delta]).unwrap(), b"aaaaaa");
    }

    #[test]
    fn windows_concatenate_in_call_order() {
        let first = window(
            (0, 3),
            3,
            vec![Instruction::CopyFromSource {
                offset: 0,
                length: 3,
            }],
            b"",
        );
        let second = window(
            (3, 3),
            4,
            vec![
                Instruction::CopyFromNewData {
                    offset: 0,
                    length: 1,
                },
                Instruction::CopyFromSource {
                    offset: 0,
                    length: 3,
                },
            ],
            b"-",
        );
        let mut applier = DeltaApplier::new(&b"abcdef"[..], Vec::new());
        applier.apply(&first).unwrap();
        assert_eq!(applier.target_offset(), 3);
        applier.apply(&second).unwrap();
        let (out, applied) = applier.finish().unwrap();
        assert_eq!(out, b"abc-def");
        assert_eq!(applied.length, 7);
        assert_eq!(applied.md5, md5_hex(b"abc-def"));
    }

    #[test]
    fn out_of_bounds_source_copy_writes_nothing_for_the_window() {
        let good = DiffWindow::replacement(b"ok:");
        let bad = window(
            (0, 4),
            2,
            vec![
                Instruction::CopyFromNewData {
                    offset: 0,
                    length: 1,
                },
                Instruction::CopyFromSource {
                    offset: 5,
                    length: 1,
                },
            ],
            b"x",
        );
        let mut sink = Vec::new();
        let mut applier = DeltaApplier::new(&b"abcd"[..], &mut sink);
        applier.apply(&good).unwrap();
        let err = applier.apply(&bad).unwrap_err();
        assert!(matches!(
            err,
            SvnError::MalformedDelta(DeltaError::OutOfBounds(_))
        ));
        assert!(applier.apply(&good).is_err());
        drop(applier);
        assert_eq!(sink, b"ok:");
    }

    #[test]
    fn oversized_target_view_fails_without_output() {
        let huge = 1u64 << 45;
        let delta = window(
            (0, 0),
            huge,
            vec![
                Instruction::CopyFromNewData {
                    offset: 0,
                    length: 1,
                },
                Instruction::CopyFromTarget {
                    offset: 0,
                    length: huge - 1,
                },
            ],
            b"a",
        );
        let mut sink = Vec::new();
        let mut applier = DeltaApplier::new(&[][..], &mut sink);
        let err = applier.apply(&delta).unwrap_err();
        assert!(matches!(err, SvnError::MalformedDelta(DeltaError::Corrupt(_))));
        drop(applier);
        assert!(sink.is_empty());
    }

    #[test]
    fn source_views_larger_than_a_read_chunk_are_assembled() {
        let source: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let delta = window(
            (1_000, 30_000),
            30_000,
            vec![Instruction::CopyFromSource {
                offset: 0,
                length: 30_000,
            }],
            b"",
        );
        assert_eq!(
            apply_windows(&source, &[delta]).unwrap(),
            &source[1_000..31_000]
        );
    }

    #[test]
    fn source_view_beyond_source_is_rejected() {
        let delta = window(
            (2, 4),
            4,
            vec![Instruction::CopyFromSource {
                offset: 0,
                length: 4,
            }],
            b"",
        );
        let err = apply_windows(b"abcd", &[delta]).unwrap_err();
        assert!(matches!(
            err,
            SvnError::MalformedDelta(DeltaError::OutOfBounds(_))
        ));
    }

    #[test]
    fn backward_source_views_are_rejected() {
        let copy = |offset| {
            window(
                (offset, 2),
                2,
                vec![Instruction::CopyFromSource {
                    offset: 0,
                    length: 2,
                }],
                b"",
            )
        };
        let err = apply_windows(b"abcdef", &[copy(2), copy(0)]).unwrap_err();
        assert!(matches!(
            err,
            SvnError::MalformedDelta(DeltaError::Corrupt(_))
        ));
        // Windows without a source view do not move the source position.
        let windows = [copy(2), DiffWindow::replacement(b"!"), copy(4)];
        assert_eq!(apply_windows(b"abcdef", &windows).unwrap(), b"cd!ef");
    }

    #[test]
    fn file_sources_are_read_at_offsets() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();
        let delta = window(
            (5, 5),
            3,
            vec![Instruction::CopyFromSource {
                offset: 2,
                length: 3,
            }],
            b"",
        );
        let mut applier = DeltaApplier::new(file, Vec::new());
        applier.apply(&delta).unwrap();
        let (out, _) = applier.finish().unwrap();
        assert_eq!(out, b"789");
    }

    proptest! {
        #[test]
        fn replacement_round_trip_reproduces_content(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            max in 1usize..700,
        ) {
            let windows: Vec<DiffWindow> = DiffWindow::replacement_windows(&data, max)
                .iter()
                .map(|w| DiffWindow::decode(&w.encode()).unwrap())
                .collect();
            prop_assert_eq!(apply_windows(&[], &windows).unwrap(), data);
        }

        #[test]
        fn resolved_instructions_reproduce_target(
            source in proptest::collection::vec(any::<u8>(), 1..256),
            picks in proptest::collection::vec((any::<bool>(), any::<u16>(), 1u16..16), 1..24),
        ) {
            // Build the expected target alongside the window that describes it.
            let mut expected = Vec::new();
            let mut new_data = Vec::new();
            let mut instructions = Vec::new();
            for (from_source, at, len) in picks {
                let len = u64::from(len);
                if from_source {
                    let offset = u64::from(at) % source.len() as u64;
                    let length = len.min(source.len() as u64 - offset);
                    expected.extend_from_slice(&source[offset as usize..(offset + length) as usize]);
                    instructions.push(Instruction::CopyFromSource { offset, length });
                } else {
                    let offset = new_data.len() as u64;
                    new_data.extend((0..len).map(|i| (at as u64 + i) as u8));
                    expected.extend_from_slice(&new_data[offset as usize..]);
                    instructions.push(Instruction::CopyFromNewData { offset, length: len });
                }
            }
            let delta = DiffWindow {
                source_view_offset: 0,
                source_view_length: source.len() as u64,
                target_view_length: expected.len() as u64,
                instructions,
                new_data,
            };
            prop_assert_eq!(apply_windows(&source, &[delta]).unwrap(), expected);
        }
    }
}
