//! Delta generation for outgoing file content.

use similar::{Algorithm, DiffTag, capture_diff_slices};

use crate::textdelta::md5_hex;
use crate::{DELTA_WINDOW_MAX, DiffWindow, Instruction, SvnError, TreeEditor};

#[derive(Clone, Copy, Debug)]
enum Piece {
    Source { offset: usize, len: usize },
    New { offset: usize, len: usize },
}

fn lines(data: &[u8]) -> Vec<&[u8]> {
    data.split_inclusive(|b| *b == b'\n').collect()
}

fn line_starts(lines: &[&[u8]]) -> Vec<usize> {
    let mut starts = Vec::with_capacity(lines.len() + 1);
    let mut pos = 0;
    starts.push(pos);
    for line in lines {
        pos += line.len();
        starts.push(pos);
    }
    starts
}

/// Line-level matching of `target` against `source`.
fn pieces(source: &[u8], target: &[u8]) -> Vec<Piece> {
    let old = lines(source);
    let new = lines(target);
    let old_starts = line_starts(&old);
    let new_starts = line_starts(&new);

    let mut out: Vec<Piece> = Vec::new();
    for op in capture_diff_slices(Algorithm::Myers, &old, &new) {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        let piece = match tag {
            DiffTag::Equal => Piece::Source {
                offset: old_starts[old_range.start],
                len: old_starts[old_range.end] - old_starts[old_range.start],
            },
            DiffTag::Insert | DiffTag::Replace => Piece::New {
                offset: new_starts[new_range.start],
                len: new_starts[new_range.end] - new_starts[new_range.start],
            },
            DiffTag::Delete => continue,
        };
        match (out.last_mut(), piece) {
            (
                Some(Piece::Source { offset, len }),
                Piece::Source {
                    offset: next,
                    len: more,
                },
            ) if *offset + *len == next => *len += more,
            (
                Some(Piece::New { offset, len }),
                Piece::New {
                    offset: next,
                    len: more,
                },
            ) if *offset + *len == next => *len += more,
            _ => out.push(piece),
        }
    }
    out
}

#[derive(Default)]
struct WindowBuilder {
    view: Option<(u64, u64)>,
    target_len: u64,
    instructions: Vec<Instruction>,
    new_data: Vec<u8>,
}

impl WindowBuilder {
    fn build(self, last_view_offset: &mut u64) -> DiffWindow {
        let (source_view_offset, source_view_length) = match self.view {
            Some((start, end)) => {
                *last_view_offset = start;
                (start, end - start)
            }
            None => (*last_view_offset, 0),
        };
        DiffWindow {
            source_view_offset,
            source_view_length,
            target_view_length: self.target_len,
            instructions: self.instructions,
            new_data: self.new_data,
        }
    }
}

/// Computes windows that turn `source` into `target`.
///
/// Unchanged lines are copied from the source and everything else is sent
/// as new data. `max_window` is clamped to `1..=DELTA_WINDOW_MAX`. No
/// window produces more than `max_window` bytes or views more than
/// `max_window` bytes of source, and source views never move
/// backwards. An empty target yields a single empty window.
pub fn generate(source: &[u8], target: &[u8], max_window: usize) -> Vec<DiffWindow> {
    let max = max_window.clamp(1, DELTA_WINDOW_MAX) as u64;
    let mut windows = Vec::new();
    let mut last_view_offset = 0;
    let mut cur = WindowBuilder::default();

    for piece in pieces(source, target) {
        let (mut offset, mut remaining, from_source) = match piece {
            Piece::Source { offset, len } => (offset as u64, len as u64, true),
            Piece::New { offset, len } => (offset as u64, len as u64, false),
        };
        while remaining > 0 {
            let mut take = remaining.min(max - cur.target_len);
            if from_source && let Some((start, _)) = cur.view {
                take = take.min((start + max).saturating_sub(offset));
            }
            if take == 0 {
                windows.push(std::mem::take(&mut cur).build(&mut last_view_offset));
                continue;
            }

            if from_source {
                let (start, end) = cur.view.get_or_insert((offset, offset));
                *end = (*end).max(offset + take);
                cur.instructions.push(Instruction::CopyFromSource {
                    offset: offset - *start,
                    length: take,
                });
            } else {
                cur.instructions.push(Instruction::CopyFromNewData {
                    offset: cur.new_data.len() as u64,
                    length: take,
                });
                cur.new_data
                    .extend_from_slice(&target[offset as usize..(offset + take) as usize]);
            }
            cur.target_len += take;
            offset += take;
            remaining -= take;
        }
    }

    if cur.target_len > 0 || windows.is_empty() {
        windows.push(cur.build(&mut last_view_offset));
    }
    windows
}

/// Sends `target` to the open file of `editor` as a delta against `source`.
///
/// Drives `apply_text_delta`, the windows and `text_delta_end`, and returns
/// the MD5 of `target` for the following `close_file`.
pub async fn send_file_delta(
    editor: &mut dyn TreeEditor,
    base_checksum: Option<String>,
    source: &[u8],
    target: &[u8],
) -> Result<String, SvnError> {
    editor.apply_text_delta(base_checksum).await?;
    for window in generate(source, target, DELTA_WINDOW_MAX) {
        editor.text_delta_chunk(window).await?;
    }
    editor.text_delta_end().await?;
    Ok(md5_hex(target))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use proptest::prelude::*;

    use super::*;
    use crate::textdelta::apply_windows;

    #[test]
    fn unchanged_lines_are_copied_from_source() {
        let source = b"one\ntwo\nthree\nfour\n";
        let target = b"one\nTWO\nthree\nfour\nfive\n";
        let windows = generate(source, target, 1024);
        assert_eq!(windows.len(), 1);
        let window = &windows[0];
        assert_eq!(window.new_data, b"TWO\nfive\n");
        assert_eq!(
            window.instructions,
            vec![
                Instruction::CopyFromSource {
                    offset: 0,
                    length: 4
                },
                Instruction::CopyFromNewData {
                    offset: 0,
                    length: 4
                },
                Instruction::CopyFromSource {
                    offset: 8,
                    length: 11
                },
                Instruction::CopyFromNewData {
                    offset: 4,
                    length: 5
                },
            ]
        );
        assert_eq!(apply_windows(source, &windows).unwrap(), target);
    }

    #[test]
    fn empty_target_is_one_empty_window() {
        let windows = generate(b"old\n", b"", 16);
        assert_eq!(windows.len(), 1);
        assert!(windows[0].is_empty());
        assert_eq!(apply_windows(b"old\n", &windows).unwrap(), b"");
    }

    #[test]
    fn windows_respect_the_size_limit() {
        let source: Vec<u8> = (0..200).flat_map(|i| format!("line {i}\n").into_bytes()).collect();
        let mut target = source.clone();
        target.splice(500..500, b"inserted\n".iter().copied());
        let windows = generate(&source, &target, 128);
        assert!(windows.len() > 1);
        let mut last_offset = 0;
        for window in &windows {
            window.validate().unwrap();
            assert!(window.target_view_length <= 128);
            assert!(window.source_view_length <= 128);
            assert!(window.source_view_offset >= last_offset);
            last_offset = window.source_view_offset;
        }
        assert_eq!(apply_windows(&source, &windows).unwrap(), target);
    }

    proptest! {
        #[test]
        fn generated_windows_reproduce_target(
            source in proptest::collection::vec(prop_oneof![Just(b'\n'), Just(b'a'), Just(b'b'), any::<u8>()], 0..512),
            target in proptest::collection::vec(prop_oneof![Just(b'\n'), Just(b'a'), Just(b'b'), any::<u8>()], 0..512),
            max in 1usize..200,
        ) {
            let windows = generate(&source, &target, max);
            for window in &windows {
                prop_assert!(window.validate().is_ok());
                prop_assert!(window.target_view_length <= max as u64);
            }
            prop_assert_eq!(apply_windows(&source, &windows).unwrap(), target);
        }

        #[test]
        fn edits_keep_shared_lines(prefix in "[a-z\n]{0,64}", suffix in "[a-z\n]{0,64}", middle in "[A-Z]{1,16}") {
            let source = format!("{prefix}\n{suffix}");
            let target = format!("{prefix}\n{middle}\n{suffix}");
            let windows = generate(source.as_bytes(), target.as_bytes(), 1 << 16);
            let new_bytes: usize = windows.iter().map(|w| w.new_data.len()).sum();
            prop_assert!(new_bytes < target.len() || source.len() <= 1);
            prop_assert_eq!(apply_windows(source.as_bytes(), &windows).unwrap(), target.into_bytes());
        }
    }
}
