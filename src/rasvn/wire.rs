//! Token writer for `svn://` commands.
//!
//! Editor and report commands are hot paths during large edits, so they are
//! written straight into a byte buffer instead of being built as
//! [`SvnItem`] trees first.

use super::SvnItem;

pub(crate) struct WireEncoder<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> WireEncoder<'a> {
    pub(crate) fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out }
    }

    pub(crate) fn word(&mut self, word: &str) {
        self.out.extend_from_slice(word.as_bytes());
        self.out.push(b' ');
    }

    pub(crate) fn number(&mut self, n: u64) {
        encode_decimal_u64(n, self.out);
        self.out.push(b' ');
    }

    pub(crate) fn bool(&mut self, b: bool) {
        if b {
            self.out.extend_from_slice(b"true ");
        } else {
            self.out.extend_from_slice(b"false ");
        }
    }

    pub(crate) fn string_bytes(&mut self, bytes: &[u8]) {
        encode_decimal_u64(bytes.len() as u64, self.out);
        self.out.push(b':');
        self.out.extend_from_slice(bytes);
        self.out.push(b' ');
    }

    pub(crate) fn string_str(&mut self, s: &str) {
        self.string_bytes(s.as_bytes());
    }

    pub(crate) fn list_start(&mut self) {
        self.out.extend_from_slice(b"( ");
    }

    pub(crate) fn list_end(&mut self) {
        self.out.extend_from_slice(b") ");
    }

    /// `( n )` or `( )`.
    pub(crate) fn opt_number(&mut self, n: Option<u64>) {
        self.list_start();
        if let Some(n) = n {
            self.number(n);
        }
        self.list_end();
    }

    /// `( len:bytes )` or `( )`.
    pub(crate) fn opt_bytes(&mut self, bytes: Option<&[u8]>) {
        self.list_start();
        if let Some(bytes) = bytes {
            self.string_bytes(bytes);
        }
        self.list_end();
    }

    /// Starts `( name ( `; close with [`WireEncoder::command_end`].
    pub(crate) fn command_start(&mut self, name: &str) {
        self.list_start();
        self.word(name);
        self.list_start();
    }

    pub(crate) fn command_end(&mut self) {
        self.list_end();
        self.list_end();
        self.out.push(b'\n');
    }
}

pub(crate) fn encode_decimal_u64(mut n: u64, out: &mut Vec<u8>) {
    if n == 0 {
        out.push(b'0');
        return;
    }
    let mut buf = [0u8; 20];
    let mut i = buf.len();
    while n > 0 {
        let digit = (n % 10) as u8;
        n /= 10;
        i -= 1;
        buf[i] = b'0' + digit;
    }
    out.extend_from_slice(&buf[i..]);
}

pub(crate) fn encode_command_item(command: &str, params: &SvnItem, out: &mut Vec<u8>) {
    out.extend_from_slice(b"( ");
    out.extend_from_slice(command.as_bytes());
    out.push(b' ');
    params.encode(out);
    out.extend_from_slice(b") ");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_edges() {
        let mut out = Vec::new();
        encode_decimal_u64(0, &mut out);
        out.push(b' ');
        encode_decimal_u64(u64::MAX, &mut out);
        assert_eq!(out, b"0 18446744073709551615");
    }

    #[test]
    fn command_with_optional_tuples() {
        let mut out = Vec::new();
        let mut enc = WireEncoder::new(&mut out);
        enc.command_start("open-dir");
        enc.string_str("trunk");
        enc.string_str("d0");
        enc.string_str("d1");
        enc.opt_number(Some(4));
        enc.command_end();
        enc.command_start("close-file");
        enc.string_str("c2");
        enc.opt_bytes(None);
        enc.command_end();
        assert_eq!(
            out,
            b"( open-dir ( 5:trunk 2:d0 2:d1 ( 4 ) ) ) \n( close-file ( 2:c2 ( ) ) ) \n"
        );
    }

    #[test]
    fn command_item_wraps_params() {
        let mut out = Vec::new();
        encode_command_item("get-latest-rev", &SvnItem::List(Vec::new()), &mut out);
        assert_eq!(out, b"( get-latest-rev ( ) ) ");
    }
}
