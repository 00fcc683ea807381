use std::fmt::{Display, Formatter};

use super::wire::WireEncoder;

/// Lists longer than this are cut short when displayed.
const DISPLAY_LIST_ITEMS: usize = 6;

/// One item of the `svn://` wire protocol.
///
/// Every command, response and editor call on that wire is a tree of these.
/// Sessions never expose them; they are public for callers that log or
/// inspect raw traffic.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum SvnItem {
    /// Bare token such as a command name or `true`.
    Word(String),
    Number(u64),
    /// Length-prefixed bytes. Paths, log messages and property values all
    /// travel this way, and nothing guarantees UTF-8.
    String(Vec<u8>),
    List(Vec<SvnItem>),
    /// Encodes as the word `true` or `false`.
    Bool(bool),
}

impl SvnItem {
    /// Variant name, for error messages.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Word(_) => "word",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Bool(_) => "bool",
        }
    }

    fn bytes(&self) -> Option<&[u8]> {
        if let Self::String(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    fn items(&self) -> Option<&[SvnItem]> {
        if let Self::List(items) = self {
            Some(items)
        } else {
            None
        }
    }

    /// The token of a word.
    pub fn as_word(&self) -> Option<String> {
        if let Self::Word(word) = self {
            Some(word.to_owned())
        } else {
            None
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        if let Self::Number(n) = self {
            Some(*n)
        } else {
            None
        }
    }

    /// A boolean, or one of the words `true` and `false` that servers send
    /// in its place.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Word(word) => word.parse().ok(),
            _ => None,
        }
    }

    /// A string's bytes as text; `None` for other items and for bytes that
    /// are not UTF-8.
    pub fn as_string(&self) -> Option<String> {
        std::str::from_utf8(self.bytes()?).ok().map(str::to_owned)
    }

    /// A string's bytes, UTF-8 or not.
    pub fn as_bytes_string(&self) -> Option<Vec<u8>> {
        self.bytes().map(<[u8]>::to_vec)
    }

    /// A copy of a list's elements.
    pub fn as_list(&self) -> Option<Vec<SvnItem>> {
        self.items().map(<[SvnItem]>::to_vec)
    }

    /// Appends the wire form of this item, trailing space included.
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        self.write_to(&mut WireEncoder::new(out));
    }

    fn write_to(&self, enc: &mut WireEncoder<'_>) {
        match self {
            Self::Word(word) => enc.word(word),
            Self::Number(n) => enc.number(*n),
            Self::String(bytes) => enc.string_bytes(bytes),
            Self::Bool(value) => enc.bool(*value),
            Self::List(items) => {
                enc.list_start();
                items.iter().for_each(|item| item.write_to(enc));
                enc.list_end();
            }
        }
    }
}

/// Shape of the item with string contents elided, so secrets and large
/// payloads never end up in logs.
impl Display for SvnItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Word(word) => f.write_str(word),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::String(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Self::List(items) => {
                f.write_str("(")?;
                for item in items.iter().take(DISPLAY_LIST_ITEMS) {
                    write!(f, " {item}")?;
                }
                if items.len() > DISPLAY_LIST_ITEMS {
                    write!(f, " +{}", items.len() - DISPLAY_LIST_ITEMS)?;
                }
                f.write_str(" )")
            }
        }
    }
}
