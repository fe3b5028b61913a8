// One terminator-delimited unit of stored bytes.
use std::fmt;

use bstr::ByteSlice;
use bytes::Bytes;

/// Immutable record content. Cloning shares the underlying buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    content: Bytes,
}

impl Record {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.content
    }

    pub fn bytes(&self) -> &Bytes {
        &self.content
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record({:?})", self.content.as_bstr())
    }
}

impl From<&'static [u8]> for Record {
    fn from(value: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(value))
    }
}

impl From<Vec<u8>> for Record {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}
