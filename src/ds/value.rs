//! Entry values shared by the ziplist and the quicklist.
//!
//! 一个 entry 要么是整数，要么是字节串。编码细节（prevlen、encoding 头等）只存在于 ziplist 内部，
//! 对外只暴露这两种值，读取时不会在两者之间做隐式转换。

use std::fmt;

use bytes::Bytes;

/// Borrowed view of an entry. `Bytes` points straight into the owning buffer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZipValue<'a> {
    Int(i64),
    Bytes(&'a [u8]),
}

impl<'a> ZipValue<'a> {
    pub fn to_entry_value(&self) -> ZipEntryValue {
        match *self {
            ZipValue::Int(i) => ZipEntryValue::Int(i),
            ZipValue::Bytes(s) => ZipEntryValue::Bytes(Bytes::copy_from_slice(s)),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self {
            ZipValue::Int(i) => Some(i),
            ZipValue::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match *self {
            ZipValue::Int(_) => None,
            ZipValue::Bytes(s) => Some(s),
        }
    }

    /// The form the value takes once stored: byte strings that are the
    /// canonical decimal form of an i64 become integers.
    pub(crate) fn normalized(self) -> ZipValue<'a> {
        match self {
            ZipValue::Bytes(s) => match parse_canonical_int(s) {
                Some(i) => ZipValue::Int(i),
                None => self,
            },
            v => v,
        }
    }
}

impl fmt::Debug for ZipValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZipValue::Int(i) => write!(f, "Int({})", i),
            ZipValue::Bytes(s) => write!(f, "Bytes({:?})", String::from_utf8_lossy(s)),
        }
    }
}

impl From<i64> for ZipValue<'_> {
    fn from(i: i64) -> Self {
        ZipValue::Int(i)
    }
}

impl<'a> From<&'a [u8]> for ZipValue<'a> {
    fn from(s: &'a [u8]) -> Self {
        ZipValue::Bytes(s)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for ZipValue<'a> {
    fn from(s: &'a [u8; N]) -> Self {
        ZipValue::Bytes(&s[..])
    }
}

impl<'a> From<&'a Vec<u8>> for ZipValue<'a> {
    fn from(s: &'a Vec<u8>) -> Self {
        ZipValue::Bytes(s.as_slice())
    }
}

impl<'a> From<&'a str> for ZipValue<'a> {
    fn from(s: &'a str) -> Self {
        ZipValue::Bytes(s.as_bytes())
    }
}

impl<'a> From<&'a ZipEntryValue> for ZipValue<'a> {
    fn from(v: &'a ZipEntryValue) -> Self {
        v.as_value()
    }
}

/// Owned entry value, handed out by pops and by reads that had to decompress.
/// `Bytes` 内部引用计数，clone 时不会复制底层数据。
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ZipEntryValue {
    Int(i64),
    Bytes(Bytes),
}

impl ZipEntryValue {
    pub fn as_value(&self) -> ZipValue<'_> {
        match self {
            ZipEntryValue::Int(i) => ZipValue::Int(*i),
            ZipEntryValue::Bytes(b) => ZipValue::Bytes(b),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        self.as_value().as_int()
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ZipEntryValue::Int(_) => None,
            ZipEntryValue::Bytes(b) => Some(b),
        }
    }
}

impl fmt::Debug for ZipEntryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_value().fmt(f)
    }
}

impl From<i64> for ZipEntryValue {
    fn from(i: i64) -> Self {
        ZipEntryValue::Int(i)
    }
}

impl From<&[u8]> for ZipEntryValue {
    fn from(s: &[u8]) -> Self {
        ZipEntryValue::Bytes(Bytes::copy_from_slice(s))
    }
}

impl From<&str> for ZipEntryValue {
    fn from(s: &str) -> Self {
        ZipEntryValue::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl PartialEq<ZipValue<'_>> for ZipEntryValue {
    fn eq(&self, other: &ZipValue<'_>) -> bool {
        self.as_value() == *other
    }
}

/// 严格的整数解析：不允许前导 0、`+`、空白，长度必须小于 32。
/// 只有这样的字符串才能无损地以整数形式存储并还原。
pub(crate) fn parse_canonical_int(s: &[u8]) -> Option<i64> {
    if s.is_empty() || s.len() >= 32 {
        return None;
    }
    let text = std::str::from_utf8(s).ok()?;
    let v: i64 = text.parse().ok()?;
    // "-0"、"007"、"+1" 都能 parse 成功，但转回去对不上
    if v.to_string().as_bytes() == s {
        Some(v)
    } else {
        None
    }
}
