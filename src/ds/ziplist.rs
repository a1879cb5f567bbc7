//! The ziplist is a specially encoded *dually linked list* that is designed to be very memory efficient. It *stores both strings and integer values*, where integers are encoded as actual integers instead of a series of characters. It allows push and pop operations on either side of the list in O(1) time.
//!
//! # Why use ziplist? 为什么使用 ziplist？
//! 一个普通的双向链表，链表中每一项都占用独立的一块内存，各项之间用地址指针（或引用）连接起来。这种方式会带来大量的内存碎片，而且地址指针也会占用额外的内存。
//! 而ziplist却是将表中每一项存放在前后连续的地址空间内，一个ziplist整体占用一大块内存。它是一个表（list），但其实不是一个链表（linked list），只是
//! 一片连续的内存区域。
//!
//! # Layout
//! ```text
//! <zlbytes: u32 LE> <zltail: u32 LE> <zllen: u16 LE> <entry> ... <entry> <zlend: 0xff>
//! entry := <prevlen> <encoding> <payload>
//! ```
//! `prevlen` 是前一个 entry 的总字节数：小于 254 时占 1 字节，否则是 `0xfe` 加 4 字节 LE。
//! `zllen` 达到 `u16::MAX` 后不再维护，需要遍历才能得到真实长度。
//!
//! 这个格式会被持久化层原样读写，所以每一个字节都必须和既有格式保持一致。

use std::fmt;

use bitmatch::bitmatch;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::{trace, warn};

use super::error::{ZLError, ZLResult};
use super::value::ZipValue;

const ZIPLIST_BYTES_OFF: usize = 0;
const ZIPLIST_BYTES_SIZE: usize = 4;
const ZIPLIST_TAILOFF_OFF: usize = ZIPLIST_BYTES_OFF + ZIPLIST_BYTES_SIZE;
const ZIPLIST_TAILOFF_SIZE: usize = 4;
const ZIPLIST_LEN_OFF: usize = ZIPLIST_TAILOFF_OFF + ZIPLIST_TAILOFF_SIZE;
const ZIPLIST_LEN_SIZE: usize = 2;
pub const ZIPLIST_HEADER_SIZE: usize = ZIPLIST_LEN_OFF + ZIPLIST_LEN_SIZE;
const ZIPLIST_END_SIZE: usize = 1;
/// Size of a ziplist holding no entries.
pub const ZIPLIST_EMPTY_SIZE: usize = ZIPLIST_HEADER_SIZE + ZIPLIST_END_SIZE;

const ZIP_END: u8 = 0xff;
const ZIP_BIG_PREVLEN: u8 = 0xfe;
/// `zllen` 饱和值：真实长度需要遍历得到
const ZIPLIST_LEN_UNKNOWN: usize = u16::MAX as usize;

const ZIP_STR_06B: u8 = 0b0000_0000;
const ZIP_STR_14B: u8 = 0b0100_0000;
const ZIP_STR_32B: u8 = 0b1000_0000;

const ZIPLIST_I16_ENC: u8 = 0b1100_0000;
const ZIPLIST_I32_ENC: u8 = 0b1101_0000;
const ZIPLIST_I64_ENC: u8 = 0b1110_0000;
const ZIPLIST_I24_ENC: u8 = 0b1111_0000;
const ZIPLIST_I8_ENC: u8 = 0b1111_1110;
/// 4 bit 立即数的编码是 `1111_xxxx`，xxxx 取 0001..=1101，表示 0..=12
const ZIPLIST_IMM_MIN: u8 = 0b1111_0001;
const ZIPLIST_IMM_MAX_VAL: i64 = 12;

const INT24_MIN: i64 = -(1 << 23);
const INT24_MAX: i64 = (1 << 23) - 1;

#[inline]
fn prevlen_size(len: usize) -> usize {
    if len < ZIP_BIG_PREVLEN as usize {
        1
    } else {
        5
    }
}

/// 把 `len` 以 `size` 字节的形式写出。`size` 为 5 时即使 len 很小也用大格式，
/// 这样已经变宽的 prevlen 字段永远不会被缩回去。
fn encode_prevlen(dst: &mut Vec<u8>, len: usize, size: usize) {
    if size == 1 {
        debug_assert!(len < ZIP_BIG_PREVLEN as usize);
        dst.push(len as u8);
    } else {
        let mut buf = [0u8; 5];
        buf[0] = ZIP_BIG_PREVLEN;
        LittleEndian::write_u32(&mut buf[1..], len as u32);
        dst.extend_from_slice(&buf);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IntWidth {
    Imm(u8),
    I8,
    I16,
    I24,
    I32,
    I64,
}

impl IntWidth {
    /// 能无损保存 `i` 的最小编码
    fn for_value(i: i64) -> Self {
        if (0..=ZIPLIST_IMM_MAX_VAL).contains(&i) {
            IntWidth::Imm(i as u8)
        } else if i >= i8::MIN as i64 && i <= i8::MAX as i64 {
            IntWidth::I8
        } else if i >= i16::MIN as i64 && i <= i16::MAX as i64 {
            IntWidth::I16
        } else if (INT24_MIN..=INT24_MAX).contains(&i) {
            IntWidth::I24
        } else if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
            IntWidth::I32
        } else {
            IntWidth::I64
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            IntWidth::Imm(_) => 0,
            IntWidth::I8 => 1,
            IntWidth::I16 => 2,
            IntWidth::I24 => 3,
            IntWidth::I32 => 4,
            IntWidth::I64 => 8,
        }
    }

    fn tag(&self) -> u8 {
        match *self {
            IntWidth::Imm(v) => ZIPLIST_IMM_MIN + v,
            IntWidth::I8 => ZIPLIST_I8_ENC,
            IntWidth::I16 => ZIPLIST_I16_ENC,
            IntWidth::I24 => ZIPLIST_I24_ENC,
            IntWidth::I32 => ZIPLIST_I32_ENC,
            IntWidth::I64 => ZIPLIST_I64_ENC,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryKind {
    Str,
    Int(IntWidth),
}

/// 待写入 entry 的编码。
#[derive(Clone, Copy, Debug)]
enum Encoding {
    // 字符串类型, usize 为字符串长度
    String(usize),
    Integer(i64),
}

impl Encoding {
    /// 获取编码本身所占的字节数。
    fn encoding_len(&self) -> usize {
        match *self {
            Encoding::String(sz) => {
                if sz <= 0x3f {
                    1
                } else if sz <= 0x3fff {
                    2
                } else {
                    5
                }
            }
            Encoding::Integer(_) => 1,
        }
    }

    /// 编码字节数 + 内容长度
    fn encoding_len_with_content(&self) -> usize {
        match *self {
            Encoding::String(sz) => self.encoding_len() + sz,
            Encoding::Integer(i) => self.encoding_len() + IntWidth::for_value(i).payload_len(),
        }
    }

    /// 追加 encoding 头和 payload。字符串长度是大端，整数 payload 是小端。
    fn write(&self, dst: &mut Vec<u8>, content: &[u8]) {
        match *self {
            Encoding::String(sz) => {
                match self.encoding_len() {
                    1 => dst.push(ZIP_STR_06B | sz as u8),
                    2 => {
                        dst.push(ZIP_STR_14B | ((sz >> 8) as u8 & 0x3f));
                        dst.push(sz as u8);
                    }
                    _ => {
                        let mut buf = [0u8; 4];
                        BigEndian::write_u32(&mut buf, sz as u32);
                        dst.push(ZIP_STR_32B);
                        dst.extend_from_slice(&buf);
                    }
                }
                dst.extend_from_slice(content);
            }
            Encoding::Integer(i) => {
                let width = IntWidth::for_value(i);
                dst.push(width.tag());
                let mut buf = [0u8; 8];
                match width {
                    IntWidth::Imm(_) => {}
                    IntWidth::I8 => buf[0] = i as i8 as u8,
                    IntWidth::I16 => LittleEndian::write_i16(&mut buf, i as i16),
                    IntWidth::I24 => LittleEndian::write_i24(&mut buf, i as i32),
                    IntWidth::I32 => LittleEndian::write_i32(&mut buf, i as i32),
                    IntWidth::I64 => LittleEndian::write_i64(&mut buf, i),
                }
                dst.extend_from_slice(&buf[..width.payload_len()]);
            }
        }
    }
}

fn byte_at(src: &[u8], offset: usize) -> ZLResult<u8> {
    src.get(offset).copied().ok_or(ZLError::Truncated { offset })
}

fn slice_at(src: &[u8], offset: usize, len: usize) -> ZLResult<&[u8]> {
    src.get(offset..offset + len).ok_or(ZLError::Truncated { offset })
}

/// 解析 encoding 头，返回 (类型, 头部字节数, payload 字节数)
#[bitmatch]
fn parse_encoding(src: &[u8], offset: usize) -> ZLResult<(EntryKind, usize, usize)> {
    let first = byte_at(src, offset)?;
    #[bitmatch]
    match first {
        "00ll_llll" => Ok((EntryKind::Str, 1, l as usize)),
        "01ll_llll" => {
            let low = byte_at(src, offset + 1)?;
            Ok((EntryKind::Str, 2, ((l as usize) << 8) | low as usize))
        }
        "1000_0000" => {
            let raw = slice_at(src, offset + 1, 4)?;
            Ok((EntryKind::Str, 5, BigEndian::read_u32(raw) as usize))
        }
        "1100_0000" => Ok((EntryKind::Int(IntWidth::I16), 1, 2)),
        "1101_0000" => Ok((EntryKind::Int(IntWidth::I32), 1, 4)),
        "1110_0000" => Ok((EntryKind::Int(IntWidth::I64), 1, 8)),
        "1111_0000" => Ok((EntryKind::Int(IntWidth::I24), 1, 3)),
        "1111_1110" => Ok((EntryKind::Int(IntWidth::I8), 1, 1)),
        "1111_1111" => Err(ZLError::Corruption(format!(
            "end marker used as entry encoding at offset {}",
            offset
        ))),
        "1111_iiii" => Ok((EntryKind::Int(IntWidth::Imm(i - 1)), 1, 0)),
        "????_????" => Err(ZLError::InvalidEntryEncoding(first)),
    }
}

/// 返回 (prevlen 字段字节数, prevlen)
fn parse_prevrawlen(src: &[u8], offset: usize) -> ZLResult<(usize, usize)> {
    match byte_at(src, offset)? {
        ZIP_END => Err(ZLError::Corruption(format!(
            "end marker used as prevlen at offset {}",
            offset
        ))),
        ZIP_BIG_PREVLEN => {
            let raw = slice_at(src, offset + 1, 4)?;
            Ok((5, LittleEndian::read_u32(raw) as usize))
        }
        b => Ok((1, b as usize)),
    }
}

/// 只读的 zip entry 头部信息，用于只读访问
#[derive(Clone, Copy, Debug)]
struct ZipEntry {
    offset: usize,
    prevrawlen: usize,
    prevrawlen_size: usize,
    len_size: usize,
    len: usize,
    kind: EntryKind,
}

impl ZipEntry {
    /// 解析 `offset` 处的 entry，保证整个 entry 落在 zlend 之前
    fn parse(src: &[u8], offset: usize) -> ZLResult<Self> {
        let (prevrawlen_size, prevrawlen) = parse_prevrawlen(src, offset)?;
        let (kind, len_size, len) = parse_encoding(src, offset + prevrawlen_size)?;
        let entry = Self {
            offset,
            prevrawlen,
            prevrawlen_size,
            len_size,
            len,
            kind,
        };
        if offset + entry.entry_size() + ZIPLIST_END_SIZE > src.len() {
            return Err(ZLError::Truncated { offset });
        }
        Ok(entry)
    }

    fn header_size(&self) -> usize {
        self.prevrawlen_size + self.len_size
    }

    fn entry_size(&self) -> usize {
        self.header_size() + self.len
    }

    fn value<'a>(&self, src: &'a [u8]) -> ZipValue<'a> {
        let p = self.offset + self.header_size();
        match self.kind {
            EntryKind::Str => ZipValue::Bytes(&src[p..p + self.len]),
            EntryKind::Int(width) => ZipValue::Int(match width {
                IntWidth::Imm(v) => v as i64,
                IntWidth::I8 => src[p] as i8 as i64,
                IntWidth::I16 => LittleEndian::read_i16(&src[p..]) as i64,
                IntWidth::I24 => LittleEndian::read_i24(&src[p..]) as i64,
                IntWidth::I32 => LittleEndian::read_i32(&src[p..]) as i64,
                IntWidth::I64 => LittleEndian::read_i64(&src[p..]),
            }),
        }
    }
}

/// 一次 prevlen 字段的改写。offset 基于改写之前的布局。
#[derive(Clone, Copy, Debug)]
struct PrevlenFix {
    offset: usize,
    prevlen: usize,
    grow: bool,
}

/// Which input buffer `ZipList::merge` kept as storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeSide {
    First,
    Second,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ZipList {
    buf: Vec<u8>,
    /// entry 个数。zllen 饱和之后以这里为准
    len: usize,
}

impl Default for ZipList {
    fn default() -> Self {
        Self::new()
    }
}

impl ZipList {
    pub fn new() -> Self {
        let mut src = vec![0u8; ZIPLIST_EMPTY_SIZE];
        src[ZIPLIST_HEADER_SIZE] = ZIP_END;
        let mut zl = Self { buf: src, len: 0 };
        zl.sync_bytes_size();
        zl.set_tail_offset(ZIPLIST_HEADER_SIZE);
        zl
    }

    /// 从持久化数据或者解压出来的数据构造，会完整校验一遍。
    pub fn from_bytes(bytes: Vec<u8>) -> ZLResult<Self> {
        let mut zl = Self { buf: bytes, len: 0 };
        zl.len = zl.walk()?;
        Ok(zl)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// 整个 ziplist 占用的字节数
    pub fn blob_len(&self) -> usize {
        self.buf.len()
    }

    fn set_tail_offset(&mut self, tail_offset: usize) {
        LittleEndian::write_u32(&mut self.buf[ZIPLIST_TAILOFF_OFF..], tail_offset as u32);
    }

    fn tail_offset(&self) -> usize {
        LittleEndian::read_u32(&self.buf[ZIPLIST_TAILOFF_OFF..]) as usize
    }

    fn read_entry_cnt(&self) -> usize {
        LittleEndian::read_u16(&self.buf[ZIPLIST_LEN_OFF..]) as usize
    }

    fn set_entry_cnt(&mut self, len: usize) {
        self.len = len;
        let len = len.min(ZIPLIST_LEN_UNKNOWN) as u16;
        LittleEndian::write_u16(&mut self.buf[ZIPLIST_LEN_OFF..], len);
    }

    /// zllen 饱和之后不再变化，真实个数记在 `self.len`
    fn incr_entry_cnt(&mut self, delta: isize) {
        let len = (self.len as isize + delta) as usize;
        if self.read_entry_cnt() < ZIPLIST_LEN_UNKNOWN {
            self.set_entry_cnt(len);
        } else {
            self.len = len;
        }
    }

    fn bytes_size(&self) -> usize {
        LittleEndian::read_u32(&self.buf[ZIPLIST_BYTES_OFF..]) as usize
    }

    fn sync_bytes_size(&mut self) {
        let sz = self.buf.len();
        LittleEndian::write_u32(&mut self.buf[ZIPLIST_BYTES_OFF..], sz as u32);
    }

    fn reserve(&mut self, additional: usize) -> ZLResult<()> {
        if self.buf.len() + additional > u32::MAX as usize {
            return Err(ZLError::InvalidArgument(format!(
                "ziplist of {} bytes cannot grow by {}",
                self.buf.len(),
                additional
            )));
        }
        self.buf
            .try_reserve(additional)
            .map_err(|_| ZLError::AllocationFailure(additional))
    }

    pub(crate) fn try_clone(&self) -> ZLResult<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(self.buf.len())
            .map_err(|_| ZLError::AllocationFailure(self.buf.len()))?;
        buf.extend_from_slice(&self.buf);
        Ok(Self { buf, len: self.len })
    }

    /// entry 个数，O(1)
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.is_end(ZIPLIST_HEADER_SIZE)
    }

    #[inline]
    pub(crate) fn is_end(&self, offset: usize) -> bool {
        offset + ZIPLIST_END_SIZE >= self.buf.len()
    }

    #[inline]
    fn end_offset(&self) -> usize {
        self.buf.len() - ZIPLIST_END_SIZE
    }

    fn entry_at(&self, offset: usize) -> ZLResult<ZipEntry> {
        ZipEntry::parse(&self.buf, offset)
    }

    pub(crate) fn head_pos(&self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(ZIPLIST_HEADER_SIZE)
        }
    }

    pub(crate) fn tail_pos(&self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(self.tail_offset())
        }
    }

    /// 下一个 entry 的位置，`pos` 已经是最后一个时返回 None
    pub(crate) fn next_pos(&self, pos: usize) -> ZLResult<Option<usize>> {
        let entry = self.entry_at(pos)?;
        let next = pos + entry.entry_size();
        if self.is_end(next) {
            Ok(None)
        } else {
            Ok(Some(next))
        }
    }

    pub(crate) fn prev_pos(&self, pos: usize) -> ZLResult<Option<usize>> {
        if self.is_end(pos) {
            return Ok(self.tail_pos());
        }
        if pos <= ZIPLIST_HEADER_SIZE {
            return Ok(None);
        }
        let entry = self.entry_at(pos)?;
        if entry.prevrawlen == 0 || entry.prevrawlen > pos - ZIPLIST_HEADER_SIZE {
            return Err(ZLError::Corruption(format!(
                "entry at offset {} has prevlen {}",
                pos, entry.prevrawlen
            )));
        }
        Ok(Some(pos - entry.prevrawlen))
    }

    /// 第 index 个 entry 的位置，负数从尾部往前数，-1 是最后一个。
    /// 下标越界返回 None，走到一半遇到损坏的 entry 返回错误。
    pub(crate) fn index_pos(&self, index: isize) -> ZLResult<Option<usize>> {
        let steps = if index >= 0 {
            index.unsigned_abs()
        } else {
            index.unsigned_abs() - 1
        };
        if steps >= self.len {
            return Ok(None);
        }
        let (start, forward) = if index >= 0 {
            (self.head_pos(), true)
        } else {
            (self.tail_pos(), false)
        };
        let mut pos = match start {
            Some(pos) => pos,
            None => return Ok(None),
        };
        for _ in 0..steps {
            let step = if forward {
                self.next_pos(pos)?
            } else {
                self.prev_pos(pos)?
            };
            pos = match step {
                Some(p) => p,
                None => {
                    return Err(ZLError::LengthMismatch {
                        expected: self.len,
                        actual: steps,
                    })
                }
            };
        }
        Ok(Some(pos))
    }

    pub(crate) fn value_at(&self, pos: usize) -> ZLResult<ZipValue<'_>> {
        let entry = self.entry_at(pos)?;
        Ok(entry.value(&self.buf))
    }

    /// O(|index|) 的随机访问，下标越界返回 `Ok(None)`
    pub fn get(&self, index: isize) -> ZLResult<Option<ZipValue<'_>>> {
        match self.index_pos(index)? {
            Some(pos) => self.value_at(pos).map(Some),
            None => Ok(None),
        }
    }

    pub fn first(&self) -> ZLResult<Option<ZipValue<'_>>> {
        self.get(0)
    }

    pub fn last(&self) -> ZLResult<Option<ZipValue<'_>>> {
        self.get(-1)
    }

    /// 从 `offset` 开始，找出所有需要改写 prevlen 的 entry。`new_len` 是 `offset` 处
    /// entry 的前一个 entry 改动之后的长度。只读，不修改 buffer。
    ///
    /// prevlen 变宽会让本 entry 变长 4 字节，进而可能要求下一个 entry 也变宽，
    /// 所以这里是一个显式的工作队列，最多走到 zlend。
    fn plan_cascade(&self, mut offset: usize, mut new_len: usize) -> ZLResult<Vec<PrevlenFix>> {
        let mut fixes = Vec::new();
        while !self.is_end(offset) {
            let entry = self.entry_at(offset)?;
            if entry.prevrawlen == new_len {
                break;
            }
            if entry.prevrawlen_size < prevlen_size(new_len) {
                trace!(offset, prevlen = new_len, "prevlen field grows");
                fixes.push(PrevlenFix {
                    offset,
                    prevlen: new_len,
                    grow: true,
                });
                new_len = entry.entry_size() + 4;
                offset += entry.entry_size();
            } else {
                // 字段够宽，原地改写后链条就断了；宽字段不会缩回 1 字节
                fixes.push(PrevlenFix {
                    offset,
                    prevlen: new_len,
                    grow: false,
                });
                break;
            }
        }
        Ok(fixes)
    }

    fn cascade_growth(fixes: &[PrevlenFix]) -> usize {
        fixes.iter().filter(|f| f.grow).count() * 4
    }

    /// 应用 `plan_cascade` 的结果。调用方必须已经 reserve 了足够空间。
    fn apply_fixes(&mut self, fixes: &[PrevlenFix]) {
        let tail = self.tail_offset();
        let mut tail_shift = 0;
        // 从后往前改，前面的 offset 不受影响
        for fix in fixes.iter().rev() {
            let old_size = if self.buf[fix.offset] == ZIP_BIG_PREVLEN { 5 } else { 1 };
            let new_size = if fix.grow { 5 } else { old_size };
            let mut field = Vec::with_capacity(5);
            encode_prevlen(&mut field, fix.prevlen, new_size);
            self.buf.splice(fix.offset..fix.offset + old_size, field);
            if fix.grow && fix.offset < tail {
                tail_shift += 4;
            }
        }
        self.set_tail_offset(tail + tail_shift);
        self.sync_bytes_size();
    }

    /// 插入 `value` 大约会增加的字节数，不考虑 prevlen 的连锁扩张。
    pub(crate) fn estimate_entry_size(value: ZipValue<'_>) -> usize {
        let encoding = match value.normalized() {
            ZipValue::Int(i) => Encoding::Integer(i),
            ZipValue::Bytes(s) => Encoding::String(s.len()),
        };
        let len = encoding.encoding_len_with_content();
        prevlen_size(len) + len
    }

    /// 在 `pos` 之前插入，`pos` 指向 zlend 时追加到尾部。
    pub(crate) fn insert_at<'v>(&mut self, pos: usize, value: impl Into<ZipValue<'v>>) -> ZLResult<()> {
        let value = value.into().normalized();
        let (encoding, content) = match value {
            ZipValue::Int(i) => (Encoding::Integer(i), &[][..]),
            ZipValue::Bytes(s) => {
                if s.len() > u32::MAX as usize {
                    return Err(ZLError::InvalidArgument(format!(
                        "string of {} bytes is too long for an entry",
                        s.len()
                    )));
                }
                (Encoding::String(s.len()), s)
            }
        };
        let at_end = self.is_end(pos);
        let prevlen = if at_end {
            match self.tail_pos() {
                Some(tail) => self.entry_at(tail)?.entry_size(),
                None => 0,
            }
        } else {
            self.entry_at(pos)?.prevrawlen
        };

        let mut entry = Vec::new();
        entry
            .try_reserve_exact(prevlen_size(prevlen) + encoding.encoding_len_with_content())
            .map_err(|_| ZLError::AllocationFailure(encoding.encoding_len_with_content()))?;
        encode_prevlen(&mut entry, prevlen, prevlen_size(prevlen));
        encoding.write(&mut entry, content);
        let reqlen = entry.len();

        if at_end {
            self.reserve(reqlen)?;
            let end = self.end_offset();
            self.buf.splice(end..end, entry);
            self.set_tail_offset(end);
        } else {
            // pos 处原来的 entry 现在跟在新 entry 后面，它的 prevlen 要改成 reqlen
            let fixes = self.plan_cascade(pos, reqlen)?;
            self.reserve(reqlen + Self::cascade_growth(&fixes))?;
            self.apply_fixes(&fixes);
            let tail = self.tail_offset();
            self.buf.splice(pos..pos, entry);
            self.set_tail_offset(tail + reqlen);
        }
        self.sync_bytes_size();
        self.incr_entry_cnt(1);
        Ok(())
    }

    /// 从 `pos` 开始删除最多 `num` 个 entry，返回实际删除的个数
    pub(crate) fn delete_at(&mut self, pos: usize, num: usize) -> ZLResult<usize> {
        if self.is_end(pos) || num == 0 {
            return Ok(0);
        }
        let first = self.entry_at(pos)?;
        let mut end = pos;
        let mut deleted = 0;
        while deleted < num && !self.is_end(end) {
            end += self.entry_at(end)?.entry_size();
            deleted += 1;
        }
        let totlen = end - pos;

        if self.is_end(end) {
            // 删到了尾部，不需要改写任何 prevlen
            let tail = if pos == ZIPLIST_HEADER_SIZE {
                ZIPLIST_HEADER_SIZE
            } else {
                pos - first.prevrawlen
            };
            self.buf.drain(pos..end);
            self.set_tail_offset(tail);
        } else {
            // end 处的 entry 接到 first 原来的前驱之后
            let fixes = self.plan_cascade(end, first.prevrawlen)?;
            self.reserve(Self::cascade_growth(&fixes))?;
            self.apply_fixes(&fixes);
            let tail = self.tail_offset();
            self.buf.drain(pos..end);
            self.set_tail_offset(tail - totlen);
        }
        self.sync_bytes_size();
        self.incr_entry_cnt(-(deleted as isize));
        Ok(deleted)
    }

    pub fn push_front<'v>(&mut self, value: impl Into<ZipValue<'v>>) -> ZLResult<()> {
        self.insert_at(ZIPLIST_HEADER_SIZE, value)
    }

    pub fn push_back<'v>(&mut self, value: impl Into<ZipValue<'v>>) -> ZLResult<()> {
        let end = self.end_offset();
        self.insert_at(end, value)
    }

    /// 插入到第 index 个 entry 之前；index 等于长度时追加。
    pub fn insert<'v>(&mut self, index: usize, value: impl Into<ZipValue<'v>>) -> ZLResult<()> {
        let signed = isize::try_from(index).map_err(|_| ZLError::OutOfRange(isize::MAX))?;
        if index > self.len {
            return Err(ZLError::OutOfRange(signed));
        }
        let pos = if index == 0 {
            ZIPLIST_HEADER_SIZE
        } else {
            // 先定位前一个，这样 index == len 也能找到位置
            let prev = self.index_pos(signed - 1)?.ok_or(ZLError::OutOfRange(signed))?;
            prev + self.entry_at(prev)?.entry_size()
        };
        self.insert_at(pos, value)
    }

    /// 删除第 index 个 entry，index 不存在时返回 false
    pub fn delete(&mut self, index: isize) -> ZLResult<bool> {
        match self.index_pos(index)? {
            Some(pos) => Ok(self.delete_at(pos, 1)? == 1),
            None => Ok(false),
        }
    }

    /// 从第 index 个 entry 开始向后删除最多 num 个，返回删除个数
    pub fn delete_range(&mut self, index: isize, num: usize) -> ZLResult<usize> {
        match self.index_pos(index)? {
            Some(pos) => self.delete_at(pos, num),
            None => Ok(0),
        }
    }

    pub(crate) fn replace_at<'v>(&mut self, pos: usize, value: impl Into<ZipValue<'v>>) -> ZLResult<()> {
        let value = value.into().normalized();
        let old = self.entry_at(pos)?;
        let encoding = match value {
            ZipValue::Int(i) => Encoding::Integer(i),
            ZipValue::Bytes(s) => Encoding::String(s.len()),
        };
        if encoding.encoding_len_with_content() == old.len_size + old.len {
            // 长度不变，直接覆盖 encoding 和 payload，prevlen 不动
            let mut body = Vec::with_capacity(old.len_size + old.len);
            encoding.write(&mut body, value.as_bytes().unwrap_or(&[]));
            let start = pos + old.prevrawlen_size;
            self.buf[start..start + body.len()].copy_from_slice(&body);
            return Ok(());
        }
        // 先在副本上做删除+插入，失败时原 buffer 不受影响
        let mut scratch = self.try_clone()?;
        scratch.delete_at(pos, 1)?;
        scratch.insert_at(pos, value)?;
        *self = scratch;
        Ok(())
    }

    pub fn replace<'v>(&mut self, index: isize, value: impl Into<ZipValue<'v>>) -> ZLResult<()> {
        let pos = self.index_pos(index)?.ok_or(ZLError::OutOfRange(index))?;
        self.replace_at(pos, value)
    }

    /// 从 `pos` 开始线性查找，每比较一次跳过 `skip` 个 entry。
    pub(crate) fn find_at<'v>(
        &self,
        pos: usize,
        value: impl Into<ZipValue<'v>>,
        skip: usize,
    ) -> ZLResult<Option<(usize, usize)>> {
        let needle = value.into().normalized();
        let mut offset = pos;
        let mut skipcnt = 0;
        let mut steps = 0;
        while !self.is_end(offset) {
            let entry = self.entry_at(offset)?;
            if skipcnt == 0 {
                if entry.value(&self.buf) == needle {
                    return Ok(Some((offset, steps)));
                }
                skipcnt = skip;
            } else {
                skipcnt -= 1;
            }
            offset += entry.entry_size();
            steps += 1;
        }
        Ok(None)
    }

    /// 返回匹配 entry 的下标，`start` 越界或者没找到时返回 `Ok(None)`
    pub fn find<'v>(
        &self,
        start: usize,
        value: impl Into<ZipValue<'v>>,
        skip: usize,
    ) -> ZLResult<Option<usize>> {
        let pos = match isize::try_from(start) {
            Ok(signed) => self.index_pos(signed)?,
            Err(_) => None,
        };
        let pos = match pos {
            Some(pos) => pos,
            None => return Ok(None),
        };
        // start < len，走的步数不会超过剩下的 entry 数，加起来不会溢出
        Ok(self.find_at(pos, value, skip)?.map(|(_, steps)| start + steps))
    }

    /// 字符串按字节比较，整数按数值比较
    pub fn compare<'v>(&self, index: isize, value: impl Into<ZipValue<'v>>) -> ZLResult<bool> {
        Ok(match self.get(index)? {
            Some(v) => v == value.into().normalized(),
            None => false,
        })
    }

    /// 把 `first` 和 `second` 合并成一个 ziplist（first 的 entry 在前）。
    /// 字节数大的那个作为存储，返回值指明结果留在哪一边，另一边被重置为空 ziplist。
    /// 出错时两边都保持原样。
    pub fn merge(first: &mut ZipList, second: &mut ZipList) -> ZLResult<MergeSide> {
        let first_bytes = first.blob_len();
        let second_bytes = second.blob_len();
        let first_len = first.len();
        let second_len = second.len();
        let first_tail = first.tail_offset();
        let second_tail = second.tail_offset();
        let junction = first_bytes - ZIPLIST_END_SIZE;
        let first_tail_size = match first.tail_pos() {
            Some(tail) => first.entry_at(tail)?.entry_size(),
            None => 0,
        };
        let growth = if first_len > 0 && second_len > 0 {
            Self::cascade_growth(&second.plan_cascade(ZIPLIST_HEADER_SIZE, first_tail_size)?)
        } else {
            0
        };

        let side = if first_bytes >= second_bytes {
            first.reserve(second_bytes - ZIPLIST_HEADER_SIZE + growth)?;
            first.buf.truncate(junction);
            first.buf.extend_from_slice(&second.buf[ZIPLIST_HEADER_SIZE..]);
            *second = ZipList::new();
            MergeSide::First
        } else {
            second.reserve(first_bytes - ZIPLIST_EMPTY_SIZE + growth)?;
            second.buf.splice(
                ZIPLIST_HEADER_SIZE..ZIPLIST_HEADER_SIZE,
                first.buf[ZIPLIST_HEADER_SIZE..junction].iter().copied(),
            );
            *first = ZipList::new();
            MergeSide::Second
        };
        let target = match side {
            MergeSide::First => first,
            MergeSide::Second => second,
        };

        let tail = if second_len == 0 {
            first_tail
        } else if first_len == 0 {
            second_tail
        } else {
            junction + (second_tail - ZIPLIST_HEADER_SIZE)
        };
        target.set_tail_offset(tail);
        target.set_entry_cnt(first_len + second_len);
        target.sync_bytes_size();
        if first_len > 0 && second_len > 0 {
            // 空间已经预留过了，这里不会再分配失败
            let fixes = target.plan_cascade(junction, first_tail_size)?;
            target.apply_fixes(&fixes);
        }
        Ok(side)
    }

    /// 把 `[at, len)` 拆成一个新的 ziplist，自己保留 `[0, at)`。
    /// `at` 不小于长度时自己保持不变，返回空 ziplist。
    pub fn split_off(&mut self, at: usize) -> ZLResult<ZipList> {
        if at >= self.len {
            return Ok(ZipList::new());
        }
        let signed = isize::try_from(at).map_err(|_| ZLError::OutOfRange(isize::MAX))?;
        let mut right = self.try_clone()?;
        right.delete_range(0, at)?;
        // 删到尾部不会触发 prevlen 改写
        self.delete_range(signed, usize::MAX)?;
        Ok(right)
    }

    /// 完整性校验：头部字段、每个 entry 的边界、prevlen 链、zlend。
    pub fn validate(&self) -> ZLResult<()> {
        let cnt = self.walk()?;
        if cnt != self.len {
            return Err(ZLError::LengthMismatch {
                expected: self.len,
                actual: cnt,
            });
        }
        Ok(())
    }

    /// 从头走到尾校验每个 entry，返回 entry 个数
    fn walk(&self) -> ZLResult<usize> {
        if self.buf.len() < ZIPLIST_EMPTY_SIZE {
            return Err(ZLError::Corruption(format!("buffer of {} bytes is too short", self.buf.len())));
        }
        if self.bytes_size() != self.buf.len() {
            return Err(ZLError::Corruption(format!(
                "zlbytes says {} but buffer holds {}",
                self.bytes_size(),
                self.buf.len()
            )));
        }
        if self.buf[self.buf.len() - 1] != ZIP_END {
            return Err(ZLError::Corruption("missing end marker".into()));
        }
        let mut offset = ZIPLIST_HEADER_SIZE;
        let mut prev_size = 0;
        let mut last = ZIPLIST_HEADER_SIZE;
        let mut cnt = 0;
        while !self.is_end(offset) {
            let entry = self.entry_at(offset).map_err(|e| {
                warn!(offset, error = %e, "corrupted ziplist entry");
                e
            })?;
            if entry.prevrawlen != prev_size {
                return Err(ZLError::Corruption(format!(
                    "entry at offset {} has prevlen {}, previous entry is {} bytes",
                    offset, entry.prevrawlen, prev_size
                )));
            }
            prev_size = entry.entry_size();
            last = offset;
            offset += prev_size;
            cnt += 1;
        }
        if self.tail_offset() != last {
            return Err(ZLError::Corruption(format!(
                "zltail says {} but last entry is at {}",
                self.tail_offset(),
                last
            )));
        }
        let stored = self.read_entry_cnt();
        if stored < ZIPLIST_LEN_UNKNOWN && stored != cnt {
            return Err(ZLError::Corruption(format!(
                "zllen says {} but found {} entries",
                stored, cnt
            )));
        }
        Ok(cnt)
    }

    pub fn iter(&self) -> ZipListIter<'_> {
        ZipListIter {
            ziplist: self,
            front: ZIPLIST_HEADER_SIZE,
            back: self.tail_offset(),
            remaining: self.len(),
        }
    }
}

impl fmt::Debug for ZipList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipList")
            .field("bytes", &self.blob_len())
            .field("tail", &self.tail_offset())
            .field("len", &self.len())
            .field("entries", &self.iter().collect::<ZLResult<Vec<_>>>())
            .finish()
    }
}

impl<'a> IntoIterator for &'a ZipList {
    type Item = ZLResult<ZipValue<'a>>;
    type IntoIter = ZipListIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// 双向迭代，front 从头往后，back 借助 prevlen 从尾往前。
/// 遇到损坏的 entry 时返回一次错误，之后迭代结束。
pub struct ZipListIter<'a> {
    ziplist: &'a ZipList,
    front: usize,
    back: usize,
    remaining: usize,
}

impl<'a> Iterator for ZipListIter<'a> {
    type Item = ZLResult<ZipValue<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let entry = match self.ziplist.entry_at(self.front) {
            Ok(entry) => entry,
            Err(e) => {
                self.remaining = 0;
                return Some(Err(e));
            }
        };
        self.front += entry.entry_size();
        self.remaining -= 1;
        Some(Ok(entry.value(&self.ziplist.buf)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a> DoubleEndedIterator for ZipListIter<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let entry = match self.ziplist.entry_at(self.back) {
            Ok(entry) => entry,
            Err(e) => {
                self.remaining = 0;
                return Some(Err(e));
            }
        };
        self.back = self.back.saturating_sub(entry.prevrawlen);
        self.remaining -= 1;
        Some(Ok(entry.value(&self.ziplist.buf)))
    }
}
