//! Quicklist 节点以及存放节点的 arena。
//!
//! 节点之间用 `SegmentId` 互相引用，而不是指针。`SegmentId` 就是节点在 slab 里的 key。

use std::borrow::Cow;
use std::ops::{Index, IndexMut};

use slab::Slab;
use tracing::debug;

use crate::ds::compress;
use crate::ds::error::{ZLError, ZLResult};
use crate::ds::ziplist::ZipList;

/// 单个节点最多保存的 entry 个数
pub const SEGMENT_COUNT_MAX: usize = u16::MAX as usize;

/// Handle of a segment inside a quicklist, wraps the slab key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SegmentId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentEncoding {
    Raw,
    Compressed,
}

#[derive(Clone)]
enum Payload {
    Raw(ZipList),
    /// LZ4 block，解压后的长度记录在 `Segment::sz`
    Compressed(Vec<u8>),
}

#[derive(Clone)]
pub(crate) struct Segment {
    pub(crate) prev: Option<SegmentId>,
    pub(crate) next: Option<SegmentId>,
    payload: Payload,
    /// 明文 ziplist 的字节数，压缩后仍然有效
    sz: usize,
    count: usize,
    /// 为了读写临时解压过，用完后应当重新压缩
    pub(crate) recompress: bool,
    /// 尝试过压缩但没压下来，内容改变后清除
    attempted_compress: bool,
}

impl Segment {
    pub(crate) fn new(zl: ZipList) -> Self {
        Self {
            prev: None,
            next: None,
            sz: zl.blob_len(),
            count: zl.len(),
            payload: Payload::Raw(zl),
            recompress: false,
            attempted_compress: false,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn size(&self) -> usize {
        self.sz
    }

    pub(crate) fn encoding(&self) -> SegmentEncoding {
        match self.payload {
            Payload::Raw(_) => SegmentEncoding::Raw,
            Payload::Compressed(_) => SegmentEncoding::Compressed,
        }
    }

    pub(crate) fn is_compressed(&self) -> bool {
        matches!(self.payload, Payload::Compressed(_))
    }

    pub(crate) fn attempted_compress(&self) -> bool {
        self.attempted_compress
    }

    /// 只读访问，压缩节点会临时解压一份，不改变节点本身
    pub(crate) fn load(&self) -> ZLResult<Cow<'_, ZipList>> {
        match &self.payload {
            Payload::Raw(zl) => Ok(Cow::Borrowed(zl)),
            Payload::Compressed(blob) => {
                let bytes = compress::decompress(blob, self.sz)?;
                Ok(Cow::Owned(ZipList::from_bytes(bytes)?))
            }
        }
    }

    /// 压缩成功返回 true。太小或者压不动时保持明文。
    pub(crate) fn compress(&mut self) -> bool {
        let zl = match &self.payload {
            Payload::Raw(zl) => zl,
            Payload::Compressed(_) => return true,
        };
        self.attempted_compress = true;
        match compress::compress(zl.as_bytes()) {
            Some(blob) => {
                debug!(raw = self.sz, compressed = blob.len(), "segment compressed");
                self.payload = Payload::Compressed(blob);
                self.recompress = false;
                true
            }
            None => false,
        }
    }

    /// 解压成明文，原来就是明文时返回 false
    pub(crate) fn decompress(&mut self) -> ZLResult<bool> {
        let blob = match &self.payload {
            Payload::Raw(_) => return Ok(false),
            Payload::Compressed(blob) => blob,
        };
        let zl = ZipList::from_bytes(compress::decompress(blob, self.sz)?)?;
        if zl.len() != self.count {
            return Err(ZLError::LengthMismatch {
                expected: self.count,
                actual: zl.len(),
            });
        }
        self.payload = Payload::Raw(zl);
        self.attempted_compress = false;
        Ok(true)
    }

    fn raw_mut(&mut self) -> ZLResult<&mut ZipList> {
        match &mut self.payload {
            Payload::Raw(zl) => Ok(zl),
            Payload::Compressed(_) => Err(ZLError::InvalidArgument(
                "segment must be decompressed before it is modified".into(),
            )),
        }
    }

    /// 修改明文 ziplist，之后同步节点的 count 和 sz
    pub(crate) fn edit<R>(&mut self, f: impl FnOnce(&mut ZipList) -> ZLResult<R>) -> ZLResult<R> {
        let zl = self.raw_mut()?;
        let result = f(zl);
        self.attempted_compress = false;
        self.sync();
        let result = result?;
        if self.count > SEGMENT_COUNT_MAX {
            return Err(ZLError::CapacityExceeded(self.count));
        }
        Ok(result)
    }

    /// 取出 ziplist，节点留下一个空 ziplist
    pub(crate) fn take_ziplist(&mut self) -> ZLResult<ZipList> {
        let zl = std::mem::take(self.raw_mut()?);
        self.sync();
        Ok(zl)
    }

    pub(crate) fn set_ziplist(&mut self, zl: ZipList) {
        self.payload = Payload::Raw(zl);
        self.attempted_compress = false;
        self.sync();
    }

    fn sync(&mut self) {
        if let Payload::Raw(zl) = &self.payload {
            self.sz = zl.blob_len();
            self.count = zl.len();
        }
    }
}

#[cfg(test)]
impl Segment {
    /// 直接用 `raw` 的压缩结果构造节点，不检查内容，用来模拟损坏的数据
    pub(crate) fn compressed_unchecked(raw: &[u8], count: usize) -> Option<Segment> {
        let blob = compress::compress(raw)?;
        Some(Segment {
            prev: None,
            next: None,
            payload: Payload::Compressed(blob),
            sz: raw.len(),
            count,
            recompress: false,
            attempted_compress: false,
        })
    }
}

/// 节点存储，底层是 `slab::Slab`，删除后的槽位会被新节点复用。
#[derive(Clone, Default)]
pub(crate) struct SegmentArena(Slab<Segment>);

impl SegmentArena {
    pub(crate) fn insert(&mut self, segment: Segment) -> SegmentId {
        SegmentId(self.0.insert(segment))
    }

    pub(crate) fn remove(&mut self, id: SegmentId) -> Option<Segment> {
        self.0.try_remove(id.0)
    }

    pub(crate) fn get(&self, id: SegmentId) -> Option<&Segment> {
        self.0.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
        self.0.get_mut(id.0)
    }

    pub(crate) fn contains(&self, id: SegmentId) -> bool {
        self.0.contains(id.0)
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }
}

impl Index<SegmentId> for SegmentArena {
    type Output = Segment;

    fn index(&self, id: SegmentId) -> &Segment {
        match self.get(id) {
            Some(segment) => segment,
            None => panic!("dangling segment handle {:?}", id),
        }
    }
}

impl IndexMut<SegmentId> for SegmentArena {
    fn index_mut(&mut self, id: SegmentId) -> &mut Segment {
        match self.get_mut(id) {
            Some(segment) => segment,
            None => panic!("dangling segment handle {:?}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Segment, SegmentArena, SegmentEncoding};
    use crate::ds::ziplist::ZipList;

    fn filled(n: i64) -> ZipList {
        let mut zl = ZipList::new();
        for i in 0..n {
            zl.push_back(format!("value-{}", i % 4).as_str()).unwrap();
        }
        zl
    }

    #[test]
    fn compress_then_decompress_keeps_content() {
        let zl = filled(50);
        let plain = zl.as_bytes().to_vec();
        let mut seg = Segment::new(zl);
        assert_eq!(seg.count(), 50);
        assert!(seg.compress());
        assert_eq!(seg.encoding(), SegmentEncoding::Compressed);
        assert_eq!(seg.size(), plain.len());
        assert_eq!(seg.load().unwrap().as_bytes(), &plain[..]);
        assert!(seg.decompress().unwrap());
        assert!(!seg.decompress().unwrap());
        assert_eq!(seg.encoding(), SegmentEncoding::Raw);
    }

    #[test]
    fn tiny_segment_stays_raw() {
        let mut seg = Segment::new(filled(1));
        assert!(!seg.compress());
        assert!(seg.attempted_compress());
        assert_eq!(seg.encoding(), SegmentEncoding::Raw);
    }

    #[test]
    fn edit_requires_raw_and_syncs() {
        let mut seg = Segment::new(filled(50));
        assert!(seg.compress());
        assert!(seg.edit(|zl| zl.push_back(1i64)).is_err());
        seg.decompress().unwrap();
        seg.edit(|zl| zl.push_back(1i64)).unwrap();
        assert_eq!(seg.count(), 51);
        assert_eq!(seg.size(), seg.load().unwrap().blob_len());
    }

    #[test]
    fn arena_reuses_slots() {
        let mut arena = SegmentArena::default();
        let a = arena.insert(Segment::new(ZipList::new()));
        let b = arena.insert(Segment::new(ZipList::new()));
        assert!(arena.remove(a).is_some());
        assert!(arena.remove(a).is_none());
        assert!(!arena.contains(a));
        let c = arena.insert(Segment::new(ZipList::new()));
        assert_eq!(a, c);
        assert!(arena.contains(b));
        arena.clear();
        assert!(!arena.contains(b));
        assert!(arena.get_mut(b).is_none());
    }
}
