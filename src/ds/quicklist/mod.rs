//! A quicklist is a doubly linked list of ziplists.
//!
//! # 为什么需要 quicklist？
//! 单个 ziplist 插入、删除都要搬移整块内存，元素一多代价就很高；普通双向链表每个元素一个节点，
//! 指针和内存碎片又太浪费。quicklist 折中：链表的每个节点是一个不太大的 ziplist。
//!
//! 节点大小由 `fill` 控制，见 [`QuicklistOptions`]。`compress_depth` 大于 0 时，
//! 链表两端各 `compress_depth` 个节点保持明文，中间的节点用 LZ4 压缩。
//! 压缩对调用方完全透明：读写压缩节点时会临时解压，用完后再压回去。

mod hot;
mod iter;
mod node;
mod options;

use tracing::{debug, trace};

use self::hot::HotSegments;
use self::node::{Segment, SegmentArena, SEGMENT_COUNT_MAX};
use crate::ds::error::{ZLError, ZLResult};
use crate::ds::value::{ZipEntryValue, ZipValue};
use crate::ds::ziplist::{MergeSide, ZipList, ZIPLIST_EMPTY_SIZE};

pub use self::iter::{Direction, Iter};
pub use self::node::SegmentEncoding;
use self::node::SegmentId;
pub use self::options::{QuicklistOptions, COMPRESS_MAX, FILL_MAX, SIZE_SAFETY_LIMIT};

/// Snapshot of one segment, as reported by [`Quicklist::segments`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    pub count: usize,
    /// 明文 ziplist 的字节数
    pub size: usize,
    pub encoding: SegmentEncoding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum End {
    Head,
    Tail,
}

/// 某个下标落在哪个节点的第几个 entry
#[derive(Clone, Copy, Debug)]
struct Locator {
    id: SegmentId,
    offset: usize,
}

#[derive(Clone)]
pub struct Quicklist {
    segments: SegmentArena,
    head: Option<SegmentId>,
    tail: Option<SegmentId>,
    /// 所有节点的 entry 总数
    count: usize,
    /// 节点个数
    len: usize,
    options: QuicklistOptions,
    hot: HotSegments,
}

impl Default for Quicklist {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Quicklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Quicklist")
            .field("count", &self.count)
            .field("segments", &self.segments().collect::<Vec<_>>())
            .field("options", &self.options)
            .field("hot", &self.hot.len())
            .finish()
    }
}

impl Quicklist {
    pub fn new() -> Self {
        let options = QuicklistOptions::default();
        Self {
            segments: SegmentArena::default(),
            head: None,
            tail: None,
            count: 0,
            len: 0,
            hot: HotSegments::new(options.hot_capacity),
            options,
        }
    }

    pub fn with_options(options: QuicklistOptions) -> ZLResult<Self> {
        options.validate()?;
        let mut ql = Self::new();
        ql.hot = HotSegments::new(options.hot_capacity);
        ql.options = options;
        Ok(ql)
    }

    /// 用 `zl` 中的元素构造一个新的 quicklist，元素按 fill 重新分段。
    pub fn from_ziplist(options: QuicklistOptions, zl: &ZipList) -> ZLResult<Self> {
        let mut ql = Self::with_options(options)?;
        ql.append_values_from(zl)?;
        Ok(ql)
    }

    pub fn options(&self) -> QuicklistOptions {
        self.options
    }

    /// 修改配置并对已有节点重新应用：超限的节点被拆分，压缩状态按新的深度重新计算。
    pub fn set_options(&mut self, options: QuicklistOptions) -> ZLResult<()> {
        options.validate()?;
        let old = self.options;
        self.options = options;
        for id in self.hot.set_capacity(options.hot_capacity) {
            self.release_hot(id);
        }
        if old.fill != options.fill {
            let ids: Vec<SegmentId> = self.segment_ids().collect();
            for id in ids {
                self.enforce_cap(id)?;
            }
        }
        debug!(fill = options.fill, depth = options.compress_depth, "quicklist options changed");
        self.recompress_all()
    }

    pub fn set_fill(&mut self, fill: i32) -> ZLResult<()> {
        self.set_options(self.options.fill(fill))
    }

    pub fn set_compress_depth(&mut self, depth: usize) -> ZLResult<()> {
        self.set_options(self.options.compress_depth(depth))
    }

    /// 元素总数
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// 节点个数
    pub fn segment_count(&self) -> usize {
        self.len
    }

    /// 从头到尾每个节点的概况
    pub fn segments(&self) -> impl Iterator<Item = SegmentInfo> + '_ {
        self.segment_ids().map(move |id| {
            let seg = &self.segments[id];
            SegmentInfo {
                count: seg.count(),
                size: seg.size(),
                encoding: seg.encoding(),
            }
        })
    }

    fn segment_ids(&self) -> impl Iterator<Item = SegmentId> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let id = cur?;
            cur = self.segments[id].next;
            Some(id)
        })
    }

    fn segments_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
        self.segments.get_mut(id)
    }

    // ---------------------------------------------------------------------
    // 链表结构

    fn link_back(&mut self, id: SegmentId) {
        self.segments[id].prev = self.tail;
        self.segments[id].next = None;
        match self.tail {
            Some(tail) => self.segments[tail].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    fn link_front(&mut self, id: SegmentId) {
        self.segments[id].prev = None;
        self.segments[id].next = self.head;
        match self.head {
            Some(head) => self.segments[head].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    fn link_after(&mut self, after: SegmentId, id: SegmentId) {
        let next = self.segments[after].next;
        self.segments[id].prev = Some(after);
        self.segments[id].next = next;
        self.segments[after].next = Some(id);
        match next {
            Some(next) => self.segments[next].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;
    }

    fn link_before(&mut self, before: SegmentId, id: SegmentId) {
        let prev = self.segments[before].prev;
        self.segments[id].next = Some(before);
        self.segments[id].prev = prev;
        self.segments[before].prev = Some(id);
        match prev {
            Some(prev) => self.segments[prev].next = Some(id),
            None => self.head = Some(id),
        }
        self.len += 1;
    }

    fn unlink(&mut self, id: SegmentId) {
        let (prev, next) = {
            let seg = &self.segments[id];
            (seg.prev, seg.next)
        };
        match prev {
            Some(prev) => self.segments[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.segments[next].prev = prev,
            None => self.tail = prev,
        }
        self.segments[id].prev = None;
        self.segments[id].next = None;
        self.len -= 1;
    }

    /// 新建一个节点挂到 `anchor` 前面或后面，`anchor` 为 None 时链表必须为空。
    fn insert_node(&mut self, anchor: Option<SegmentId>, zl: ZipList, after: bool) -> SegmentId {
        debug!(count = zl.len(), bytes = zl.blob_len(), "segment created");
        let id = self.segments.insert(Segment::new(zl));
        match anchor {
            Some(anchor) if after => self.link_after(anchor, id),
            Some(anchor) => self.link_before(anchor, id),
            None if after => self.link_back(id),
            None => self.link_front(id),
        }
        if self.options.compression_enabled() {
            self.mark_hot(id);
        }
        id
    }

    /// 摘掉并释放节点，节点中的元素从总数中扣除
    fn remove_node(&mut self, id: SegmentId) {
        self.unlink(id);
        self.hot.evict(id);
        if let Some(seg) = self.segments.remove(id) {
            self.count -= seg.count();
            debug!(count = seg.count(), "segment removed");
        }
    }

    // ---------------------------------------------------------------------
    // fill 限制

    fn allow_insert(&self, id: Option<SegmentId>, value: ZipValue<'_>) -> bool {
        let id = match id {
            Some(id) => id,
            None => return false,
        };
        let seg = &self.segments[id];
        if seg.count() >= SEGMENT_COUNT_MAX {
            return false;
        }
        let new_sz = seg.size() + ZipList::estimate_entry_size(value);
        self.options.allows(seg.count() + 1, new_sz)
    }

    fn allow_merge(&self, a: SegmentId, b: SegmentId) -> bool {
        let (a, b) = (&self.segments[a], &self.segments[b]);
        let count = a.count() + b.count();
        // 合并后只保留一份头部和 zlend
        let merge_sz = a.size() + b.size() - ZIPLIST_EMPTY_SIZE;
        count <= SEGMENT_COUNT_MAX && self.options.allows(count, merge_sz)
    }

    /// 节点超出 fill 限制时对半拆分，直到每一段都满足。只有一个元素的节点不受限制。
    fn enforce_cap(&mut self, id: SegmentId) -> ZLResult<()> {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let seg = &self.segments[id];
            if seg.count() <= 1 || self.options.allows(seg.count(), seg.size()) {
                continue;
            }
            let at = seg.count() / 2;
            let right = self.split_node(id, at)?;
            work.push(id);
            work.push(right);
        }
        Ok(())
    }

    /// 把节点从第 `at` 个 entry 处一分为二，`[at..]` 放进紧随其后的新节点。
    fn split_node(&mut self, id: SegmentId, at: usize) -> ZLResult<SegmentId> {
        let right = self.edit(id, |zl| zl.split_off(at))?;
        debug!(left = at, right = right.len(), "segment split");
        Ok(self.insert_node(Some(id), right, true))
    }

    /// 合并相邻的 `a`、`b`（a 在前），结果留在 `a`，返回 `a`。
    fn merge_pair(&mut self, a: SegmentId, b: SegmentId) -> ZLResult<SegmentId> {
        self.decompress_for_use(a)?;
        self.decompress_for_use(b)?;
        let mut second = self.segments[b].take_ziplist()?;
        let mut first = self.segments[a].take_ziplist()?;
        match ZipList::merge(&mut first, &mut second) {
            Ok(side) => {
                let merged = match side {
                    MergeSide::First => first,
                    MergeSide::Second => second,
                };
                debug!(count = merged.len(), bytes = merged.blob_len(), ?side, "segments merged");
                self.segments[a].set_ziplist(merged);
                self.remove_node(b);
                if self.options.compression_enabled() {
                    self.mark_hot(a);
                }
                // prevlen 扩张可能让结果略超限制
                self.enforce_cap(a)?;
                Ok(a)
            }
            Err(e) => {
                self.segments[a].set_ziplist(first);
                self.segments[b].set_ziplist(second);
                Err(e)
            }
        }
    }

    /// `id` 与后继合并，放得下才合并
    fn try_merge_next(&mut self, id: SegmentId) -> ZLResult<SegmentId> {
        match self.segments[id].next {
            Some(next) if self.allow_merge(id, next) => self.merge_pair(id, next),
            _ => Ok(id),
        }
    }

    /// 先尝试与前驱合并，再尝试与后继合并，返回包含原节点内容的节点
    fn merge_with_neighbor(&mut self, id: SegmentId) -> ZLResult<SegmentId> {
        let target = match self.segments[id].prev {
            Some(prev) if self.allow_merge(prev, id) => self.merge_pair(prev, id)?,
            _ => id,
        };
        self.try_merge_next(target)
    }

    /// 插入导致拆分后，尝试把 center 周围的小节点合并起来：
    /// (prev.prev, prev)、(next, next.next)、(prev, center)、(center, next)
    fn merge_nodes(&mut self, center: SegmentId) -> ZLResult<SegmentId> {
        let prev = self.segments[center].prev;
        let next = self.segments[center].next;
        if let Some(prev) = prev {
            if let Some(prev_prev) = self.segments[prev].prev {
                if self.allow_merge(prev_prev, prev) {
                    self.merge_pair(prev_prev, prev)?;
                }
            }
        }
        if let Some(next) = next {
            if let Some(next_next) = self.segments[next].next {
                if self.allow_merge(next, next_next) {
                    self.merge_pair(next, next_next)?;
                }
            }
        }
        self.merge_with_neighbor(center)
    }

    // ---------------------------------------------------------------------
    // 压缩

    /// 节点要被修改前调用：压缩节点先解压，并记下用完后需要重新压缩
    fn decompress_for_use(&mut self, id: SegmentId) -> ZLResult<()> {
        let seg = &mut self.segments[id];
        if seg.decompress()? {
            seg.recompress = true;
            trace!(?id, "segment decompressed for use");
        }
        Ok(())
    }

    fn edit<R>(&mut self, id: SegmentId, f: impl FnOnce(&mut ZipList) -> ZLResult<R>) -> ZLResult<R> {
        self.decompress_for_use(id)?;
        self.segments[id].edit(f)
    }

    /// 窗口内的节点：保持明文，并且不在热缓存中
    fn keep_raw(&mut self, id: SegmentId) -> ZLResult<()> {
        self.hot.evict(id);
        let seg = &mut self.segments[id];
        seg.decompress()?;
        seg.recompress = false;
        Ok(())
    }

    fn compress_segment(&mut self, id: SegmentId) {
        let seg = &mut self.segments[id];
        seg.recompress = false;
        // 上次没压下来且之后没改过，不用再试
        if seg.is_compressed() || seg.attempted_compress() {
            return;
        }
        if !seg.compress() {
            trace!(?id, bytes = seg.size(), "segment left uncompressed");
        }
    }

    /// 窗口外用过的节点放进热缓存，明文节点记下需要重新压缩
    fn mark_hot(&mut self, id: SegmentId) {
        if !self.segments[id].is_compressed() {
            self.segments[id].recompress = true;
        }
        if let Some(evicted) = self.hot.touch(id) {
            self.release_hot(evicted);
        }
    }

    /// 节点离开热缓存：标记过 recompress 且仍在窗口外才压缩
    fn release_hot(&mut self, id: SegmentId) {
        let flagged = match self.segments.get(id) {
            Some(seg) => seg.recompress,
            None => return,
        };
        if !flagged {
            return;
        }
        if self.in_window(id) {
            self.segments[id].recompress = false;
        } else {
            self.compress_segment(id);
        }
    }

    fn in_window(&self, id: SegmentId) -> bool {
        let mut forward = self.head;
        let mut backward = self.tail;
        for _ in 0..self.options.compress_depth {
            if forward == Some(id) || backward == Some(id) {
                return true;
            }
            forward = forward.and_then(|f| self.segments[f].next);
            backward = backward.and_then(|b| self.segments[b].prev);
        }
        false
    }

    /// 每次修改之后调用。两端各 depth 个节点解压，窗口之外紧挨着的两个节点压缩；
    /// `touched` 是本次用到的节点，落在窗口外时进入热缓存。
    fn compress_around(&mut self, touched: Option<SegmentId>) -> ZLResult<()> {
        let depth = self.options.compress_depth;
        if depth == 0 {
            return Ok(());
        }
        let (mut forward, mut backward) = match (self.head, self.tail) {
            (Some(head), Some(tail)) => (head, tail),
            _ => return Ok(()),
        };
        let mut in_window = false;
        for _ in 0..depth {
            self.keep_raw(forward)?;
            self.keep_raw(backward)?;
            if Some(forward) == touched || Some(backward) == touched {
                in_window = true;
            }
            let next = self.segments[forward].next;
            if forward == backward || next == Some(backward) {
                // 所有节点都在窗口内
                return Ok(());
            }
            forward = match next {
                Some(next) => next,
                None => return Ok(()),
            };
            backward = match self.segments[backward].prev {
                Some(prev) => prev,
                None => return Ok(()),
            };
        }
        if let Some(touched) = touched {
            if !in_window && self.segments.contains(touched) {
                self.mark_hot(touched);
            }
        }
        if !self.hot.contains(forward) {
            self.compress_segment(forward);
        }
        if !self.hot.contains(backward) {
            self.compress_segment(backward);
        }
        Ok(())
    }

    /// 按当前配置重新计算所有节点的压缩状态
    fn recompress_all(&mut self) -> ZLResult<()> {
        let depth = self.options.compress_depth;
        for id in self.hot.drain() {
            if let Some(seg) = self.segments_mut(id) {
                seg.recompress = false;
            }
        }
        let ids: Vec<SegmentId> = self.segment_ids().collect();
        let len = ids.len();
        for (i, id) in ids.into_iter().enumerate() {
            if depth == 0 || i < depth || i + depth >= len {
                self.keep_raw(id)?;
            } else {
                self.compress_segment(id);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // 定位

    /// 负数下标从尾部往前数，-1 是最后一个元素。从离目标近的一端开始走。
    fn locate(&self, index: isize) -> Option<Locator> {
        let forward = index >= 0;
        let target = if forward { index as usize } else { (-(index + 1)) as usize };
        if target >= self.count {
            return None;
        }
        let mut accum = 0;
        let mut cur = if forward { self.head } else { self.tail };
        while let Some(id) = cur {
            let seg = &self.segments[id];
            if accum + seg.count() > target {
                let offset = if forward {
                    target - accum
                } else {
                    seg.count() - 1 - (target - accum)
                };
                return Some(Locator { id, offset });
            }
            accum += seg.count();
            cur = if forward { seg.next } else { seg.prev };
        }
        None
    }

    /// 下标转成从头开始的绝对位置
    fn absolute_index(&self, index: isize) -> Option<usize> {
        if index >= 0 {
            let i = index as usize;
            if i < self.count {
                Some(i)
            } else {
                None
            }
        } else {
            self.count.checked_sub((-(index + 1)) as usize + 1)
        }
    }

    // ---------------------------------------------------------------------
    // 读

    pub fn get(&self, index: isize) -> ZLResult<Option<ZipEntryValue>> {
        let loc = match self.locate(index) {
            Some(loc) => loc,
            None => return Ok(None),
        };
        let zl = self.segments[loc.id].load()?;
        Ok(zl.get(loc.offset as isize)?.map(|v| v.to_entry_value()))
    }

    pub fn first(&self) -> ZLResult<Option<ZipEntryValue>> {
        self.get(0)
    }

    pub fn last(&self) -> ZLResult<Option<ZipEntryValue>> {
        self.get(-1)
    }

    /// 下标处的元素是否等于 `value`，下标不存在时为 false
    pub fn compare_at<'v>(&self, index: isize, value: impl Into<ZipValue<'v>>) -> ZLResult<bool> {
        let loc = match self.locate(index) {
            Some(loc) => loc,
            None => return Ok(false),
        };
        let zl = self.segments[loc.id].load()?;
        zl.compare(loc.offset as isize, value)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self, Direction::Forward)
    }

    pub fn iter_rev(&self) -> Iter<'_> {
        Iter::new(self, Direction::Backward)
    }

    /// 从下标 `index` 开始按 `direction` 遍历，下标不存在时得到空迭代器
    pub fn iter_from(&self, index: isize, direction: Direction) -> ZLResult<Iter<'_>> {
        let (loc, abs) = match (self.locate(index), self.absolute_index(index)) {
            (Some(loc), Some(abs)) => (loc, abs),
            _ => return Ok(Iter::empty(self, direction)),
        };
        let remaining = match direction {
            Direction::Forward => self.count - abs,
            Direction::Backward => abs + 1,
        };
        Iter::starting_at(self, direction, loc.id, loc.offset, remaining)
    }

    // ---------------------------------------------------------------------
    // 写

    pub fn push_front<'v>(&mut self, value: impl Into<ZipValue<'v>>) -> ZLResult<()> {
        self.push(End::Head, value.into())
    }

    pub fn push_back<'v>(&mut self, value: impl Into<ZipValue<'v>>) -> ZLResult<()> {
        self.push(End::Tail, value.into())
    }

    fn push(&mut self, end: End, value: ZipValue<'_>) -> ZLResult<()> {
        let anchor = match end {
            End::Head => self.head,
            End::Tail => self.tail,
        };
        let target = match anchor {
            Some(id) if self.allow_insert(Some(id), value) => {
                self.edit(id, |zl| match end {
                    End::Head => zl.push_front(value),
                    End::Tail => zl.push_back(value),
                })?;
                id
            }
            _ => {
                let mut zl = ZipList::new();
                zl.push_back(value)?;
                self.insert_node(anchor, zl, end == End::Tail)
            }
        };
        self.count += 1;
        self.enforce_cap(target)?;
        self.compress_around(Some(target))
    }

    pub fn insert_before<'v>(&mut self, index: isize, value: impl Into<ZipValue<'v>>) -> ZLResult<()> {
        self.insert(index, value.into(), false)
    }

    pub fn insert_after<'v>(&mut self, index: isize, value: impl Into<ZipValue<'v>>) -> ZLResult<()> {
        self.insert(index, value.into(), true)
    }

    /// 在下标处元素的前面或后面插入。优先放进所在节点；节点已满时，如果插入点正好在节点边界，
    /// 尝试放进相邻节点，都放不下就新建节点；插入点在节点中间时拆分节点。
    fn insert(&mut self, index: isize, value: ZipValue<'_>, after: bool) -> ZLResult<()> {
        let loc = self.locate(index).ok_or(ZLError::OutOfRange(index))?;
        let node = loc.id;
        let (count, prev, next) = {
            let seg = &self.segments[node];
            (seg.count(), seg.prev, seg.next)
        };
        let full = !self.allow_insert(Some(node), value);
        let at_tail = after && loc.offset + 1 == count;
        let at_head = !after && loc.offset == 0;

        let target = if !full {
            let at = if after { loc.offset + 1 } else { loc.offset };
            self.edit(node, |zl| zl.insert(at, value))?;
            node
        } else if let Some(next) = next.filter(|&n| at_tail && self.allow_insert(Some(n), value)) {
            self.edit(next, |zl| zl.push_front(value))?;
            next
        } else if let Some(prev) = prev.filter(|&p| at_head && self.allow_insert(Some(p), value)) {
            self.edit(prev, |zl| zl.push_back(value))?;
            prev
        } else if at_tail || at_head {
            // 两边都满了，在边界上新建节点
            let mut zl = ZipList::new();
            zl.push_back(value)?;
            self.insert_node(Some(node), zl, after)
        } else {
            trace!(offset = loc.offset, after, "splitting full segment for insert");
            let at = if after { loc.offset + 1 } else { loc.offset };
            let right = self.split_node(node, at)?;
            let target = if after {
                self.edit(right, |zl| zl.push_front(value))?;
                right
            } else {
                self.edit(node, |zl| zl.push_back(value))?;
                node
            };
            self.count += 1;
            let target = self.merge_nodes(target)?;
            self.enforce_cap(target)?;
            return self.compress_around(Some(target));
        };
        self.count += 1;
        self.enforce_cap(target)?;
        self.compress_around(Some(target))
    }

    /// 替换下标处的元素
    pub fn replace<'v>(&mut self, index: isize, value: impl Into<ZipValue<'v>>) -> ZLResult<()> {
        let loc = self.locate(index).ok_or(ZLError::OutOfRange(index))?;
        let value = value.into();
        self.edit(loc.id, |zl| zl.replace(loc.offset as isize, value))?;
        self.enforce_cap(loc.id)?;
        self.compress_around(Some(loc.id))
    }

    pub fn pop_front(&mut self) -> ZLResult<Option<ZipEntryValue>> {
        self.pop(End::Head)
    }

    pub fn pop_back(&mut self) -> ZLResult<Option<ZipEntryValue>> {
        self.pop(End::Tail)
    }

    fn pop(&mut self, end: End) -> ZLResult<Option<ZipEntryValue>> {
        let (id, offset) = match end {
            End::Head => (self.head, 0),
            End::Tail => (self.tail, -1),
        };
        let id = match id {
            Some(id) => id,
            None => return Ok(None),
        };
        let value = self.edit(id, |zl| {
            let value = zl.get(offset)?.map(|v| v.to_entry_value());
            zl.delete(offset)?;
            Ok(value)
        })?;
        self.count -= 1;
        self.after_removal(id)?;
        Ok(value)
    }

    /// 删除下标处的元素并返回它
    pub fn remove(&mut self, index: isize) -> ZLResult<Option<ZipEntryValue>> {
        let loc = match self.locate(index) {
            Some(loc) => loc,
            None => return Ok(None),
        };
        let offset = loc.offset as isize;
        let value = self.edit(loc.id, |zl| {
            let value = zl.get(offset)?.map(|v| v.to_entry_value());
            zl.delete(offset)?;
            Ok(value)
        })?;
        self.count -= 1;
        self.after_removal(loc.id)?;
        Ok(value)
    }

    /// 节点删空了就释放，否则看能不能和邻居合并
    fn after_removal(&mut self, id: SegmentId) -> ZLResult<()> {
        if self.segments[id].count() == 0 {
            self.remove_node(id);
            self.compress_around(None)
        } else {
            let survivor = self.merge_with_neighbor(id)?;
            self.compress_around(Some(survivor))
        }
    }

    /// 从 `start` 开始删除最多 `count` 个元素，返回实际删除的个数。
    /// 整个被覆盖的节点直接释放，两端的节点就地裁剪，最后尝试合并缺口两侧的节点。
    pub fn delete_range(&mut self, start: isize, count: usize) -> ZLResult<usize> {
        if count == 0 {
            return Ok(0);
        }
        let loc = match self.locate(start) {
            Some(loc) => loc,
            None => return Ok(0),
        };
        let available = if start >= 0 {
            self.count - start as usize
        } else {
            (-(start + 1)) as usize + 1
        };
        let total = count.min(available);
        // 缺口左边的节点；起点在节点开头时，左边是前驱
        let anchor = if loc.offset > 0 {
            Some(loc.id)
        } else {
            self.segments[loc.id].prev
        };

        let mut extent = total;
        let mut cur = Some(loc.id);
        let mut offset = loc.offset;
        while extent > 0 {
            let id = match cur {
                Some(id) => id,
                None => break,
            };
            let (seg_count, next) = {
                let seg = &self.segments[id];
                (seg.count(), seg.next)
            };
            let del = extent.min(seg_count - offset);
            if offset == 0 && del == seg_count {
                self.remove_node(id);
            } else {
                let from = offset as isize;
                self.edit(id, |zl| zl.delete_range(from, del))?;
                self.count -= del;
                if self.options.compression_enabled() {
                    self.mark_hot(id);
                }
            }
            trace!(?id, offset, del, "range deletion step");
            extent -= del;
            cur = next;
            offset = 0;
        }

        let center = match anchor.or(self.head) {
            Some(center) => Some(self.try_merge_next(center)?),
            None => None,
        };
        self.compress_around(center)?;
        Ok(total - extent)
    }

    /// 只保留 `keep` 返回 true 的元素，返回删除的个数
    pub fn retain<F>(&mut self, mut keep: F) -> ZLResult<usize>
    where
        F: FnMut(ZipValue<'_>) -> bool,
    {
        let mut removed = 0;
        let mut cur = self.head;
        while let Some(id) = cur {
            cur = self.segments[id].next;
            let deleted = self.edit(id, |zl| {
                let mut deleted = 0;
                let mut pos = zl.head_pos();
                while let Some(p) = pos {
                    if keep(zl.value_at(p)?) {
                        pos = zl.next_pos(p)?;
                    } else {
                        zl.delete_at(p, 1)?;
                        deleted += 1;
                        pos = if zl.is_end(p) { None } else { Some(p) };
                    }
                }
                Ok(deleted)
            })?;
            self.count -= deleted;
            removed += deleted;
            if self.segments[id].count() == 0 {
                self.remove_node(id);
                self.compress_around(None)?;
            } else {
                self.compress_around(Some(id))?;
            }
        }
        Ok(removed)
    }

    /// 把尾部元素移到头部。先复制到头部再删尾部，头部插入失败时链表不变。
    pub fn rotate(&mut self) -> ZLResult<()> {
        if self.count <= 1 {
            return Ok(());
        }
        let value = match self.last()? {
            Some(value) => value,
            None => return Ok(()),
        };
        self.push_front(&value)?;
        if let Err(e) = self.pop_back() {
            // 撤掉刚放到头部的副本
            self.pop_front()?;
            return Err(e);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.hot.clear();
        self.head = None;
        self.tail = None;
        self.count = 0;
        self.len = 0;
    }

    /// 深拷贝，压缩节点原样复制压缩数据
    pub fn duplicate(&self) -> Quicklist {
        self.clone()
    }

    /// 把 `other` 的全部节点接到尾部，`other` 变为空。
    /// 只移动节点句柄，不复制元素；两边 fill 不同时超限节点会被拆分。
    pub fn join(&mut self, other: &mut Quicklist) -> ZLResult<()> {
        if other.head.is_none() {
            return Ok(());
        }
        if self.head.is_none()
            && self.options.fill == other.options.fill
            && self.options.compress_depth == other.options.compress_depth
        {
            // 自己为空且策略一致，直接接管对方的存储
            std::mem::swap(&mut self.segments, &mut other.segments);
            std::mem::swap(&mut self.hot, &mut other.hot);
            self.head = other.head.take();
            self.tail = other.tail.take();
            self.count = std::mem::take(&mut other.count);
            self.len = std::mem::take(&mut other.len);
            other.clear();
            for id in self.hot.set_capacity(self.options.hot_capacity) {
                self.release_hot(id);
            }
            other.hot = HotSegments::new(other.options.hot_capacity);
            debug!(entries = self.count, "quicklist taken over by join");
            return Ok(());
        }
        let old_tail = self.tail;
        let mut moved = Vec::with_capacity(other.len);
        let mut cur = other.head;
        while let Some(id) = cur {
            let mut seg = other
                .segments
                .remove(id)
                .ok_or_else(|| ZLError::Corruption(format!("dangling segment handle {:?}", id)))?;
            cur = seg.next;
            seg.recompress = false;
            let new_id = self.segments.insert(seg);
            self.link_back(new_id);
            moved.push(new_id);
        }
        self.count += other.count;
        debug!(segments = moved.len(), entries = other.count, "quicklists joined");
        let other_fill = other.options.fill;
        other.clear();

        if other_fill != self.options.fill {
            for &id in &moved {
                self.enforce_cap(id)?;
            }
        }
        let depth = self.options.compress_depth;
        for &id in &moved {
            if depth == 0 || self.in_window(id) {
                self.keep_raw(id)?;
            } else if !self.segments[id].is_compressed() {
                self.compress_segment(id);
            }
        }
        self.compress_around(old_tail)
    }

    /// 把整个 ziplist 作为一个节点接到尾部；超出 fill 限制时逐个元素追加。
    pub fn append_ziplist(&mut self, zl: ZipList) -> ZLResult<()> {
        let count = zl.len();
        if count == 0 {
            return Ok(());
        }
        if count > SEGMENT_COUNT_MAX || (count > 1 && !self.options.allows(count, zl.blob_len())) {
            return self.append_values_from(&zl);
        }
        let id = self.segments.insert(Segment::new(zl));
        self.link_back(id);
        self.count += count;
        self.compress_around(Some(id))
    }

    /// 把 `zl` 中的元素逐个追加到尾部
    pub fn append_values_from(&mut self, zl: &ZipList) -> ZLResult<()> {
        for value in zl.iter() {
            self.push_back(value?)?;
        }
        Ok(())
    }

    /// 完整性校验：链表结构、计数、每个节点的 ziplist、fill 限制以及压缩窗口。
    pub fn validate(&self) -> ZLResult<()> {
        let depth = self.options.compress_depth;
        let mut prev = None;
        let mut walked = 0;
        let mut total = 0;
        let mut cur = self.head;
        while let Some(id) = cur {
            let seg = self
                .segments
                .get(id)
                .ok_or_else(|| ZLError::Corruption(format!("dangling segment handle {:?}", id)))?;
            if seg.prev != prev {
                return Err(ZLError::Corruption(format!("segment {} has a broken prev link", walked)));
            }
            let zl = seg.load()?;
            zl.validate()?;
            if zl.len() != seg.count() || zl.blob_len() != seg.size() {
                return Err(ZLError::Corruption(format!(
                    "segment {} records {} entries in {} bytes, ziplist has {} in {}",
                    walked,
                    seg.count(),
                    seg.size(),
                    zl.len(),
                    zl.blob_len()
                )));
            }
            if seg.count() == 0 {
                return Err(ZLError::Corruption(format!("segment {} is empty", walked)));
            }
            if seg.count() > 1 && !self.options.allows(seg.count(), seg.size()) {
                return Err(ZLError::CapacityExceeded(seg.count()));
            }
            if depth > 0 && (walked < depth || walked + depth >= self.len) && seg.is_compressed() {
                return Err(ZLError::Corruption(format!(
                    "segment {} is inside the uncompressed window but compressed",
                    walked
                )));
            }
            total += seg.count();
            walked += 1;
            prev = Some(id);
            cur = seg.next;
        }
        if prev != self.tail || walked != self.len || total != self.count {
            return Err(ZLError::Corruption(format!(
                "quicklist records {} entries in {} segments, found {} in {}",
                self.count, self.len, total, walked
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use rand::Rng;

    use super::node::Segment;
    use super::{Direction, Quicklist, QuicklistOptions, SegmentEncoding, SegmentId};
    use crate::ds::error::ZLError;
    use crate::ds::value::{ZipEntryValue, ZipValue};
    use crate::ds::ziplist::{ZipList, ZIPLIST_HEADER_SIZE};

    fn with_fill(fill: i32) -> Quicklist {
        Quicklist::with_options(QuicklistOptions::new().fill(fill)).unwrap()
    }

    fn ints(ql: &Quicklist) -> Vec<i64> {
        ql.iter().map(|v| v.unwrap().as_int().unwrap()).collect()
    }

    fn counts(ql: &Quicklist) -> Vec<usize> {
        ql.segments().map(|s| s.count).collect()
    }

    fn as_text(v: &ZipEntryValue) -> Vec<u8> {
        match v {
            ZipEntryValue::Int(i) => i.to_string().into_bytes(),
            ZipEntryValue::Bytes(b) => b.to_vec(),
        }
    }

    fn contents(ql: &Quicklist) -> Vec<Vec<u8>> {
        ql.iter().map(|v| as_text(&v.unwrap())).collect()
    }

    #[test]
    fn push_get_rotate() {
        let mut ql = with_fill(4);
        for i in 1..=10i64 {
            ql.push_back(i).unwrap();
        }
        assert_eq!(counts(&ql), vec![4, 4, 2]);
        assert_eq!(ql.len(), 10);
        assert_eq!(ql.get(5).unwrap(), Some(ZipEntryValue::Int(6)));
        assert_eq!(ql.get(-1).unwrap(), Some(ZipEntryValue::Int(10)));
        assert_eq!(ql.get(-10).unwrap(), Some(ZipEntryValue::Int(1)));
        assert_eq!(ql.get(10).unwrap(), None);
        assert_eq!(ql.get(-11).unwrap(), None);
        ql.rotate().unwrap();
        assert_eq!(ints(&ql), vec![10, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        ql.validate().unwrap();
    }

    #[test]
    fn push_front_fills_head_first() {
        let mut ql = with_fill(3);
        for i in 0..7i64 {
            ql.push_front(i).unwrap();
        }
        assert_eq!(counts(&ql), vec![1, 3, 3]);
        assert_eq!(ints(&ql), vec![6, 5, 4, 3, 2, 1, 0]);
        ql.validate().unwrap();
    }

    #[test]
    fn pops_on_empty_list() {
        let mut ql = Quicklist::new();
        assert_eq!(ql.pop_front().unwrap(), None);
        assert_eq!(ql.pop_back().unwrap(), None);
        assert_eq!(ql.get(0).unwrap(), None);
        assert_eq!(ql.delete_range(0, 5).unwrap(), 0);
        ql.rotate().unwrap();
        assert!(ql.is_empty());
        assert_eq!(ql.segment_count(), 0);
    }

    #[test]
    fn pops_free_empty_segments() {
        let mut ql = with_fill(2);
        for i in 0..5i64 {
            ql.push_back(i).unwrap();
        }
        assert_eq!(ql.pop_front().unwrap(), Some(ZipEntryValue::Int(0)));
        assert_eq!(ql.pop_back().unwrap(), Some(ZipEntryValue::Int(4)));
        assert_eq!(ints(&ql), vec![1, 2, 3]);
        ql.validate().unwrap();
        while ql.pop_front().unwrap().is_some() {}
        assert_eq!(ql.segment_count(), 0);
        ql.validate().unwrap();
    }

    #[test]
    fn join_moves_everything() {
        let mut a = with_fill(4);
        a.push_back(1i64).unwrap();
        a.push_back(2i64).unwrap();
        let mut b = with_fill(4);
        b.push_back(3i64).unwrap();
        b.push_back(4i64).unwrap();
        a.join(&mut b).unwrap();
        assert_eq!(ints(&a), vec![1, 2, 3, 4]);
        assert!(b.is_empty());
        assert_eq!(b.segment_count(), 0);
        a.validate().unwrap();
        b.validate().unwrap();

        let mut empty = Quicklist::new();
        empty.join(&mut a).unwrap();
        assert_eq!(ints(&empty), vec![1, 2, 3, 4]);
        assert!(a.is_empty());
        empty.join(&mut a).unwrap();
        assert_eq!(empty.len(), 4);
    }

    #[test]
    fn join_into_empty_takes_storage() {
        let opts = QuicklistOptions::new().fill(3).compress_depth(1).hot_capacity(1);
        let mut src = Quicklist::with_options(opts).unwrap();
        for i in 0..30i64 {
            src.push_back(format!("{}-join-join-join-join-join", i % 2).as_str()).unwrap();
        }
        let expected = contents(&src);
        let mut dst = Quicklist::with_options(opts).unwrap();
        dst.join(&mut src).unwrap();
        assert_eq!(contents(&dst), expected);
        assert_eq!(dst.segment_count(), 10);
        assert!(src.is_empty());
        assert_eq!(src.segment_count(), 0);
        dst.validate().unwrap();
        src.validate().unwrap();
        // 被清空的一方还能继续使用
        src.push_back(1i64).unwrap();
        assert_eq!(ints(&src), vec![1]);
    }

    #[test]
    fn join_reapplies_own_fill() {
        let mut a = with_fill(2);
        a.push_back(0i64).unwrap();
        let mut b = with_fill(8);
        for i in 1..=8i64 {
            b.push_back(i).unwrap();
        }
        assert_eq!(counts(&b), vec![8]);
        a.join(&mut b).unwrap();
        assert!(counts(&a).iter().all(|&c| c <= 2));
        assert_eq!(ints(&a), (0..=8).collect::<Vec<_>>());
        a.validate().unwrap();
    }

    #[test]
    fn delete_range_merges_survivors() {
        let mut ql = with_fill(4);
        for i in 1..=10i64 {
            ql.push_back(i).unwrap();
        }
        assert_eq!(ql.delete_range(2, 6).unwrap(), 6);
        assert_eq!(ints(&ql), vec![1, 2, 9, 10]);
        assert_eq!(counts(&ql), vec![4]);
        ql.validate().unwrap();
    }

    #[test]
    fn delete_range_clamps_and_negative_start() {
        let mut ql = with_fill(3);
        for i in 0..10i64 {
            ql.push_back(i).unwrap();
        }
        assert_eq!(ql.delete_range(-3, 100).unwrap(), 3);
        assert_eq!(ints(&ql), (0..7).collect::<Vec<_>>());
        assert_eq!(ql.delete_range(0, 3).unwrap(), 3);
        assert_eq!(ints(&ql), vec![3, 4, 5, 6]);
        assert_eq!(ql.delete_range(7, 1).unwrap(), 0);
        assert_eq!(ql.delete_range(1, 0).unwrap(), 0);
        assert_eq!(ql.delete_range(0, usize::MAX).unwrap(), 4);
        assert!(ql.is_empty());
        ql.validate().unwrap();
    }

    #[test]
    fn insert_around_full_segments() {
        let mut ql = with_fill(2);
        for i in [1i64, 2, 4, 5] {
            ql.push_back(i).unwrap();
        }
        assert_eq!(counts(&ql), vec![2, 2]);
        // 插在满节点的尾部
        ql.insert_after(1, 3i64).unwrap();
        assert_eq!(ints(&ql), vec![1, 2, 3, 4, 5]);
        // 插在满节点中间
        ql.insert_before(1, 100i64).unwrap();
        assert_eq!(ints(&ql), vec![1, 100, 2, 3, 4, 5]);
        ql.insert_before(0, 0i64).unwrap();
        ql.insert_after(-1, 6i64).unwrap();
        assert_eq!(ints(&ql), vec![0, 1, 100, 2, 3, 4, 5, 6]);
        assert!(counts(&ql).iter().all(|&c| c <= 2));
        ql.validate().unwrap();
    }

    #[test]
    fn insert_at_missing_anchor_fails() {
        let mut ql = with_fill(4);
        assert!(matches!(ql.insert_after(0, 1i64), Err(ZLError::OutOfRange(0))));
        ql.push_back(1i64).unwrap();
        assert!(matches!(ql.insert_before(3, 2i64), Err(ZLError::OutOfRange(3))));
        assert!(matches!(ql.replace(-2, 2i64), Err(ZLError::OutOfRange(-2))));
        assert_eq!(ints(&ql), vec![1]);
    }

    #[test]
    fn replace_and_remove() {
        let mut ql = with_fill(3);
        for i in 0..6i64 {
            ql.push_back(i).unwrap();
        }
        ql.replace(2, "two").unwrap();
        ql.replace(-1, &vec![b'z'; 300]).unwrap();
        assert_eq!(ql.get(2).unwrap(), Some(ZipEntryValue::from("two")));
        assert!(ql.compare_at(2, "two").unwrap());
        assert!(ql.compare_at(0, "0").unwrap());
        assert!(!ql.compare_at(9, "0").unwrap());
        assert_eq!(ql.remove(2).unwrap(), Some(ZipEntryValue::from("two")));
        assert_eq!(ql.remove(10).unwrap(), None);
        assert_eq!(ql.len(), 5);
        assert_eq!(ql.get(-1).unwrap().unwrap().as_bytes().unwrap().len(), 300);
        ql.validate().unwrap();
    }

    #[test]
    fn forward_and_backward_iteration_mirror() {
        let mut ql = with_fill(5);
        for i in 0..37i64 {
            ql.push_back(i).unwrap();
        }
        let forward: Vec<_> = ql.iter().map(|v| v.unwrap()).collect();
        let mut backward: Vec<_> = ql.iter_rev().map(|v| v.unwrap()).collect();
        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), ql.len());
    }

    #[test]
    fn iterate_from_index() {
        let mut ql = with_fill(3);
        for i in 0..10i64 {
            ql.push_back(i).unwrap();
        }
        let tail: Vec<i64> = ql
            .iter_from(4, Direction::Forward)
            .unwrap()
            .map(|v| v.unwrap().as_int().unwrap())
            .collect();
        assert_eq!(tail, vec![4, 5, 6, 7, 8, 9]);
        let head: Vec<i64> = ql
            .iter_from(-7, Direction::Backward)
            .unwrap()
            .map(|v| v.unwrap().as_int().unwrap())
            .collect();
        assert_eq!(head, vec![3, 2, 1, 0]);
        assert_eq!(ql.iter_from(10, Direction::Forward).unwrap().count(), 0);
    }

    #[test]
    fn oversized_entry_gets_own_segment() {
        let mut ql = Quicklist::with_options(QuicklistOptions::new().fill(-1)).unwrap();
        ql.push_back("a").unwrap();
        ql.push_back(&vec![b'x'; 10_000]).unwrap();
        ql.push_back("b").unwrap();
        assert_eq!(counts(&ql), vec![1, 1, 1]);
        ql.insert_before(1, &vec![b'y'; 5000]).unwrap();
        assert!(ql.segments().all(|s| s.count == 1 || s.size <= 4096));
        ql.validate().unwrap();
    }

    #[test]
    fn size_class_bounds_segments() {
        let mut ql = Quicklist::new();
        for i in 0..2000i64 {
            ql.push_back(format!("member-{}", i).as_str()).unwrap();
        }
        assert!(ql.segment_count() > 1);
        assert!(ql.segments().all(|s| s.size <= 8192));
        ql.validate().unwrap();
    }

    #[test]
    fn compression_is_transparent() {
        let opts = QuicklistOptions::new().fill(16).compress_depth(1).hot_capacity(1);
        let mut ql = Quicklist::with_options(opts).unwrap();
        let mut model = Vec::new();
        for i in 0..400 {
            let v = format!("payload-{}-{}", i % 7, "abcdefgh".repeat(2));
            ql.push_back(v.as_str()).unwrap();
            model.push(v.into_bytes());
        }
        ql.validate().unwrap();
        let infos: Vec<_> = ql.segments().collect();
        assert_eq!(infos.first().unwrap().encoding, SegmentEncoding::Raw);
        assert_eq!(infos.last().unwrap().encoding, SegmentEncoding::Raw);
        let compressed = infos.iter().filter(|s| s.encoding == SegmentEncoding::Compressed).count();
        assert!(compressed >= infos.len() - 3);

        assert_eq!(contents(&ql), model);
        assert_eq!(ql.get(200).unwrap().unwrap().as_bytes().unwrap(), &model[200][..]);
        ql.delete_range(100, 50).unwrap();
        model.drain(100..150);
        ql.insert_after(120, "inserted").unwrap();
        model.insert(121, b"inserted".to_vec());
        assert_eq!(contents(&ql), model);
        ql.validate().unwrap();

        let copy = ql.duplicate();
        assert_eq!(contents(&copy), model);
        ql.clear();
        assert_eq!(contents(&copy), model);
        copy.validate().unwrap();
    }

    fn segment_at(ql: &Quicklist, n: usize) -> SegmentId {
        let mut id = ql.head.unwrap();
        for _ in 0..n {
            id = ql.segments[id].next.unwrap();
        }
        id
    }

    /// 每个 entry 都是 28 字节：prevlen 1 + encoding 1 + 26 字节内容
    fn fixed_width(i: usize) -> String {
        format!("{:02}-segment-segment-segment", i)
    }

    /// 把节点换成一个压缩数据完好、但第二个 entry 的 encoding 被破坏的版本
    fn damage_second_entry(ql: &mut Quicklist, id: SegmentId) {
        let old = &ql.segments[id];
        let (prev, next, count) = (old.prev, old.next, old.count());
        let mut raw = old.load().unwrap().into_owned().into_bytes();
        raw[ZIPLIST_HEADER_SIZE + 28 + 1] = 0b1001_0000;
        let mut seg = Segment::compressed_unchecked(&raw, count).unwrap();
        seg.prev = prev;
        seg.next = next;
        ql.segments[id] = seg;
    }

    #[test]
    fn damaged_segment_is_reported() {
        let opts = QuicklistOptions::new().fill(4).compress_depth(1);
        let mut ql = Quicklist::with_options(opts).unwrap();
        for i in 0..12 {
            ql.push_back(fixed_width(i).as_str()).unwrap();
        }
        assert_eq!(counts(&ql), vec![4, 4, 4]);
        let middle = ql.segments[ql.head.unwrap()].next.unwrap();
        damage_second_entry(&mut ql, middle);

        assert_eq!(ql.get(0).unwrap().unwrap().as_bytes().unwrap(), fixed_width(0).as_bytes());
        assert_eq!(ql.get(-1).unwrap().unwrap().as_bytes().unwrap(), fixed_width(11).as_bytes());
        assert!(ql.get(5).is_err());
        assert!(ql.get(4).is_err());
        assert!(ql.compare_at(5, fixed_width(5).as_str()).is_err());
        let walked: Vec<_> = ql.iter().collect();
        assert_eq!(walked.len(), 5);
        assert!(walked[..4].iter().all(|v| v.is_ok()));
        assert!(walked[4].is_err());
        assert!(ql.validate().is_err());
    }

    #[test]
    fn failed_rotate_keeps_tail() {
        let mut ql = with_fill(6);
        for i in (0..9).rev() {
            ql.push_front(fixed_width(i).as_str()).unwrap();
        }
        assert_eq!(counts(&ql), vec![3, 6]);
        let head = ql.head.unwrap();
        damage_second_entry(&mut ql, head);

        assert!(ql.rotate().is_err());
        assert_eq!(ql.len(), 9);
        assert_eq!(counts(&ql), vec![3, 6]);
        for i in 3..9 {
            assert_eq!(
                ql.get(i as isize).unwrap().unwrap().as_bytes().unwrap(),
                fixed_width(i).as_bytes()
            );
        }
    }

    #[test]
    fn rotate_moves_tail_across_segments() {
        let mut ql = with_fill(3);
        for i in 0..7i64 {
            ql.push_back(i).unwrap();
        }
        for _ in 0..3 {
            ql.rotate().unwrap();
            ql.validate().unwrap();
        }
        assert_eq!(ints(&ql), vec![4, 5, 6, 0, 1, 2, 3]);
        let mut single = with_fill(3);
        single.push_back("only").unwrap();
        single.rotate().unwrap();
        assert_eq!(contents(&single), vec![b"only".to_vec()]);
    }

    #[test]
    fn evicted_hot_segment_is_recompressed() {
        let opts = QuicklistOptions::new().fill(4).compress_depth(1).hot_capacity(1);
        let mut ql = Quicklist::with_options(opts).unwrap();
        for i in 0..40 {
            ql.push_back(fixed_width(i % 10).as_str()).unwrap();
        }
        ql.validate().unwrap();
        let encodings = |ql: &Quicklist| ql.segments().map(|s| s.encoding).collect::<Vec<_>>();
        assert_eq!(encodings(&ql)[3], SegmentEncoding::Compressed);
        assert_eq!(encodings(&ql)[5], SegmentEncoding::Compressed);

        // 第 3 个节点被改写后留在热缓存中，保持明文
        let third = segment_at(&ql, 3);
        let fifth = segment_at(&ql, 5);
        ql.replace(12, fixed_width(99).as_str()).unwrap();
        assert_eq!(encodings(&ql)[3], SegmentEncoding::Raw);
        assert!(ql.segments[third].recompress);

        // 改写第 5 个节点把第 3 个挤出热缓存，它被重新压缩
        ql.replace(20, fixed_width(98).as_str()).unwrap();
        assert_eq!(encodings(&ql)[3], SegmentEncoding::Compressed);
        assert!(!ql.segments[third].recompress);
        assert_eq!(encodings(&ql)[5], SegmentEncoding::Raw);
        assert!(ql.segments[fifth].recompress);
        ql.validate().unwrap();
        assert_eq!(ql.get(12).unwrap().unwrap().as_bytes().unwrap(), fixed_width(99).as_bytes());
        assert_eq!(ql.get(20).unwrap().unwrap().as_bytes().unwrap(), fixed_width(98).as_bytes());

        // 窗口扩大到覆盖全部节点，热缓存清空，标记也清掉
        ql.set_compress_depth(5).unwrap();
        assert!(ql.segments().all(|s| s.encoding == SegmentEncoding::Raw));
        assert!(!ql.segments[fifth].recompress);
    }

    #[test]
    fn changing_depth_recomputes_window() {
        let mut ql = with_fill(8);
        for i in 0..200 {
            ql.push_back(format!("{}-repeated-repeated-repeated", i % 3).as_str()).unwrap();
        }
        assert!(ql.segments().all(|s| s.encoding == SegmentEncoding::Raw));
        ql.set_compress_depth(2).unwrap();
        ql.validate().unwrap();
        assert!(ql.segments().any(|s| s.encoding == SegmentEncoding::Compressed));
        ql.set_compress_depth(0).unwrap();
        assert!(ql.segments().all(|s| s.encoding == SegmentEncoding::Raw));
        ql.set_fill(2).unwrap();
        assert!(ql.segments().all(|s| s.count <= 2));
        assert_eq!(ql.len(), 200);
        ql.validate().unwrap();
        assert!(ql.set_fill(-6).is_err());
        assert_eq!(ql.options().fill, 2);
    }

    #[test]
    fn invalid_options_are_rejected() {
        assert!(matches!(
            Quicklist::with_options(QuicklistOptions::new().fill(-6)),
            Err(ZLError::InvalidArgument(_))
        ));
        assert!(Quicklist::with_options(QuicklistOptions::new().fill(1 << 16)).is_err());
        assert!(Quicklist::with_options(QuicklistOptions::new().hot_capacity(0)).is_err());
    }

    #[test]
    fn retain_drops_rejected_values() {
        let mut ql = with_fill(4);
        for i in 0..20i64 {
            ql.push_back(i).unwrap();
        }
        let removed = ql.retain(|v| v.as_int().map_or(false, |i| i % 3 == 0)).unwrap();
        assert_eq!(removed, 13);
        assert_eq!(ints(&ql), vec![0, 3, 6, 9, 12, 15, 18]);
        ql.validate().unwrap();
    }

    #[test]
    fn ziplist_adoption() {
        let mut zl = ZipList::new();
        for i in 0..3i64 {
            zl.push_back(i).unwrap();
        }
        let mut ql = with_fill(4);
        ql.push_back(-1i64).unwrap();
        ql.append_ziplist(zl.clone()).unwrap();
        assert_eq!(counts(&ql), vec![1, 3]);
        let mut big = ZipList::new();
        for i in 0..10i64 {
            big.push_back(i).unwrap();
        }
        ql.append_ziplist(big.clone()).unwrap();
        assert_eq!(ql.len(), 14);
        ql.validate().unwrap();

        let rebuilt = Quicklist::from_ziplist(QuicklistOptions::new().fill(3), &big).unwrap();
        assert_eq!(counts(&rebuilt), vec![3, 3, 3, 1]);
        assert_eq!(ints(&rebuilt), (0..10).collect::<Vec<_>>());
    }

    fn check_against_model(ql: &Quicklist, model: &VecDeque<Vec<u8>>) {
        ql.validate().unwrap();
        assert_eq!(ql.len(), model.len());
        let got = contents(ql);
        assert_eq!(got.len(), model.len());
        assert!(got.iter().zip(model.iter()).all(|(a, b)| a == b));
    }

    fn random_ops(options: QuicklistOptions, rounds: usize) {
        let mut rng = rand::thread_rng();
        let mut ql = Quicklist::with_options(options).unwrap();
        let mut model: VecDeque<Vec<u8>> = VecDeque::new();
        for round in 0..rounds {
            let payload: Vec<u8> = match rng.gen_range(0..3) {
                0 => rng.gen_range(-1000i64..1000).to_string().into_bytes(),
                1 => format!("v{}", rng.gen_range(0..50)).into_bytes(),
                _ => vec![b'r'; rng.gen_range(0..700)],
            };
            let value = ZipValue::from(&payload);
            match rng.gen_range(0..10) {
                0 | 1 => {
                    ql.push_back(value).unwrap();
                    model.push_back(payload);
                }
                2 => {
                    ql.push_front(value).unwrap();
                    model.push_front(payload);
                }
                3 => {
                    let got = ql.pop_front().unwrap().map(|v| as_text(&v));
                    assert_eq!(got, model.pop_front());
                }
                4 => {
                    let got = ql.pop_back().unwrap().map(|v| as_text(&v));
                    assert_eq!(got, model.pop_back());
                }
                5 if !model.is_empty() => {
                    let idx = rng.gen_range(0..model.len());
                    if rng.gen_bool(0.5) {
                        ql.insert_before(idx as isize, value).unwrap();
                        model.insert(idx, payload);
                    } else {
                        ql.insert_after(idx as isize, value).unwrap();
                        model.insert(idx + 1, payload);
                    }
                }
                6 if !model.is_empty() => {
                    let idx = rng.gen_range(0..model.len());
                    let num = rng.gen_range(0..12);
                    let removed = ql.delete_range(idx as isize, num).unwrap();
                    let end = (idx + num).min(model.len());
                    assert_eq!(removed, end - idx);
                    model.drain(idx..end);
                }
                7 if !model.is_empty() => {
                    let idx = rng.gen_range(0..model.len());
                    ql.replace(idx as isize, value).unwrap();
                    model[idx] = payload;
                }
                8 if !model.is_empty() => {
                    let idx = rng.gen_range(0..model.len());
                    let got = ql.get(-(idx as isize) - 1).unwrap().map(|v| as_text(&v));
                    assert_eq!(got.as_ref(), model.get(model.len() - 1 - idx));
                }
                9 => {
                    ql.rotate().unwrap();
                    if let Some(v) = model.pop_back() {
                        model.push_front(v);
                    }
                }
                _ => {}
            }
            if round % 50 == 0 {
                check_against_model(&ql, &model);
            }
        }
        check_against_model(&ql, &model);
    }

    #[test]
    fn random_ops_match_model_with_size_fill() {
        for fill in [-1, -2, -5] {
            random_ops(QuicklistOptions::new().fill(fill), 1500);
        }
    }

    #[test]
    fn random_ops_match_model_with_count_fill() {
        for fill in [1, 2, 5, 128] {
            random_ops(QuicklistOptions::new().fill(fill), 1500);
        }
    }

    #[test]
    fn random_ops_match_model_compressed() {
        for depth in [1, 2, 3] {
            random_ops(
                QuicklistOptions::new().fill(4).compress_depth(depth).hot_capacity(2),
                1500,
            );
        }
    }
}
