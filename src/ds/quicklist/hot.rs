//! 临时解压节点的缓存。
//!
//! 窗口外的节点被读写时需要解压，刚用完就压回去的话，对同一个节点的连续访问会反复压缩。
//! 这里记住最近用过的几个节点，容量满了之后把最久没用的那个交回去重新压缩。

use std::collections::VecDeque;

use super::node::SegmentId;

#[derive(Clone, Debug)]
pub(crate) struct HotSegments {
    capacity: usize,
    /// 队尾是最近使用的
    ids: VecDeque<SegmentId>,
}

impl HotSegments {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ids: VecDeque::with_capacity(capacity),
        }
    }

    /// 记录一次使用，返回被挤出去的节点
    pub(crate) fn touch(&mut self, id: SegmentId) -> Option<SegmentId> {
        self.evict(id);
        self.ids.push_back(id);
        if self.ids.len() > self.capacity {
            self.ids.pop_front()
        } else {
            None
        }
    }

    pub(crate) fn evict(&mut self, id: SegmentId) -> bool {
        match self.ids.iter().position(|&x| x == id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, id: SegmentId) -> bool {
        self.ids.contains(&id)
    }

    /// 调整容量，返回超出新容量的节点（最久没用的在前）
    pub(crate) fn set_capacity(&mut self, capacity: usize) -> Vec<SegmentId> {
        self.capacity = capacity;
        let overflow = self.ids.len().saturating_sub(capacity);
        self.ids.drain(..overflow).collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<SegmentId> {
        self.ids.drain(..).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.ids.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }
}
