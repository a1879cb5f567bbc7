use std::borrow::Cow;

use super::node::SegmentId;
use super::Quicklist;
use crate::ds::error::ZLResult;
use crate::ds::value::ZipEntryValue;
use crate::ds::ziplist::ZipList;

/// 遍历方向
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// 从头到尾
    Forward,
    /// 从尾到头
    Backward,
}

/// Iterator over a quicklist.
///
/// 压缩节点在进入时解压一份临时副本，节点本身保持压缩状态。
/// 读到损坏的节点时产出一个 `Err`，之后迭代结束。
pub struct Iter<'a> {
    list: &'a Quicklist,
    direction: Direction,
    /// 下一个要进入的节点
    pending: Option<SegmentId>,
    view: Option<Cow<'a, ZipList>>,
    /// 当前节点内下一个 entry 的位置
    pos: Option<usize>,
    remaining: usize,
}

impl<'a> Iter<'a> {
    pub(crate) fn new(list: &'a Quicklist, direction: Direction) -> Self {
        let pending = match direction {
            Direction::Forward => list.head,
            Direction::Backward => list.tail,
        };
        Self {
            list,
            direction,
            pending,
            view: None,
            pos: None,
            remaining: list.len(),
        }
    }

    /// 从 `segment` 的第 `offset` 个 entry 开始，最多产出 `remaining` 个
    pub(crate) fn starting_at(
        list: &'a Quicklist,
        direction: Direction,
        segment: SegmentId,
        offset: usize,
        remaining: usize,
    ) -> ZLResult<Self> {
        let seg = &list.segments[segment];
        let view = seg.load()?;
        let pos = view.index_pos(offset as isize)?;
        let pending = match direction {
            Direction::Forward => seg.next,
            Direction::Backward => seg.prev,
        };
        Ok(Self {
            list,
            direction,
            pending,
            view: Some(view),
            pos,
            remaining,
        })
    }

    pub(crate) fn empty(list: &'a Quicklist, direction: Direction) -> Self {
        Self {
            list,
            direction,
            pending: None,
            view: None,
            pos: None,
            remaining: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = ZLResult<ZipEntryValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.remaining == 0 {
                return None;
            }
            if let (Some(view), Some(pos)) = (self.view.as_ref(), self.pos) {
                let value = match view.value_at(pos) {
                    Ok(v) => v.to_entry_value(),
                    Err(e) => {
                        self.remaining = 0;
                        return Some(Err(e));
                    }
                };
                let step = match self.direction {
                    Direction::Forward => view.next_pos(pos),
                    Direction::Backward => view.prev_pos(pos),
                };
                self.pos = match step {
                    Ok(pos) => pos,
                    Err(e) => {
                        self.remaining = 0;
                        return Some(Err(e));
                    }
                };
                self.remaining -= 1;
                return Some(Ok(value));
            }

            // 当前节点已经走完
            let list: &'a Quicklist = self.list;
            let id = self.pending?;
            let seg = &list.segments[id];
            self.pending = match self.direction {
                Direction::Forward => seg.next,
                Direction::Backward => seg.prev,
            };
            match seg.load() {
                Ok(view) => {
                    self.pos = match self.direction {
                        Direction::Forward => view.head_pos(),
                        Direction::Backward => view.tail_pos(),
                    };
                    self.view = Some(view);
                }
                Err(e) => {
                    self.remaining = 0;
                    return Some(Err(e));
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

impl<'a> IntoIterator for &'a Quicklist {
    type Item = ZLResult<ZipEntryValue>;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
