//! Quicklist configuration.

use crate::ds::error::{ZLError, ZLResult};

/// 正数 fill 的上限
pub const FILL_MAX: i32 = 1 << 15;
/// 压缩深度上限
pub const COMPRESS_MAX: usize = 1 << 16;
/// 默认 -2，即每个节点不超过 8KiB
pub const DEFAULT_FILL: i32 = -2;
pub const DEFAULT_HOT_CAPACITY: usize = 4;

/// 负数 fill 对应的字节上限，-1 对应 4096，-5 对应 65536
const OPTIMIZATION_LEVEL: [usize; 5] = [4096, 8192, 16384, 32768, 65536];
/// 正数 fill 时节点大小的安全上限
pub const SIZE_SAFETY_LIMIT: usize = 8192;

/// Options controlling segment size and compression.
///
/// `fill` 有两种含义：正数限制每个节点的元素个数，负数 -1..=-5 选择一个字节上限。
/// `compress_depth` 为 0 时关闭压缩，否则链表两端各 `compress_depth` 个节点不压缩。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuicklistOptions {
    pub fill: i32,
    pub compress_depth: usize,
    /// 临时解压节点缓存的容量
    pub hot_capacity: usize,
}

impl Default for QuicklistOptions {
    fn default() -> Self {
        Self {
            fill: DEFAULT_FILL,
            compress_depth: 0,
            hot_capacity: DEFAULT_HOT_CAPACITY,
        }
    }
}

impl QuicklistOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn fill(mut self, fill: i32) -> Self {
        self.fill = fill;
        self
    }

    #[must_use]
    pub const fn compress_depth(mut self, depth: usize) -> Self {
        self.compress_depth = depth;
        self
    }

    #[must_use]
    pub const fn hot_capacity(mut self, capacity: usize) -> Self {
        self.hot_capacity = capacity;
        self
    }

    pub fn validate(&self) -> ZLResult<()> {
        if self.fill < -(OPTIMIZATION_LEVEL.len() as i32) || self.fill > FILL_MAX {
            return Err(ZLError::InvalidArgument(format!(
                "fill must be within [-{}, {}], got {}",
                OPTIMIZATION_LEVEL.len(),
                FILL_MAX,
                self.fill
            )));
        }
        if self.compress_depth > COMPRESS_MAX {
            return Err(ZLError::InvalidArgument(format!(
                "compress depth must be at most {}, got {}",
                COMPRESS_MAX, self.compress_depth
            )));
        }
        if self.hot_capacity == 0 {
            return Err(ZLError::InvalidArgument("hot capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn compression_enabled(&self) -> bool {
        self.compress_depth > 0
    }

    /// 负数 fill 对应的字节上限
    fn size_class(&self) -> Option<usize> {
        if self.fill >= 0 {
            return None;
        }
        OPTIMIZATION_LEVEL.get((-self.fill - 1) as usize).copied()
    }

    /// 一个含 `count` 个元素、`bytes` 字节的节点是否满足 fill 限制
    pub(crate) fn allows(&self, count: usize, bytes: usize) -> bool {
        match self.size_class() {
            Some(limit) => bytes <= limit,
            None => bytes <= SIZE_SAFETY_LIMIT && count <= self.fill as usize,
        }
    }
}
