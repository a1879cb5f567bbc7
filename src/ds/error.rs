#[derive(thiserror::Error, Debug)]
pub enum ZLError {
    #[error("Corrupted ziplist, `{0}`")]
    Corruption(String),
    #[error("invalid entry encoding `{0:#04x}`")]
    InvalidEntryEncoding(u8),
    #[error("entry at offset({offset}) runs past the end of the buffer")]
    Truncated { offset: usize },
    #[error("decompressed {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("segment would hold {0} entries, more than its count field allows")]
    CapacityExceeded(usize),
    #[error("Invalid index({0}) is given")]
    OutOfRange(isize),
    #[error("Invalid argument, {0}")]
    InvalidArgument(String),
    #[error("failed to allocate {0} bytes")]
    AllocationFailure(usize),
}

impl ZLError {
    /// 是否为数据损坏类错误（buffer 格式不对、解压长度不符、entry 被截断）。
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ZLError::Corruption(_)
                | ZLError::InvalidEntryEncoding(_)
                | ZLError::Truncated { .. }
                | ZLError::LengthMismatch { .. }
        )
    }
}

pub type ZLResult<T> = Result<T, ZLError>;
