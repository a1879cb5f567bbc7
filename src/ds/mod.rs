/// 错误类型
pub mod error;
/// entry 的取值
pub mod value;
/// 压缩链表
pub mod ziplist;
/// LZ4 节点压缩
pub mod compress;
/// ziplist 组成的双向链表
pub mod quicklist;
