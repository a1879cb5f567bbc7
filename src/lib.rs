pub mod ds;

pub use ds::error::{ZLError, ZLResult};
pub use ds::quicklist::{Direction, Quicklist, QuicklistOptions, SegmentEncoding, SegmentInfo};
pub use ds::value::{ZipEntryValue, ZipValue};
pub use ds::ziplist::{MergeSide, ZipList};
