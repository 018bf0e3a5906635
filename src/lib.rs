pub mod btree;
mod error;
pub mod internal_page;
pub mod leaf_page;
pub mod page;
pub mod pager;
pub mod store;
pub mod wal;

pub use crate::error::{Error, Result};
pub use crate::store::Store;

/// On-disk page size, in bytes. Chosen at format time; fixed for the lifetime of a file.
pub const PAGE_SIZE: usize = 4096;

/// First nine bytes of the meta page. Any value works; this one is this format's own.
pub const FILE_MAGIC: [u8; 9] = *b"GOSTORE1\0";

/// Maximum key length, in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Maximum value length, in bytes.
///
/// Without an overflow-page chain, a value has to fit alongside its key as the sole
/// record on an otherwise-empty leaf page; this is the largest one that does:
/// `PAGE_SIZE - leaf_data_start(7) - one_cell_pointer(2) - record_header(4) - MAX_KEY_LEN`.
pub const MAX_VALUE_LEN: usize = 3059;

/// Upper bound on the number of children of an internal page.
pub const MAX_CHILDREN: usize = 128;

/// Sentinel page id meaning "no page" (end of a free list, absent child, etc).
pub const NO_PAGE: u32 = 0xFFFF_FFFF;
