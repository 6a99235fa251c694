#![forbid(unsafe_code)]

mod header;
mod pager;

pub use header::{
    load_header, store_header, CatalogHeader, FileHeader, FreeSpaceHeader, FILE_HEADER_LEN,
    FILE_MAGIC, FIRST_DATA_PAGE, FORMAT_VERSION, HEADER_SLOTS,
};
pub use pager::{
    growth_increment, GrowthPolicy, PagePointer, Pager, PagerOptions, PagerState, Synchronous,
    DEFAULT_MIN_GROWTH_BYTES, FAST_GROWTH_WINDOW, FIRST_GROWTH_PAGES, SLOW_GROWTH_WINDOW,
};
