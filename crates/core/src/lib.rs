pub mod paging;
pub mod stock;
pub mod types;
