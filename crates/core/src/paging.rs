use crate::types::PageMeta;

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_LIMIT: u32 = 10;

/// Normalized pagination parameters.
///
/// Construction clamps both values to at least 1 so a row offset can never go
/// negative, independent of what boundary validation let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    page: u32,
    limit: u32,
}

impl Paging {
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.max(1),
        }
    }

    pub fn page(self) -> u32 {
        self.page
    }

    pub fn limit(self) -> u32 {
        self.limit
    }

    /// Number of rows to skip before the first row of this page.
    ///
    /// Saturates instead of overflowing so extreme page/limit combinations
    /// degrade to an empty page rather than a negative offset.
    pub fn offset(self) -> i64 {
        i64::from(self.page - 1).saturating_mul(i64::from(self.limit))
    }

    /// Total number of pages needed to hold `total` rows.
    pub fn total_pages(self, total: i64) -> u32 {
        let total = total.max(0) as u64;
        let limit = u64::from(self.limit);
        total.div_ceil(limit) as u32
    }

    /// Builds the response metadata for a page containing `total` matches.
    pub fn meta(self, total: i64) -> PageMeta {
        PageMeta {
            total,
            page: self.page,
            limit: self.limit,
            total_pages: self.total_pages(total),
        }
    }
}

impl Default for Paging {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE, DEFAULT_LIMIT)
    }
}
