use serde::{Deserialize, Serialize};

pub mod event;
pub mod leaderboard;
pub mod prediction;
pub mod round;

#[inline]
const fn default_page() -> i64 {
    0
}

#[inline]
const fn default_limit() -> i64 {
    50
}

pub const MAX_PAGE_SIZE: i64 = 500;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default = "default_page")]
    pub page: i64,
}

impl Pagination {
    /// Clamps the requested window to something the store can answer cheaply, returning
    /// `(limit, offset)`
    pub fn window(&self) -> (i64, i64) {
        let limit = self.limit.clamp(1, MAX_PAGE_SIZE);
        let page = self.page.max(0);

        (limit, page.saturating_mul(limit))
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            page: default_page(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub total_items: i64,
    pub total_pages: i64,
    #[serde(default = "default_limit")]
    pub page_size: i64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, total_items: i64, page_size: i64, page: i64) -> Self {
        let total_pages = if page_size > 0 {
            (total_items as f64 / page_size as f64).ceil() as i64
        } else {
            0
        };

        Self {
            items,
            page,
            page_size,
            total_items,
            total_pages,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pagination_window() {
        let p = Pagination { limit: 20, page: 3 };
        assert_eq!(p.window(), (20, 60));

        let wild = Pagination {
            limit: 100_000,
            page: -4,
        };
        assert_eq!(wild.window(), (MAX_PAGE_SIZE, 0));

        let far = Pagination {
            limit: MAX_PAGE_SIZE,
            page: i64::MAX,
        };
        assert_eq!(far.window(), (MAX_PAGE_SIZE, i64::MAX));
    }

    #[test]
    fn test_total_pages_rounds_up() {
        let resp = PaginatedResponse::new(vec![1, 2, 3], 101, 50, 0);
        assert_eq!(resp.total_pages, 3);

        let empty: PaginatedResponse<i32> = PaginatedResponse::new(vec![], 0, 50, 0);
        assert_eq!(empty.total_pages, 0);
    }
}
