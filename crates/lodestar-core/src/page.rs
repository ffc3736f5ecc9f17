//! 1-based paging for list views.

use serde::Serialize;

/// One page of a list plus the size of the whole list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub count: usize,
    pub list: Vec<T>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            count: 0,
            list: Vec::new(),
        }
    }
}

/// Cut page `page_no` (1-based; 0 is read as 1) of `page_size` items.
pub fn paginate<T>(items: Vec<T>, page_no: usize, page_size: usize) -> Page<T> {
    let count = items.len();
    let start = page_no.max(1).saturating_sub(1).saturating_mul(page_size);
    let list = items.into_iter().skip(start).take(page_size).collect();
    Page { count, list }
}
