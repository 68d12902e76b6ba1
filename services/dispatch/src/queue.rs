//! FIFO view over pending, unbound orders.

use std::sync::Arc;

use crate::domain::Order;
use crate::error::DispatchResult;
use crate::store::DispatchStore;

pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Paged reader over the dispatch queue: pending orders not yet bound
/// to a round, oldest first.
#[derive(Clone)]
pub struct OrderQueue {
    store: Arc<dyn DispatchStore>,
    page_size: i64,
}

impl OrderQueue {
    pub fn new(store: Arc<dyn DispatchStore>, page_size: i64) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> i64 {
        self.page_size
    }

    /// One page of the queue at the given offset.
    pub async fn next_pending(&self, offset: i64) -> DispatchResult<Vec<Order>> {
        self.store.pending_orders(self.page_size, offset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn page_size_floor_is_one() {
        let store = Arc::new(MemoryStore::new());
        assert_eq!(OrderQueue::new(store.clone(), 0).page_size(), 1);
        assert_eq!(OrderQueue::new(store, 25).page_size(), 25);
    }
}
