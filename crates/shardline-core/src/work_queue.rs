//! Lock-free job queue shared by the workers of one stage

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Lock-free queue handing out jobs to workers.
///
/// Workers call [`next()`](WorkQueue::next) to atomically claim the next
/// job. Once [`abort()`](WorkQueue::abort) is called no further jobs are
/// handed out; jobs already claimed run to completion.
pub struct WorkQueue<J> {
    items: Vec<J>,
    cursor: AtomicUsize,
    aborted: AtomicBool,
}

impl<J> WorkQueue<J> {
    pub fn new(items: Vec<J>) -> Self {
        log::debug!("{} jobs in work queue", items.len());
        Self {
            items,
            cursor: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    /// Claim the next job, or `None` when drained or aborted.
    pub fn next(&self) -> Option<&J> {
        if self.aborted.load(Ordering::Acquire) {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.items.get(i)
    }

    /// Stop handing out jobs (first fatal error).
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }
}
