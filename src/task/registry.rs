//! Last known status of the tasks this process has launched or touched.
//!
//! Terminal statuses stick: once a task is recorded `completed` or
//! `cancelled`, later host events for it cannot move it anywhere else.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::types::TaskStatus;

#[derive(Default)]
struct Book {
    states: HashMap<String, TaskStatus>,
    order: VecDeque<String>,
}

pub struct TaskRegistry {
    book: Mutex<Book>,
    capacity: usize,
}

impl TaskRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            book: Mutex::new(Book::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        match self.book.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Unknown tasks are treated as running.
    pub fn status(&self, task_id: &str) -> TaskStatus {
        self.lock()
            .states
            .get(task_id)
            .copied()
            .unwrap_or(TaskStatus::Running)
    }

    /// Move `task_id` to `next`. Returns false, leaving the status as it
    /// was, when the current status does not allow it.
    pub fn transition(&self, task_id: &str, next: TaskStatus) -> bool {
        let mut book = self.lock();
        let current = book
            .states
            .get(task_id)
            .copied()
            .unwrap_or(TaskStatus::Running);
        if !current.can_transition_to(next) {
            tracing::debug!(task_id, %current, %next, "Rejected task status change");
            return false;
        }
        Self::store(&mut book, task_id, next, self.capacity);
        true
    }

    /// A follow-up message starts a new turn on a finished task. Cancelled
    /// tasks stay cancelled.
    pub fn reopen(&self, task_id: &str) -> bool {
        let mut book = self.lock();
        if book.states.get(task_id) == Some(&TaskStatus::Cancelled) {
            return false;
        }
        Self::store(&mut book, task_id, TaskStatus::Running, self.capacity);
        true
    }

    fn store(book: &mut Book, task_id: &str, status: TaskStatus, capacity: usize) {
        if book.states.insert(task_id.to_string(), status).is_none() {
            book.order.push_back(task_id.to_string());
        }
        while book.order.len() > capacity {
            if let Some(oldest) = book.order.pop_front() {
                book.states.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
