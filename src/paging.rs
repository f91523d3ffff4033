//! Lazy cursor-based pagination.
//!
//! A [`Pager`] walks a paginated listing one page at a time, only asking its
//! [`PageSource`] for the next page once the buffered items are consumed.
//! The deadline is checked on every advance; once it passes (or any fetch
//! fails) the pager yields that error and then ends.

use crate::deadline::Deadline;
use crate::error::Result;
use std::collections::VecDeque;

/// One page of a listing and the cursor of the page after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

pub trait PageSource {
    type Item;

    /// Fetch the page at `cursor`; `None` requests the first page.
    fn fetch(&mut self, cursor: Option<&str>, deadline: &Deadline) -> Result<Page<Self::Item>>;
}

enum Cursor {
    First,
    Next(String),
    Done,
}

pub struct Pager<S: PageSource> {
    source: S,
    deadline: Deadline,
    buffer: VecDeque<S::Item>,
    cursor: Cursor,
}

impl<S: PageSource> Pager<S> {
    pub fn new(source: S, deadline: Deadline) -> Self {
        Self {
            source,
            deadline,
            buffer: VecDeque::new(),
            cursor: Cursor::First,
        }
    }

    fn stop(&mut self) {
        self.buffer.clear();
        self.cursor = Cursor::Done;
    }
}

impl<S: PageSource> Iterator for Pager<S> {
    type Item = Result<S::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if matches!(self.cursor, Cursor::Done) && self.buffer.is_empty() {
                return None;
            }
            if let Err(err) = self.deadline.check() {
                self.stop();
                return Some(Err(err));
            }
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }

            let cursor = match std::mem::replace(&mut self.cursor, Cursor::Done) {
                Cursor::First => None,
                Cursor::Next(cursor) => Some(cursor),
                Cursor::Done => return None,
            };
            match self.source.fetch(cursor.as_deref(), &self.deadline) {
                Ok(page) => {
                    self.buffer.extend(page.items);
                    if let Some(next) = page.next {
                        self.cursor = Cursor::Next(next);
                    }
                }
                Err(err) => {
                    self.stop();
                    return Some(Err(err));
                }
            }
        }
    }
}
