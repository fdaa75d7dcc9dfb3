//! Swappable one-slot holder for a queued message.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::messages::PdpMessage;

/// A single-slot cell enqueued with the publisher.
///
/// The slot supports exactly one irreversible transition: once it has been
/// emptied (drained by the publisher worker, or cancelled), it stays empty.
/// [`replace_item`](Self::replace_item) on an occupied slot swaps the
/// message in place, which is how a later message supersedes an un-sent one
/// while consuming only the original queue position.
#[derive(Debug)]
pub struct QueueToken {
    slot: ArcSwapOption<PdpMessage>,
}

impl QueueToken {
    /// Create a token holding the given message.
    #[must_use]
    pub fn new(message: Arc<PdpMessage>) -> Self {
        Self {
            slot: ArcSwapOption::from(Some(message)),
        }
    }

    /// Current slot content.
    #[must_use]
    pub fn get(&self) -> Option<Arc<PdpMessage>> {
        self.slot.load_full()
    }

    /// Swap the slot content, returning the previous message.
    ///
    /// Returns `None` without installing `new_item` when the slot is already
    /// empty: the message was taken (or cancelled) and the caller must
    /// enqueue a fresh token instead. Passing `None` cancels an occupied
    /// slot.
    pub fn replace_item(&self, new_item: Option<Arc<PdpMessage>>) -> Option<Arc<PdpMessage>> {
        let mut current = self.slot.load_full();
        loop {
            current.as_ref()?;

            let prev = self.slot.compare_and_swap(&current, new_item.clone());
            let swapped = match (&*prev, &current) {
                (Some(seen), Some(expected)) => Arc::ptr_eq(seen, expected),
                (None, _) => false,
                (Some(_), None) => unreachable!("current checked non-empty above"),
            };

            if swapped {
                return current;
            }

            current = (*prev).clone();
        }
    }
}
