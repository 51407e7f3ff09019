use std::collections::VecDeque;

use thiserror::Error;

use crate::media::{RemoteEntry, extension_priority};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("transcode queue is empty")]
    Empty,
}

/// Submission order for one batch: stable by extension priority, so cheap
/// formats become visible before expensive conversions.
#[derive(Debug, Default)]
pub struct TranscodeQueue {
    inner: VecDeque<RemoteEntry>,
}

impl TranscodeQueue {
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = RemoteEntry>,
    {
        let mut entries: Vec<RemoteEntry> = entries.into_iter().collect();
        entries.sort_by_cached_key(|entry| extension_priority(&entry.extension()));
        Self {
            inner: entries.into(),
        }
    }

    pub fn dequeue(&mut self) -> Result<RemoteEntry, QueueError> {
        self.inner.pop_front().ok_or(QueueError::Empty)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> RemoteEntry {
        RemoteEntry {
            id: name.to_string(),
            name: name.to_string(),
            mime_type: String::new(),
            size: 0,
            md5_checksum: None,
        }
    }

    fn drain(mut queue: TranscodeQueue) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(entry) = queue.dequeue() {
            out.push(entry.name);
        }
        out
    }

    #[test]
    fn orders_by_extension_priority_keeping_ties_stable() {
        let queue = TranscodeQueue::from_entries(
            ["d.heic", "a.mp4", "b.jpg", "c.png", "e.jpg", "f.mp4", "g.gif"]
                .into_iter()
                .map(entry),
        );
        assert_eq!(
            drain(queue),
            vec!["b.jpg", "e.jpg", "c.png", "a.mp4", "f.mp4", "d.heic", "g.gif"]
        );
    }

    #[test]
    fn dequeue_on_empty_returns_error() {
        let mut queue = TranscodeQueue::from_entries([entry("a.jpg")]);
        assert_eq!(queue.len(), 1);
        queue.dequeue().unwrap();
        assert!(queue.is_empty());
        assert!(matches!(queue.dequeue(), Err(QueueError::Empty)));
    }
}
