//! Streams: bounded mailboxes with independent cursors, held in the store.
//!
//! A stream is an append log. Every cursor keeps its own absolute read
//! position; values read by every open cursor are released, and capacity
//! counts the values still retained.

use std::collections::{BTreeMap, VecDeque};

use cesk_types::StreamCapacity;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::VmError;
use crate::value::{CursorId, StreamId, Value};

/// What `put` does when a stream is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Leave the stream unchanged and yield [`Value::Blocked`]; the producer
    /// retries.
    #[default]
    Block,
    /// Evict the oldest retained value. Cursors behind it skip ahead.
    DropOldest,
    /// Fail with [`VmError::StreamFull`].
    Fail,
}

/// Result of appending to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Appended,
    /// Appended after evicting the oldest value.
    Evicted,
    /// Full under [`OverflowPolicy::Block`]; nothing changed.
    WouldBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    capacity: StreamCapacity,
    buffer: VecDeque<Value>,
    /// Absolute position of `buffer[0]`.
    base: u64,
    cursors: BTreeMap<CursorId, u64>,
}

impl Stream {
    #[must_use]
    pub fn new(capacity: StreamCapacity) -> Self {
        Self {
            capacity,
            buffer: VecDeque::new(),
            base: 0,
            cursors: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> StreamCapacity {
        self.capacity
    }

    /// Values still retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        match self.capacity {
            StreamCapacity::Bounded(n) => self.buffer.len() >= n,
            StreamCapacity::Unbounded => false,
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.buffer.iter()
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
        self.buffer.iter_mut()
    }

    pub fn cursor_ids(&self) -> impl Iterator<Item = CursorId> + '_ {
        self.cursors.keys().copied()
    }

    pub(crate) fn push(&mut self, value: Value, policy: OverflowPolicy, id: StreamId) -> Result<PutOutcome, VmError> {
        if !self.is_full() {
            self.buffer.push_back(value);
            return Ok(PutOutcome::Appended);
        }
        match policy {
            OverflowPolicy::Block => Ok(PutOutcome::WouldBlock),
            OverflowPolicy::Fail => Err(VmError::StreamFull { stream: id }),
            OverflowPolicy::DropOldest => {
                if self.buffer.pop_front().is_none() {
                    // Capacity zero: nothing to evict, nothing fits.
                    return Ok(PutOutcome::WouldBlock);
                }
                self.base += 1;
                self.buffer.push_back(value);
                Ok(PutOutcome::Evicted)
            }
        }
    }

    /// Open a cursor at the oldest retained value.
    pub(crate) fn open(&mut self, cursor: CursorId) {
        self.cursors.insert(cursor, self.base);
    }

    pub(crate) fn read(&mut self, cursor: CursorId, id: StreamId) -> Result<Option<Value>, VmError> {
        let pos = *self
            .cursors
            .get(&cursor)
            .ok_or(VmError::UnknownCursor { stream: id, cursor })?;
        let pos = pos.max(self.base);
        let index = usize::try_from(pos - self.base)
            .map_err(|_| VmError::internal("cursor offset exceeds address space"))?;
        let Some(value) = self.buffer.get(index).cloned() else {
            return Ok(None);
        };
        self.cursors.insert(cursor, pos + 1);
        self.release();
        Ok(Some(value))
    }

    fn release(&mut self) {
        let Some(slowest) = self.cursors.values().copied().min() else {
            return;
        };
        while self.base < slowest && self.buffer.pop_front().is_some() {
            self.base += 1;
        }
    }

    pub(crate) fn rekey_cursors(&mut self, mut f: impl FnMut(CursorId) -> Result<CursorId, VmError>) -> Result<(), VmError> {
        let mut cursors = BTreeMap::new();
        for (cursor, pos) in &self.cursors {
            cursors.insert(f(*cursor)?, *pos);
        }
        self.cursors = cursors;
        Ok(())
    }
}

/// The machine store. Streams are its only cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Store {
    streams: BTreeMap<StreamId, Stream>,
    next_stream: StreamId,
    next_cursor: CursorId,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    #[must_use]
    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn stream_ids(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.streams.keys().copied()
    }

    fn reserve_stream(&mut self) -> StreamId {
        let id = self.next_stream;
        self.next_stream += 1;
        id
    }

    fn reserve_cursor(&mut self) -> CursorId {
        let id = self.next_cursor;
        self.next_cursor += 1;
        id
    }

    /// Ids the next stream and cursor would get.
    pub(crate) fn next_ids(&self) -> (StreamId, CursorId) {
        (self.next_stream, self.next_cursor)
    }

    /// Adopt a stream under an id at or past [`Store::next_ids`].
    pub(crate) fn insert(&mut self, id: StreamId, stream: Stream) {
        self.next_stream = self.next_stream.max(id + 1);
        if let Some(last) = stream.cursors.keys().next_back() {
            self.next_cursor = self.next_cursor.max(last + 1);
        }
        self.streams.insert(id, stream);
    }

    /// `stream-make`
    pub fn make(&mut self, capacity: StreamCapacity) -> Value {
        let id = self.reserve_stream();
        self.streams.insert(id, Stream::new(capacity));
        trace!(stream = id, ?capacity, "stream created");
        Value::Stream(id)
    }

    /// `stream-put`: yields the stream on success, [`Value::Blocked`] when
    /// full under the blocking policy.
    pub fn put(&mut self, target: &Value, value: Value, policy: OverflowPolicy) -> Result<Value, VmError> {
        let Value::Stream(id) = target else {
            return Err(VmError::type_mismatch("stream-put", "stream", target));
        };
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(VmError::UnknownStream { stream: *id })?;
        Ok(match stream.push(value, policy, *id)? {
            PutOutcome::Appended | PutOutcome::Evicted => Value::Stream(*id),
            PutOutcome::WouldBlock => Value::Blocked,
        })
    }

    /// `stream-cursor`
    pub fn cursor(&mut self, source: &Value) -> Result<Value, VmError> {
        let Value::Stream(id) = source else {
            return Err(VmError::type_mismatch("stream-cursor", "stream", source));
        };
        if !self.streams.contains_key(id) {
            return Err(VmError::UnknownStream { stream: *id });
        }
        let cursor = self.reserve_cursor();
        if let Some(stream) = self.streams.get_mut(id) {
            stream.open(cursor);
        }
        Ok(Value::Cursor { stream: *id, cursor })
    }

    /// `stream-next`: the next unread value, or [`Value::Blocked`].
    pub fn next(&mut self, source: &Value) -> Result<Value, VmError> {
        let Value::Cursor { stream: id, cursor } = source else {
            return Err(VmError::type_mismatch("stream-next", "cursor", source));
        };
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(VmError::UnknownStream { stream: *id })?;
        Ok(stream.read(*cursor, *id)?.unwrap_or(Value::Blocked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn kw(k: &str) -> Value {
        Value::keyword(k)
    }

    #[test]
    fn test_fifo_per_cursor() {
        let mut store = Store::new();
        let s = store.make(StreamCapacity::Bounded(8));
        for k in ["first", "second", "third"] {
            store.put(&s, kw(k), OverflowPolicy::Block).unwrap();
        }
        let c = store.cursor(&s).unwrap();
        assert_eq!(store.next(&c).unwrap(), kw("first"));
        assert_eq!(store.next(&c).unwrap(), kw("second"));
        assert_eq!(store.next(&c).unwrap(), kw("third"));
        assert_eq!(store.next(&c).unwrap(), Value::Blocked);
    }

    #[test]
    fn test_cursors_independent() {
        let mut store = Store::new();
        let s = store.make(StreamCapacity::Unbounded);
        let a = store.cursor(&s).unwrap();
        let b = store.cursor(&s).unwrap();
        store.put(&s, Value::Int(1), OverflowPolicy::Block).unwrap();
        store.put(&s, Value::Int(2), OverflowPolicy::Block).unwrap();
        assert_eq!(store.next(&a).unwrap(), Value::Int(1));
        assert_eq!(store.next(&a).unwrap(), Value::Int(2));
        assert_eq!(store.next(&b).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_release_after_all_cursors_read() {
        let mut store = Store::new();
        let s = store.make(StreamCapacity::Bounded(1));
        let c = store.cursor(&s).unwrap();
        store.put(&s, Value::Int(1), OverflowPolicy::Block).unwrap();
        assert_eq!(store.put(&s, Value::Int(2), OverflowPolicy::Block).unwrap(), Value::Blocked);
        assert_eq!(store.next(&c).unwrap(), Value::Int(1));
        assert_eq!(store.put(&s, Value::Int(2), OverflowPolicy::Block).unwrap(), s);
    }

    #[test]
    fn test_overflow_policies() {
        let mut store = Store::new();
        let s = store.make(StreamCapacity::Bounded(2));
        let c = store.cursor(&s).unwrap();
        for n in 0..3 {
            store.put(&s, Value::Int(n), OverflowPolicy::DropOldest).unwrap();
        }
        assert_eq!(store.next(&c).unwrap(), Value::Int(1));

        let full = store.make(StreamCapacity::Bounded(0));
        assert_matches!(
            store.put(&full, Value::Nil, OverflowPolicy::Fail),
            Err(VmError::StreamFull { .. })
        );
    }

    #[test]
    fn test_type_errors() {
        let mut store = Store::new();
        assert_matches!(
            store.next(&Value::Int(3)),
            Err(VmError::TypeMismatch { expected: "cursor", .. })
        );
        assert_matches!(
            store.put(&Value::Nil, Value::Nil, OverflowPolicy::Block),
            Err(VmError::TypeMismatch { expected: "stream", .. })
        );
    }

    #[test]
    fn test_stream_values_travel_through_streams() {
        let mut store = Store::new();
        let inner = store.make(StreamCapacity::Unbounded);
        let outer = store.make(StreamCapacity::Unbounded);
        store.put(&inner, kw("payload"), OverflowPolicy::Block).unwrap();
        store.put(&outer, inner.clone(), OverflowPolicy::Block).unwrap();
        let oc = store.cursor(&outer).unwrap();
        let recovered = store.next(&oc).unwrap();
        assert_eq!(recovered, inner);
        let ic = store.cursor(&recovered).unwrap();
        assert_eq!(store.next(&ic).unwrap(), kw("payload"));
    }
}
