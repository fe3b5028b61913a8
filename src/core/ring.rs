// Fixed-capacity ring of records with oldest-eviction and global byte offset lookup.
use bytes::Bytes;

use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;

/// Default number of retained records.
pub const DEFAULT_CAPACITY: usize = 10;

/// Ring of `capacity` record slots.
///
/// Valid slots form one contiguous run of `occupied` entries starting at `read_cursor`
/// (wrapping), and `write_cursor == (read_cursor + occupied) % capacity`. The logical stream is
/// the concatenation of those records in order. Callers serialize access; see `StoreGuard`.
#[derive(Debug)]
pub struct CircularStore {
    slots: Box<[Option<Record>]>,
    write_cursor: usize,
    read_cursor: usize,
    occupied: usize,
}

impl CircularStore {
    pub fn new(capacity: usize) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("store capacity must be greater than zero")
                .with_hint("Use a positive value like 10."));
        }
        Ok(Self {
            slots: (0..capacity).map(|_| None).collect(),
            write_cursor: 0,
            read_cursor: 0,
            occupied: 0,
        })
    }

    /// Drops every record and rewinds both cursors.
    pub fn init(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.write_cursor = 0;
        self.read_cursor = 0;
        self.occupied = 0;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub fn is_full(&self) -> bool {
        self.occupied == self.capacity()
    }

    /// Inserts at the write cursor. When full, the oldest record is replaced and returned, and
    /// the valid window slides forward by one slot.
    pub fn add(&mut self, record: Record) -> Option<Record> {
        let capacity = self.capacity();
        let evicted = self.slots[self.write_cursor].replace(record);
        self.write_cursor = (self.write_cursor + 1) % capacity;
        if self.occupied == capacity {
            self.read_cursor = (self.read_cursor + 1) % capacity;
            evicted
        } else {
            self.occupied += 1;
            debug_assert!(evicted.is_none(), "slot outside the valid run was occupied");
            None
        }
    }

    /// Maps a byte offset in the logical stream to the record holding it and the offset
    /// inside that record. Offsets shift as records are evicted from the front.
    pub fn locate(&self, offset: usize) -> Option<(&Record, usize)> {
        let mut remaining = offset;
        for record in self.iter() {
            if remaining < record.len() {
                return Some((record, remaining));
            }
            remaining -= record.len();
        }
        None
    }

    /// Reads at most `max` bytes of the logical stream starting at `offset`, never crossing a
    /// record boundary. `None` once `offset` is past the end of the stream.
    pub fn read_at(&self, offset: usize, max: usize) -> Option<Bytes> {
        let (record, local) = self.locate(offset)?;
        let end = record.len().min(local.saturating_add(max));
        Some(record.bytes().slice(local..end))
    }

    /// Sum of retained record lengths.
    pub fn total_len(&self) -> usize {
        self.iter().map(Record::len).sum()
    }

    /// Valid records from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Record> + '_ {
        let capacity = self.capacity();
        (0..self.occupied)
            .filter_map(move |i| self.slots[(self.read_cursor + i) % capacity].as_ref())
    }

    #[cfg(test)]
    fn cursors(&self) -> (usize, usize) {
        (self.write_cursor, self.read_cursor)
    }
}
