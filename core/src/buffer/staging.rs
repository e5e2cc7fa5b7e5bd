//! buffer/staging.rs
//! Fixed-capacity byte arena shuttling bytes between pipeline stages and
//! the underlying file.
//!
//! Design notes:
//! - One allocation at construction, aligned to the direct-I/O alignment.
//! - Stages never touch the heads directly. They borrow a cursor, run,
//!   and hand the cursor's `CursorState` back through `commit_read` /
//!   `commit_write`, so the ordering invariant is checked in one place.
//! - Forward orientation keeps `read <= write <= capacity`; reverse keeps
//!   `write <= read <= capacity` with data flowing from the top down.

use crate::buffer::cursor::{InputCursor, OutputCursor, ReverseInputCursor, ReverseOutputCursor};
use crate::buffer::types::{ContractViolation, CursorState};
use crate::utils::round_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Forward,
    Reverse,
}

impl Orientation {
    fn name(self) -> &'static str {
        match self {
            Orientation::Forward => "forward",
            Orientation::Reverse => "reverse",
        }
    }
}

#[derive(Debug)]
pub struct StagingBuffer {
    storage: Box<[u8]>,
    offset: usize,
    capacity: usize,
    alignment: usize,
    read: usize,
    write: usize,
    eos: bool,
    orientation: Orientation,
}

impl StagingBuffer {
    /// Allocate `capacity` bytes whose first byte sits on an `alignment`
    /// boundary. Capacity is rounded up to a whole number of alignment units.
    pub fn new(capacity: usize, alignment: usize) -> Result<Self, ContractViolation> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(ContractViolation::BadAlignment { alignment });
        }
        let capacity = round_up(capacity.max(alignment), alignment);
        let storage = vec![0u8; capacity + alignment].into_boxed_slice();
        let addr = storage.as_ptr() as usize;
        let offset = (alignment - addr % alignment) % alignment;
        Ok(Self {
            storage,
            offset,
            capacity,
            alignment,
            read: 0,
            write: 0,
            eos: false,
            orientation: Orientation::Forward,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[inline]
    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    fn mem(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.capacity]
    }

    fn mem_mut(&mut self) -> &mut [u8] {
        let (offset, capacity) = (self.offset, self.capacity);
        &mut self.storage[offset..offset + capacity]
    }

    /// Empty the buffer with both heads at the bottom edge.
    pub fn begin_forward(&mut self) {
        self.orientation = Orientation::Forward;
        self.read = 0;
        self.write = 0;
        self.eos = false;
    }

    /// Empty the buffer with both heads at the top edge.
    pub fn begin_reverse(&mut self) {
        self.orientation = Orientation::Reverse;
        self.read = self.capacity;
        self.write = self.capacity;
        self.eos = false;
    }

    pub fn readable_size(&self) -> usize {
        match self.orientation {
            Orientation::Forward => self.write - self.read,
            Orientation::Reverse => self.read - self.write,
        }
    }

    pub fn writable_space(&self) -> usize {
        match self.orientation {
            Orientation::Forward => self.capacity - self.write,
            Orientation::Reverse => self.write,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.readable_size() == 0
    }

    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.eos
    }

    /// End-of-stream reached and every byte consumed.
    #[inline]
    pub fn is_drained(&self) -> bool {
        self.eos && self.is_empty()
    }

    pub fn mark_end_of_stream(&mut self) {
        self.eos = true;
    }

    /// Readable bytes in natural order.
    pub fn readable(&self) -> &[u8] {
        let (lo, hi) = match self.orientation {
            Orientation::Forward => (self.read, self.write),
            Orientation::Reverse => (self.write, self.read),
        };
        &self.mem()[lo..hi]
    }

    fn expect(&self, orientation: Orientation) -> Result<(), ContractViolation> {
        if self.orientation != orientation {
            return Err(ContractViolation::WrongOrientation { expected: orientation.name() });
        }
        Ok(())
    }

    pub fn output_cursor(&mut self) -> Result<OutputCursor<'_>, ContractViolation> {
        self.expect(Orientation::Forward)?;
        let write = self.write;
        Ok(OutputCursor::with_base(&mut self.mem_mut()[write..], write))
    }

    pub fn input_cursor(&self) -> Result<InputCursor<'_>, ContractViolation> {
        self.expect(Orientation::Forward)?;
        Ok(InputCursor::with_base(&self.mem()[self.read..self.write], self.read, self.eos))
    }

    pub fn reverse_output_cursor(&mut self) -> Result<ReverseOutputCursor<'_>, ContractViolation> {
        self.expect(Orientation::Reverse)?;
        let write = self.write;
        Ok(ReverseOutputCursor::with_base(&mut self.mem_mut()[..write], write))
    }

    pub fn reverse_input_cursor(&self) -> Result<ReverseInputCursor<'_>, ContractViolation> {
        self.expect(Orientation::Reverse)?;
        Ok(ReverseInputCursor::with_base(&self.mem()[self.write..self.read], self.read, self.eos))
    }

    fn check_order(&self) -> Result<(), ContractViolation> {
        let ordered = match self.orientation {
            Orientation::Forward => self.read <= self.write && self.write <= self.capacity,
            Orientation::Reverse => self.write <= self.read && self.read <= self.capacity,
        };
        if !ordered {
            return Err(ContractViolation::BufferOrder {
                read: self.read,
                write: self.write,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Fold a producer's cursor back into the write head.
    pub fn commit_write(&mut self, state: CursorState) -> Result<(), ContractViolation> {
        if state.base != self.write {
            return Err(ContractViolation::ForeignCursor { expected: self.write, got: state.base });
        }
        let next = match self.orientation {
            Orientation::Forward => self.write.checked_add(state.moved),
            Orientation::Reverse => self.write.checked_sub(state.moved),
        };
        let Some(next) = next else {
            return Err(ContractViolation::BufferOrder {
                read: self.read,
                write: self.write,
                capacity: self.capacity,
            });
        };
        let prev = self.write;
        self.write = next;
        if let Err(e) = self.check_order() {
            self.write = prev;
            return Err(e);
        }
        if state.end_of_stream {
            self.eos = true;
        }
        Ok(())
    }

    /// Fold a consumer's cursor back into the read head.
    pub fn commit_read(&mut self, state: CursorState) -> Result<(), ContractViolation> {
        if state.base != self.read {
            return Err(ContractViolation::ForeignCursor { expected: self.read, got: state.base });
        }
        let next = match self.orientation {
            Orientation::Forward => self.read.checked_add(state.moved),
            Orientation::Reverse => self.read.checked_sub(state.moved),
        };
        let Some(next) = next else {
            return Err(ContractViolation::BufferOrder {
                read: self.read,
                write: self.write,
                capacity: self.capacity,
            });
        };
        let prev = self.read;
        self.read = next;
        if let Err(e) = self.check_order() {
            self.read = prev;
            return Err(e);
        }
        Ok(())
    }

    /// Slide unread bytes so the write head lands on an `alignment` boundary
    /// as close to the buffer edge as possible, freeing space for the next
    /// block-aligned fill.
    pub fn compact(&mut self, alignment: usize) -> Result<(), ContractViolation> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(ContractViolation::BadAlignment { alignment });
        }
        let len = self.readable_size();
        let span = round_up(len, alignment);
        if span > self.capacity {
            return Err(ContractViolation::BufferOrder {
                read: self.read,
                write: self.write,
                capacity: self.capacity,
            });
        }
        match self.orientation {
            Orientation::Forward => {
                let new_read = span - len;
                if new_read != self.read {
                    let (read, write) = (self.read, self.write);
                    self.mem_mut().copy_within(read..write, new_read);
                }
                self.read = new_read;
                self.write = span;
            }
            Orientation::Reverse => {
                let new_write = self.capacity - span;
                if new_write != self.write {
                    let (read, write) = (self.read, self.write);
                    self.mem_mut().copy_within(write..read, new_write);
                }
                self.write = new_write;
                self.read = new_write + len;
            }
        }
        Ok(())
    }
}
