//! buffer/cursor.rs
//! Bounded views over caller-owned memory.
//!
//! Four cursor kinds, forward/backward × input/output. A cursor borrows
//! its region for a single stage invocation and never owns it. Forward
//! cursors move `begin` upward toward `end`; reverse cursors move `begin`
//! downward, so bytes produced by a reverse output cursor end up in
//! natural order at the top of the region.

use crate::buffer::types::{ContractViolation, CursorState, Progress};

/// Forward read view: unread bytes are `buf[begin..end]`.
#[derive(Debug)]
pub struct InputCursor<'a> {
    buf: &'a [u8],
    begin: usize,
    end: usize,
    start: usize,
    base: usize,
    eos: bool,
}

impl<'a> InputCursor<'a> {
    /// View over the whole slice. End-of-stream is not set.
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_base(buf, 0, false)
    }

    /// View over the whole slice that is also the last input ever.
    pub fn last(buf: &'a [u8]) -> Self {
        Self::with_base(buf, 0, true)
    }

    pub(crate) fn with_base(buf: &'a [u8], base: usize, eos: bool) -> Self {
        Self { end: buf.len(), buf, begin: 0, start: 0, base, eos }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.end - self.begin
    }

    #[inline]
    pub fn as_slice(&self) -> &'a [u8] {
        &self.buf[self.begin..self.end]
    }

    /// Bytes consumed since the cursor was created.
    #[inline]
    pub fn consumed(&self) -> usize {
        self.begin - self.start
    }

    /// The bytes consumed since the cursor was created.
    pub fn consumed_bytes(&self) -> &'a [u8] {
        &self.buf[self.start..self.begin]
    }

    pub fn advance(&mut self, n: usize) -> Result<(), ContractViolation> {
        if n > self.remaining() {
            return Err(ContractViolation::AdvanceOverrun { requested: n, remaining: self.remaining() });
        }
        self.begin += n;
        Ok(())
    }

    /// Shrink the view from the far edge, e.g. to hide a trailer.
    pub fn reduce(&mut self, n: usize) -> Result<(), ContractViolation> {
        if n > self.remaining() {
            return Err(ContractViolation::ReduceOverrun { requested: n, remaining: self.remaining() });
        }
        self.end -= n;
        Ok(())
    }

    #[inline]
    pub fn mark_end_of_stream(&mut self) {
        self.eos = true;
    }

    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.eos
    }

    /// End-of-stream and nothing left to consume.
    #[inline]
    pub fn is_drained(&self) -> bool {
        self.eos && self.remaining() == 0
    }

    pub fn state(&self) -> CursorState {
        CursorState { base: self.base, moved: self.consumed(), end_of_stream: self.eos }
    }

    /// Copy as much as fits into `out`, advancing both.
    pub fn copy_into(&mut self, out: &mut OutputCursor<'_>) -> Progress {
        let n = self.remaining().min(out.remaining());
        out.space_mut()[..n].copy_from_slice(&self.buf[self.begin..self.begin + n]);
        self.begin += n;
        out.begin += n;
        if self.remaining() > 0 {
            Progress::OutputFull
        } else if self.eos {
            out.mark_end_of_stream();
            Progress::Done
        } else {
            Progress::NeedInput
        }
    }
}

/// Forward write view: free space is `buf[begin..end]`.
#[derive(Debug)]
pub struct OutputCursor<'a> {
    buf: &'a mut [u8],
    begin: usize,
    end: usize,
    start: usize,
    base: usize,
    eos: bool,
}

impl<'a> OutputCursor<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self::with_base(buf, 0)
    }

    pub(crate) fn with_base(buf: &'a mut [u8], base: usize) -> Self {
        Self { end: buf.len(), buf, begin: 0, start: 0, base, eos: false }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.end - self.begin
    }

    #[inline]
    pub fn space_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.begin..self.end]
    }

    /// Bytes produced since the cursor was created.
    #[inline]
    pub fn produced(&self) -> usize {
        self.begin - self.start
    }

    pub fn produced_bytes(&self) -> &[u8] {
        &self.buf[self.start..self.begin]
    }

    pub fn advance(&mut self, n: usize) -> Result<(), ContractViolation> {
        if n > self.remaining() {
            return Err(ContractViolation::AdvanceOverrun { requested: n, remaining: self.remaining() });
        }
        self.begin += n;
        Ok(())
    }

    pub fn reduce(&mut self, n: usize) -> Result<(), ContractViolation> {
        if n > self.remaining() {
            return Err(ContractViolation::ReduceOverrun { requested: n, remaining: self.remaining() });
        }
        self.end -= n;
        Ok(())
    }

    /// Copy as much of `data` as fits and return how many bytes went in.
    pub fn put(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        self.buf[self.begin..self.begin + n].copy_from_slice(&data[..n]);
        self.begin += n;
        n
    }

    /// Producer side: no further bytes will be written through this cursor.
    #[inline]
    pub fn mark_end_of_stream(&mut self) {
        self.eos = true;
    }

    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.eos
    }

    pub fn state(&self) -> CursorState {
        CursorState { base: self.base, moved: self.produced(), end_of_stream: self.eos }
    }
}

/// Backward read view: unread bytes are `buf[end..begin]`, consumed from
/// the top.
#[derive(Debug)]
pub struct ReverseInputCursor<'a> {
    buf: &'a [u8],
    begin: usize,
    end: usize,
    start: usize,
    base: usize,
    eos: bool,
}

impl<'a> ReverseInputCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_base(buf, buf.len(), false)
    }

    pub fn last(buf: &'a [u8]) -> Self {
        Self::with_base(buf, buf.len(), true)
    }

    pub(crate) fn with_base(buf: &'a [u8], base: usize, eos: bool) -> Self {
        let top = buf.len();
        Self { buf, begin: top, end: 0, start: top, base, eos }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.begin - self.end
    }

    /// Unread bytes in natural order; the next byte consumed is the last.
    #[inline]
    pub fn as_slice(&self) -> &'a [u8] {
        &self.buf[self.end..self.begin]
    }

    #[inline]
    pub fn consumed(&self) -> usize {
        self.start - self.begin
    }

    pub fn consumed_bytes(&self) -> &'a [u8] {
        &self.buf[self.begin..self.start]
    }

    pub fn advance(&mut self, n: usize) -> Result<(), ContractViolation> {
        if n > self.remaining() {
            return Err(ContractViolation::AdvanceOverrun { requested: n, remaining: self.remaining() });
        }
        self.begin -= n;
        Ok(())
    }

    pub fn reduce(&mut self, n: usize) -> Result<(), ContractViolation> {
        if n > self.remaining() {
            return Err(ContractViolation::ReduceOverrun { requested: n, remaining: self.remaining() });
        }
        self.end += n;
        Ok(())
    }

    #[inline]
    pub fn mark_end_of_stream(&mut self) {
        self.eos = true;
    }

    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.eos
    }

    #[inline]
    pub fn is_drained(&self) -> bool {
        self.eos && self.remaining() == 0
    }

    pub fn state(&self) -> CursorState {
        CursorState { base: self.base, moved: self.consumed(), end_of_stream: self.eos }
    }

    pub fn copy_into(&mut self, out: &mut ReverseOutputCursor<'_>) -> Progress {
        let n = self.remaining().min(out.remaining());
        let src = &self.buf[self.begin - n..self.begin];
        out.buf[out.begin - n..out.begin].copy_from_slice(src);
        self.begin -= n;
        out.begin -= n;
        if self.remaining() > 0 {
            Progress::OutputFull
        } else if self.eos {
            out.mark_end_of_stream();
            Progress::Done
        } else {
            Progress::NeedInput
        }
    }
}

/// Backward write view: free space is `buf[end..begin]`, filled downward.
#[derive(Debug)]
pub struct ReverseOutputCursor<'a> {
    buf: &'a mut [u8],
    begin: usize,
    end: usize,
    start: usize,
    base: usize,
    eos: bool,
}

impl<'a> ReverseOutputCursor<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        let top = buf.len();
        Self::with_base(buf, top)
    }

    pub(crate) fn with_base(buf: &'a mut [u8], base: usize) -> Self {
        let top = buf.len();
        Self { buf, begin: top, end: 0, start: top, base, eos: false }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.begin - self.end
    }

    #[inline]
    pub fn space_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.end..self.begin]
    }

    #[inline]
    pub fn produced(&self) -> usize {
        self.start - self.begin
    }

    /// Produced bytes in natural order.
    pub fn produced_bytes(&self) -> &[u8] {
        &self.buf[self.begin..self.start]
    }

    pub fn advance(&mut self, n: usize) -> Result<(), ContractViolation> {
        if n > self.remaining() {
            return Err(ContractViolation::AdvanceOverrun { requested: n, remaining: self.remaining() });
        }
        self.begin -= n;
        Ok(())
    }

    pub fn reduce(&mut self, n: usize) -> Result<(), ContractViolation> {
        if n > self.remaining() {
            return Err(ContractViolation::ReduceOverrun { requested: n, remaining: self.remaining() });
        }
        self.end += n;
        Ok(())
    }

    /// Place the tail of `data` directly below what was produced so far.
    pub fn put(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        self.buf[self.begin - n..self.begin].copy_from_slice(&data[data.len() - n..]);
        self.begin -= n;
        n
    }

    #[inline]
    pub fn mark_end_of_stream(&mut self) {
        self.eos = true;
    }

    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.eos
    }

    pub fn state(&self) -> CursorState {
        CursorState { base: self.base, moved: self.produced(), end_of_stream: self.eos }
    }
}
