//! crypto/operation.rs
//! Streaming cipher sessions bound to a key context.
//!
//! Lifecycle: `init` → `transform`* → `end`. A session keeps at most one
//! partial input block and one block of pending output, so callers may
//! hand it arbitrarily small cursors.
//!
//! Padding (PKCS, 1..=16 bytes of value n) is added on encrypt at end of
//! stream. On decrypt the last full block is held back until either more
//! input arrives or end-of-stream proves it is the last one.

use std::sync::Arc;

use crate::buffer::{
    ContractViolation, InputCursor, OutputCursor, Progress, ReverseInputCursor, ReverseOutputCursor, TransformStage,
};
use crate::constants::AES_BLOCK_SIZE;
use crate::crypto::cipher::{gf_double, gf_halve, Block, UnitCipher};
use crate::crypto::keys::KeyContext;
use crate::crypto::types::{CryptoError, KeyError};
use crate::envelope::CipherKind;

const BS: usize = AES_BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Keyed state for the data unit currently being processed.
struct UnitState {
    cipher: Option<UnitCipher>,
    key_index: Option<usize>,
    unit: Option<u64>,
}

impl UnitState {
    fn new() -> Self {
        Self { cipher: None, key_index: None, unit: None }
    }

    fn reset(&mut self) {
        self.unit = None;
    }

    /// Make sure the cipher for the unit containing `position` is loaded.
    /// Returns the unit's starting chain value or tweak when the unit
    /// changed.
    fn enter(&mut self, ctx: &KeyContext, position: u64) -> Result<Option<Block>, CryptoError> {
        let unit = ctx.unit_index(position);
        if self.unit == Some(unit) {
            return Ok(None);
        }
        let (k, i) = ctx.select_indices(unit)?;
        if self.key_index != Some(k) || self.cipher.is_none() {
            let cipher = UnitCipher::new(ctx.cipher(), ctx.key_at(k))
                .ok_or(KeyError::BadKeyMaterial { expected: ctx.key_len(), actual: ctx.key_at(k).len() })?;
            self.cipher = Some(cipher);
            self.key_index = Some(k);
        }
        self.unit = Some(unit);
        let cipher = self.cipher.as_ref().ok_or(KeyError::NoPairs)?;
        Ok(Some(cipher.unit_start_state(ctx.iv_at(i), unit)))
    }

    fn cipher(&self) -> Result<&UnitCipher, CryptoError> {
        self.cipher.as_ref().ok_or_else(|| KeyError::NoPairs.into())
    }
}

/// Forward streaming session.
pub struct CipherOperation {
    ctx: Arc<KeyContext>,
    direction: Direction,
    active: bool,
    finished: bool,
    /// Ciphertext offset of the next block to process.
    position: u64,
    unit: UnitState,
    state: Block,
    in_block: Block,
    in_len: usize,
    out_block: Block,
    out_start: usize,
    out_end: usize,
}

impl std::fmt::Debug for CipherOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherOperation")
            .field("direction", &self.direction)
            .field("active", &self.active)
            .field("finished", &self.finished)
            .field("position", &self.position)
            .finish()
    }
}

impl CipherOperation {
    pub fn new(ctx: Arc<KeyContext>, direction: Direction) -> Self {
        Self {
            ctx,
            direction,
            active: false,
            finished: false,
            position: 0,
            unit: UnitState::new(),
            state: [0u8; BS],
            in_block: [0u8; BS],
            in_len: 0,
            out_block: [0u8; BS],
            out_start: 0,
            out_end: 0,
        }
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn context(&self) -> &Arc<KeyContext> {
        &self.ctx
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Ciphertext offset reached so far.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Start a session at the given logical offsets. The ciphertext side
    /// decides the data unit: output for encrypt, input for decrypt.
    pub fn init(&mut self, output_position: u64, input_position: u64) -> Result<(), CryptoError> {
        if self.active {
            return Err(ContractViolation::OutOfSequence { operation: "init", state: "active" }.into());
        }
        let position = match self.direction {
            Direction::Encrypt => output_position,
            Direction::Decrypt => input_position,
        };
        if position % BS as u64 != 0 {
            return Err(CryptoError::Unaligned { len: position });
        }
        self.position = position;
        self.active = true;
        self.finished = false;
        self.in_len = 0;
        self.out_start = 0;
        self.out_end = 0;
        self.unit.reset();
        Ok(())
    }

    /// Finish the session. Fails if end-of-stream was never reached or
    /// output is still pending.
    pub fn end(&mut self) -> Result<(), CryptoError> {
        if !self.active {
            return Err(ContractViolation::OutOfSequence { operation: "end", state: "idle" }.into());
        }
        let complete = self.finished && self.out_start == self.out_end;
        self.abort();
        if !complete {
            return Err(ContractViolation::OutOfSequence { operation: "end", state: "stream not finished" }.into());
        }
        Ok(())
    }

    /// Drop in-flight state without any checks.
    pub fn abort(&mut self) {
        self.active = false;
        self.in_block = [0u8; BS];
        self.out_block = [0u8; BS];
        self.state = [0u8; BS];
        self.in_len = 0;
        self.out_start = 0;
        self.out_end = 0;
    }

    fn process(&mut self, block: &mut Block) -> Result<(), CryptoError> {
        if let Some(start) = self.unit.enter(&self.ctx, self.position)? {
            self.state = start;
        }
        let cipher = self.unit.cipher()?;
        match self.direction {
            Direction::Encrypt => cipher.encrypt(&mut self.state, block),
            Direction::Decrypt => cipher.decrypt(&mut self.state, block),
        }
        self.position += BS as u64;
        Ok(())
    }

    /// One-shot pass over whole blocks starting at `position`, with no
    /// padding and no buffering. Used for page-addressed access.
    pub fn process_in_place(&mut self, position: u64, data: &mut [u8]) -> Result<(), CryptoError> {
        if data.len() % BS != 0 {
            return Err(CryptoError::Unaligned { len: position + data.len() as u64 });
        }
        // Chaining state is only known at unit boundaries.
        if self.ctx.unit_start(position) != position {
            return Err(CryptoError::Unaligned { len: position });
        }
        self.position = position;
        self.unit.reset();
        for chunk in data.chunks_exact_mut(BS) {
            let mut block: Block = [0u8; BS];
            block.copy_from_slice(chunk);
            self.process(&mut block)?;
            chunk.copy_from_slice(&block);
        }
        Ok(())
    }

    fn holds_last_block(&self) -> bool {
        self.direction == Direction::Decrypt && self.ctx.padding()
    }

    pub fn transform(&mut self, out: &mut OutputCursor<'_>, input: &mut InputCursor<'_>) -> Result<Progress, CryptoError> {
        if !self.active {
            return Err(ContractViolation::OutOfSequence { operation: "transform", state: "idle" }.into());
        }
        loop {
            if self.out_start < self.out_end {
                let n = out.put(&self.out_block[self.out_start..self.out_end]);
                self.out_start += n;
                if self.out_start < self.out_end {
                    return Ok(Progress::OutputFull);
                }
            }
            if self.finished {
                out.mark_end_of_stream();
                return Ok(Progress::Done);
            }

            // Bulk path: whole blocks straight from input to output.
            if self.in_len == 0 {
                let keep = if self.holds_last_block() { BS } else { 0 };
                let avail = input.remaining().saturating_sub(keep);
                let n = (avail.min(out.remaining()) / BS) * BS;
                if n > 0 {
                    let src = &input.as_slice()[..n];
                    let dst = &mut out.space_mut()[..n];
                    for (s, d) in src.chunks_exact(BS).zip(dst.chunks_exact_mut(BS)) {
                        let mut block: Block = [0u8; BS];
                        block.copy_from_slice(s);
                        self.process(&mut block)?;
                        d.copy_from_slice(&block);
                    }
                    input.advance(n)?;
                    out.advance(n)?;
                    continue;
                }
            }

            let take = (BS - self.in_len).min(input.remaining());
            self.in_block[self.in_len..self.in_len + take].copy_from_slice(&input.as_slice()[..take]);
            input.advance(take)?;
            self.in_len += take;

            if self.in_len < BS {
                if input.is_end_of_stream() {
                    self.finish_partial()?;
                    continue;
                }
                return Ok(Progress::NeedInput);
            }

            if self.holds_last_block() && input.remaining() == 0 {
                if !input.is_end_of_stream() {
                    return Ok(Progress::NeedInput);
                }
                let mut block = self.in_block;
                self.process(&mut block)?;
                let pad = check_padding(&block)?;
                self.out_block = block;
                self.out_start = 0;
                self.out_end = BS - pad;
                self.in_len = 0;
                self.finished = true;
                continue;
            }

            if out.remaining() == 0 {
                return Ok(Progress::OutputFull);
            }
            let mut block = self.in_block;
            self.process(&mut block)?;
            self.in_len = 0;
            self.out_block = block;
            self.out_start = 0;
            self.out_end = BS;
        }
    }

    /// Input ended with `in_len < BS` bytes buffered.
    fn finish_partial(&mut self) -> Result<(), CryptoError> {
        match self.direction {
            Direction::Encrypt if self.ctx.padding() => {
                let pad = BS - self.in_len;
                let mut block = self.in_block;
                block[self.in_len..].fill(pad as u8);
                self.process(&mut block)?;
                self.out_block = block;
                self.out_start = 0;
                self.out_end = BS;
            }
            Direction::Decrypt if self.ctx.padding() => {
                // A padded stream always ends in a full block that the
                // hold-back path consumes; reaching here means it was empty
                // or cut short.
                return Err(if self.in_len == 0 {
                    CryptoError::BadPadding
                } else {
                    CryptoError::Unaligned { len: self.position + self.in_len as u64 }
                });
            }
            _ => {
                if self.in_len != 0 {
                    return Err(CryptoError::Unaligned { len: self.position + self.in_len as u64 });
                }
            }
        }
        self.in_len = 0;
        self.finished = true;
        Ok(())
    }
}

impl TransformStage for CipherOperation {
    type Error = CryptoError;

    fn transform(&mut self, out: &mut OutputCursor<'_>, input: &mut InputCursor<'_>) -> Result<Progress, Self::Error> {
        CipherOperation::transform(self, out, input)
    }
}

/// Validate PKCS padding on a decrypted last block; returns the pad length.
fn check_padding(block: &Block) -> Result<usize, CryptoError> {
    let n = block[BS - 1] as usize;
    if n == 0 || n > BS || block[BS - n..].iter().any(|&b| b as usize != n) {
        return Err(CryptoError::BadPadding);
    }
    Ok(n)
}

/// Backward decrypting session: consumes ciphertext from the tail toward
/// the start of the payload and produces plaintext in the same direction.
pub struct ReverseCipherOperation {
    ctx: Arc<KeyContext>,
    active: bool,
    finished: bool,
    /// Ciphertext offset just above the next block to consume.
    position: u64,
    /// The next block processed is the last block of the stream.
    at_tail: bool,
    unit: UnitState,
    /// CBC: IV of the current unit. XTS: tweak of the block at `tweak_pos`.
    unit_iv: Block,
    tweak: Block,
    tweak_pos: Option<u64>,
    /// CBC block waiting for its predecessor, with its offset.
    pending: Option<(Block, u64)>,
    in_block: Block,
    in_len: usize,
    out_buf: [u8; 2 * BS],
    out_lo: usize,
    out_hi: usize,
}

impl std::fmt::Debug for ReverseCipherOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseCipherOperation")
            .field("active", &self.active)
            .field("finished", &self.finished)
            .field("position", &self.position)
            .finish()
    }
}

impl ReverseCipherOperation {
    pub fn new(ctx: Arc<KeyContext>) -> Self {
        Self {
            ctx,
            active: false,
            finished: false,
            position: 0,
            at_tail: false,
            unit: UnitState::new(),
            unit_iv: [0u8; BS],
            tweak: [0u8; BS],
            tweak_pos: None,
            pending: None,
            in_block: [0u8; BS],
            in_len: 0,
            out_buf: [0u8; 2 * BS],
            out_lo: 2 * BS,
            out_hi: 2 * BS,
        }
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Start decrypting backward from ciphertext offset `end_position`,
    /// which must be the end of the stream.
    pub fn init(&mut self, end_position: u64) -> Result<(), CryptoError> {
        if self.active {
            return Err(ContractViolation::OutOfSequence { operation: "init", state: "active" }.into());
        }
        if end_position % BS as u64 != 0 {
            return Err(CryptoError::Unaligned { len: end_position });
        }
        self.position = end_position;
        self.at_tail = self.ctx.padding();
        self.active = true;
        self.finished = false;
        self.unit.reset();
        self.tweak_pos = None;
        self.pending = None;
        self.in_len = 0;
        self.out_lo = 2 * BS;
        self.out_hi = 2 * BS;
        Ok(())
    }

    pub fn end(&mut self) -> Result<(), CryptoError> {
        if !self.active {
            return Err(ContractViolation::OutOfSequence { operation: "end", state: "idle" }.into());
        }
        let complete = self.finished && self.out_lo == self.out_hi;
        self.abort();
        if !complete {
            return Err(ContractViolation::OutOfSequence { operation: "end", state: "stream not finished" }.into());
        }
        Ok(())
    }

    pub fn abort(&mut self) {
        self.active = false;
        self.pending = None;
        self.in_block = [0u8; BS];
        self.out_buf = [0u8; 2 * BS];
        self.tweak = [0u8; BS];
        self.unit_iv = [0u8; BS];
        self.in_len = 0;
        self.out_lo = 2 * BS;
        self.out_hi = 2 * BS;
    }

    /// Prepend plaintext below what is already pending.
    fn emit(&mut self, block: &Block) -> Result<(), CryptoError> {
        let mut len = BS;
        if self.at_tail {
            len -= check_padding(block)?;
            self.at_tail = false;
        }
        self.out_lo -= len;
        self.out_buf[self.out_lo..self.out_lo + len].copy_from_slice(&block[..len]);
        Ok(())
    }

    fn load(&mut self, block_pos: u64) -> Result<(), CryptoError> {
        if let Some(start) = self.unit.enter(&self.ctx, block_pos)? {
            self.unit_iv = start;
            self.tweak_pos = None;
        }
        Ok(())
    }

    fn handle_block(&mut self, block: Block) -> Result<(), CryptoError> {
        let q = self.position - BS as u64;
        self.position = q;
        self.load(q)?;
        let unit_start = self.ctx.unit_start(q);
        match self.ctx.cipher() {
            CipherKind::Cbc => {
                if let Some((mut c, _)) = self.pending.take() {
                    self.unit.cipher()?.cbc_decrypt_with(&block, &mut c);
                    self.emit(&c)?;
                }
                if q == unit_start {
                    let mut p = block;
                    let iv = self.unit_iv;
                    self.unit.cipher()?.cbc_decrypt_with(&iv, &mut p);
                    self.emit(&p)?;
                } else {
                    self.pending = Some((block, q));
                }
            }
            CipherKind::Xts => {
                match self.tweak_pos {
                    Some(prev) if prev == q + BS as u64 => gf_halve(&mut self.tweak),
                    _ => {
                        self.tweak = self.unit_iv;
                        for _ in 0..(q - unit_start) / BS as u64 {
                            gf_double(&mut self.tweak);
                        }
                    }
                }
                self.tweak_pos = Some(q);
                let mut p = block;
                let tweak = self.tweak;
                self.unit.cipher()?.xts_decrypt_with(&tweak, &mut p);
                self.emit(&p)?;
            }
            CipherKind::None => return Err(KeyError::NoCipher.into()),
        }
        Ok(())
    }

    pub fn transform(
        &mut self,
        out: &mut ReverseOutputCursor<'_>,
        input: &mut ReverseInputCursor<'_>,
    ) -> Result<Progress, CryptoError> {
        if !self.active {
            return Err(ContractViolation::OutOfSequence { operation: "transform", state: "idle" }.into());
        }
        loop {
            if self.out_lo < self.out_hi {
                let n = out.put(&self.out_buf[self.out_lo..self.out_hi]);
                self.out_hi -= n;
                if self.out_lo < self.out_hi {
                    return Ok(Progress::OutputFull);
                }
                self.out_lo = 2 * BS;
                self.out_hi = 2 * BS;
            }
            if self.finished {
                out.mark_end_of_stream();
                return Ok(Progress::Done);
            }

            let need = BS - self.in_len;
            let take = need.min(input.remaining());
            let src = input.as_slice();
            let top = src.len();
            self.in_block[need - take..need].copy_from_slice(&src[top - take..]);
            input.advance(take)?;
            self.in_len += take;

            if self.in_len < BS {
                if input.is_end_of_stream() {
                    if self.in_len != 0 {
                        return Err(CryptoError::Unaligned { len: self.position });
                    }
                    if self.at_tail {
                        return Err(CryptoError::BadPadding);
                    }
                    if self.pending.is_some() || self.position != 0 {
                        return Err(CryptoError::Unaligned { len: self.position });
                    }
                    self.finished = true;
                    continue;
                }
                return Ok(Progress::NeedInput);
            }

            let block = self.in_block;
            self.in_len = 0;
            self.handle_block(block)?;
        }
    }
}
