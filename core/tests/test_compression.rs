// Streaming DEFLATE stage:

// * round trip through tiny cursors, with and without block padding
// * truncated and over-long compressed input
// * arena reservation and LIFO release

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use xfrm_core::buffer::{InputCursor, OutputCursor, Progress};
    use xfrm_core::compression::{CompressionError, DeflateStage, ScratchArena};
    use xfrm_core::constants::{DEFLATE_DECODE_WORKSET, DEFLATE_ENCODE_WORKSET, MIN_DEFLATE_ARENA};

    fn stage() -> DeflateStage {
        let mut s = DeflateStage::new(6);
        s.bind_memory(MIN_DEFLATE_ARENA).unwrap();
        s
    }

    /// Drive one session to completion, feeding `chunk` bytes at a time
    /// and draining into an output window of `window` bytes.
    fn run(s: &mut DeflateStage, data: &[u8], chunk: usize, window: usize) -> Result<Vec<u8>, CompressionError> {
        let mut result = Vec::new();
        let mut fed = 0;
        loop {
            let end = (fed + chunk).min(data.len());
            let last = end == data.len();
            let mut input = if last { InputCursor::last(&data[fed..end]) } else { InputCursor::new(&data[fed..end]) };
            let mut space = vec![0u8; window];
            let mut out = OutputCursor::new(&mut space);
            let progress = s.step(&mut out, &mut input)?;
            result.extend_from_slice(out.produced_bytes());
            fed += input.consumed();
            if progress == Progress::Done {
                return Ok(result);
            }
        }
    }

    fn encode(data: &[u8], padding: bool) -> Vec<u8> {
        let mut s = stage();
        s.begin_encode(padding).unwrap();
        let out = run(&mut s, data, 1000, 333).unwrap();
        assert!(s.is_finished());
        s.end().unwrap();
        out
    }

    fn sample() -> Vec<u8> {
        (0..50_000u32).map(|i| (i % 251) as u8 ^ (i / 700) as u8).collect()
    }

    #[test]
    fn round_trip_unpadded() {
        let data = sample();
        let packed = encode(&data, false);
        assert!(packed.len() < data.len());

        let mut s = stage();
        s.begin_decode(false).unwrap();
        let back = run(&mut s, &packed, 7, 64).unwrap();
        s.end().unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn padding_fills_last_block() {
        let data = sample();
        let packed = encode(&data, true);
        assert_eq!(packed.len() % 16, 0);
        let n = *packed.last().unwrap() as usize;
        assert!((1..=16).contains(&n));
        assert!(packed[packed.len() - n..].iter().all(|&b| b as usize == n));

        let mut s = stage();
        s.begin_decode(true).unwrap();
        let back = run(&mut s, &packed, 5, 100).unwrap();
        s.end().unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn empty_input_still_yields_a_stream() {
        let packed = encode(b"", true);
        assert!(!packed.is_empty());
        assert_eq!(packed.len() % 16, 0);

        let mut s = stage();
        s.begin_decode(true).unwrap();
        assert!(run(&mut s, &packed, 3, 8).unwrap().is_empty());
        s.end().unwrap();
    }

    #[test]
    fn truncated_stream_is_reported() {
        let packed = encode(&sample(), false);
        let cut = &packed[..packed.len() / 2];
        let mut s = stage();
        s.begin_decode(false).unwrap();
        let err = run(&mut s, cut, 64, 4096).unwrap_err();
        assert!(matches!(err, CompressionError::Truncated));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut packed = encode(b"some text some text", false);
        packed.extend_from_slice(b"junk");
        let mut s = stage();
        s.begin_decode(false).unwrap();
        let err = run(&mut s, &packed, 1024, 1024).unwrap_err();
        assert!(matches!(err, CompressionError::TrailingData { extra: 4 }));
    }

    #[test]
    fn corrupted_padding_is_rejected() {
        let mut packed = encode(b"padded payload", true);
        let last = packed.len() - 1;
        packed[last] ^= 0x40;
        let mut s = stage();
        s.begin_decode(true).unwrap();
        let err = run(&mut s, &packed, 1024, 1024).unwrap_err();
        assert!(matches!(err, CompressionError::BadPadding));
    }

    #[test]
    fn session_lifecycle_is_checked() {
        let mut s = DeflateStage::new(1);
        assert!(matches!(s.begin_encode(false), Err(CompressionError::NoArena)));
        assert!(matches!(
            s.bind_memory(1024),
            Err(CompressionError::ArenaTooSmall { size: 1024, .. })
        ));

        let mut s = stage();
        assert!(matches!(s.end(), Err(CompressionError::NotActive)));
        s.begin_decode(false).unwrap();
        assert!(s.is_active());
        assert_eq!(s.arena().unwrap().in_use(), DEFLATE_DECODE_WORKSET);
        assert!(matches!(s.begin_encode(false), Err(CompressionError::AlreadyActive)));
        s.end().unwrap();
        assert!(s.arena().unwrap().is_drained());

        s.begin_encode(false).unwrap();
        assert_eq!(s.arena().unwrap().in_use(), DEFLATE_ENCODE_WORKSET);
        s.end().unwrap();
    }

    #[test]
    fn arena_frees_in_reverse_order() {
        let mut arena = ScratchArena::new(256);
        let a = arena.alloc(10, 1).unwrap();
        let b = arena.alloc(20, 16).unwrap();
        assert_eq!(b.offset(), 16);
        assert_eq!(arena.in_use(), 36);
        assert_eq!(arena.live_blocks(), 2);

        assert!(matches!(arena.free(a), Err(CompressionError::ArenaOrder { block_end: 10, top: 36 })));
        arena.free(b).unwrap();
        assert_eq!(arena.in_use(), 10);

        let big = arena.alloc(1000, 1);
        assert!(matches!(big, Err(CompressionError::ArenaExhausted { requested: 1000, .. })));
    }

    #[test]
    fn arena_budget_is_bookkeeping_only() {
        // A budget far beyond memory still binds: nothing is allocated for it.
        let mut s = DeflateStage::new(6);
        s.bind_memory(usize::MAX / 2).unwrap();
        s.begin_encode(false).unwrap();
        assert_eq!(s.arena().unwrap().available(), usize::MAX / 2 - DEFLATE_ENCODE_WORKSET);
        let out = run(&mut s, b"abcabcabc", 4, 64).unwrap();
        assert!(!out.is_empty());
        s.end().unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_round_trip_any_chunking(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            chunk in 1usize..300,
            window in 1usize..300,
            padding in any::<bool>(),
        ) {
            let mut s = stage();
            s.begin_encode(padding).unwrap();
            let packed = run(&mut s, &data, chunk, window).unwrap();
            s.end().unwrap();

            s.begin_decode(padding).unwrap();
            let back = run(&mut s, &packed, window, chunk).unwrap();
            s.end().unwrap();
            prop_assert_eq!(back, data);
        }
    }
}
