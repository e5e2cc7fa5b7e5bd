// Envelope codecs:

// * format detection on partial and complete prefixes
// * legacy header / trailer framing, including zero-valued payload tails
// * extensible header in both byte orders, older and newer fixed layouts
// * extensible trailer padding, split output and validation

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use xfrm_core::buffer::{InputCursor, OutputCursor, ReverseInputCursor};
    use xfrm_core::envelope::header::{header_size_for, key_material_size_for, trailer_max_size_for};
    use xfrm_core::envelope::{
        detect_format, legacy, ChecksumKind, CipherKind, CompressionMethod, Detect, Endian, EnvelopeFormat,
        FormatError, KeyMethod, LegacyTrailer, PaddingKind, Presence, XfrmFlags, XfrmHeader, XfrmTrailer,
        FIXED_HEADER_SIZE, FIXED_TRAILER_SIZE, LEGACY_HEADER,
    };

    // ------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------

    fn compressed_flags() -> XfrmFlags {
        XfrmFlags {
            file_checksum: ChecksumKind::Crc32,
            data_checksum: ChecksumKind::Crc32,
            compression: CompressionMethod::Deflate,
            ..XfrmFlags::default()
        }
    }

    fn encode(h: &XfrmHeader) -> Vec<u8> {
        let mut buf = vec![0u8; h.header_size as usize];
        let n = h.write(&mut OutputCursor::new(&mut buf)).unwrap();
        assert_eq!(n, buf.len());
        buf
    }

    fn decode(buf: &[u8]) -> XfrmHeader {
        let mut input = InputCursor::new(buf);
        let h = XfrmHeader::read(&mut input).unwrap();
        assert_eq!(input.consumed(), h.header_size as usize);
        h
    }

    fn put_u32(buf: &mut [u8], at: usize, v: u32, order: Endian) {
        let bytes = match order {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        buf[at..at + 4].copy_from_slice(&bytes);
    }

    // ## 1️⃣ Detection

    #[test]
    fn detect_each_format() {
        assert_eq!(detect_format(&LEGACY_HEADER[..8]), (EnvelopeFormat::Legacy, Detect::Yes));
        assert_eq!(detect_format(b"NDBXFRM1rest"), (EnvelopeFormat::Extensible, Detect::Yes));
        assert_eq!(detect_format(b"plain text"), (EnvelopeFormat::Raw, Detect::No));
    }

    #[test]
    fn detect_needs_more_on_prefix() {
        assert_eq!(detect_format(b"AZ").1, Detect::NeedMoreBytes);
        assert_eq!(detect_format(b"NDBX").1, Detect::NeedMoreBytes);
        assert_eq!(detect_format(b"").1, Detect::NeedMoreBytes);
    }

    // ## 2️⃣ Legacy framing

    #[test]
    fn legacy_header_round_trip() {
        let mut buf = [0u8; 512];
        assert_eq!(legacy::write_header(&mut OutputCursor::new(&mut buf)).unwrap(), 512);
        let mut input = InputCursor::new(&buf);
        assert_eq!(legacy::read_header(&mut input).unwrap(), 512);
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn legacy_header_mismatch_reports_offset() {
        let mut buf = LEGACY_HEADER;
        buf[100] = 7;
        let err = legacy::read_header(&mut InputCursor::new(&buf)).unwrap_err();
        assert!(matches!(err, FormatError::LegacyHeaderMismatch { offset: 100 }));
    }

    #[test]
    fn legacy_trailer_after_zero_tail_payload() {
        // Payload that itself ends in zeros must not confuse the scan.
        let mut file = vec![0xABu8; 60];
        file.extend_from_slice(&[0u8; 40]);
        let trailer = LegacyTrailer { data_checksum: 0xDEAD_BEEF, data_size: 4242 };
        let offset = 512 + file.len() as u64;
        let mut buf = vec![0u8; 600];
        let n = trailer.write(offset, &mut OutputCursor::new(&mut buf), None).unwrap();
        assert_eq!(n, 12 + LegacyTrailer::pad_for(offset));
        assert_eq!((offset + n as u64) % 512, 0);
        file.extend_from_slice(&buf[..n]);

        let mut tail = ReverseInputCursor::last(&file);
        let back = LegacyTrailer::read(&mut tail).unwrap();
        assert_eq!(back, trailer);
        assert_eq!(tail.consumed(), n);
        assert_eq!(tail.remaining(), 100);
    }

    #[test]
    fn legacy_trailer_split_across_cursors() {
        let trailer = LegacyTrailer { data_checksum: 1, data_size: 2 };
        let offset = 512 + 7;
        let total = 12 + LegacyTrailer::pad_for(offset);
        let mut a = [0u8; 5];
        let mut b = vec![0u8; total];
        let mut out = OutputCursor::new(&mut a);
        let mut extra = OutputCursor::new(&mut b);
        assert_eq!(trailer.write(offset, &mut out, Some(&mut extra)).unwrap(), total);
        assert_eq!(out.produced(), 5);
        assert_eq!(extra.produced(), total - 5);
    }

    #[test]
    fn legacy_trailer_missing() {
        let zeros = [0u8; 64];
        let err = LegacyTrailer::read(&mut ReverseInputCursor::last(&zeros)).unwrap_err();
        assert!(matches!(err, FormatError::MissingTrailer));

        let junk = [1u8; 64];
        let err = LegacyTrailer::read(&mut ReverseInputCursor::last(&junk)).unwrap_err();
        assert!(matches!(err, FormatError::BadMagic { .. }));
    }

    #[test]
    fn legacy_trailer_validate_size() {
        let t = LegacyTrailer { data_checksum: 0, data_size: 10 };
        t.validate(10).unwrap();
        assert!(matches!(t.validate(11), Err(FormatError::DataSizeMismatch { declared: 10, actual: 11 })));
    }

    // ## 3️⃣ Extensible header

    #[test]
    fn header_sizes_follow_block() {
        assert_eq!(header_size_for(0, 512), 512);
        assert_eq!(header_size_for(0, 0), FIXED_HEADER_SIZE);
        assert_eq!(header_size_for(500, 512), 1024);
        assert_eq!(trailer_max_size_for(512), 560);
        assert_eq!(trailer_max_size_for(0), FIXED_TRAILER_SIZE as u32);
        assert_eq!(key_material_size_for(CipherKind::Cbc, KeyMethod::Pbkdf2Sha256, 3), 96);
        assert_eq!(key_material_size_for(CipherKind::Xts, KeyMethod::AesKeyWrap256, 2), 32 + 2 * 80 + 8);
    }

    #[test]
    fn header_round_trip_both_orders() {
        let mut little = XfrmHeader::new(Endian::Little, compressed_flags(), 512);
        little.declare_data_size(123_456);
        let mut big = little.clone();
        big.order = Endian::Big;

        let a = encode(&little);
        let b = encode(&big);
        assert_ne!(a, b);
        assert_eq!(&a[..8], b"NDBXFRM1");
        assert_eq!(&b[..8], b"NDBXFRM1");

        assert_eq!(decode(&a), little);
        assert_eq!(decode(&b), big);
        assert_eq!(decode(&b).declared_data_size(), Some(123_456));
        assert_eq!(XfrmHeader::peek_size(&b[..24]).unwrap(), 512);
    }

    #[test]
    fn header_with_key_material() {
        let flags = XfrmFlags {
            cipher: CipherKind::Xts,
            key_method: KeyMethod::Pbkdf2Sha256,
            cipher_padding: PaddingKind::Pkcs,
            ..compressed_flags()
        };
        let mut h = XfrmHeader::new(Endian::native(), flags, 4096);
        h.kdf_iter_count = 1000;
        h.data_unit_size = 512;
        h.key_material_count = 2;
        h.key_material_size = 64;
        h.set_octets(vec![7u8; 64]).unwrap();
        let back = decode(&encode(&h));
        assert_eq!(back.key_material(), &[7u8; 64][..]);
        assert_eq!(back.header_size, 4096);
        assert_eq!(back, h);
    }

    #[test]
    fn header_from_older_writer_is_zero_extended() {
        let h = XfrmHeader::new(Endian::Little, compressed_flags(), 0);
        let mut bytes = encode(&h);
        assert_eq!(bytes.len(), FIXED_HEADER_SIZE);
        // An older layout without the last two key-material words.
        bytes.truncate(96);
        put_u32(&mut bytes, 16, 96, Endian::Little);
        put_u32(&mut bytes, 20, 96, Endian::Little);
        let back = decode(&bytes);
        assert_eq!(back.fixed_header_size, 96);
        assert_eq!(back.flags, h.flags);
        assert_eq!(back.key_material_position, 0);
    }

    #[test]
    fn header_from_newer_writer_needs_zero_extension() {
        let h = XfrmHeader::new(Endian::Big, compressed_flags(), 0);
        let base = encode(&h);
        let mut bytes = base[..FIXED_HEADER_SIZE].to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        put_u32(&mut bytes, 16, 112, Endian::Big);
        put_u32(&mut bytes, 20, 112, Endian::Big);
        assert_eq!(decode(&bytes).fixed_header_size, 112);

        bytes[108] = 1;
        let err = XfrmHeader::read(&mut InputCursor::new(&bytes)).unwrap_err();
        assert!(matches!(err, FormatError::NonZero { .. }));
    }

    #[test]
    fn header_rejects_bad_magic_and_marker() {
        let h = XfrmHeader::new(Endian::Little, compressed_flags(), 512);
        let mut bytes = encode(&h);
        bytes[9] ^= 0xFF;
        assert!(matches!(XfrmHeader::read(&mut InputCursor::new(&bytes)), Err(FormatError::BadEndianMarker { .. })));
        bytes[0] = b'X';
        assert!(matches!(XfrmHeader::peek_size(&bytes), Err(FormatError::BadMagic { .. })));
    }

    #[test]
    fn header_rejects_truncation() {
        let h = XfrmHeader::new(Endian::Little, compressed_flags(), 512);
        let bytes = encode(&h);
        let err = XfrmHeader::read(&mut InputCursor::new(&bytes[..300])).unwrap_err();
        assert!(matches!(err, FormatError::Truncated { need: 512, have: 300, .. }));
    }

    #[test]
    fn header_rejects_unknown_stamp() {
        let mut h = XfrmHeader::new(Endian::Little, compressed_flags(), 512);
        h.compress_dbg_header_stamp = 99;
        let mut buf = vec![0u8; 512];
        let err = h.write(&mut OutputCursor::new(&mut buf)).unwrap_err();
        assert!(matches!(err, FormatError::UnknownStamp { value: 99, .. }));
    }

    #[test]
    fn header_rejects_cipher_without_method() {
        let flags = XfrmFlags { cipher: CipherKind::Cbc, ..compressed_flags() };
        let mut h = XfrmHeader::new(Endian::Little, flags, 512);
        h.kdf_iter_count = 10;
        let err = h.validate().unwrap_err();
        assert!(matches!(err, FormatError::Inconsistent(_)));
    }

    #[test]
    fn header_write_needs_room() {
        let h = XfrmHeader::new(Endian::Little, compressed_flags(), 512);
        let mut buf = vec![0u8; 100];
        let err = h.write(&mut OutputCursor::new(&mut buf)).unwrap_err();
        assert!(matches!(err, FormatError::NoSpace { need: 512, have: 100, .. }));
    }

    proptest! {
        #[test]
        fn prop_header_round_trip(
            big in any::<bool>(),
            block in 0u32..=64,
            size in any::<u64>(),
            checksum in any::<u32>(),
        ) {
            let order = if big { Endian::Big } else { Endian::Little };
            let mut flags = compressed_flags();
            flags.presence = Presence::DATA_SIZE_IN_HEADER | Presence::DATA_CHECKSUM_IN_HEADER;
            let mut h = XfrmHeader::new(order, flags, block * 8);
            h.data_size = size;
            h.data_checksum = checksum;
            let back = decode(&encode(&h));
            prop_assert_eq!(back, h);
        }
    }

    // ## 4️⃣ Extensible trailer

    #[test]
    fn trailer_pad_lands_on_block() {
        let flags = compressed_flags();
        let mut t = XfrmTrailer::new(Endian::Little, flags);
        t.data_size = 77;
        t.data_checksum = 0x1111_2222;
        t.file_checksum = 0x3333_4444;
        let offset = 1000;
        let mut buf = vec![0u8; 1024];
        let n = t.write(offset, 512, &mut OutputCursor::new(&mut buf), None).unwrap();
        assert_eq!((offset + n as u64) % 512, 0);
        assert_eq!(n, 536);
        assert_eq!(t.trailer_size as usize, n);
        assert_eq!(&buf[n - 8..n], b"DNMRFXBN");

        let mut cursor = ReverseInputCursor::last(&buf[..n]);
        let back = XfrmTrailer::read(&mut cursor).unwrap();
        assert_eq!(back, t);
        assert_eq!(cursor.consumed(), n);
        back.validate(&flags, trailer_max_size_for(512)).unwrap();
    }

    #[test]
    fn trailer_split_output_big_endian() {
        let mut t = XfrmTrailer::new(Endian::Big, compressed_flags());
        t.data_size = u64::MAX - 1;
        let mut head = [0u8; 20];
        let mut spill = vec![0u8; 600];
        let mut out = OutputCursor::new(&mut head);
        let mut extra = OutputCursor::new(&mut spill);
        let n = t.write(3, 512, &mut out, Some(&mut extra)).unwrap();
        assert_eq!(out.produced(), 20);
        let spilled = extra.produced();
        assert_eq!(20 + spilled, n);

        let mut joined = head.to_vec();
        joined.extend_from_slice(&spill[..spilled]);
        let back = XfrmTrailer::read(&mut ReverseInputCursor::last(&joined)).unwrap();
        assert_eq!(back.order, Endian::Big);
        assert_eq!(back.data_size, u64::MAX - 1);
    }

    #[test]
    fn trailer_without_room_fails() {
        let mut t = XfrmTrailer::new(Endian::Little, compressed_flags());
        let mut small = [0u8; 16];
        let err = t.write(0, 0, &mut OutputCursor::new(&mut small), None).unwrap_err();
        assert!(matches!(err, FormatError::NoSpace { .. }));
    }

    #[test]
    fn trailer_validate_against_header() {
        let flags = compressed_flags();
        let t = XfrmTrailer::new(Endian::Little, flags);
        let other = XfrmFlags { compression: CompressionMethod::None, ..flags };
        assert!(matches!(t.validate(&other, 560), Err(FormatError::Inconsistent(_))));

        let mut big = t;
        big.trailer_size = 600;
        assert!(matches!(big.validate(&flags, 560), Err(FormatError::SizeOutOfBounds { .. })));
    }

    #[test]
    fn trailer_rejects_nonzero_pad() {
        let mut t = XfrmTrailer::new(Endian::Little, compressed_flags());
        let mut buf = vec![0u8; 600];
        let n = t.write(0, 512, &mut OutputCursor::new(&mut buf), None).unwrap();
        buf[0] = 1;
        let err = XfrmTrailer::read(&mut ReverseInputCursor::last(&buf[..n])).unwrap_err();
        assert!(matches!(err, FormatError::NonZero { .. }));
    }
}
