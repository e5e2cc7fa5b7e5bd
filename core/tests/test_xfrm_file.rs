// Transformed files end to end:

// * write / reopen / read across every compression × cipher combination
// * checksum and size verification at close
// * near misses on missing or wrong passwords
// * backward reads, page access on declared-size files
// * contract violations halting a file
// * the same flow on a real file on disk

#[cfg(test)]
mod tests {
    use xfrm_core::buffer::{InputCursor, OutputCursor, Progress, ReverseOutputCursor};
    use xfrm_core::config::{CreateOptions, KeyCount, XfrmConfig};
    use xfrm_core::crypto::{CryptoError, Direction, KeyError};
    use xfrm_core::envelope::{CipherKind, EnvelopeFormat, FormatError, KeyMethod, KeySelection};
    use xfrm_core::file::{FileHandle, FileMode, MemoryFile, OpenOutcome, OsFile, XfrmFile};
    use xfrm_core::types::XfrmError;

    const PASSWORD: &str = "swordfish";

    // ------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------

    fn cfg() -> XfrmConfig {
        XfrmConfig { kdf_iter_count: 1000, auto_key_count: 4, buffer_size: 4096, ..XfrmConfig::default() }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 7) % 256) as u8 ^ ((i / 1000) as u8)).collect()
    }

    fn write_all<F: FileHandle>(file: &mut XfrmFile<F>, data: &[u8], chunk: usize) {
        for piece in data.chunks(chunk) {
            let mut input = InputCursor::new(piece);
            file.write_forward(&mut input).unwrap();
            assert_eq!(input.remaining(), 0);
        }
        file.close(false).unwrap();
    }

    fn read_all<F: FileHandle>(file: &mut XfrmFile<F>, window: usize) -> Result<Vec<u8>, XfrmError> {
        let mut result = Vec::new();
        loop {
            let mut buf = vec![0u8; window];
            let mut out = OutputCursor::new(&mut buf);
            let progress = file.read_forward(&mut out)?;
            result.extend_from_slice(out.produced_bytes());
            if progress == Progress::Done {
                break;
            }
        }
        file.close(false)?;
        Ok(result)
    }

    fn create(opts: &CreateOptions, data: &[u8]) -> MemoryFile {
        let mem = MemoryFile::new();
        let mut file = XfrmFile::create(mem.clone(), opts, cfg()).unwrap();
        write_all(&mut file, data, 1000);
        mem
    }

    fn open_ready(mem: &MemoryFile, password: Option<&str>) -> XfrmFile<MemoryFile> {
        match XfrmFile::open(mem.clone(), password.map(str::as_bytes), cfg()).unwrap() {
            OpenOutcome::Ready(file) => file,
            OpenOutcome::NearMiss(miss) => panic!("unexpected near miss: {:?}", miss.reason),
        }
    }

    fn matrix_cases() -> Vec<(CreateOptions, EnvelopeFormat)> {
        vec![
            (CreateOptions::new(), EnvelopeFormat::Raw),
            (CreateOptions::new().compress(true), EnvelopeFormat::Legacy),
            (CreateOptions::new().extensible(true), EnvelopeFormat::Extensible),
            (CreateOptions::new().compress(true).extensible(true), EnvelopeFormat::Extensible),
            (CreateOptions::new().password(PASSWORD), EnvelopeFormat::Extensible),
            (CreateOptions::new().password(PASSWORD).compress(true), EnvelopeFormat::Extensible),
            (CreateOptions::new().password(PASSWORD).cipher(CipherKind::Xts), EnvelopeFormat::Extensible),
            (
                CreateOptions::new().password(PASSWORD).cipher(CipherKind::Xts).compress(true),
                EnvelopeFormat::Extensible,
            ),
            (
                CreateOptions::new()
                    .password(PASSWORD)
                    .key_method(KeyMethod::Pbkdf2Sha256)
                    .key_count(KeyCount::Exact(3))
                    .key_selection(KeySelection::Pair),
                EnvelopeFormat::Extensible,
            ),
        ]
    }

    // ## 1️⃣ Round trips

    #[test]
    fn round_trip_matrix() {
        let data = sample(20_000);
        for (opts, format) in matrix_cases() {
            let mem = create(&opts, &data);
            let mut file = open_ready(&mem, Some(PASSWORD));
            assert_eq!(file.envelope_info().format, format, "{opts:?}");
            assert_eq!(file.data_size(), data.len() as u64, "{opts:?}");
            let back = read_all(&mut file, 777).unwrap();
            assert_eq!(back, data, "{opts:?}");
            assert_eq!(file.mode(), FileMode::Closed);
        }
    }

    #[test]
    fn envelope_ends_on_file_block() {
        let opts = CreateOptions::new().password(PASSWORD).compress(true);
        let mem = create(&opts, &sample(3333));
        assert_eq!(mem.contents().len() % 512, 0);
        assert_eq!(&mem.contents()[..8], b"NDBXFRM1");

        let file = open_ready(&mem, Some(PASSWORD));
        let info = file.envelope_info();
        assert!(info.flags.is_compressed());
        assert_eq!(info.flags.cipher, CipherKind::Cbc);
        assert_eq!(info.key_material_count, 4);
        assert_eq!(info.header_size % 512, 0);
        assert!(info.data_checksum.is_some());
        assert!(info.file_checksum.is_some());
    }

    #[test]
    fn empty_payload_round_trip() {
        for opts in [CreateOptions::new().compress(true), CreateOptions::new().password(PASSWORD)] {
            let mem = create(&opts, b"");
            let mut file = open_ready(&mem, Some(PASSWORD));
            assert!(read_all(&mut file, 64).unwrap().is_empty());
        }
    }

    #[test]
    fn tiny_reads_through_all_stages() {
        let opts = CreateOptions::new().password(PASSWORD).compress(true);
        let mem = create(&opts, b"hellohellohello");
        let mut file = open_ready(&mem, Some(PASSWORD));
        assert_eq!(read_all(&mut file, 2).unwrap(), b"hellohellohello");
    }

    #[test]
    fn end_of_stream_comes_on_an_empty_read() {
        let mem = MemoryFile::new();
        let mut file = XfrmFile::create(mem.clone(), &CreateOptions::new().compress(true), cfg()).unwrap();
        for _ in 0..3 {
            let mut input = InputCursor::new(b"hello");
            file.write_forward(&mut input).unwrap();
        }
        file.close(false).unwrap();

        let mut file = open_ready(&mem, None);
        assert_eq!(file.envelope_info().format, EnvelopeFormat::Legacy);
        let mut result = Vec::new();
        loop {
            let mut buf = [0u8; 2];
            let mut out = OutputCursor::new(&mut buf);
            let progress = file.read_forward(&mut out).unwrap();
            let n = out.produced();
            result.extend_from_slice(out.produced_bytes());
            if progress == Progress::Done {
                assert_eq!(n, 0);
                assert!(out.is_end_of_stream());
                break;
            }
            assert!(n > 0);
            assert!(!out.is_end_of_stream());
        }
        assert_eq!(result, b"hellohellohello");
        file.close(false).unwrap();
    }

    #[test]
    fn create_refuses_existing_bytes() {
        let mem = MemoryFile::with_data(vec![1, 2, 3]);
        let err = XfrmFile::create(mem, &CreateOptions::new(), cfg()).unwrap_err();
        assert!(matches!(err, XfrmError::Io(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists));
    }

    // ## 2️⃣ Verification at close

    #[test]
    fn corrupted_payload_fails_data_checksum() {
        let data = sample(5000);
        let mem = create(&CreateOptions::new().extensible(true), &data);
        let file = open_ready(&mem, None);
        let at = file.payload_range().start as usize + 1234;
        mem.modify(|bytes| bytes[at] ^= 0xFF);

        let mut file = open_ready(&mem, None);
        let err = read_all(&mut file, 1024).unwrap_err();
        assert!(matches!(err, XfrmError::Format(FormatError::ChecksumMismatch { what: "data", .. })));
    }

    #[test]
    fn corrupted_payload_fails_every_transform() {
        let data = sample(20_000);
        for (opts, format) in matrix_cases() {
            if format == EnvelopeFormat::Raw {
                continue;
            }
            let mem = create(&opts, &data);
            let range = open_ready(&mem, Some(PASSWORD)).payload_range();
            let at = (range.start + (range.end - range.start) / 2) as usize;
            mem.modify(|bytes| bytes[at] ^= 0x5A);

            let mut file = open_ready(&mem, Some(PASSWORD));
            assert!(read_all(&mut file, 1024).is_err(), "{opts:?}");
        }
    }

    #[test]
    fn partial_read_then_close_reports_size() {
        let mem = create(&CreateOptions::new().compress(true), &sample(10_000));
        let mut file = open_ready(&mem, None);
        let mut buf = [0u8; 100];
        let mut out = OutputCursor::new(&mut buf);
        assert_eq!(file.read_forward(&mut out).unwrap(), Progress::OutputFull);
        let err = file.close(false).unwrap_err();
        assert!(matches!(err, XfrmError::Format(FormatError::DataSizeMismatch { declared: 10_000, actual: 100 })));
        assert_eq!(file.mode(), FileMode::Closed);
    }

    #[test]
    fn unread_file_closes_cleanly() {
        let mem = create(&CreateOptions::new().password(PASSWORD), &sample(100));
        let mut file = open_ready(&mem, Some(PASSWORD));
        file.close(false).unwrap();
        assert!(file.close(false).unwrap_err().is_contract_violation());
    }

    fn open_raw(mem: &MemoryFile) -> XfrmFile<MemoryFile> {
        let file = open_ready(mem, None);
        let info = file.envelope_info();
        assert_eq!(info.format, EnvelopeFormat::Raw);
        assert_eq!(info.data_size, Some(mem.contents().len() as u64));
        assert_eq!(file.payload_range(), 0..mem.contents().len() as u64);
        file
    }

    #[test]
    fn aborted_writer_opens_as_raw() {
        for opts in [CreateOptions::new().extensible(true), CreateOptions::new().compress(true)] {
            let mem = MemoryFile::new();
            let mut file = XfrmFile::create(mem.clone(), &opts, cfg()).unwrap();
            let data = sample(40_000);
            let mut input = InputCursor::new(&data);
            file.write_forward(&mut input).unwrap();
            file.close(true).unwrap();

            let mut file = open_raw(&mem);
            assert_eq!(read_all(&mut file, 4096).unwrap(), mem.contents(), "{opts:?}");
        }
    }

    #[test]
    fn header_only_file_opens_as_raw() {
        let mem = MemoryFile::new();
        let mut file = XfrmFile::create(mem.clone(), &CreateOptions::new().extensible(true), cfg()).unwrap();
        file.close(true).unwrap();
        assert_eq!(mem.contents().len(), 512);

        let mut file = open_raw(&mem);
        assert_eq!(read_all(&mut file, 100).unwrap(), mem.contents());
    }

    #[test]
    fn damaged_trailer_magic_opens_as_raw() {
        let mem = create(&CreateOptions::new().extensible(true), &sample(100));
        let len = mem.contents().len();
        mem.modify(|bytes| bytes[len - 1] = b'X');
        let mut file = open_raw(&mem);
        assert_eq!(read_all(&mut file, 333).unwrap(), mem.contents());
    }

    // ## 3️⃣ Passwords

    #[test]
    fn wrong_password_is_a_near_miss() {
        let data = sample(2000);
        let mem = create(&CreateOptions::new().password(PASSWORD), &data);

        let outcome = XfrmFile::open(mem.clone(), Some(b"not it".as_slice()), cfg()).unwrap();
        assert!(outcome.is_near_miss());
        assert_eq!(outcome.info().format, EnvelopeFormat::Extensible);
        let OpenOutcome::NearMiss(miss) = outcome else { unreachable!() };
        assert!(matches!(miss.reason, KeyError::UnwrapFailed));

        // Same handle, right password.
        let mut file = XfrmFile::open(miss.file, Some(PASSWORD.as_bytes()), cfg()).unwrap().into_ready().unwrap();
        assert_eq!(read_all(&mut file, 4096).unwrap(), data);
    }

    #[test]
    fn missing_password_is_a_near_miss() {
        let mem = create(&CreateOptions::new().password(PASSWORD).cipher(CipherKind::Xts), b"secret");
        let outcome = XfrmFile::open(mem, None, cfg()).unwrap();
        let info = outcome.info().clone();
        assert_eq!(info.flags.cipher, CipherKind::Xts);
        assert_eq!(info.data_unit_size, 512);
        let err = outcome.into_ready().unwrap_err();
        assert!(err.is_key_error());
        assert!(matches!(err, XfrmError::Key(KeyError::MissingPassword)));
    }

    #[test]
    fn derived_keys_with_wrong_password_fail_while_reading() {
        let opts = CreateOptions::new().password(PASSWORD).key_method(KeyMethod::Pbkdf2Sha256);
        let mem = create(&opts, &sample(3000));
        let mut file = open_ready(&mem, Some("guess"));
        assert!(read_all(&mut file, 1024).is_err());
    }

    // ## 4️⃣ Backward reads

    #[test]
    fn backward_read_returns_same_bytes() {
        let data = sample(9000);
        for opts in [
            CreateOptions::new().extensible(true),
            CreateOptions::new().password(PASSWORD),
            CreateOptions::new().password(PASSWORD).cipher(CipherKind::Xts),
        ] {
            let mem = create(&opts, &data);
            let mut file = open_ready(&mem, Some(PASSWORD));
            file.move_to_end().unwrap();
            assert_eq!(file.mode(), FileMode::ReadingBackward);

            let mut result = Vec::new();
            loop {
                let mut buf = vec![0u8; 1000];
                let mut out = ReverseOutputCursor::new(&mut buf);
                let progress = file.read_backward(&mut out).unwrap();
                let mut joined = out.produced_bytes().to_vec();
                joined.extend_from_slice(&result);
                result = joined;
                if progress == Progress::Done {
                    break;
                }
            }
            file.close(false).unwrap();
            assert_eq!(result, data, "{opts:?}");
        }
    }

    #[test]
    fn backward_read_needs_uncompressed_data() {
        let mem = create(&CreateOptions::new().compress(true), &sample(100));
        let mut file = open_ready(&mem, None);
        let err = file.move_to_end().unwrap_err();
        assert!(matches!(err, XfrmError::Format(FormatError::Unsupported(_))));
    }

    // ## 5️⃣ Pages

    #[test]
    fn declared_size_file_written_by_pages() {
        let data = sample(4096);
        let opts = CreateOptions::new().password(PASSWORD).cipher(CipherKind::Xts).declared_data_size(4096);
        let mem = MemoryFile::new();
        let file = XfrmFile::create(mem.clone(), &opts, cfg()).unwrap();
        assert_eq!(file.random_access_block_size(), 512);
        assert_eq!(file.payload_range().end - file.payload_range().start, 4096);

        // Out of order, two pages at a time.
        for start in [2048usize, 0, 3072, 1024] {
            let mut pages = data[start..start + 1024].to_vec();
            file.write_pages_at(start as u64, &mut pages).unwrap();
            assert_ne!(pages, &data[start..start + 1024]);
        }
        let mut file = file;
        file.close(false).unwrap();

        let mut reopened = open_ready(&mem, Some(PASSWORD));
        let mut page = vec![0u8; 512];
        reopened.read_pages_at(1536, &mut page).unwrap();
        assert_eq!(page, &data[1536..2048]);
        assert_eq!(read_all(&mut reopened, 1000).unwrap(), data);
    }

    #[test]
    fn declared_size_is_enforced_when_streaming() {
        let opts = CreateOptions::new().declared_data_size(100);
        let mut file = XfrmFile::create(MemoryFile::new(), &opts, cfg()).unwrap();
        let mut input = InputCursor::new(&[0u8; 60]);
        file.write_forward(&mut input).unwrap();
        let mut more = InputCursor::new(&[0u8; 60]);
        let err = file.write_forward(&mut more).unwrap_err();
        assert!(matches!(err, XfrmError::Format(FormatError::DataSizeMismatch { declared: 100, actual: 120 })));
        let err = file.close(false).unwrap_err();
        assert!(matches!(err, XfrmError::Format(FormatError::DataSizeMismatch { declared: 100, actual: 60 })));
    }

    #[test]
    fn pages_reject_bad_requests() {
        let opts = CreateOptions::new().password(PASSWORD).cipher(CipherKind::Xts).declared_data_size(2048);
        let file = XfrmFile::create(MemoryFile::new(), &opts, cfg()).unwrap();
        let mut buf = vec![0u8; 512];
        let err = file.write_pages_at(100, &mut buf).unwrap_err();
        assert!(matches!(err, XfrmError::Format(FormatError::Misaligned { what: "page position", .. })));
        let err = file.write_pages_at(2048, &mut buf).unwrap_err();
        assert!(matches!(err, XfrmError::Format(FormatError::SizeOutOfBounds { what: "page range", .. })));
        let mut odd = vec![0u8; 100];
        let err = file.transform_pages(0, &mut odd).unwrap_err();
        assert!(matches!(err, XfrmError::Format(FormatError::Misaligned { what: "page length", .. })));

        let compressed = XfrmFile::create(MemoryFile::new(), &CreateOptions::new().compress(true), cfg()).unwrap();
        assert_eq!(compressed.random_access_block_size(), 0);
        assert!(matches!(
            compressed.transform_pages(0, &mut buf),
            Err(XfrmError::Format(FormatError::Unsupported(_)))
        ));
    }

    #[test]
    fn page_operation_round_trip() {
        let opts = CreateOptions::new().password(PASSWORD).cipher(CipherKind::Xts).declared_data_size(1024);
        let file = XfrmFile::create(MemoryFile::new(), &opts, cfg()).unwrap();
        let mut enc = file.page_operation(Direction::Encrypt).unwrap();
        let mut dec = file.page_operation(Direction::Decrypt).unwrap();
        let plain = sample(1024);
        let mut pages = plain.clone();
        file.transform_pages_with(&mut enc, 0, &mut pages).unwrap();
        file.transform_pages_with(&mut dec, 0, &mut pages).unwrap();
        assert_eq!(pages, plain);

        let other = XfrmFile::create(MemoryFile::new(), &opts, cfg()).unwrap();
        let mut foreign = other.page_operation(Direction::Encrypt).unwrap();
        assert!(matches!(
            file.transform_pages_with(&mut foreign, 0, &mut pages),
            Err(XfrmError::Format(FormatError::Inconsistent(_)))
        ));
    }

    // ## 6️⃣ Contract violations

    #[test]
    fn writing_after_end_of_stream_poisons() {
        let mut file = XfrmFile::create(MemoryFile::new(), &CreateOptions::new().compress(true), cfg()).unwrap();
        let mut input = InputCursor::last(b"abc");
        assert_eq!(file.write_forward(&mut input).unwrap(), Progress::Done);

        let mut more = InputCursor::new(b"late");
        assert!(file.write_forward(&mut more).unwrap_err().is_contract_violation());
        assert!(file.is_poisoned());

        let mut again = InputCursor::new(b"");
        assert!(file.write_forward(&mut again).unwrap_err().is_contract_violation());
        assert!(file.close(false).unwrap_err().is_contract_violation());
        assert_eq!(file.mode(), FileMode::Closed);
    }

    #[test]
    fn wrong_direction_is_rejected() {
        let mut file = XfrmFile::create(MemoryFile::new(), &CreateOptions::new(), cfg()).unwrap();
        let mut buf = [0u8; 16];
        let err = file.read_forward(&mut OutputCursor::new(&mut buf)).unwrap_err();
        assert!(err.is_contract_violation());
        assert!(!file.is_poisoned());
        assert!(file.move_to_end().is_err());
        file.close(true).unwrap();
    }

    #[test]
    fn declared_size_on_compressed_file_is_refused() {
        let opts = CreateOptions::new().compress(true).declared_data_size(10);
        let err = XfrmFile::create(MemoryFile::new(), &opts, cfg()).unwrap_err();
        assert!(matches!(err, XfrmError::Config(_)));

        let opts = CreateOptions::new().cipher(CipherKind::Cbc);
        let err = XfrmFile::create(MemoryFile::new(), &opts, cfg()).unwrap_err();
        assert!(matches!(err, XfrmError::Key(KeyError::MissingPassword)));
    }

    // ## 7️⃣ On disk

    #[test]
    fn os_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.xf");
        let data = sample(70_000);

        let opts = CreateOptions::new().password(PASSWORD).compress(true).cipher(CipherKind::Xts);
        let mut file = XfrmFile::create(OsFile::create(&path).unwrap(), &opts, cfg()).unwrap();
        write_all(&mut file, &data, 4096);
        assert!(OsFile::create(&path).is_err());

        let handle = OsFile::open_read_only(&path).unwrap();
        let mut file = XfrmFile::open(handle, Some(PASSWORD.as_bytes()), cfg()).unwrap().into_ready().unwrap();
        assert_eq!(file.file_size().unwrap() % 512, 0);
        assert_eq!(read_all(&mut file, 5000).unwrap(), data);
    }

    #[test]
    fn unaligned_encrypted_payload_is_rejected() {
        let mem = create(&CreateOptions::new().password(PASSWORD).key_method(KeyMethod::Pbkdf2Sha256), &sample(64));
        let file = open_ready(&mem, Some(PASSWORD));
        let range = file.payload_range();
        assert_eq!(range.end - range.start, 80);
        // One stray byte between payload and trailer pad.
        mem.modify(|bytes| bytes.insert(range.end as usize, 0));
        let err = XfrmFile::open(mem, Some(PASSWORD.as_bytes()), cfg()).unwrap_err();
        assert!(matches!(err, XfrmError::Crypto(CryptoError::Unaligned { len: 81 })));
    }
}
