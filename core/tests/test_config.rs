// Configuration and creation options:

// * JSON loading with defaults, validation failures
// * how options resolve into envelope flags

#[cfg(test)]
mod tests {
    use xfrm_core::config::{CreateOptions, KeyCount, XfrmConfig};
    use xfrm_core::crypto::KeyError;
    use xfrm_core::envelope::{
        ChecksumKind, CipherKind, Endian, EnvelopeFormat, KeyMethod, KeySelection, PaddingKind, Presence,
    };
    use xfrm_core::file::{MemoryFile, XfrmFile};
    use xfrm_core::types::XfrmError;

    fn cfg() -> XfrmConfig {
        XfrmConfig { kdf_iter_count: 1000, ..XfrmConfig::default() }
    }

    fn created(opts: CreateOptions) -> Result<XfrmFile<MemoryFile>, XfrmError> {
        XfrmFile::create(MemoryFile::new(), &opts, cfg())
    }

    // ------------------------------------------------------------
    // XfrmConfig
    // ------------------------------------------------------------

    #[test]
    fn defaults_are_valid() {
        let cfg = XfrmConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.file_block_size, 512);
        assert_eq!(cfg.byte_order, Endian::native());
    }

    #[test]
    fn json_fills_missing_fields() {
        let cfg = XfrmConfig::from_json_str(r#"{ "kdf_iter_count": 5000, "byte_order": "big" }"#).unwrap();
        assert_eq!(cfg.kdf_iter_count, 5000);
        assert_eq!(cfg.byte_order, Endian::Big);
        assert_eq!(cfg.buffer_size, XfrmConfig::default().buffer_size);

        let text = cfg.to_json_string().unwrap();
        assert!(text.contains("\"byte_order\": \"big\""));
        assert_eq!(XfrmConfig::from_json_str(&text).unwrap(), cfg);
    }

    #[test]
    fn json_rejects_invalid_values() {
        for bad in [
            r#"{ "buffer_alignment": 48 }"#,
            r#"{ "buffer_size": 100 }"#,
            r#"{ "file_block_size": 12 }"#,
            r#"{ "kdf_iter_count": 0 }"#,
            r#"{ "xts_data_unit_size": 100 }"#,
            r#"{ "deflate_level": 12 }"#,
            r#"{ "arena_size": 1024 }"#,
            r#"{ "auto_key_count": 0 }"#,
            r#"{ "byte_order": "middle" }"#,
            "not json",
        ] {
            assert!(matches!(XfrmConfig::from_json_str(bad), Err(XfrmError::Config(_))), "{bad}");
        }
    }

    // ------------------------------------------------------------
    // CreateOptions
    // ------------------------------------------------------------

    #[test]
    fn format_follows_options() {
        let raw = created(CreateOptions::new()).unwrap();
        assert_eq!(raw.envelope_info().format, EnvelopeFormat::Raw);
        let legacy = created(CreateOptions::new().compress(true)).unwrap();
        assert_eq!(legacy.envelope_info().format, EnvelopeFormat::Legacy);
        let ext = created(CreateOptions::new().password("pw")).unwrap();
        assert_eq!(ext.envelope_info().format, EnvelopeFormat::Extensible);
        assert_eq!(ext.header().unwrap().order, cfg().byte_order);
    }

    #[test]
    fn padding_goes_where_it_is_needed() {
        let xts = created(CreateOptions::new().password("pw").cipher(CipherKind::Xts).compress(true)).unwrap();
        let f = xts.envelope_info().flags;
        assert_eq!(f.compression_padding, PaddingKind::Pkcs);
        assert_eq!(f.cipher_padding, PaddingKind::None);

        let cbc = created(CreateOptions::new().password("pw").compress(true)).unwrap();
        let f = cbc.envelope_info().flags;
        assert_eq!(f.compression_padding, PaddingKind::None);
        assert_eq!(f.cipher_padding, PaddingKind::Pkcs);
    }

    #[test]
    fn key_defaults() {
        let wrap = created(CreateOptions::new().password("pw")).unwrap();
        let info = wrap.envelope_info();
        assert_eq!(info.flags.key_method, KeyMethod::AesKeyWrap256);
        assert_eq!(info.key_material_count, cfg().auto_key_count);
        assert_eq!(info.flags.key_selection, KeySelection::MixedPair);
        assert_eq!(info.data_unit_size, 0);

        let derived = created(CreateOptions::new().password("pw").key_method(KeyMethod::Pbkdf2Sha256)).unwrap();
        let info = derived.envelope_info();
        assert_eq!(info.key_material_count, 1);
        assert_eq!(info.flags.key_selection, KeySelection::Same);

        let xts = created(CreateOptions::new().password("pw").cipher(CipherKind::Xts).data_unit_size(4096)).unwrap();
        assert_eq!(xts.envelope_info().data_unit_size, 4096);
    }

    #[test]
    fn declared_size_drops_checksums() {
        let file = created(CreateOptions::new().declared_data_size(1000)).unwrap();
        let f = file.envelope_info().flags;
        assert_eq!(f.data_checksum, ChecksumKind::None);
        assert_eq!(f.file_checksum, ChecksumKind::None);
        assert!(f.presence.contains(Presence::DATA_SIZE_IN_HEADER));
        assert_eq!(file.data_size(), 1000);
    }

    #[test]
    fn invalid_options_are_rejected() {
        assert!(matches!(
            created(CreateOptions::new().key_method(KeyMethod::Pbkdf2Sha256)),
            Err(XfrmError::Key(KeyError::MissingPassword))
        ));
        assert!(matches!(
            created(CreateOptions::new().password("pw").cipher(CipherKind::None)),
            Err(XfrmError::Config(_))
        ));
        assert!(matches!(
            created(CreateOptions::new().password("pw").key_count(KeyCount::Exact(0))),
            Err(XfrmError::Key(KeyError::NoPairs))
        ));
        assert!(matches!(
            created(CreateOptions::new().password("pw").key_count(KeyCount::Exact(600))),
            Err(XfrmError::Key(KeyError::TooManyPairs { requested: 600, .. }))
        ));
        assert!(matches!(
            created(CreateOptions::new().password("pw").declared_data_size(100)),
            Err(XfrmError::Config(_))
        ));
        assert!(matches!(
            created(CreateOptions::new().password("pw").cipher(CipherKind::Xts).data_unit_size(0)),
            Err(XfrmError::Config(_))
        ));
        assert!(matches!(created(CreateOptions::new().file_block_size(100)), Err(XfrmError::Config(_))));
        assert!(matches!(
            created(CreateOptions::new().password("pw").kdf_iter_count(0)),
            Err(XfrmError::Key(KeyError::ZeroIterations))
        ));
    }

    #[test]
    fn options_debug_hides_password() {
        let text = format!("{:?}", CreateOptions::new().password("hunter2"));
        assert!(!text.contains("hunter2"));
        assert!(text.contains("redacted"));
    }
}
