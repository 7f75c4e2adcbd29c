//! Per-connection text encoding negotiation.
//!
//! UTF-8 is preferred. On the first decode failure — and only when the
//! server was not forced to UTF-8 — the connection permanently falls back
//! to the user-configured code page, then Latin-1, then a lossy UTF-8
//! decode standing in for the system default. Encoding to the server is
//! UTF-8 unless disabled, with a per-call force flag for commands that
//! are specified to be UTF-8 regardless (e.g. IDN host names).

use crate::server::EncodingPreference;

/// Result of one decode call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    /// This call permanently disabled UTF-8; the caller should log the
    /// status message.
    pub utf8_disabled: bool,
}

/// Stateful per-connection codec.
pub struct TextCodec {
    use_utf8: bool,
    forced_utf8: bool,
    custom: Option<&'static encoding_rs::Encoding>,
    custom_label: Option<String>,
}

impl TextCodec {
    pub fn new(preference: &EncodingPreference) -> TextCodec {
        let (forced, custom_label) = match preference {
            EncodingPreference::Auto => (false, None),
            EncodingPreference::Utf8 => (true, None),
            EncodingPreference::Custom(label) => (false, Some(label.clone())),
        };
        let custom = custom_label
            .as_deref()
            .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()));
        TextCodec {
            use_utf8: true,
            forced_utf8: forced,
            custom,
            custom_label,
        }
    }

    /// Whether UTF-8 is still in use for this connection.
    pub fn utf8_enabled(&self) -> bool {
        self.use_utf8
    }

    /// The configured custom code page label, if any.
    pub fn custom_label(&self) -> Option<&str> {
        self.custom_label.as_deref()
    }

    /// Decode bytes received from the server.
    pub fn decode(&mut self, bytes: &[u8]) -> Decoded {
        let mut utf8_disabled = false;
        if self.use_utf8 {
            match std::str::from_utf8(bytes) {
                Ok(text) => {
                    return Decoded { text: text.to_string(), utf8_disabled: false };
                }
                Err(_) => {
                    if !self.forced_utf8 {
                        self.use_utf8 = false;
                        utf8_disabled = true;
                    }
                }
            }
        }

        if let Some(encoding) = self.custom {
            let (text, _, malformed) = encoding.decode(bytes);
            if !malformed {
                return Decoded { text: text.into_owned(), utf8_disabled };
            }
        }

        // Latin-1 maps every byte; use it before the lossy last resort so
        // legacy servers keep round-tripping.
        if bytes.iter().any(|&b| b >= 0x80) {
            let text = bytes.iter().map(|&b| b as char).collect();
            return Decoded { text, utf8_disabled };
        }

        Decoded {
            text: String::from_utf8_lossy(bytes).into_owned(),
            utf8_disabled,
        }
    }

    /// Encode text for the server. `force_utf8` overrides a disabled
    /// UTF-8 for this call only.
    pub fn encode(&self, text: &str, force_utf8: bool) -> Vec<u8> {
        if self.use_utf8 || force_utf8 {
            return text.as_bytes().to_vec();
        }
        if let Some(encoding) = self.custom {
            let (bytes, _, _) = encoding.encode(text);
            return bytes.into_owned();
        }
        // Latin-1 best effort: characters beyond U+00FF degrade to '?'.
        text.chars()
            .map(|c| {
                let code = c as u32;
                if code <= 0xFF { code as u8 } else { b'?' }
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_round_trip_is_identity() {
        let mut codec = TextCodec::new(&EncodingPreference::Auto);
        let text = "Übergrößenträger/файл.txt";
        let encoded = codec.encode(text, false);
        let decoded = codec.decode(&encoded);
        assert_eq!(decoded.text, text);
        assert!(!decoded.utf8_disabled);
        assert!(codec.utf8_enabled());
    }

    #[test]
    fn invalid_utf8_disables_permanently_in_auto_mode() {
        let mut codec = TextCodec::new(&EncodingPreference::Auto);
        let decoded = codec.decode(&[0x66, 0xFC, 0x72]); // "für" in Latin-1
        assert!(decoded.utf8_disabled);
        assert_eq!(decoded.text, "für");
        assert!(!codec.utf8_enabled());

        // Valid UTF-8 arriving later is still decoded via the fallback.
        let decoded = codec.decode(&[0x61, 0x62]);
        assert!(!decoded.utf8_disabled);
        assert_eq!(decoded.text, "ab");
    }

    #[test]
    fn forced_utf8_never_disables() {
        let mut codec = TextCodec::new(&EncodingPreference::Utf8);
        let decoded = codec.decode(&[0x66, 0xFC, 0x72]);
        assert!(!decoded.utf8_disabled);
        assert!(codec.utf8_enabled());
        // The broken line itself still decodes best-effort.
        assert_eq!(decoded.text, "für");
    }

    #[test]
    fn custom_code_page_is_used_after_fallback() {
        let mut codec = TextCodec::new(&EncodingPreference::Custom("shift_jis".into()));
        // 0x83 0x74 is Shift-JIS katakana "フ"; invalid as UTF-8.
        let decoded = codec.decode(&[0x83, 0x74]);
        assert!(decoded.utf8_disabled);
        assert_eq!(decoded.text, "フ");

        // Encoding now targets the code page as well.
        let encoded = codec.encode("フ", false);
        assert_eq!(encoded, vec![0x83, 0x74]);
    }

    #[test]
    fn force_flag_overrides_disabled_utf8() {
        let mut codec = TextCodec::new(&EncodingPreference::Auto);
        codec.decode(&[0xFC]); // disable UTF-8
        assert!(!codec.utf8_enabled());
        assert_eq!(codec.encode("ü", true), "ü".as_bytes().to_vec());
        assert_eq!(codec.encode("ü", false), vec![0xFC]);
    }

    #[test]
    fn latin1_encode_degrades_unmappable_chars() {
        let mut codec = TextCodec::new(&EncodingPreference::Auto);
        codec.decode(&[0xFC]); // disable UTF-8, no custom code page
        assert_eq!(codec.encode("a€b", false), vec![b'a', b'?', b'b']);
    }

    #[test]
    fn unknown_code_page_label_falls_back_to_latin1() {
        let mut codec = TextCodec::new(&EncodingPreference::Custom("no-such-charset".into()));
        let decoded = codec.decode(&[0x66, 0xFC]);
        assert_eq!(decoded.text, "fü");
    }
}
