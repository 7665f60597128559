//! Text encoding detection for archive entries.
//!
//! Game text assets come in three flavors: UTF-8, UTF-16 with a byte order
//! mark, and UTF-16LE without one (the `.ot`/`.otc`/`.it`/`.itc`/`.ao`/`.aoc`
//! families). A file is always written back in the encoding it was read with,
//! and decoding keeps any BOM as a leading `U+FEFF` so that
//! decode-then-encode reproduces the original bytes exactly.

use crate::vpath;
use thiserror::Error;

/// Extensions whose files may be BOM-less UTF-16LE.
pub const UTF16_SNIFF_EXTENSIONS: &[&str] = &[".ot", ".otc", ".it", ".itc", ".ao", ".aoc"];

/// Maximum number of byte pairs inspected when sniffing BOM-less UTF-16.
const SNIFF_PAIRS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TextError {
    #[error("content is not valid UTF-8 (error at byte {offset})")]
    InvalidUtf8 { offset: usize },

    #[error("UTF-16 content has an odd byte length ({len})")]
    OddUtf16Length { len: usize },

    #[error("UTF-16 content contains an unpaired surrogate")]
    InvalidUtf16,
}

impl TextEncoding {
    /// Detect the encoding of `data`, using `path` to decide whether
    /// BOM-less UTF-16 sniffing applies.
    pub fn detect(data: &[u8], path: &str) -> Self {
        if data.is_empty() {
            return TextEncoding::Utf8;
        }

        if data.len() >= 2 && data[0] == 0xFF && data[1] == 0xFE {
            return TextEncoding::Utf16Le;
        }
        if data.len() >= 2 && data[0] == 0xFE && data[1] == 0xFF {
            return TextEncoding::Utf16Be;
        }

        let sniff = vpath::extension(path)
            .is_some_and(|ext| UTF16_SNIFF_EXTENSIONS.contains(&ext.as_str()));
        if sniff && data.len() >= 4 {
            let pairs = SNIFF_PAIRS.min(data.len() / 2);
            let zeros = (0..pairs).filter(|pair| data[pair * 2 + 1] == 0).count();
            // strictly more than 80% of the sampled odd bytes
            if zeros * 5 > pairs * 4 {
                return TextEncoding::Utf16Le;
            }
        }

        TextEncoding::Utf8
    }

    pub fn decode(self, data: &[u8]) -> Result<String, TextError> {
        match self {
            TextEncoding::Utf8 => String::from_utf8(data.to_vec()).map_err(|e| {
                TextError::InvalidUtf8 {
                    offset: e.utf8_error().valid_up_to(),
                }
            }),
            TextEncoding::Utf16Le => decode_utf16(data, u16::from_le_bytes),
            TextEncoding::Utf16Be => decode_utf16(data, u16::from_be_bytes),
        }
    }

    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            TextEncoding::Utf16Be => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
        }
    }
}

fn decode_utf16(data: &[u8], unit: fn([u8; 2]) -> u16) -> Result<String, TextError> {
    if data.len() % 2 != 0 {
        return Err(TextError::OddUtf16Length { len: data.len() });
    }
    let units = data.chunks_exact(2).map(|pair| unit([pair[0], pair[1]]));
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|_| TextError::InvalidUtf16)
}

/// Text decoded from an archive entry together with the encoding it came in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedText {
    pub text: String,
    pub encoding: TextEncoding,
}

impl DecodedText {
    pub fn decode(data: &[u8], path: &str) -> Result<Self, TextError> {
        let encoding = TextEncoding::detect(data, path);
        let text = encoding.decode(data)?;
        Ok(Self { text, encoding })
    }

    /// Re-encode replacement text in this entry's original encoding.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        self.encoding.encode(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn utf16le(text: &str) -> Vec<u8> {
        TextEncoding::Utf16Le.encode(text)
    }

    #[test]
    fn test_detect_bom_le() {
        let mut data = vec![0xFF, 0xFE];
        data.extend(utf16le("hello"));
        assert_eq!(TextEncoding::detect(&data, "shaders/a.hlsl"), TextEncoding::Utf16Le);
    }

    #[test]
    fn test_detect_bom_be() {
        let mut data = vec![0xFE, 0xFF];
        data.extend(TextEncoding::Utf16Be.encode("hello"));
        assert_eq!(TextEncoding::detect(&data, "a.txt"), TextEncoding::Utf16Be);
    }

    #[test]
    fn test_detect_bomless_utf16_only_for_game_extensions() {
        let data = utf16le("version 2\r\nPositioned\r\n{\r\n}\r\n");
        assert_eq!(
            TextEncoding::detect(&data, "metadata/characters/character.ot"),
            TextEncoding::Utf16Le
        );
        assert_eq!(TextEncoding::detect(&data, "shaders/fog.hlsl"), TextEncoding::Utf8);
    }

    #[test]
    fn test_detect_plain_utf8_with_game_extension() {
        let data = b"version 2\nPositioned {}\n";
        assert_eq!(TextEncoding::detect(data, "a.otc"), TextEncoding::Utf8);
    }

    #[test]
    fn test_detect_empty_is_utf8() {
        assert_eq!(TextEncoding::detect(&[], "a.ot"), TextEncoding::Utf8);
    }

    #[test]
    fn test_bom_round_trip_is_byte_exact() {
        let mut data = vec![0xFF, 0xFE];
        data.extend(utf16le("abc"));
        let decoded = DecodedText::decode(&data, "a.ot").unwrap();
        assert!(decoded.text.starts_with('\u{FEFF}'));
        assert_eq!(decoded.encode(&decoded.text), data);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            TextEncoding::Utf8.decode(&[0x66, 0xFF]),
            Err(TextError::InvalidUtf8 { offset: 1 })
        ));
        assert!(matches!(
            TextEncoding::Utf16Le.decode(&[0x61, 0x00, 0x62]),
            Err(TextError::OddUtf16Length { len: 3 })
        ));
        // lone high surrogate
        assert!(matches!(
            TextEncoding::Utf16Le.decode(&[0x00, 0xD8]),
            Err(TextError::InvalidUtf16)
        ));
    }

    proptest! {
        #[test]
        fn prop_utf16le_game_files_round_trip(text in "[a-zA-Z0-9 =_;\"{}\r\n]{2,80}") {
            let data = utf16le(&text);
            let decoded = DecodedText::decode(&data, "metadata/x.otc").unwrap();
            prop_assert_eq!(decoded.encoding, TextEncoding::Utf16Le);
            prop_assert_eq!(&decoded.text, &text);
            prop_assert_eq!(decoded.encode(&decoded.text), data);
        }
    }
}
