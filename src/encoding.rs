// 🔤 Encoding Repair - turn one raw line into text, never fail
//
// Priority:
//   1. strict UTF-8
//   2. Windows-1252, accepted only if every byte is defined in the code page
//      and the result re-encodes to UTF-8
//   3. UTF-8 with U+FFFD for every undecodable sequence

use serde::{Deserialize, Serialize};

// ============================================================================
// DECODE PATH
// ============================================================================

/// Which rung of the fallback chain produced the text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodePath {
    /// Bytes were already valid UTF-8
    Strict,

    /// Decoded as Windows-1252
    Windows1252,

    /// Lossy UTF-8, replacement characters inserted
    Substituted,
}

impl DecodePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodePath::Strict => "strict",
            DecodePath::Windows1252 => "windows-1252",
            DecodePath::Substituted => "substituted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLine {
    pub text: String,
    pub path: DecodePath,
}

// ============================================================================
// WINDOWS-1252
// ============================================================================

/// 0x80..=0x9F; `None` marks the five bytes the code page leaves undefined
const CP1252_HIGH: [Option<char>; 32] = [
    Some('\u{20AC}'), None,             Some('\u{201A}'), Some('\u{0192}'),
    Some('\u{201E}'), Some('\u{2026}'), Some('\u{2020}'), Some('\u{2021}'),
    Some('\u{02C6}'), Some('\u{2030}'), Some('\u{0160}'), Some('\u{2039}'),
    Some('\u{0152}'), None,             Some('\u{017D}'), None,
    None,             Some('\u{2018}'), Some('\u{2019}'), Some('\u{201C}'),
    Some('\u{201D}'), Some('\u{2022}'), Some('\u{2013}'), Some('\u{2014}'),
    Some('\u{02DC}'), Some('\u{2122}'), Some('\u{0161}'), Some('\u{203A}'),
    Some('\u{0153}'), None,             Some('\u{017E}'), Some('\u{0178}'),
];

fn cp1252_char(byte: u8) -> Option<char> {
    match byte {
        0x80..=0x9F => CP1252_HIGH[(byte - 0x80) as usize],
        // ASCII and 0xA0..=0xFF coincide with Latin-1 / Unicode
        _ => Some(byte as char),
    }
}

/// Strict Windows-1252 decode; fails on undefined bytes
pub fn decode_windows_1252(bytes: &[u8]) -> Option<String> {
    bytes.iter().map(|&b| cp1252_char(b)).collect()
}

// ============================================================================
// REPAIRER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct EncodingRepairer;

impl EncodingRepairer {
    pub fn new() -> Self {
        EncodingRepairer
    }

    /// Decode one line; always returns text plus the path taken
    pub fn decode_line(&self, raw: &[u8]) -> DecodedLine {
        if let Ok(text) = std::str::from_utf8(raw) {
            return DecodedLine {
                text: text.to_string(),
                path: DecodePath::Strict,
            };
        }

        // Rejected only when the line holds one of the undefined cp1252 bytes
        if let Some(text) = decode_windows_1252(raw) {
            return DecodedLine {
                text,
                path: DecodePath::Windows1252,
            };
        }

        DecodedLine {
            text: String::from_utf8_lossy(raw).into_owned(),
            path: DecodePath::Substituted,
        }
    }
}
