//! Bidirectional mapping between document keys and tree paths.
//!
//! Filesystem-hostile characters are substituted with `_NAME_` tokens in a
//! single pass. The underscore itself is escaped too, so every `_` in an
//! encoded component is a token delimiter and decoding is unambiguous: the
//! codec is a pure inverse on all inputs, and encoded components are legal
//! file names on common filesystems.

use crate::errors::{ChronError, Result};

/// Suffix of every document file in the tree.
pub const DOC_SUFFIX: &str = ".json";

const ESCAPES: &[(char, &str)] = &[
    ('_', "UND"),
    (':', "COLON"),
    ('/', "SLASH"),
    ('?', "QMARK"),
    ('*', "STAR"),
    ('\\', "BSLASH"),
    ('<', "LT"),
    ('>', "GT"),
    ('|', "PIPE"),
    ('"', "QUOTE"),
    ('%', "PCT"),
    ('#', "HASH"),
    ('&', "AMP"),
    ('=', "EQ"),
    ('+', "PLUS"),
    ('@', "AT"),
    (' ', "SP"),
];

fn escape_name(c: char) -> Option<&'static str> {
    ESCAPES.iter().find(|(ch, _)| *ch == c).map(|(_, name)| *name)
}

fn unescape_name(name: &str) -> Option<char> {
    ESCAPES.iter().find(|(_, n)| *n == name).map(|(ch, _)| *ch)
}

/// Encode one path component (a table name or a document id).
pub fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match escape_name(c) {
            Some(name) => {
                out.push('_');
                out.push_str(name);
                out.push('_');
            }
            None => out.push(c),
        }
    }
    out
}

/// Decode one path component back to the original key text.
pub fn decode_component(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices();
    while let Some((start, c)) = chars.next() {
        if c != '_' {
            out.push(c);
            continue;
        }
        let rest = &s[start + 1..];
        let end = rest.find('_').ok_or_else(|| {
            ChronError::InvalidKey(s.to_string(), "unterminated escape token".to_string())
        })?;
        let token = &rest[..end];
        let decoded = unescape_name(token).ok_or_else(|| {
            ChronError::InvalidKey(s.to_string(), format!("unknown escape token `{token}`"))
        })?;
        out.push(decoded);
        // Skip over the token body and the closing underscore.
        for _ in 0..end + 1 {
            chars.next();
        }
    }
    Ok(out)
}

/// Tree path of a document: `[prefix/]<enc-table>/<enc-id>.json`.
pub fn doc_path(data_prefix: Option<&str>, table: &str, id: &str) -> String {
    let file = format!("{}{}", encode_component(id), DOC_SUFFIX);
    match data_prefix {
        Some(prefix) if !prefix.is_empty() => {
            format!("{}/{}/{}", prefix, encode_component(table), file)
        }
        _ => format!("{}/{}", encode_component(table), file),
    }
}

/// Tree path of a collection directory.
pub fn table_path(data_prefix: Option<&str>, table: &str) -> String {
    match data_prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, encode_component(table)),
        _ => encode_component(table),
    }
}

/// Inverse of [`doc_path`]: recover the document id from a tree path.
/// Returns `None` for paths that are not document files (wrong suffix or
/// outside the configured prefix).
pub fn parse_doc_path(data_prefix: Option<&str>, path: &str) -> Result<Option<String>> {
    let relative = match data_prefix {
        Some(prefix) if !prefix.is_empty() => match path.strip_prefix(&format!("{prefix}/")) {
            Some(rest) => rest,
            None => return Ok(None),
        },
        _ => path,
    };
    let Some((_, file)) = relative.split_once('/') else {
        return Ok(None);
    };
    let Some(encoded_id) = file.strip_suffix(DOC_SUFFIX) else {
        return Ok(None);
    };
    if encoded_id.contains('/') {
        return Ok(None);
    }
    decode_component(encoded_id).map(Some)
}
