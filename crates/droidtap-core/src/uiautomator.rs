//! Reader for `uiautomator dump` XML output.
//!
//! The dump format is a small, regular XML subset: a prolog, a single
//! `<hierarchy>` root and nested `<node .../>` elements whose data lives
//! entirely in quoted attributes. A byte scanner covers it without pulling in
//! a general-purpose XML parser. Text content is ignored, as is anything
//! after the root element closes (`exec-out` appends a status line such as
//! `UI hierchary dumped to: /dev/tty`).

use thiserror::Error;

use crate::element::HierarchyNode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("snapshot contains no root element")]
    NoRoot,

    #[error("malformed snapshot at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },
}

fn malformed(offset: usize, reason: &'static str) -> ParseError {
    ParseError::Malformed { offset, reason }
}

/// Parses a uiautomator dump into its root [`HierarchyNode`].
pub fn parse_hierarchy(xml: &str) -> Result<HierarchyNode, ParseError> {
    let bytes = xml.as_bytes();
    let mut index = 0usize;
    let mut stack: Vec<HierarchyNode> = Vec::new();

    while index < bytes.len() {
        if bytes[index] != b'<' {
            index += 1;
            continue;
        }
        match bytes.get(index + 1) {
            None => break,
            Some(b'?') => {
                index = skip_past(bytes, index + 2, b"?>")
                    .ok_or_else(|| malformed(index, "unterminated processing instruction"))?;
            }
            Some(b'!') => {
                let end: &[u8] = if bytes[index..].starts_with(b"<!--") { b"-->" } else { b">" };
                index = skip_past(bytes, index + 2, end)
                    .ok_or_else(|| malformed(index, "unterminated declaration"))?;
            }
            Some(b'/') => {
                let close = skip_past(bytes, index + 2, b">")
                    .ok_or_else(|| malformed(index, "unterminated closing tag"))?;
                let name = xml[index + 2..close - 1].trim();
                let node = stack
                    .pop()
                    .ok_or_else(|| malformed(index, "closing tag without open element"))?;
                if node.tag != name {
                    return Err(malformed(index, "mismatched closing tag"));
                }
                index = close;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Ok(node),
                }
            }
            Some(_) => {
                let (node, self_closing, next) = parse_open_tag(xml, index + 1)?;
                index = next;
                if self_closing {
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => return Ok(node),
                    }
                } else {
                    stack.push(node);
                }
            }
        }
    }

    if stack.is_empty() {
        Err(ParseError::NoRoot)
    } else {
        Err(malformed(bytes.len(), "unexpected end of document"))
    }
}

/// Returns the index just past the first occurrence of `needle` at or after `from`.
fn skip_past(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| from + pos + needle.len())
}

fn skip_whitespace(bytes: &[u8], mut cursor: usize) -> usize {
    while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
        cursor += 1;
    }
    cursor
}

/// Parses `name attr="v" ...>` or `.../>` starting just after the `<`.
fn parse_open_tag(xml: &str, start: usize) -> Result<(HierarchyNode, bool, usize), ParseError> {
    let bytes = xml.as_bytes();
    let mut cursor = start;
    while cursor < bytes.len()
        && bytes[cursor] != b'/'
        && bytes[cursor] != b'>'
        && !bytes[cursor].is_ascii_whitespace()
    {
        cursor += 1;
    }
    if cursor == start {
        return Err(malformed(start, "empty tag name"));
    }
    let mut node = HierarchyNode::new(&xml[start..cursor]);

    loop {
        cursor = skip_whitespace(bytes, cursor);
        match bytes.get(cursor) {
            None => return Err(malformed(cursor, "unterminated tag")),
            Some(b'>') => return Ok((node, false, cursor + 1)),
            Some(b'/') => {
                if bytes.get(cursor + 1) != Some(&b'>') {
                    return Err(malformed(cursor, "expected '>' after '/'"));
                }
                return Ok((node, true, cursor + 2));
            }
            Some(_) => {}
        }

        let name_start = cursor;
        while cursor < bytes.len()
            && bytes[cursor] != b'='
            && bytes[cursor] != b'>'
            && bytes[cursor] != b'/'
            && !bytes[cursor].is_ascii_whitespace()
        {
            cursor += 1;
        }
        let name_end = cursor;
        cursor = skip_whitespace(bytes, cursor);
        if bytes.get(cursor) != Some(&b'=') {
            return Err(malformed(cursor, "attribute without value"));
        }
        cursor = skip_whitespace(bytes, cursor + 1);
        let quote = match bytes.get(cursor) {
            Some(q @ (b'"' | b'\'')) => *q,
            _ => return Err(malformed(cursor, "attribute value must be quoted")),
        };
        let value_start = cursor + 1;
        let value_len = bytes[value_start..]
            .iter()
            .position(|b| *b == quote)
            .ok_or_else(|| malformed(value_start, "unterminated attribute value"))?;
        let value_end = value_start + value_len;
        node.attributes.insert(
            xml[name_start..name_end].to_string(),
            decode_entities(&xml[value_start..value_end]),
        );
        cursor = value_end + 1;
    }
}

/// Decodes the predefined XML entities and numeric character references.
///
/// Unknown or malformed references are kept verbatim.
fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').and_then(|semi| {
            let entity = &tail[1..semi];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .or_else(|| entity.strip_prefix('#').map(str::parse::<u32>))
                    .and_then(Result::ok)
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, semi + 1))
        });
        match decoded {
            Some((ch, consumed)) => {
                out.push(ch);
                rest = &tail[consumed..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?><hierarchy rotation="0"><node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.app" content-desc="" bounds="[0,0][1080,2340]"><node index="0" text="Tom &amp; Jerry" resource-id="com.app:id/title" class="android.widget.TextView" content-desc="" bounds="[42,100][600,180]" /><node index="1" text="&#x4F60;&#22909;" class="android.widget.Button" bounds="[42,200][600,280]"></node></node></hierarchy>UI hierchary dumped to: /dev/tty"#;

    #[test]
    fn parses_real_dump() {
        let root = parse_hierarchy(DUMP).unwrap();
        assert_eq!(root.tag, "hierarchy");
        assert_eq!(root.attr("rotation"), Some("0"));
        assert_eq!(root.children.len(), 1);

        let frame = &root.children[0];
        assert_eq!(frame.attr("class"), Some("android.widget.FrameLayout"));
        assert_eq!(frame.children.len(), 2);
        assert_eq!(frame.children[0].attr("text"), Some("Tom & Jerry"));
        assert_eq!(frame.children[1].attr("text"), Some("你好"));
    }

    #[test]
    fn skips_comments_and_leading_noise() {
        let root = parse_hierarchy("noise\n<!-- c --><hierarchy><node bounds='[0,0][1,1]'/></hierarchy>").unwrap();
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].attr("bounds"), Some("[0,0][1,1]"));
    }

    #[test]
    fn empty_input_has_no_root() {
        assert_eq!(parse_hierarchy(""), Err(ParseError::NoRoot));
        assert_eq!(parse_hierarchy("ERROR: could not get idle state."), Err(ParseError::NoRoot));
    }

    #[test]
    fn truncated_dump_is_malformed() {
        let truncated = &DUMP[..DUMP.len() / 2];
        assert!(matches!(
            parse_hierarchy(truncated),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn mismatched_close_is_malformed() {
        assert!(parse_hierarchy("<hierarchy><node></hierarchy>").is_err());
    }

    #[test]
    fn unknown_entities_kept_verbatim() {
        assert_eq!(decode_entities("a &bogus; b & c"), "a &bogus; b & c");
        assert_eq!(decode_entities("&lt;tag&gt;"), "<tag>");
    }
}
