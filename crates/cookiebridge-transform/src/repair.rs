//! Best-effort repair of JSON objects produced by generative text.
//!
//! Handles trailing commas, single-quoted strings, unquoted keys, raw control
//! characters and stray quotes inside strings, Python literals and missing
//! closing brackets. Output is only ever used after it re-parses cleanly.

use std::fmt::Write as _;
use std::iter::Peekable;
use std::str::CharIndices;

use serde_json::Value;

const MAX_REPAIR_BYTES: usize = 64 * 1024;

/// Repairs the object starting at the first byte of `fragment` (which must be
/// `{`). Returns the parsed object and how many bytes of `fragment` it spans.
pub(crate) fn repair_object(fragment: &str) -> Option<(Value, usize)> {
    if !fragment.starts_with('{') {
        return None;
    }
    let mut limit = fragment.len().min(MAX_REPAIR_BYTES);
    while !fragment.is_char_boundary(limit) {
        limit -= 1;
    }
    let (repaired, consumed) = rewrite(&fragment[..limit]);
    let value: Value = serde_json::from_str(&repaired).ok()?;
    value.is_object().then_some((value, consumed))
}

fn rewrite(input: &str) -> (String, usize) {
    let mut out = String::with_capacity(input.len() + 16);
    let mut closers: Vec<char> = Vec::new();
    let mut chars = input.char_indices().peekable();
    let mut consumed = input.len();

    while let Some((pos, ch)) = chars.next() {
        match ch {
            '"' | '\'' => read_string(ch, &mut chars, &mut out),
            '{' => {
                closers.push('}');
                out.push(ch);
            }
            '[' => {
                closers.push(']');
                out.push(ch);
            }
            '}' | ']' => {
                if !closers.contains(&ch) {
                    consumed = pos;
                    break;
                }
                while let Some(expected) = closers.pop() {
                    drop_trailing_comma(&mut out);
                    out.push(expected);
                    if expected == ch {
                        break;
                    }
                }
                if closers.is_empty() {
                    consumed = pos + ch.len_utf8();
                    break;
                }
            }
            c if (c.is_alphabetic() || c == '_' || c == '$')
                && !out.ends_with(|prev: char| prev.is_ascii_digit() || prev == '.') =>
            {
                let mut word = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_alphanumeric() || matches!(next, '_' | '$' | '-') {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let is_key =
                    closers.last() == Some(&'}') && next_significant(&chars) == Some(':');
                match word.as_str() {
                    _ if is_key => push_quoted(&mut out, &word),
                    "true" | "True" => out.push_str("true"),
                    "false" | "False" => out.push_str("false"),
                    "null" | "None" | "none" | "undefined" => out.push_str("null"),
                    _ => push_quoted(&mut out, &word),
                }
            }
            c if c.is_control() && !c.is_whitespace() => {}
            _ => out.push(ch),
        }
    }

    drop_trailing_comma(&mut out);
    while let Some(closer) = closers.pop() {
        drop_trailing_comma(&mut out);
        out.push(closer);
    }
    (out, consumed)
}

fn read_string(quote: char, chars: &mut Peekable<CharIndices<'_>>, out: &mut String) {
    out.push('"');
    while let Some((_, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, '\'')) if quote == '\'' => out.push('\''),
                Some((_, esc)) if matches!(esc, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                    out.push('\\');
                    out.push(esc);
                }
                Some((_, esc)) => {
                    out.push_str("\\\\");
                    push_escaped(out, esc);
                }
                None => out.push_str("\\\\"),
            },
            c if c == quote => {
                // A quote that is not followed by a structural character is
                // content, not the end of the string.
                if quote == '"' && !closes_string(chars) {
                    out.push_str("\\\"");
                } else {
                    out.push('"');
                    return;
                }
            }
            c => push_escaped(out, c),
        }
    }
    out.push('"');
}

fn closes_string(chars: &Peekable<CharIndices<'_>>) -> bool {
    matches!(next_significant(chars), None | Some(',' | '}' | ']' | ':'))
}

fn next_significant(chars: &Peekable<CharIndices<'_>>) -> Option<char> {
    chars
        .clone()
        .map(|(_, c)| c)
        .find(|c| !c.is_whitespace())
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '"' => out.push_str("\\\""),
        '\\' => out.push_str("\\\\"),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        c if c.is_control() => {
            let _ = write!(out, "\\u{:04x}", c as u32);
        }
        c => out.push(c),
    }
}

fn push_quoted(out: &mut String, word: &str) {
    out.push('"');
    for c in word.chars() {
        push_escaped(out, c);
    }
    out.push('"');
}

fn drop_trailing_comma(out: &mut String) {
    let trimmed = out.trim_end().len();
    if out[..trimmed].ends_with(',') {
        out.truncate(trimmed - 1);
    }
}
