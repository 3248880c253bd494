// Copyright 2020 - 2021 Alex Dukhno
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! One-dimensional array support on top of the element codecs. Text form is
//! the `{…,…}` syntax with quoting and escaping; binary form is the standard
//! array header followed by the elements.

use crate::{Codec, CodecContext, Datum, TypeError};
use byteorder::{BigEndian, ReadBytesExt};

pub(crate) fn decode_text(s: &str, codec: &Codec, ctx: &CodecContext) -> Result<Datum, TypeError> {
    let trimmed = s.trim();
    let inner = trimmed
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| TypeError::invalid("array", s))?;

    let mut elements = vec![];
    let mut current = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut chars = inner.chars();
    let mut saw_any = false;
    while let Some(c) = chars.next() {
        saw_any = true;
        match c {
            '"' if !in_quotes => {
                in_quotes = true;
                quoted = true;
            }
            '"' if in_quotes => in_quotes = false,
            '\\' if in_quotes => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err(TypeError::invalid("array", s)),
            },
            ',' if !in_quotes => {
                elements.push(finish_element(&mut current, &mut quoted, codec, ctx)?);
            }
            '{' if !in_quotes => {
                return Err(TypeError::invalid("array", "nested arrays are not supported"));
            }
            other => current.push(other),
        }
    }
    if in_quotes {
        return Err(TypeError::invalid("array", s));
    }
    if saw_any || !current.is_empty() {
        elements.push(finish_element(&mut current, &mut quoted, codec, ctx)?);
    }
    Ok(Datum::Array(elements))
}

fn finish_element(current: &mut String, quoted: &mut bool, codec: &Codec, ctx: &CodecContext) -> Result<Datum, TypeError> {
    let raw = std::mem::take(current);
    let was_quoted = std::mem::take(quoted);
    let trimmed = if was_quoted { raw } else { raw.trim().to_owned() };
    if !was_quoted && trimmed.eq_ignore_ascii_case("null") {
        return Ok(Datum::Null);
    }
    (codec.text_decode)(&trimmed, ctx)
}

pub(crate) fn encode_text(datum: &Datum, codec: &Codec, ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    let elements = match datum {
        Datum::Array(elements) => elements,
        other => return Err(TypeError::invalid("array", format!("{:?}", other))),
    };
    let mut out = String::from("{");
    for (index, element) in elements.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        match element {
            Datum::Null => out.push_str("NULL"),
            value => {
                let encoded = (codec.text_encode)(value, ctx)?;
                let text = String::from_utf8(encoded).map_err(|_| TypeError::violation("array"))?;
                if needs_quoting(&text) {
                    out.push('"');
                    for c in text.chars() {
                        if c == '"' || c == '\\' {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push('"');
                } else {
                    out.push_str(&text);
                }
            }
        }
    }
    out.push('}');
    Ok(out.into_bytes())
}

fn needs_quoting(text: &str) -> bool {
    text.is_empty()
        || text.eq_ignore_ascii_case("null")
        || text
            .chars()
            .any(|c| matches!(c, ',' | '{' | '}' | '"' | '\\' | ' ' | '\t' | '\n'))
}

pub(crate) fn decode_binary(mut buf: &[u8], codec: &Codec, ctx: &CodecContext) -> Result<Datum, TypeError> {
    let violation = || TypeError::violation("array");

    let ndim = buf.read_i32::<BigEndian>().map_err(|_| violation())?;
    let _flags = buf.read_i32::<BigEndian>().map_err(|_| violation())?;
    let _element_oid = buf.read_u32::<BigEndian>().map_err(|_| violation())?;

    if ndim == 0 {
        return Ok(Datum::Array(vec![]));
    }
    if ndim != 1 {
        return Err(TypeError::invalid("array", "only one-dimensional arrays are supported"));
    }

    let len = buf.read_i32::<BigEndian>().map_err(|_| violation())?;
    let _lower_bound = buf.read_i32::<BigEndian>().map_err(|_| violation())?;
    if len < 0 {
        return Err(violation());
    }

    let mut elements = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let value_len = buf.read_i32::<BigEndian>().map_err(|_| violation())?;
        if value_len == -1 {
            elements.push(Datum::Null);
            continue;
        }
        let value_len = value_len as usize;
        if buf.len() < value_len {
            return Err(violation());
        }
        let (value, rest) = buf.split_at(value_len);
        buf = rest;
        elements.push((codec.binary_decode)(value, ctx)?);
    }
    if !buf.is_empty() {
        return Err(violation());
    }
    Ok(Datum::Array(elements))
}

pub(crate) fn encode_binary(datum: &Datum, codec: &Codec, ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    let elements = match datum {
        Datum::Array(elements) => elements,
        other => return Err(TypeError::invalid("array", format!("{:?}", other))),
    };
    let has_nulls = elements.iter().any(Datum::is_null);
    let mut buf = Vec::new();
    if elements.is_empty() {
        buf.extend_from_slice(&0i32.to_be_bytes());
        buf.extend_from_slice(&0i32.to_be_bytes());
        buf.extend_from_slice(&codec.oid.to_be_bytes());
        return Ok(buf);
    }
    buf.extend_from_slice(&1i32.to_be_bytes());
    buf.extend_from_slice(&(has_nulls as i32).to_be_bytes());
    buf.extend_from_slice(&codec.oid.to_be_bytes());
    buf.extend_from_slice(&(elements.len() as i32).to_be_bytes());
    buf.extend_from_slice(&1i32.to_be_bytes());
    for element in elements {
        match element {
            Datum::Null => buf.extend_from_slice(&(-1i32).to_be_bytes()),
            value => {
                let encoded = (codec.binary_encode)(value, ctx)?;
                buf.extend_from_slice(&(encoded.len() as i32).to_be_bytes());
                buf.extend_from_slice(&encoded);
            }
        }
    }
    Ok(buf)
}
