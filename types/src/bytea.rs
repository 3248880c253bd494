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

//! BYTEA codec. Text form is `\x<hex>` or the classic octal-escape syntax;
//! binary form is the raw bytes.

use crate::{CodecContext, Datum, TypeError};

pub(crate) fn decode_text(s: &str, _ctx: &CodecContext) -> Result<Datum, TypeError> {
    if let Some(hex) = s.strip_prefix("\\x").or_else(|| s.strip_prefix("\\X")) {
        return decode_hex(hex).map(Datum::Bytes).ok_or_else(|| TypeError::invalid("bytea", s));
    }
    decode_escape(s).map(Datum::Bytes).ok_or_else(|| TypeError::invalid("bytea", s))
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let digits = hex.as_bytes();
    for pair in digits.chunks(2) {
        let high = (pair[0] as char).to_digit(16)?;
        let low = (pair[1] as char).to_digit(16)?;
        bytes.push((high * 16 + low) as u8);
    }
    Some(bytes)
}

fn decode_escape(s: &str) -> Option<Vec<u8>> {
    let mut bytes = Vec::with_capacity(s.len());
    let mut chars = s.bytes();
    while let Some(byte) = chars.next() {
        if byte != b'\\' {
            bytes.push(byte);
            continue;
        }
        match chars.next()? {
            b'\\' => bytes.push(b'\\'),
            first @ b'0'..=b'3' => {
                let second = chars.next()?;
                let third = chars.next()?;
                if !(b'0'..=b'7').contains(&second) || !(b'0'..=b'7').contains(&third) {
                    return None;
                }
                bytes.push((first - b'0') * 64 + (second - b'0') * 8 + (third - b'0'));
            }
            _ => return None,
        }
    }
    Some(bytes)
}

pub(crate) fn decode_binary(buf: &[u8], _ctx: &CodecContext) -> Result<Datum, TypeError> {
    Ok(Datum::Bytes(buf.to_vec()))
}

pub(crate) fn encode_text(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Bytes(bytes) => {
            let mut out = Vec::with_capacity(bytes.len() * 2 + 2);
            out.extend_from_slice(b"\\x");
            for byte in bytes {
                out.extend_from_slice(format!("{:02x}", byte).as_bytes());
            }
            Ok(out)
        }
        other => Err(TypeError::invalid("bytea", format!("{:?}", other))),
    }
}

pub(crate) fn encode_binary(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Bytes(bytes) => Ok(bytes.clone()),
        other => Err(TypeError::invalid("bytea", format!("{:?}", other))),
    }
}
