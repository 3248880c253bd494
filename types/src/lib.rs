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

//! Value codecs between PostgreSQL wire representations and backend values.
//!
//! There is one codec record per base type OID, each holding the four
//! conversion functions (text/binary decode, text/binary encode). Array types
//! are dispatched on top of their element codec.

mod array;
mod bytea;
mod numeric;
mod temporal;

use bigdecimal::BigDecimal;
use byteorder::{BigEndian, ReadBytesExt};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use std::{
    fmt::{self, Display, Formatter},
    str,
};
use wire_protocol_payload as oids;
use wire_protocol_payload::PgFormat;

/// A single value crossing the wire boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Numeric(BigDecimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Jsonb(String),
    Array(Vec<Datum>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }
}

/// Conversion failure, split the way the protocol reports it
#[derive(Debug, Clone, PartialEq)]
pub enum TypeError {
    /// the bytes are readable as the type but the value is illegal
    InvalidArgument { pg_type: &'static str, message: String },
    /// the bytes do not form the declared type at all
    ProtocolViolation { pg_type: &'static str },
}

impl TypeError {
    pub(crate) fn invalid<M: ToString>(pg_type: &'static str, message: M) -> TypeError {
        TypeError::InvalidArgument {
            pg_type,
            message: message.to_string(),
        }
    }

    pub(crate) fn violation(pg_type: &'static str) -> TypeError {
        TypeError::ProtocolViolation { pg_type }
    }
}

impl Display for TypeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TypeError::InvalidArgument { pg_type, message } => {
                write!(f, "invalid input for type {}: {}", pg_type, message)
            }
            TypeError::ProtocolViolation { pg_type } => {
                write!(f, "insufficient or malformed data for type {}", pg_type)
            }
        }
    }
}

/// Session-dependent pieces of decoding, currently the time zone applied to
/// timestamps without an explicit offset
#[derive(Debug, Clone, Copy)]
pub struct CodecContext {
    pub timezone: FixedOffset,
}

impl Default for CodecContext {
    fn default() -> CodecContext {
        CodecContext {
            timezone: FixedOffset::east(0),
        }
    }
}

impl CodecContext {
    pub fn with_timezone(timezone: FixedOffset) -> CodecContext {
        CodecContext { timezone }
    }
}

type TextDecode = fn(&str, &CodecContext) -> Result<Datum, TypeError>;
type BinaryDecode = fn(&[u8], &CodecContext) -> Result<Datum, TypeError>;
type TextEncode = fn(&Datum, &CodecContext) -> Result<Vec<u8>, TypeError>;
type BinaryEncode = fn(&Datum, &CodecContext) -> Result<Vec<u8>, TypeError>;

/// One codec per base type: the four conversion functions plus wire metadata
pub struct Codec {
    pub oid: u32,
    pub name: &'static str,
    pub type_len: i16,
    pub text_decode: TextDecode,
    pub binary_decode: BinaryDecode,
    pub text_encode: TextEncode,
    pub binary_encode: BinaryEncode,
}

static CODECS: &[Codec] = &[
    Codec {
        oid: oids::BOOL,
        name: "boolean",
        type_len: 1,
        text_decode: decode_bool_text,
        binary_decode: decode_bool_binary,
        text_encode: encode_bool_text,
        binary_encode: encode_bool_binary,
    },
    Codec {
        oid: oids::SMALLINT,
        name: "smallint",
        type_len: 2,
        text_decode: decode_int2_text,
        binary_decode: decode_int2_binary,
        text_encode: encode_int_text,
        binary_encode: encode_int2_binary,
    },
    Codec {
        oid: oids::INT,
        name: "integer",
        type_len: 4,
        text_decode: decode_int4_text,
        binary_decode: decode_int4_binary,
        text_encode: encode_int_text,
        binary_encode: encode_int4_binary,
    },
    Codec {
        oid: oids::BIGINT,
        name: "bigint",
        type_len: 8,
        text_decode: decode_int8_text,
        binary_decode: decode_int8_binary,
        text_encode: encode_int_text,
        binary_encode: encode_int8_binary,
    },
    Codec {
        oid: oids::REAL,
        name: "real",
        type_len: 4,
        text_decode: decode_float4_text,
        binary_decode: decode_float4_binary,
        text_encode: encode_float_text,
        binary_encode: encode_float4_binary,
    },
    Codec {
        oid: oids::DOUBLE_PRECISION,
        name: "double precision",
        type_len: 8,
        text_decode: decode_float8_text,
        binary_decode: decode_float8_binary,
        text_encode: encode_float_text,
        binary_encode: encode_float8_binary,
    },
    Codec {
        oid: oids::NUMERIC,
        name: "numeric",
        type_len: -1,
        text_decode: numeric::decode_text,
        binary_decode: numeric::decode_binary,
        text_encode: numeric::encode_text,
        binary_encode: numeric::encode_binary,
    },
    Codec {
        oid: oids::TEXT,
        name: "text",
        type_len: -1,
        text_decode: decode_text_text,
        binary_decode: decode_text_binary,
        text_encode: encode_text_text,
        binary_encode: encode_text_text,
    },
    Codec {
        oid: oids::VARCHAR,
        name: "character varying",
        type_len: -1,
        text_decode: decode_text_text,
        binary_decode: decode_text_binary,
        text_encode: encode_text_text,
        binary_encode: encode_text_text,
    },
    Codec {
        oid: oids::CHAR,
        name: "character",
        type_len: 1,
        text_decode: decode_text_text,
        binary_decode: decode_text_binary,
        text_encode: encode_text_text,
        binary_encode: encode_text_text,
    },
    Codec {
        oid: oids::BYTEA,
        name: "bytea",
        type_len: -1,
        text_decode: bytea::decode_text,
        binary_decode: bytea::decode_binary,
        text_encode: bytea::encode_text,
        binary_encode: bytea::encode_binary,
    },
    Codec {
        oid: oids::DATE,
        name: "date",
        type_len: 4,
        text_decode: temporal::decode_date_text,
        binary_decode: temporal::decode_date_binary,
        text_encode: temporal::encode_date_text,
        binary_encode: temporal::encode_date_binary,
    },
    Codec {
        oid: oids::TIMESTAMP,
        name: "timestamp without time zone",
        type_len: 8,
        text_decode: temporal::decode_timestamp_text,
        binary_decode: temporal::decode_timestamp_binary,
        text_encode: temporal::encode_timestamp_text,
        binary_encode: temporal::encode_timestamp_binary,
    },
    Codec {
        oid: oids::TIMESTAMPTZ,
        name: "timestamp with time zone",
        type_len: 8,
        text_decode: temporal::decode_timestamptz_text,
        binary_decode: temporal::decode_timestamptz_binary,
        text_encode: temporal::encode_timestamptz_text,
        binary_encode: temporal::encode_timestamptz_binary,
    },
    Codec {
        oid: oids::JSONB,
        name: "jsonb",
        type_len: -1,
        text_decode: decode_jsonb_text,
        binary_decode: decode_jsonb_binary,
        text_encode: encode_jsonb_text,
        binary_encode: encode_jsonb_binary,
    },
];

/// Looks up the codec of a scalar type
pub fn codec_for(oid: u32) -> Option<&'static Codec> {
    CODECS.iter().find(|codec| codec.oid == oid)
}

/// Maps an array type to its element type
pub fn element_oid(array_oid: u32) -> Option<u32> {
    match array_oid {
        oids::BOOL_ARRAY => Some(oids::BOOL),
        oids::BYTEA_ARRAY => Some(oids::BYTEA),
        oids::SMALLINT_ARRAY => Some(oids::SMALLINT),
        oids::INT_ARRAY => Some(oids::INT),
        oids::BIGINT_ARRAY => Some(oids::BIGINT),
        oids::TEXT_ARRAY => Some(oids::TEXT),
        oids::REAL_ARRAY => Some(oids::REAL),
        oids::DOUBLE_PRECISION_ARRAY => Some(oids::DOUBLE_PRECISION),
        oids::VARCHAR_ARRAY => Some(oids::VARCHAR),
        oids::DATE_ARRAY => Some(oids::DATE),
        oids::TIMESTAMP_ARRAY => Some(oids::TIMESTAMP),
        oids::TIMESTAMPTZ_ARRAY => Some(oids::TIMESTAMPTZ),
        oids::NUMERIC_ARRAY => Some(oids::NUMERIC),
        oids::JSONB_ARRAY => Some(oids::JSONB),
        _ => None,
    }
}

/// Decodes a non-null value of the given type from its wire form
pub fn decode(oid: u32, format: PgFormat, raw: &[u8], ctx: &CodecContext) -> Result<Datum, TypeError> {
    if let Some(element) = element_oid(oid) {
        let codec = codec_for(element).ok_or_else(|| TypeError::violation("array"))?;
        return match format {
            PgFormat::Text => array::decode_text(as_utf8(raw, "array")?, codec, ctx),
            PgFormat::Binary => array::decode_binary(raw, codec, ctx),
        };
    }
    let codec = codec_for(oid).ok_or_else(|| TypeError::violation("unknown"))?;
    match format {
        PgFormat::Text => (codec.text_decode)(as_utf8(raw, codec.name)?, ctx),
        PgFormat::Binary => (codec.binary_decode)(raw, ctx),
    }
}

/// Encodes a value of the given type into its wire form
pub fn encode(oid: u32, format: PgFormat, datum: &Datum, ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    if let Some(element) = element_oid(oid) {
        let codec = codec_for(element).ok_or_else(|| TypeError::violation("array"))?;
        return match format {
            PgFormat::Text => array::encode_text(datum, codec, ctx),
            PgFormat::Binary => array::encode_binary(datum, codec, ctx),
        };
    }
    let codec = codec_for(oid).ok_or_else(|| TypeError::violation("unknown"))?;
    match format {
        PgFormat::Text => (codec.text_encode)(datum, ctx),
        PgFormat::Binary => (codec.binary_encode)(datum, ctx),
    }
}

/// Wire length reported in `RowDescription` for the given type
pub fn type_len(oid: u32) -> i16 {
    if element_oid(oid).is_some() {
        return -1;
    }
    codec_for(oid).map(|codec| codec.type_len).unwrap_or(-1)
}

/// Human name of a type used in error messages
pub fn type_name(oid: u32) -> &'static str {
    if element_oid(oid).is_some() {
        return "array";
    }
    codec_for(oid).map(|codec| codec.name).unwrap_or("unknown")
}

/// Resolves a SQL type name as written in DDL to its OID
pub fn oid_of_type_name(name: &str) -> Option<u32> {
    let lowered = name.trim().to_lowercase();
    let base = lowered.split('(').next().unwrap_or("").trim().to_owned();
    let (base, is_array) = match base.strip_suffix("[]") {
        Some(stripped) => (stripped.trim().to_owned(), true),
        None => (base, false),
    };
    let scalar = match base.as_str() {
        "bool" | "boolean" => oids::BOOL,
        "bytea" => oids::BYTEA,
        "smallint" | "int2" => oids::SMALLINT,
        "int" | "integer" | "int4" => oids::INT,
        "bigint" | "int8" => oids::BIGINT,
        "real" | "float4" => oids::REAL,
        "double precision" | "float8" => oids::DOUBLE_PRECISION,
        "numeric" | "decimal" => oids::NUMERIC,
        "text" => oids::TEXT,
        "varchar" | "character varying" => oids::VARCHAR,
        "char" | "character" => oids::CHAR,
        "date" => oids::DATE,
        "timestamp" | "timestamp without time zone" => oids::TIMESTAMP,
        "timestamptz" | "timestamp with time zone" => oids::TIMESTAMPTZ,
        "jsonb" => oids::JSONB,
        _ => return None,
    };
    if is_array {
        array_oid_of(scalar)
    } else {
        Some(scalar)
    }
}

fn array_oid_of(scalar: u32) -> Option<u32> {
    match scalar {
        oids::BOOL => Some(oids::BOOL_ARRAY),
        oids::BYTEA => Some(oids::BYTEA_ARRAY),
        oids::SMALLINT => Some(oids::SMALLINT_ARRAY),
        oids::INT => Some(oids::INT_ARRAY),
        oids::BIGINT => Some(oids::BIGINT_ARRAY),
        oids::TEXT => Some(oids::TEXT_ARRAY),
        oids::REAL => Some(oids::REAL_ARRAY),
        oids::DOUBLE_PRECISION => Some(oids::DOUBLE_PRECISION_ARRAY),
        oids::VARCHAR => Some(oids::VARCHAR_ARRAY),
        oids::DATE => Some(oids::DATE_ARRAY),
        oids::TIMESTAMP => Some(oids::TIMESTAMP_ARRAY),
        oids::TIMESTAMPTZ => Some(oids::TIMESTAMPTZ_ARRAY),
        oids::NUMERIC => Some(oids::NUMERIC_ARRAY),
        oids::JSONB => Some(oids::JSONB_ARRAY),
        _ => None,
    }
}

fn as_utf8<'r>(raw: &'r [u8], pg_type: &'static str) -> Result<&'r str, TypeError> {
    str::from_utf8(raw).map_err(|_| TypeError::violation(pg_type))
}

// boolean

fn decode_bool_text(s: &str, _ctx: &CodecContext) -> Result<Datum, TypeError> {
    match s.trim().to_lowercase().as_str() {
        "t" | "tr" | "tru" | "true" | "y" | "ye" | "yes" | "on" | "1" => Ok(Datum::Bool(true)),
        "f" | "fa" | "fal" | "fals" | "false" | "n" | "no" | "of" | "off" | "0" => Ok(Datum::Bool(false)),
        other => Err(TypeError::invalid("boolean", other)),
    }
}

fn decode_bool_binary(buf: &[u8], _ctx: &CodecContext) -> Result<Datum, TypeError> {
    if buf.len() != 1 {
        return Err(TypeError::violation("boolean"));
    }
    Ok(Datum::Bool(buf[0] != 0))
}

fn encode_bool_text(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Bool(true) => Ok(b"t".to_vec()),
        Datum::Bool(false) => Ok(b"f".to_vec()),
        other => Err(TypeError::invalid("boolean", format!("{:?}", other))),
    }
}

fn encode_bool_binary(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Bool(value) => Ok(vec![*value as u8]),
        other => Err(TypeError::invalid("boolean", format!("{:?}", other))),
    }
}

// integers

fn decode_int2_text(s: &str, _ctx: &CodecContext) -> Result<Datum, TypeError> {
    s.trim()
        .parse::<i16>()
        .map(Datum::Int16)
        .map_err(|_| TypeError::invalid("smallint", s))
}

fn decode_int4_text(s: &str, _ctx: &CodecContext) -> Result<Datum, TypeError> {
    s.trim()
        .parse::<i32>()
        .map(Datum::Int32)
        .map_err(|_| TypeError::invalid("integer", s))
}

fn decode_int8_text(s: &str, _ctx: &CodecContext) -> Result<Datum, TypeError> {
    s.trim()
        .parse::<i64>()
        .map(Datum::Int64)
        .map_err(|_| TypeError::invalid("bigint", s))
}

fn decode_int2_binary(mut buf: &[u8], _ctx: &CodecContext) -> Result<Datum, TypeError> {
    let value = buf.read_i16::<BigEndian>().map_err(|_| TypeError::violation("smallint"))?;
    if !buf.is_empty() {
        return Err(TypeError::violation("smallint"));
    }
    Ok(Datum::Int16(value))
}

fn decode_int4_binary(mut buf: &[u8], _ctx: &CodecContext) -> Result<Datum, TypeError> {
    let value = buf.read_i32::<BigEndian>().map_err(|_| TypeError::violation("integer"))?;
    if !buf.is_empty() {
        return Err(TypeError::violation("integer"));
    }
    Ok(Datum::Int32(value))
}

fn decode_int8_binary(mut buf: &[u8], _ctx: &CodecContext) -> Result<Datum, TypeError> {
    let value = buf.read_i64::<BigEndian>().map_err(|_| TypeError::violation("bigint"))?;
    if !buf.is_empty() {
        return Err(TypeError::violation("bigint"));
    }
    Ok(Datum::Int64(value))
}

fn encode_int_text(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Int16(value) => Ok(value.to_string().into_bytes()),
        Datum::Int32(value) => Ok(value.to_string().into_bytes()),
        Datum::Int64(value) => Ok(value.to_string().into_bytes()),
        other => Err(TypeError::invalid("integer", format!("{:?}", other))),
    }
}

fn encode_int2_binary(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Int16(value) => Ok(value.to_be_bytes().to_vec()),
        other => Err(TypeError::invalid("smallint", format!("{:?}", other))),
    }
}

fn encode_int4_binary(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Int16(value) => Ok((*value as i32).to_be_bytes().to_vec()),
        Datum::Int32(value) => Ok(value.to_be_bytes().to_vec()),
        other => Err(TypeError::invalid("integer", format!("{:?}", other))),
    }
}

fn encode_int8_binary(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Int16(value) => Ok((*value as i64).to_be_bytes().to_vec()),
        Datum::Int32(value) => Ok((*value as i64).to_be_bytes().to_vec()),
        Datum::Int64(value) => Ok(value.to_be_bytes().to_vec()),
        other => Err(TypeError::invalid("bigint", format!("{:?}", other))),
    }
}

// floats

fn decode_float4_text(s: &str, _ctx: &CodecContext) -> Result<Datum, TypeError> {
    match s.trim() {
        "NaN" => Ok(Datum::Float32(f32::NAN)),
        "Infinity" => Ok(Datum::Float32(f32::INFINITY)),
        "-Infinity" => Ok(Datum::Float32(f32::NEG_INFINITY)),
        trimmed => trimmed
            .parse::<f32>()
            .map(Datum::Float32)
            .map_err(|_| TypeError::invalid("real", s)),
    }
}

fn decode_float8_text(s: &str, _ctx: &CodecContext) -> Result<Datum, TypeError> {
    match s.trim() {
        "NaN" => Ok(Datum::Float64(f64::NAN)),
        "Infinity" => Ok(Datum::Float64(f64::INFINITY)),
        "-Infinity" => Ok(Datum::Float64(f64::NEG_INFINITY)),
        trimmed => trimmed
            .parse::<f64>()
            .map(Datum::Float64)
            .map_err(|_| TypeError::invalid("double precision", s)),
    }
}

fn decode_float4_binary(mut buf: &[u8], _ctx: &CodecContext) -> Result<Datum, TypeError> {
    let value = buf.read_f32::<BigEndian>().map_err(|_| TypeError::violation("real"))?;
    if !buf.is_empty() {
        return Err(TypeError::violation("real"));
    }
    Ok(Datum::Float32(value))
}

fn decode_float8_binary(mut buf: &[u8], _ctx: &CodecContext) -> Result<Datum, TypeError> {
    let value = buf
        .read_f64::<BigEndian>()
        .map_err(|_| TypeError::violation("double precision"))?;
    if !buf.is_empty() {
        return Err(TypeError::violation("double precision"));
    }
    Ok(Datum::Float64(value))
}

fn encode_float_text(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Float32(value) if value.is_nan() => Ok(b"NaN".to_vec()),
        Datum::Float64(value) if value.is_nan() => Ok(b"NaN".to_vec()),
        Datum::Float32(value) if value.is_infinite() => {
            Ok(if *value > 0.0 { b"Infinity".to_vec() } else { b"-Infinity".to_vec() })
        }
        Datum::Float64(value) if value.is_infinite() => {
            Ok(if *value > 0.0 { b"Infinity".to_vec() } else { b"-Infinity".to_vec() })
        }
        Datum::Float32(value) => Ok(value.to_string().into_bytes()),
        Datum::Float64(value) => Ok(value.to_string().into_bytes()),
        other => Err(TypeError::invalid("double precision", format!("{:?}", other))),
    }
}

fn encode_float4_binary(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Float32(value) => Ok(value.to_be_bytes().to_vec()),
        other => Err(TypeError::invalid("real", format!("{:?}", other))),
    }
}

fn encode_float8_binary(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Float32(value) => Ok((*value as f64).to_be_bytes().to_vec()),
        Datum::Float64(value) => Ok(value.to_be_bytes().to_vec()),
        other => Err(TypeError::invalid("double precision", format!("{:?}", other))),
    }
}

// text family

fn decode_text_text(s: &str, _ctx: &CodecContext) -> Result<Datum, TypeError> {
    Ok(Datum::Text(s.to_owned()))
}

fn decode_text_binary(buf: &[u8], _ctx: &CodecContext) -> Result<Datum, TypeError> {
    Ok(Datum::Text(as_utf8(buf, "text")?.to_owned()))
}

fn encode_text_text(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Text(value) => Ok(value.clone().into_bytes()),
        other => Err(TypeError::invalid("text", format!("{:?}", other))),
    }
}

// jsonb; binary form carries a 1-byte version prefix

fn decode_jsonb_text(s: &str, _ctx: &CodecContext) -> Result<Datum, TypeError> {
    Ok(Datum::Jsonb(s.to_owned()))
}

fn decode_jsonb_binary(buf: &[u8], _ctx: &CodecContext) -> Result<Datum, TypeError> {
    match buf.split_first() {
        Some((1, rest)) => Ok(Datum::Jsonb(as_utf8(rest, "jsonb")?.to_owned())),
        _ => Err(TypeError::violation("jsonb")),
    }
}

fn encode_jsonb_text(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Jsonb(value) => Ok(value.clone().into_bytes()),
        other => Err(TypeError::invalid("jsonb", format!("{:?}", other))),
    }
}

fn encode_jsonb_binary(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Jsonb(value) => {
            let mut buf = Vec::with_capacity(value.len() + 1);
            buf.push(1);
            buf.extend_from_slice(value.as_bytes());
            Ok(buf)
        }
        other => Err(TypeError::invalid("jsonb", format!("{:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_true_in_both_formats() {
        let ctx = CodecContext::default();
        assert_eq!(decode(oids::BOOL, PgFormat::Text, b"true", &ctx), Ok(Datum::Bool(true)));
        assert_eq!(decode(oids::BOOL, PgFormat::Binary, &[1], &ctx), Ok(Datum::Bool(true)));
    }

    #[test]
    fn decode_bool_shorthand_spellings() {
        let ctx = CodecContext::default();
        for spelling in &["t", "yes", "on", "1"] {
            assert_eq!(
                decode(oids::BOOL, PgFormat::Text, spelling.as_bytes(), &ctx),
                Ok(Datum::Bool(true))
            );
        }
        for spelling in &["f", "no", "off", "0"] {
            assert_eq!(
                decode(oids::BOOL, PgFormat::Text, spelling.as_bytes(), &ctx),
                Ok(Datum::Bool(false))
            );
        }
    }

    #[test]
    fn decode_integers() {
        let ctx = CodecContext::default();
        assert_eq!(decode(oids::SMALLINT, PgFormat::Text, b"1", &ctx), Ok(Datum::Int16(1)));
        assert_eq!(decode(oids::INT, PgFormat::Text, b"123", &ctx), Ok(Datum::Int32(123)));
        assert_eq!(
            decode(oids::BIGINT, PgFormat::Text, b"123456", &ctx),
            Ok(Datum::Int64(123456))
        );
        assert_eq!(
            decode(oids::BIGINT, PgFormat::Binary, &[0, 0, 0, 0, 0, 0, 0, 1], &ctx),
            Ok(Datum::Int64(1))
        );
    }

    #[test]
    fn binary_integer_with_trailing_bytes_is_a_protocol_violation() {
        let ctx = CodecContext::default();
        assert_eq!(
            decode(oids::INT, PgFormat::Binary, &[0, 0, 0, 1, 9], &ctx),
            Err(TypeError::ProtocolViolation { pg_type: "integer" })
        );
    }

    #[test]
    fn garbage_integer_text_is_invalid_argument() {
        let ctx = CodecContext::default();
        assert!(matches!(
            decode(oids::INT, PgFormat::Text, b"not a number", &ctx),
            Err(TypeError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn integer_round_trip_binary() {
        let ctx = CodecContext::default();
        let datum = Datum::Int32(-42);
        let encoded = encode(oids::INT, PgFormat::Binary, &datum, &ctx).unwrap();
        assert_eq!(decode(oids::INT, PgFormat::Binary, &encoded, &ctx), Ok(datum));
    }

    #[test]
    fn float_special_values() {
        let ctx = CodecContext::default();
        assert!(matches!(
            decode(oids::DOUBLE_PRECISION, PgFormat::Text, b"NaN", &ctx),
            Ok(Datum::Float64(value)) if value.is_nan()
        ));
        assert_eq!(
            decode(oids::DOUBLE_PRECISION, PgFormat::Text, b"-Infinity", &ctx),
            Ok(Datum::Float64(f64::NEG_INFINITY))
        );
    }

    #[test]
    fn text_round_trip() {
        let ctx = CodecContext::default();
        let datum = Datum::Text("héllo".to_owned());
        let encoded = encode(oids::TEXT, PgFormat::Text, &datum, &ctx).unwrap();
        assert_eq!(decode(oids::TEXT, PgFormat::Text, &encoded, &ctx), Ok(datum));
    }

    #[test]
    fn jsonb_binary_version_prefix() {
        let ctx = CodecContext::default();
        let datum = Datum::Jsonb("{\"a\":1}".to_owned());
        let encoded = encode(oids::JSONB, PgFormat::Binary, &datum, &ctx).unwrap();
        assert_eq!(encoded[0], 1);
        assert_eq!(decode(oids::JSONB, PgFormat::Binary, &encoded, &ctx), Ok(datum));
        assert_eq!(
            decode(oids::JSONB, PgFormat::Binary, b"\x02{}", &ctx),
            Err(TypeError::ProtocolViolation { pg_type: "jsonb" })
        );
    }

    #[test]
    fn type_names_resolve_to_oids() {
        assert_eq!(oid_of_type_name("bigint"), Some(oids::BIGINT));
        assert_eq!(oid_of_type_name("VARCHAR(100)"), Some(oids::VARCHAR));
        assert_eq!(oid_of_type_name("timestamp with time zone"), Some(oids::TIMESTAMPTZ));
        assert_eq!(oid_of_type_name("text[]"), Some(oids::TEXT_ARRAY));
        assert_eq!(oid_of_type_name("no such type"), None);
    }
}
