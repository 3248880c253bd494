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

//! NUMERIC codec. The binary wire form is the PostgreSQL base-10000
//! representation: digit-group count, weight of the first group, sign word
//! and display scale followed by the groups themselves.

use crate::{CodecContext, Datum, TypeError};
use bigdecimal::BigDecimal;
use byteorder::{BigEndian, ReadBytesExt};
use std::str::FromStr;

const SIGN_POSITIVE: u16 = 0x0000;
const SIGN_NEGATIVE: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;

pub(crate) fn decode_text(s: &str, _ctx: &CodecContext) -> Result<Datum, TypeError> {
    let trimmed = s.trim();
    match trimmed.to_lowercase().as_str() {
        "nan" | "infinity" | "-infinity" | "inf" | "-inf" => {
            return Err(TypeError::invalid("numeric", format!("{} is not allowed here", trimmed)));
        }
        _ => {}
    }
    BigDecimal::from_str(trimmed)
        .map(Datum::Numeric)
        .map_err(|_| TypeError::invalid("numeric", s))
}

pub(crate) fn encode_text(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Numeric(value) => Ok(value.to_string().into_bytes()),
        Datum::Int16(value) => Ok(value.to_string().into_bytes()),
        Datum::Int32(value) => Ok(value.to_string().into_bytes()),
        Datum::Int64(value) => Ok(value.to_string().into_bytes()),
        other => Err(TypeError::invalid("numeric", format!("{:?}", other))),
    }
}

pub(crate) fn decode_binary(mut buf: &[u8], _ctx: &CodecContext) -> Result<Datum, TypeError> {
    let violation = || TypeError::violation("numeric");

    let ndigits = buf.read_u16::<BigEndian>().map_err(|_| violation())?;
    let weight = buf.read_i16::<BigEndian>().map_err(|_| violation())?;
    let sign = buf.read_u16::<BigEndian>().map_err(|_| violation())?;
    let dscale = buf.read_u16::<BigEndian>().map_err(|_| violation())?;

    let negative = match sign {
        SIGN_POSITIVE => false,
        SIGN_NEGATIVE => true,
        SIGN_NAN => return Err(TypeError::invalid("numeric", "NaN is not allowed here")),
        _ => return Err(TypeError::invalid("numeric", "infinity is not allowed here")),
    };

    let mut groups = Vec::with_capacity(ndigits as usize);
    for _ in 0..ndigits {
        let group = buf.read_u16::<BigEndian>().map_err(|_| violation())?;
        if group > 9999 {
            return Err(violation());
        }
        groups.push(group);
    }
    if !buf.is_empty() {
        return Err(violation());
    }

    if groups.is_empty() {
        let zero = BigDecimal::from(0).with_scale(dscale as i64);
        return Ok(Datum::Numeric(zero));
    }

    let mut digits = String::with_capacity(groups.len() * 4);
    for group in &groups {
        digits.push_str(&format!("{:04}", group));
    }

    // value = digits * 10^exp10
    let exp10 = (weight as i64 + 1 - groups.len() as i64) * 4;
    let mut literal = String::new();
    if negative {
        literal.push('-');
    }
    if exp10 >= 0 {
        literal.push_str(&digits);
        for _ in 0..exp10 {
            literal.push('0');
        }
    } else {
        let fraction_len = (-exp10) as usize;
        if digits.len() > fraction_len {
            let split = digits.len() - fraction_len;
            literal.push_str(&digits[..split]);
            literal.push('.');
            literal.push_str(&digits[split..]);
        } else {
            literal.push_str("0.");
            for _ in 0..(fraction_len - digits.len()) {
                literal.push('0');
            }
            literal.push_str(&digits);
        }
    }

    BigDecimal::from_str(&literal)
        .map(|value| Datum::Numeric(value.with_scale(dscale as i64)))
        .map_err(|_| violation())
}

pub(crate) fn encode_binary(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    let value = match datum {
        Datum::Numeric(value) => value.clone(),
        Datum::Int16(value) => BigDecimal::from(*value),
        Datum::Int32(value) => BigDecimal::from(*value),
        Datum::Int64(value) => BigDecimal::from(*value),
        other => return Err(TypeError::invalid("numeric", format!("{:?}", other))),
    };

    let (bigint, exponent) = value.as_bigint_and_exponent();
    let mut digits = bigint.to_string();
    let negative = digits.starts_with('-');
    if negative {
        digits.remove(0);
    }

    // exponent is the count of fractional decimal digits; a negative exponent
    // means trailing integer zeros that are not materialized in `digits`
    let dscale = exponent.max(0) as u16;
    let mut scale = exponent;
    if scale < 0 {
        for _ in 0..(-scale) {
            digits.push('0');
        }
        scale = 0;
    }
    let scale = scale as usize;

    if digits.bytes().all(|b| b == b'0') {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0i16.to_be_bytes());
        buf.extend_from_slice(&SIGN_POSITIVE.to_be_bytes());
        buf.extend_from_slice(&dscale.to_be_bytes());
        return Ok(buf);
    }

    let int_len = digits.len() as i64 - scale as i64;
    let lead = ((4 - int_len.rem_euclid(4)) % 4) as usize;
    let mut padded = String::with_capacity(lead + digits.len() + 3);
    for _ in 0..lead {
        padded.push('0');
    }
    padded.push_str(&digits);
    while padded.len() % 4 != 0 {
        padded.push('0');
    }

    let mut weight = (int_len + lead as i64) / 4 - 1;
    let mut groups: Vec<u16> = padded
        .as_bytes()
        .chunks(4)
        .map(|chunk| {
            chunk
                .iter()
                .fold(0u16, |acc, digit| acc * 10 + (*digit - b'0') as u16)
        })
        .collect();

    while groups.first() == Some(&0) {
        groups.remove(0);
        weight -= 1;
    }
    while groups.last() == Some(&0) {
        groups.pop();
    }

    let mut buf = Vec::with_capacity(8 + groups.len() * 2);
    buf.extend_from_slice(&(groups.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(weight as i16).to_be_bytes());
    buf.extend_from_slice(&if negative { SIGN_NEGATIVE } else { SIGN_POSITIVE }.to_be_bytes());
    buf.extend_from_slice(&dscale.to_be_bytes());
    for group in groups {
        buf.extend_from_slice(&group.to_be_bytes());
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode, encode};
    use rstest::rstest;
    use wire_protocol_payload::{PgFormat, NUMERIC};

    fn numeric(literal: &str) -> Datum {
        Datum::Numeric(BigDecimal::from_str(literal).unwrap())
    }

    #[test]
    fn text_round_trip() {
        let ctx = CodecContext::default();
        let datum = decode(NUMERIC, PgFormat::Text, b"123.450", &ctx).unwrap();
        assert_eq!(datum, numeric("123.450"));
        assert_eq!(encode(NUMERIC, PgFormat::Text, &datum, &ctx).unwrap(), b"123.450".to_vec());
    }

    #[test]
    fn nan_and_infinity_are_rejected() {
        let ctx = CodecContext::default();
        for illegal in &["NaN", "Infinity", "-Infinity"] {
            assert!(matches!(
                decode(NUMERIC, PgFormat::Text, illegal.as_bytes(), &ctx),
                Err(TypeError::InvalidArgument { .. })
            ));
        }
    }

    #[test]
    fn binary_encoding_of_one() {
        let ctx = CodecContext::default();
        let encoded = encode(NUMERIC, PgFormat::Binary, &numeric("1"), &ctx).unwrap();
        // ndigits=1, weight=0, sign=positive, dscale=0, digits=[1]
        assert_eq!(encoded, vec![0, 1, 0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn binary_nan_is_rejected() {
        let ctx = CodecContext::default();
        let wire = vec![0, 0, 0, 0, 0xC0, 0, 0, 0];
        assert!(matches!(
            decode(NUMERIC, PgFormat::Binary, &wire, &ctx),
            Err(TypeError::InvalidArgument { .. })
        ));
    }

    #[rstest]
    #[case("0")]
    #[case("1")]
    #[case("-1")]
    #[case("123.45")]
    #[case("-0.0001")]
    #[case("9999999999.9999")]
    #[case("10000")]
    #[case("123456780000")]
    #[case("0.1")]
    #[case("-73786.182")]
    fn binary_round_trip(#[case] literal: &str) {
        let ctx = CodecContext::default();
        let datum = numeric(literal);
        let encoded = encode(NUMERIC, PgFormat::Binary, &datum, &ctx).unwrap();
        let decoded = decode(NUMERIC, PgFormat::Binary, &encoded, &ctx).unwrap();
        match (decoded, &datum) {
            (Datum::Numeric(decoded), Datum::Numeric(original)) => assert_eq!(decoded, *original),
            other => panic!("unexpected round trip result {:?}", other),
        }
    }

    #[test]
    fn truncated_binary_is_a_protocol_violation() {
        let ctx = CodecContext::default();
        assert_eq!(
            decode(NUMERIC, PgFormat::Binary, &[0, 1, 0, 0], &ctx),
            Err(TypeError::ProtocolViolation { pg_type: "numeric" })
        );
    }
}
