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

//! Date and timestamp codecs. The binary epoch is 2000-01-01: dates travel as
//! days from the epoch in an int32, timestamps as microseconds in an int64.

use crate::{CodecContext, Datum, TypeError};
use byteorder::{BigEndian, ReadBytesExt};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd(2000, 1, 1)
}

fn pg_epoch() -> NaiveDateTime {
    pg_epoch_date().and_hms(0, 0, 0)
}

/// Strips optional wrapping `( … )`, `' … '` and `" … "` with whitespace
/// tolerated between the layers
fn unwrap_literal(s: &str) -> &str {
    let mut value = s.trim();
    loop {
        let current = value;
        if value.starts_with('(') && value.ends_with(')') && value.len() >= 2 {
            value = value[1..value.len() - 1].trim();
        }
        if value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2 {
            value = value[1..value.len() - 1].trim();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].trim();
        }
        if value == current {
            return value;
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, ()> {
    let mut parts = s.splitn(3, '-');
    let year = parts.next().ok_or(())?.trim().parse::<i32>().map_err(|_| ())?;
    let month = parts.next().ok_or(())?.trim().parse::<u32>().map_err(|_| ())?;
    let day = parts.next().ok_or(())?.trim().parse::<u32>().map_err(|_| ())?;
    NaiveDate::from_ymd_opt(year, month, day).ok_or(())
}

fn parse_time(s: &str) -> Result<NaiveTime, ()> {
    let (hms, fraction) = match s.find('.') {
        Some(pos) => (&s[..pos], Some(&s[pos + 1..])),
        None => (s, None),
    };
    let mut parts = hms.splitn(3, ':');
    let hour = parts.next().ok_or(())?.trim().parse::<u32>().map_err(|_| ())?;
    let minute = parts.next().ok_or(())?.trim().parse::<u32>().map_err(|_| ())?;
    let second = match parts.next() {
        Some(seconds) => seconds.trim().parse::<u32>().map_err(|_| ())?,
        None => 0,
    };
    let nanos = match fraction {
        Some(digits) => {
            if digits.is_empty() || digits.len() > 9 || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(());
            }
            let mut padded = digits.to_owned();
            while padded.len() < 9 {
                padded.push('0');
            }
            padded.parse::<u32>().map_err(|_| ())?
        }
        None => 0,
    };
    NaiveTime::from_hms_nano_opt(hour, minute, second, nanos).ok_or(())
}

/// Splits a trailing `±HH[:MM]` / `±HHMM` / `Z` offset off a time string.
/// The date part is already gone, so any sign here starts an offset.
fn split_offset(s: &str) -> (&str, Option<Result<FixedOffset, ()>>) {
    if let Some(stripped) = s.strip_suffix('Z').or_else(|| s.strip_suffix('z')) {
        return (stripped, Some(Ok(FixedOffset::east(0))));
    }
    if let Some(pos) = s.rfind(|c| c == '+' || c == '-') {
        if pos > 0 {
            let (time, offset) = s.split_at(pos);
            return (time, Some(parse_offset(offset)));
        }
    }
    (s, None)
}

fn parse_offset(s: &str) -> Result<FixedOffset, ()> {
    let (sign, digits) = match s.split_at(1) {
        ("+", rest) => (1, rest),
        ("-", rest) => (-1, rest),
        _ => return Err(()),
    };
    let (hours, minutes) = if let Some(pos) = digits.find(':') {
        (
            digits[..pos].parse::<i32>().map_err(|_| ())?,
            digits[pos + 1..].parse::<i32>().map_err(|_| ())?,
        )
    } else if digits.len() == 4 {
        (
            digits[..2].parse::<i32>().map_err(|_| ())?,
            digits[2..].parse::<i32>().map_err(|_| ())?,
        )
    } else {
        (digits.parse::<i32>().map_err(|_| ())?, 0)
    };
    if hours > 15 || minutes > 59 {
        return Err(());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or(())
}

/// Parses `YYYY-MM-DD[ T]HH:MM[:SS[.fff]][±HH[:MM]]` with optional wrappers
fn parse_timestamp(s: &str) -> Result<(NaiveDateTime, Option<FixedOffset>), ()> {
    let value = unwrap_literal(s);
    let separator = value
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == ' ' || *c == 'T' || *c == 't')
        .map(|(at, _)| at);
    match separator {
        None => {
            let date = parse_date(value)?;
            Ok((date.and_hms(0, 0, 0), None))
        }
        Some(at) => {
            let date = parse_date(value[..at].trim())?;
            let rest = value[at + 1..].trim();
            let (time_part, offset) = split_offset(rest);
            let time = parse_time(time_part.trim())?;
            let offset = match offset {
                None => None,
                Some(parsed) => Some(parsed?),
            };
            Ok((date.and_time(time), offset))
        }
    }
}

// date

pub(crate) fn decode_date_text(s: &str, _ctx: &CodecContext) -> Result<Datum, TypeError> {
    parse_date(unwrap_literal(s))
        .map(Datum::Date)
        .map_err(|()| TypeError::invalid("date", s))
}

pub(crate) fn decode_date_binary(mut buf: &[u8], _ctx: &CodecContext) -> Result<Datum, TypeError> {
    let days = buf.read_i32::<BigEndian>().map_err(|_| TypeError::violation("date"))?;
    if !buf.is_empty() {
        return Err(TypeError::violation("date"));
    }
    pg_epoch_date()
        .checked_add_signed(Duration::days(days as i64))
        .map(Datum::Date)
        .ok_or_else(|| TypeError::invalid("date", days))
}

pub(crate) fn encode_date_text(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Date(date) => Ok(date.format("%Y-%m-%d").to_string().into_bytes()),
        other => Err(TypeError::invalid("date", format!("{:?}", other))),
    }
}

pub(crate) fn encode_date_binary(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Date(date) => {
            let days = date.signed_duration_since(pg_epoch_date()).num_days() as i32;
            Ok(days.to_be_bytes().to_vec())
        }
        other => Err(TypeError::invalid("date", format!("{:?}", other))),
    }
}

// timestamp without time zone

pub(crate) fn decode_timestamp_text(s: &str, _ctx: &CodecContext) -> Result<Datum, TypeError> {
    parse_timestamp(s)
        .map(|(datetime, _offset)| Datum::Timestamp(datetime))
        .map_err(|()| TypeError::invalid("timestamp without time zone", s))
}

pub(crate) fn decode_timestamp_binary(mut buf: &[u8], _ctx: &CodecContext) -> Result<Datum, TypeError> {
    let micros = buf
        .read_i64::<BigEndian>()
        .map_err(|_| TypeError::violation("timestamp without time zone"))?;
    if !buf.is_empty() {
        return Err(TypeError::violation("timestamp without time zone"));
    }
    pg_epoch()
        .checked_add_signed(Duration::microseconds(micros))
        .map(Datum::Timestamp)
        .ok_or_else(|| TypeError::invalid("timestamp without time zone", micros))
}

pub(crate) fn encode_timestamp_text(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Timestamp(datetime) => Ok(datetime.format("%Y-%m-%d %H:%M:%S%.6f").to_string().into_bytes()),
        other => Err(TypeError::invalid("timestamp without time zone", format!("{:?}", other))),
    }
}

pub(crate) fn encode_timestamp_binary(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::Timestamp(datetime) => micros_since_epoch(datetime)
            .map(|micros| micros.to_be_bytes().to_vec())
            .ok_or_else(|| TypeError::invalid("timestamp without time zone", "out of range")),
        other => Err(TypeError::invalid("timestamp without time zone", format!("{:?}", other))),
    }
}

// timestamp with time zone

pub(crate) fn decode_timestamptz_text(s: &str, ctx: &CodecContext) -> Result<Datum, TypeError> {
    let (datetime, offset) = parse_timestamp(s).map_err(|()| TypeError::invalid("timestamp with time zone", s))?;
    let offset = offset.unwrap_or(ctx.timezone);
    match offset.from_local_datetime(&datetime).single() {
        Some(zoned) => Ok(Datum::TimestampTz(zoned.with_timezone(&Utc))),
        None => Err(TypeError::invalid("timestamp with time zone", s)),
    }
}

pub(crate) fn decode_timestamptz_binary(mut buf: &[u8], _ctx: &CodecContext) -> Result<Datum, TypeError> {
    let micros = buf
        .read_i64::<BigEndian>()
        .map_err(|_| TypeError::violation("timestamp with time zone"))?;
    if !buf.is_empty() {
        return Err(TypeError::violation("timestamp with time zone"));
    }
    pg_epoch()
        .checked_add_signed(Duration::microseconds(micros))
        .map(|datetime| Datum::TimestampTz(DateTime::<Utc>::from_utc(datetime, Utc)))
        .ok_or_else(|| TypeError::invalid("timestamp with time zone", micros))
}

pub(crate) fn encode_timestamptz_text(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::TimestampTz(datetime) => Ok(datetime
            .format("%Y-%m-%d %H:%M:%S%.6f+00:00")
            .to_string()
            .into_bytes()),
        other => Err(TypeError::invalid("timestamp with time zone", format!("{:?}", other))),
    }
}

pub(crate) fn encode_timestamptz_binary(datum: &Datum, _ctx: &CodecContext) -> Result<Vec<u8>, TypeError> {
    match datum {
        Datum::TimestampTz(datetime) => micros_since_epoch(&datetime.naive_utc())
            .map(|micros| micros.to_be_bytes().to_vec())
            .ok_or_else(|| TypeError::invalid("timestamp with time zone", "out of range")),
        other => Err(TypeError::invalid("timestamp with time zone", format!("{:?}", other))),
    }
}

fn micros_since_epoch(datetime: &NaiveDateTime) -> Option<i64> {
    datetime.signed_duration_since(pg_epoch()).num_microseconds()
}
