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

//! The streaming half of `COPY … FROM STDIN`. Payload arrives in arbitrary
//! `CopyData` slices; the writer keeps a partial-record carry buffer, turns
//! complete records into insert mutations and flushes them to the backend in
//! bounded batches.

use backend::{BackendConnection, Mutation, MutationOp};
use query_parser::copy::CopyFormat;
use query_response::QueryError;
use types::{CodecContext, Datum};
use wire_protocol_payload::PgFormat;

/// Rows buffered before the mutation queue is pushed to the backend
pub const BATCH_ROW_LIMIT: usize = 1000;
/// Payload bytes buffered before the mutation queue is pushed to the backend
pub const BATCH_BYTE_LIMIT: usize = 1 << 20;

const BINARY_SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

/// Converts a COPY payload stream into batched backend mutations
pub struct MutationWriter {
    table: String,
    columns: Vec<(String, u32)>,
    format: CopyFormat,
    delimiter: u8,
    null_marker: String,
    skip_first_record: bool,
    /// periodic commit mode for arbitrarily large loads
    partitioned: bool,
    ctx: CodecContext,
    carry: Vec<u8>,
    binary_header_seen: bool,
    trailer_seen: bool,
    rows_since_flush: usize,
    bytes_since_flush: usize,
    total_rows: usize,
    batch_row_limit: usize,
    batch_byte_limit: usize,
}

impl MutationWriter {
    pub fn new(
        table: String,
        columns: Vec<(String, u32)>,
        format: CopyFormat,
        delimiter: char,
        null_marker: String,
        has_header: bool,
        partitioned: bool,
        ctx: CodecContext,
    ) -> MutationWriter {
        MutationWriter {
            table,
            columns,
            format,
            delimiter: delimiter as u8,
            null_marker,
            skip_first_record: has_header,
            partitioned,
            ctx,
            carry: vec![],
            binary_header_seen: false,
            trailer_seen: false,
            rows_since_flush: 0,
            bytes_since_flush: 0,
            total_rows: 0,
            batch_row_limit: BATCH_ROW_LIMIT,
            batch_byte_limit: BATCH_BYTE_LIMIT,
        }
    }

    #[cfg(test)]
    fn with_batch_limits(mut self, rows: usize, bytes: usize) -> MutationWriter {
        self.batch_row_limit = rows;
        self.batch_byte_limit = bytes;
        self
    }

    /// Appends one `CopyData` payload and applies every record that is now
    /// complete. Incomplete trailing bytes stay in the carry buffer.
    pub fn push<B: BackendConnection>(&mut self, bytes: &[u8], backend: &mut B) -> Result<(), QueryError> {
        self.carry.extend_from_slice(bytes);
        match self.format {
            CopyFormat::Text => self.drain_text(backend),
            CopyFormat::Csv => self.drain_csv(backend),
            CopyFormat::Binary => self.drain_binary(backend),
        }
    }

    /// Applies a final partial record, flushes the last batch and returns the
    /// number of rows loaded
    pub fn finish<B: BackendConnection>(&mut self, backend: &mut B) -> Result<usize, QueryError> {
        match self.format {
            CopyFormat::Text => {
                if !self.carry.is_empty() {
                    let line = std::mem::take(&mut self.carry);
                    self.text_record(&line, backend)?;
                }
            }
            CopyFormat::Csv => {
                if !self.carry.is_empty() {
                    let record = std::mem::take(&mut self.carry);
                    self.csv_record(&record, backend)?;
                }
            }
            CopyFormat::Binary => {
                if !self.trailer_seen && !self.carry.is_empty() {
                    return Err(QueryError::protocol_violation("incomplete binary COPY data"));
                }
            }
        }
        self.flush(backend)?;
        Ok(self.total_rows)
    }

    /// Drops everything that has not reached the backend yet
    pub fn abort<B: BackendConnection>(&mut self, backend: &mut B) {
        self.carry.clear();
        backend.discard_mutations();
    }

    pub fn rows_loaded(&self) -> usize {
        self.total_rows
    }

    fn flush<B: BackendConnection>(&mut self, backend: &mut B) -> Result<(), QueryError> {
        if self.rows_since_flush == 0 {
            return Ok(());
        }
        backend
            .flush_mutations()
            .map_err(|error| QueryError::backend_error(error.code, error.message, error.hint))?;
        if self.partitioned {
            // partitioned_non_atomic commits as it goes so the load never
            // outgrows a single transaction
            backend
                .commit()
                .map_err(|error| QueryError::backend_error(error.code, error.message, error.hint))?;
        }
        self.rows_since_flush = 0;
        self.bytes_since_flush = 0;
        Ok(())
    }

    fn buffer_row<B: BackendConnection>(
        &mut self,
        values: Vec<Datum>,
        record_bytes: usize,
        backend: &mut B,
    ) -> Result<(), QueryError> {
        if values.len() != self.columns.len() {
            return Err(QueryError::protocol_violation(format!(
                "COPY record has {} columns, table \"{}\" expects {}",
                values.len(),
                self.table,
                self.columns.len()
            )));
        }
        let mutation = Mutation {
            table: self.table.clone(),
            op: MutationOp::Insert,
            columns: self.columns.iter().map(|(name, _)| name.clone()).collect(),
            values,
        };
        backend
            .buffer_mutation(mutation)
            .map_err(|error| QueryError::backend_error(error.code, error.message, error.hint))?;
        self.total_rows += 1;
        self.rows_since_flush += 1;
        self.bytes_since_flush += record_bytes;
        if self.rows_since_flush >= self.batch_row_limit || self.bytes_since_flush >= self.batch_byte_limit {
            self.flush(backend)?;
        }
        Ok(())
    }

    // text format

    fn drain_text<B: BackendConnection>(&mut self, backend: &mut B) -> Result<(), QueryError> {
        while let Some(at) = self.carry.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.carry.drain(..=at).collect();
            line.pop(); // the newline
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.text_record(&line, backend)?;
        }
        Ok(())
    }

    fn text_record<B: BackendConnection>(&mut self, line: &[u8], backend: &mut B) -> Result<(), QueryError> {
        if line == b"\\." {
            self.trailer_seen = true;
            return Ok(());
        }
        if self.trailer_seen || line.is_empty() {
            return Ok(());
        }
        if std::mem::take(&mut self.skip_first_record) {
            return Ok(());
        }

        let mut values = vec![];
        let mut field_index = 0;
        for raw_field in split_unquoted(line, self.delimiter) {
            let oid = self.columns.get(field_index).map(|(_, oid)| *oid).unwrap_or(0);
            field_index += 1;
            if raw_field == self.null_marker.as_bytes() {
                values.push(Datum::Null);
                continue;
            }
            let unescaped = unescape_text(&raw_field)
                .ok_or_else(|| QueryError::invalid_text_representation("text", String::from_utf8_lossy(&raw_field)))?;
            values.push(self.decode_field(oid, &unescaped)?);
        }
        self.buffer_row(values, line.len(), backend)
    }

    // csv format

    fn drain_csv<B: BackendConnection>(&mut self, backend: &mut B) -> Result<(), QueryError> {
        loop {
            let mut in_quotes = false;
            let mut end = None;
            for (at, byte) in self.carry.iter().enumerate() {
                match byte {
                    b'"' => in_quotes = !in_quotes,
                    b'\n' if !in_quotes => {
                        end = Some(at);
                        break;
                    }
                    _ => {}
                }
            }
            let at = match end {
                Some(at) => at,
                None => return Ok(()),
            };
            let mut record: Vec<u8> = self.carry.drain(..=at).collect();
            record.pop();
            if record.last() == Some(&b'\r') {
                record.pop();
            }
            self.csv_record(&record, backend)?;
        }
    }

    fn csv_record<B: BackendConnection>(&mut self, record: &[u8], backend: &mut B) -> Result<(), QueryError> {
        if record.is_empty() || record == b"\\." {
            if record == b"\\." {
                self.trailer_seen = true;
            }
            return Ok(());
        }
        if self.trailer_seen {
            return Ok(());
        }
        if std::mem::take(&mut self.skip_first_record) {
            return Ok(());
        }

        let mut values = vec![];
        let mut field = Vec::new();
        let mut field_index = 0;
        let mut quoted = false;
        let mut in_quotes = false;
        let mut bytes = record.iter().peekable();
        loop {
            match bytes.next() {
                Some(b'"') if in_quotes => {
                    if bytes.peek() == Some(&&b'"') {
                        bytes.next();
                        field.push(b'"');
                    } else {
                        in_quotes = false;
                    }
                }
                Some(b'"') if !in_quotes && field.is_empty() => {
                    in_quotes = true;
                    quoted = true;
                }
                Some(byte) if *byte == self.delimiter && !in_quotes => {
                    let oid = self.columns.get(field_index).map(|(_, oid)| *oid).unwrap_or(0);
                    values.push(self.csv_field(oid, &field, quoted)?);
                    field.clear();
                    quoted = false;
                    field_index += 1;
                }
                Some(byte) => field.push(*byte),
                None => {
                    let oid = self.columns.get(field_index).map(|(_, oid)| *oid).unwrap_or(0);
                    values.push(self.csv_field(oid, &field, quoted)?);
                    break;
                }
            }
        }
        self.buffer_row(values, record.len(), backend)
    }

    fn csv_field(&self, oid: u32, field: &[u8], quoted: bool) -> Result<Datum, QueryError> {
        // only an unquoted field can be the null marker
        if !quoted && field == self.null_marker.as_bytes() {
            return Ok(Datum::Null);
        }
        self.decode_field(oid, field)
    }

    // binary format

    fn drain_binary<B: BackendConnection>(&mut self, backend: &mut B) -> Result<(), QueryError> {
        loop {
            let mut cursor = Cursor {
                buf: &self.carry,
                at: 0,
            };
            if !self.binary_header_seen {
                match cursor.binary_header()? {
                    Some(()) => {}
                    None => return Ok(()),
                }
                self.binary_header_seen = true;
                let consumed = cursor.at;
                self.carry.drain(..consumed);
                continue;
            }
            if self.trailer_seen {
                // bytes after the trailer are drained and ignored
                self.carry.clear();
                return Ok(());
            }
            let record_bytes;
            let values = {
                let field_count = match cursor.read_i16() {
                    Some(count) => count,
                    None => return Ok(()),
                };
                if field_count == -1 {
                    self.trailer_seen = true;
                    let consumed = cursor.at;
                    self.carry.drain(..consumed);
                    continue;
                }
                let mut values = Vec::with_capacity(field_count.max(0) as usize);
                let mut complete = true;
                for field_index in 0..field_count {
                    let len = match cursor.read_i32() {
                        Some(len) => len,
                        None => {
                            complete = false;
                            break;
                        }
                    };
                    if len == -1 {
                        values.push(Datum::Null);
                        continue;
                    }
                    let raw = match cursor.read_bytes(len as usize) {
                        Some(raw) => raw,
                        None => {
                            complete = false;
                            break;
                        }
                    };
                    let oid = self
                        .columns
                        .get(field_index as usize)
                        .map(|(_, oid)| *oid)
                        .unwrap_or(0);
                    let datum = types::decode(oid, PgFormat::Binary, raw, &self.ctx).map_err(map_type_error)?;
                    values.push(datum);
                }
                if !complete {
                    return Ok(());
                }
                record_bytes = cursor.at;
                values
            };
            self.carry.drain(..record_bytes);
            self.buffer_row(values, record_bytes, backend)?;
        }
    }

    fn decode_field(&self, oid: u32, raw: &[u8]) -> Result<Datum, QueryError> {
        types::decode(oid, PgFormat::Text, raw, &self.ctx).map_err(map_type_error)
    }
}

fn map_type_error(error: types::TypeError) -> QueryError {
    match error {
        types::TypeError::InvalidArgument { pg_type, message } => {
            QueryError::invalid_text_representation(pg_type, message)
        }
        types::TypeError::ProtocolViolation { pg_type } => {
            QueryError::invalid_binary_representation(pg_type)
        }
    }
}

/// Splits a text-format line at delimiters; escapes hide delimiters
fn split_unquoted(line: &[u8], delimiter: u8) -> Vec<Vec<u8>> {
    let mut fields = vec![];
    let mut current = vec![];
    let mut at = 0;
    while at < line.len() {
        let byte = line[at];
        if byte == b'\\' && at + 1 < line.len() {
            current.push(byte);
            current.push(line[at + 1]);
            at += 2;
            continue;
        }
        if byte == delimiter {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(byte);
        }
        at += 1;
    }
    fields.push(current);
    fields
}

/// Resolves text-format backslash escapes
fn unescape_text(field: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(field.len());
    let mut at = 0;
    while at < field.len() {
        let byte = field[at];
        if byte != b'\\' {
            out.push(byte);
            at += 1;
            continue;
        }
        at += 1;
        let escaped = *field.get(at)?;
        out.push(match escaped {
            b'\\' => b'\\',
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'b' => 0x08,
            b'f' => 0x0c,
            b'v' => 0x0b,
            other => other,
        });
        at += 1;
    }
    Some(out)
}

struct Cursor<'b> {
    buf: &'b [u8],
    at: usize,
}

impl<'b> Cursor<'b> {
    fn read_i16(&mut self) -> Option<i16> {
        let bytes = self.read_bytes(2)?;
        Some(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_i32(&mut self) -> Option<i32> {
        let bytes = self.read_bytes(4)?;
        Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Option<&'b [u8]> {
        if self.buf.len() - self.at < len {
            return None;
        }
        let slice = &self.buf[self.at..self.at + len];
        self.at += len;
        Some(slice)
    }

    /// `Ok(None)` means more bytes are needed
    fn binary_header(&mut self) -> Result<Option<()>, QueryError> {
        let signature = match self.read_bytes(BINARY_SIGNATURE.len()) {
            Some(signature) => signature,
            None => return Ok(None),
        };
        if signature != BINARY_SIGNATURE {
            return Err(QueryError::protocol_violation("malformed binary COPY signature"));
        }
        let _flags = match self.read_i32() {
            Some(flags) => flags,
            None => return Ok(None),
        };
        let extension_len = match self.read_i32() {
            Some(len) => len,
            None => return Ok(None),
        };
        if extension_len < 0 {
            return Err(QueryError::protocol_violation("malformed binary COPY header"));
        }
        match self.read_bytes(extension_len as usize) {
            Some(_) => Ok(Some(())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::{BackendConnection, InMemoryBackend};
    use wire_protocol_payload::{BIGINT, VARCHAR};

    fn table_backend() -> InMemoryBackend {
        let mut backend = InMemoryBackend::new();
        backend
            .execute("create table k (id bigint, value varchar(20))", &[])
            .unwrap();
        backend
    }

    fn writer(format: CopyFormat) -> MutationWriter {
        let (delimiter, null_marker) = match format {
            CopyFormat::Csv => (',', String::new()),
            _ => ('\t', "\\N".to_owned()),
        };
        MutationWriter::new(
            "k".to_owned(),
            vec![("id".to_owned(), BIGINT), ("value".to_owned(), VARCHAR)],
            format,
            delimiter,
            null_marker,
            false,
            false,
            CodecContext::default(),
        )
    }

    #[test]
    fn chunk_boundaries_do_not_change_the_result() {
        // the same stream partitioned two ways loads the same rows
        let full = b"1\t'one'\n2\t'two'\n3\t'three'\n4\t'four'\n";
        let chunks: Vec<&[u8]> = vec![b"1\t'one'\n2\t", b"'two'\n3\t'th", b"ree'\n4\t'four'\n"];

        let mut whole_backend = table_backend();
        let mut whole = writer(CopyFormat::Text);
        whole.push(full, &mut whole_backend).unwrap();
        assert_eq!(whole.finish(&mut whole_backend).unwrap(), 4);

        let mut split_backend = table_backend();
        let mut split = writer(CopyFormat::Text);
        for chunk in chunks {
            split.push(chunk, &mut split_backend).unwrap();
        }
        assert_eq!(split.finish(&mut split_backend).unwrap(), 4);

        assert_eq!(whole_backend.applied_mutations(), split_backend.applied_mutations());
        assert_eq!(split_backend.rows("k").unwrap().len(), 4);
    }

    #[test]
    fn null_marker_becomes_null() {
        let mut backend = table_backend();
        let mut writer = writer(CopyFormat::Text);
        writer.push(b"1\t\\N\n", &mut backend).unwrap();
        writer.finish(&mut backend).unwrap();
        assert_eq!(backend.rows("k").unwrap()[0][1], Datum::Null);
    }

    #[test]
    fn text_escapes_are_resolved() {
        let mut backend = table_backend();
        let mut writer = writer(CopyFormat::Text);
        writer.push(b"1\ta\\tb\n", &mut backend).unwrap();
        writer.finish(&mut backend).unwrap();
        assert_eq!(backend.rows("k").unwrap()[0][1], Datum::Text("a\tb".to_owned()));
    }

    #[test]
    fn final_line_without_newline_is_loaded_at_finish() {
        let mut backend = table_backend();
        let mut writer = writer(CopyFormat::Text);
        writer.push(b"1\tone\n2\ttwo", &mut backend).unwrap();
        assert_eq!(writer.finish(&mut backend).unwrap(), 2);
    }

    #[test]
    fn end_of_data_marker_stops_the_load() {
        let mut backend = table_backend();
        let mut writer = writer(CopyFormat::Text);
        writer.push(b"1\tone\n\\.\n2\ttwo\n", &mut backend).unwrap();
        assert_eq!(writer.finish(&mut backend).unwrap(), 1);
    }

    #[test]
    fn csv_quotes_hide_delimiters_and_newlines() {
        let mut backend = table_backend();
        let mut writer = writer(CopyFormat::Csv);
        writer.push(b"1,\"a,b\"\n2,\"line1\nline2\"\n", &mut backend).unwrap();
        writer.finish(&mut backend).unwrap();
        let rows = backend.rows("k").unwrap();
        assert_eq!(rows[0][1], Datum::Text("a,b".to_owned()));
        assert_eq!(rows[1][1], Datum::Text("line1\nline2".to_owned()));
    }

    #[test]
    fn csv_doubled_quote_is_escaped() {
        let mut backend = table_backend();
        let mut writer = writer(CopyFormat::Csv);
        writer.push(b"1,\"say \"\"hi\"\"\"\n", &mut backend).unwrap();
        writer.finish(&mut backend).unwrap();
        assert_eq!(backend.rows("k").unwrap()[0][1], Datum::Text("say \"hi\"".to_owned()));
    }

    #[test]
    fn csv_unquoted_empty_is_null_but_quoted_empty_is_text() {
        let mut backend = table_backend();
        let mut writer = writer(CopyFormat::Csv);
        writer.push(b"1,\n2,\"\"\n", &mut backend).unwrap();
        writer.finish(&mut backend).unwrap();
        let rows = backend.rows("k").unwrap();
        assert_eq!(rows[0][1], Datum::Null);
        assert_eq!(rows[1][1], Datum::Text("".to_owned()));
    }

    #[test]
    fn header_row_is_skipped() {
        let mut backend = table_backend();
        let mut writer = MutationWriter::new(
            "k".to_owned(),
            vec![("id".to_owned(), BIGINT), ("value".to_owned(), VARCHAR)],
            CopyFormat::Csv,
            ',',
            String::new(),
            true,
            false,
            CodecContext::default(),
        );
        writer.push(b"id,value\n1,one\n", &mut backend).unwrap();
        assert_eq!(writer.finish(&mut backend).unwrap(), 1);
    }

    #[test]
    fn binary_stream_round_trip() {
        let ctx = CodecContext::default();
        let mut stream = Vec::new();
        stream.extend_from_slice(BINARY_SIGNATURE);
        stream.extend_from_slice(&0i32.to_be_bytes());
        stream.extend_from_slice(&0i32.to_be_bytes());
        for (id, value) in &[(1i64, "one"), (2, "two")] {
            stream.extend_from_slice(&2i16.to_be_bytes());
            let id_bytes = types::encode(BIGINT, PgFormat::Binary, &Datum::Int64(*id), &ctx).unwrap();
            stream.extend_from_slice(&(id_bytes.len() as i32).to_be_bytes());
            stream.extend_from_slice(&id_bytes);
            let value_bytes = types::encode(VARCHAR, PgFormat::Binary, &Datum::Text((*value).to_owned()), &ctx).unwrap();
            stream.extend_from_slice(&(value_bytes.len() as i32).to_be_bytes());
            stream.extend_from_slice(&value_bytes);
        }
        stream.extend_from_slice(&(-1i16).to_be_bytes());

        let mut backend = table_backend();
        let mut writer = writer(CopyFormat::Binary);
        // feed in tiny slices to exercise the carry buffer
        for chunk in stream.chunks(3) {
            writer.push(chunk, &mut backend).unwrap();
        }
        assert_eq!(writer.finish(&mut backend).unwrap(), 2);
        assert_eq!(backend.rows("k").unwrap().len(), 2);
    }

    #[test]
    fn bad_binary_signature_is_rejected() {
        let mut backend = table_backend();
        let mut writer = writer(CopyFormat::Binary);
        assert!(writer.push(b"NOTPGCOPY\0\0\0\0\0\0\0\0\0\0", &mut backend).is_err());
    }

    #[test]
    fn batches_flush_at_the_row_limit() {
        let mut backend = table_backend();
        let mut writer = writer(CopyFormat::Text).with_batch_limits(2, usize::MAX);
        writer.push(b"1\ta\n2\tb\n3\tc\n", &mut backend).unwrap();
        // two rows already flushed, the third still buffered
        assert_eq!(backend.rows("k").unwrap().len(), 2);
        assert_eq!(writer.finish(&mut backend).unwrap(), 3);
        assert_eq!(backend.rows("k").unwrap().len(), 3);
    }

    #[test]
    fn garbage_field_is_reported_as_invalid_text() {
        let mut backend = table_backend();
        let mut writer = writer(CopyFormat::Text);
        let error = writer.push(b"not_a_number\tx\n", &mut backend).unwrap_err();
        assert_eq!(error.code(), "22P02");
    }

    #[test]
    fn wrong_column_count_is_a_protocol_violation() {
        let mut backend = table_backend();
        let mut writer = writer(CopyFormat::Text);
        let error = writer.push(b"1\tone\textra\n", &mut backend).unwrap_err();
        assert_eq!(error.code(), "08P01");
    }

    #[test]
    fn abort_discards_buffered_rows() {
        let mut backend = table_backend();
        let mut writer = writer(CopyFormat::Text);
        writer.push(b"1\tone\n", &mut backend).unwrap();
        writer.abort(&mut backend);
        assert_eq!(backend.flush_mutations().unwrap(), 0);
        assert!(backend.rows("k").unwrap().is_empty());
    }
}
