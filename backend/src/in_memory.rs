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

//! A small table store behind the [`BackendConnection`] trait. It evaluates
//! just enough SQL for the front end to be driven end to end: literal and
//! parameter projections, full-table scans, literal inserts and the DDL the
//! translator produces. The remote service client replaces it in production.

use crate::{
    datum_oid, BackendConnection, BackendError, BackendOutcome, BackendResult, CancelHandle, Description, Mutation,
    MutationOp,
};
use query_parser::ddl::{create_table_columns, ddl_target, DdlTarget};
use query_parser::{classify, tokenize, StatementKind, Token, TokenKind};
use std::collections::{HashMap, HashSet};
use types::{oid_of_type_name, Datum};
use wire_protocol_payload as oids;

#[derive(Debug, Default)]
struct Table {
    columns: Vec<(String, u32)>,
    rows: Vec<Vec<Datum>>,
}

/// In-memory stand-in for the remote SQL service
#[derive(Default)]
pub struct InMemoryBackend {
    tables: HashMap<String, Table>,
    indexes: HashSet<String>,
    pending: Vec<Mutation>,
    applied: Vec<Mutation>,
    in_transaction: bool,
    cancel: CancelHandle,
    statement_timeout_millis: u64,
    latency_millis: u64,
    injected_error: Option<BackendError>,
}

impl InMemoryBackend {
    pub fn new() -> InMemoryBackend {
        InMemoryBackend::default()
    }

    /// Mutations applied so far, in order; test observability hook
    pub fn applied_mutations(&self) -> &[Mutation] {
        &self.applied
    }

    pub fn rows(&self, table: &str) -> Option<&Vec<Vec<Datum>>> {
        self.tables.get(table).map(|table| &table.rows)
    }

    /// Makes the next statement fail with the given error
    pub fn inject_error(&mut self, error: BackendError) {
        self.injected_error = Some(error);
    }

    /// Pretends the next statements take this long, so that a configured
    /// statement timeout can fire
    pub fn set_latency_millis(&mut self, millis: u64) {
        self.latency_millis = millis;
    }

    fn check_interrupts(&mut self) -> BackendResult<()> {
        if self.cancel.is_canceled() {
            self.cancel.clear();
            return Err(BackendError::query_canceled());
        }
        if let Some(error) = self.injected_error.take() {
            return Err(error);
        }
        if self.statement_timeout_millis > 0 && self.latency_millis > self.statement_timeout_millis {
            return Err(BackendError::query_canceled());
        }
        Ok(())
    }

    fn execute_ddl(&mut self, sql: &str) -> BackendResult<BackendOutcome> {
        match ddl_target(sql).map_err(|error| BackendError::new("42601", error.to_string()))? {
            DdlTarget::CreateTable { table, .. } => {
                let columns = create_table_columns(sql)
                    .map_err(|error| BackendError::new("42601", error.to_string()))?
                    .into_iter()
                    .map(|(name, type_name)| (name.value, oid_of_type_name(&type_name).unwrap_or(oids::TEXT)))
                    .collect();
                if self.tables.contains_key(&table.value) {
                    return Err(BackendError::new(
                        "42P07",
                        format!("relation \"{}\" already exists", table.value),
                    ));
                }
                self.tables.insert(table.value, Table { columns, rows: vec![] });
                Ok(BackendOutcome::DdlAck("CREATE TABLE".to_owned()))
            }
            DdlTarget::CreateIndex { index, .. } => {
                self.indexes.insert(index.value);
                Ok(BackendOutcome::DdlAck("CREATE INDEX".to_owned()))
            }
            DdlTarget::DropTable { table, .. } => {
                if self.tables.remove(&table.value).is_none() {
                    return Err(BackendError::table_not_found(&table.value));
                }
                Ok(BackendOutcome::DdlAck("DROP TABLE".to_owned()))
            }
            DdlTarget::DropIndex { index, .. } => {
                if !self.indexes.remove(&index.value) {
                    return Err(BackendError::new("42704", format!("index \"{}\" does not exist", index.value)));
                }
                Ok(BackendOutcome::DdlAck("DROP INDEX".to_owned()))
            }
            DdlTarget::Other => Err(BackendError::new("0A000", format!("unsupported statement: {}", sql))),
        }
    }

    fn execute_select(&mut self, sql: &str, params: &[Datum]) -> BackendResult<BackendOutcome> {
        let tokens = tokenize(sql).map_err(|error| BackendError::new("42601", error.to_string()))?;
        if let Some(from) = tokens.iter().position(|token| token.is_keyword("from")) {
            let table_name = match tokens.get(from + 1).and_then(token_ident) {
                Some(name) => name,
                None => return Err(BackendError::new("42601", "missing table name")),
            };
            let table = self
                .tables
                .get(&table_name)
                .ok_or_else(|| BackendError::table_not_found(&table_name))?;
            let projection: Vec<usize> = if tokens.get(1).map(|token| token.kind == TokenKind::Symbol('*')) == Some(true) {
                (0..table.columns.len()).collect()
            } else {
                let mut indexes = vec![];
                for token in &tokens[1..from] {
                    if let Some(name) = token_ident(token) {
                        match table.columns.iter().position(|(column, _)| *column == name) {
                            Some(index) => indexes.push(index),
                            None => {
                                return Err(BackendError::new("42703", format!("column \"{}\" does not exist", name)))
                            }
                        }
                    }
                }
                indexes
            };
            let description: Description = projection.iter().map(|index| table.columns[*index].clone()).collect();
            let rows = table
                .rows
                .iter()
                .map(|row| projection.iter().map(|index| row.get(*index).cloned().unwrap_or(Datum::Null)).collect())
                .collect();
            return Ok(BackendOutcome::Rows(description, rows));
        }

        // scalar projection: literals and parameters
        let (description, row) = scalar_projection(&tokens, params)?;
        Ok(BackendOutcome::Rows(description, vec![row]))
    }

    fn execute_dml(&mut self, sql: &str, params: &[Datum]) -> BackendResult<BackendOutcome> {
        let tokens = tokenize(sql).map_err(|error| BackendError::new("42601", error.to_string()))?;
        match tokens.first().and_then(|token| token.keyword()) {
            Some("insert") => {
                let table_name = match tokens.get(2).and_then(token_ident) {
                    Some(name) => name,
                    None => return Err(BackendError::new("42601", "missing table name")),
                };
                let rows = insert_rows(&tokens, params)?;
                let table = self
                    .tables
                    .get_mut(&table_name)
                    .ok_or_else(|| BackendError::table_not_found(&table_name))?;
                let inserted = rows.len() as u64;
                table.rows.extend(rows);
                Ok(BackendOutcome::Updated(inserted))
            }
            Some("update") => {
                let table_name = match tokens.get(1).and_then(token_ident) {
                    Some(name) => name,
                    None => return Err(BackendError::new("42601", "missing table name")),
                };
                let table = self
                    .tables
                    .get(&table_name)
                    .ok_or_else(|| BackendError::table_not_found(&table_name))?;
                Ok(BackendOutcome::Updated(table.rows.len() as u64))
            }
            Some("delete") => {
                let table_name = match tokens.get(2).and_then(token_ident) {
                    Some(name) => name,
                    None => return Err(BackendError::new("42601", "missing table name")),
                };
                let table = self
                    .tables
                    .get_mut(&table_name)
                    .ok_or_else(|| BackendError::table_not_found(&table_name))?;
                let deleted = table.rows.len() as u64;
                table.rows.clear();
                Ok(BackendOutcome::Updated(deleted))
            }
            _ => Err(BackendError::new("42601", format!("unsupported statement: {}", sql))),
        }
    }

    fn apply(&mut self, mutation: Mutation) -> BackendResult<()> {
        let table = self
            .tables
            .get_mut(&mutation.table)
            .ok_or_else(|| BackendError::table_not_found(&mutation.table))?;
        match mutation.op {
            MutationOp::Insert => {
                let mut row = vec![Datum::Null; table.columns.len()];
                for (column, value) in mutation.columns.iter().zip(mutation.values.iter()) {
                    if let Some(index) = table.columns.iter().position(|(name, _)| name == column) {
                        row[index] = value.clone();
                    }
                }
                table.rows.push(row);
            }
            MutationOp::Update => {
                // key match on the first listed column, remaining listed
                // columns replaced, absent columns untouched
                let key_value = mutation.values.first().cloned().unwrap_or(Datum::Null);
                let key_index = mutation
                    .columns
                    .first()
                    .and_then(|column| table.columns.iter().position(|(name, _)| name == column));
                if let Some(key_index) = key_index {
                    for row in &mut table.rows {
                        if row.get(key_index) == Some(&key_value) {
                            for (column, value) in mutation.columns.iter().zip(mutation.values.iter()).skip(1) {
                                if let Some(index) = table.columns.iter().position(|(name, _)| name == column) {
                                    row[index] = value.clone();
                                }
                            }
                        }
                    }
                }
            }
            MutationOp::Delete => {
                let key_value = mutation.values.first().cloned().unwrap_or(Datum::Null);
                let key_index = mutation
                    .columns
                    .first()
                    .and_then(|column| table.columns.iter().position(|(name, _)| name == column));
                if let Some(key_index) = key_index {
                    table.rows.retain(|row| row.get(key_index) != Some(&key_value));
                }
            }
        }
        self.applied.push(mutation);
        Ok(())
    }
}

impl BackendConnection for InMemoryBackend {
    fn execute(&mut self, sql: &str, params: &[Datum]) -> BackendResult<BackendOutcome> {
        self.check_interrupts()?;
        log::debug!("backend execute: {}", sql);
        match classify(sql).map_err(|error| BackendError::new("42601", error.to_string()))? {
            StatementKind::Ddl => self.execute_ddl(sql),
            StatementKind::Query => self.execute_select(sql, params),
            StatementKind::Dml => self.execute_dml(sql, params),
            _ => Err(BackendError::new("0A000", format!("unsupported statement: {}", sql))),
        }
    }

    fn describe(&mut self, sql: &str) -> BackendResult<Description> {
        match classify(sql).map_err(|error| BackendError::new("42601", error.to_string()))? {
            StatementKind::Query => {
                let tokens = tokenize(sql).map_err(|error| BackendError::new("42601", error.to_string()))?;
                if let Some(from) = tokens.iter().position(|token| token.is_keyword("from")) {
                    let table_name = match tokens.get(from + 1).and_then(token_ident) {
                        Some(name) => name,
                        None => return Err(BackendError::new("42601", "missing table name")),
                    };
                    let table = self
                        .tables
                        .get(&table_name)
                        .ok_or_else(|| BackendError::table_not_found(&table_name))?;
                    if tokens.get(1).map(|token| token.kind == TokenKind::Symbol('*')) == Some(true) {
                        return Ok(table.columns.clone());
                    }
                    let mut description = vec![];
                    for token in &tokens[1..from] {
                        if let Some(name) = token_ident(token) {
                            match table.columns.iter().find(|(column, _)| *column == name) {
                                Some(column) => description.push(column.clone()),
                                None => {
                                    return Err(BackendError::new("42703", format!("column \"{}\" does not exist", name)))
                                }
                            }
                        }
                    }
                    return Ok(description);
                }
                let (description, _row) = scalar_projection(&tokens, &[])?;
                Ok(description)
            }
            _ => Ok(vec![]),
        }
    }

    fn begin(&mut self) -> BackendResult<()> {
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> BackendResult<()> {
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> BackendResult<()> {
        self.in_transaction = false;
        self.pending.clear();
        Ok(())
    }

    fn buffer_mutation(&mut self, mutation: Mutation) -> BackendResult<()> {
        self.pending.push(mutation);
        Ok(())
    }

    fn flush_mutations(&mut self) -> BackendResult<u64> {
        let pending = std::mem::take(&mut self.pending);
        let flushed = pending.len() as u64;
        for mutation in pending {
            self.apply(mutation)?;
        }
        Ok(flushed)
    }

    fn discard_mutations(&mut self) {
        self.pending.clear();
    }

    fn table_exists(&mut self, table: &str) -> BackendResult<bool> {
        Ok(self.tables.contains_key(table))
    }

    fn index_exists(&mut self, index: &str) -> BackendResult<bool> {
        Ok(self.indexes.contains(index))
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn set_statement_timeout(&mut self, millis: u64) {
        self.statement_timeout_millis = millis;
    }
}

trait TokenExt {
    fn keyword(&self) -> Option<&str>;
    fn is_keyword(&self, expected: &str) -> bool;
}

impl TokenExt for Token {
    fn keyword(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Word(word) => Some(word.as_str()),
            _ => None,
        }
    }

    fn is_keyword(&self, expected: &str) -> bool {
        self.keyword() == Some(expected)
    }
}

fn token_ident(token: &Token) -> Option<String> {
    match &token.kind {
        TokenKind::Word(word) => Some(word.clone()),
        TokenKind::QuotedIdent(name) => Some(name.clone()),
        _ => None,
    }
}

/// Evaluates a `select <scalar>, <scalar>, …` projection
fn scalar_projection(tokens: &[Token], params: &[Datum]) -> BackendResult<(Description, Vec<Datum>)> {
    let mut description = vec![];
    let mut row = vec![];
    let mut at = 1;
    while at < tokens.len() {
        let (datum, oid, next) = scalar_value(tokens, at, params)?;
        description.push(("?column?".to_owned(), oid));
        row.push(datum);
        at = next;
        match tokens.get(at) {
            None => break,
            Some(token) if token.kind == TokenKind::Symbol(',') => at += 1,
            Some(token) => {
                return Err(BackendError::new(
                    "42601",
                    format!("unsupported expression near offset {}", token.start),
                ))
            }
        }
    }
    Ok((description, row))
}

/// Evaluates one literal or `$n` parameter, with an optional `::type` cast
fn scalar_value(tokens: &[Token], mut at: usize, params: &[Datum]) -> BackendResult<(Datum, u32, usize)> {
    let mut negative = false;
    if tokens.get(at).map(|token| token.kind == TokenKind::Symbol('-')) == Some(true) {
        negative = true;
        at += 1;
    }
    let (mut datum, mut oid) = match tokens.get(at).map(|token| &token.kind) {
        Some(TokenKind::Number(text)) => {
            if text.contains('.') || text.contains('e') || text.contains('E') {
                let literal = if negative { format!("-{}", text) } else { text.clone() };
                let value = types::decode(
                    oids::NUMERIC,
                    wire_protocol_payload::PgFormat::Text,
                    literal.as_bytes(),
                    &types::CodecContext::default(),
                )
                .map_err(|_| BackendError::new("42601", format!("bad numeric literal {}", text)))?;
                (value, oids::NUMERIC)
            } else {
                let value = text
                    .parse::<i64>()
                    .map(|value| if negative { -value } else { value })
                    .map_err(|_| BackendError::new("42601", format!("bad integer literal {}", text)))?;
                if value >= i32::MIN as i64 && value <= i32::MAX as i64 {
                    (Datum::Int32(value as i32), oids::INT)
                } else {
                    (Datum::Int64(value), oids::BIGINT)
                }
            }
        }
        Some(TokenKind::StringLiteral(text)) => (Datum::Text(text.clone()), oids::TEXT),
        Some(TokenKind::Word(word)) if word == "true" => (Datum::Bool(true), oids::BOOL),
        Some(TokenKind::Word(word)) if word == "false" => (Datum::Bool(false), oids::BOOL),
        Some(TokenKind::Word(word)) if word == "null" => (Datum::Null, oids::TEXT),
        Some(TokenKind::Param(index)) => {
            // absent values (a Describe before Bind) read as NULL
            let datum = params
                .get((*index as usize).wrapping_sub(1))
                .cloned()
                .unwrap_or(Datum::Null);
            let oid = datum_oid(&datum);
            (datum, oid)
        }
        _ => return Err(BackendError::new("42601", "unsupported expression")),
    };
    at += 1;

    // optional ::type cast refines the reported type
    if tokens.get(at).map(|token| token.kind == TokenKind::Symbol(':')) == Some(true)
        && tokens.get(at + 1).map(|token| token.kind == TokenKind::Symbol(':')) == Some(true)
    {
        if let Some(type_name) = tokens.get(at + 2).and_then(|token| token.keyword()) {
            if let Some(cast_oid) = types::oid_of_type_name(type_name) {
                oid = cast_oid;
                datum = cast_datum(datum, cast_oid);
            }
            at += 3;
        }
    }

    Ok((datum, oid, at))
}

/// Narrow numeric casts applied to already-decoded values
fn cast_datum(datum: Datum, oid: u32) -> Datum {
    match (&datum, oid) {
        (Datum::Int32(value), oids::BIGINT) => Datum::Int64(*value as i64),
        (Datum::Int64(value), oids::INT) if *value >= i32::MIN as i64 && *value <= i32::MAX as i64 => {
            Datum::Int32(*value as i32)
        }
        (Datum::Text(text), oids::INT) => text.parse::<i32>().map(Datum::Int32).unwrap_or(datum),
        (Datum::Text(text), oids::BIGINT) => text.parse::<i64>().map(Datum::Int64).unwrap_or(datum),
        _ => datum,
    }
}

/// Parses the literal rows of `INSERT INTO t [(cols)] VALUES (…)[, (…)]`
fn insert_rows(tokens: &[Token], params: &[Datum]) -> BackendResult<Vec<Vec<Datum>>> {
    let values_at = tokens
        .iter()
        .position(|token| token.is_keyword("values"))
        .ok_or_else(|| BackendError::new("42601", "INSERT without VALUES"))?;
    let mut rows = vec![];
    let mut at = values_at + 1;
    while at < tokens.len() {
        if tokens.get(at).map(|token| token.kind == TokenKind::Symbol('(')) != Some(true) {
            break;
        }
        at += 1;
        let mut row = vec![];
        loop {
            let (datum, _oid, next) = scalar_value(tokens, at, params)?;
            row.push(datum);
            at = next;
            match tokens.get(at).map(|token| &token.kind) {
                Some(TokenKind::Symbol(',')) => at += 1,
                Some(TokenKind::Symbol(')')) => {
                    at += 1;
                    break;
                }
                _ => return Err(BackendError::new("42601", "malformed VALUES list")),
            }
        }
        rows.push(row);
        if tokens.get(at).map(|token| token.kind == TokenKind::Symbol(',')) == Some(true) {
            at += 1;
        }
    }
    if rows.is_empty() {
        return Err(BackendError::new("42601", "INSERT without rows"));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_with_table() -> InMemoryBackend {
        let mut backend = InMemoryBackend::new();
        backend
            .execute("create table k (id bigint, value varchar(20))", &[])
            .unwrap();
        backend
    }

    #[test]
    fn select_literal() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(
            backend.execute("SELECT 1", &[]),
            Ok(BackendOutcome::Rows(
                vec![("?column?".to_owned(), oids::INT)],
                vec![vec![Datum::Int32(1)]]
            ))
        );
    }

    #[test]
    fn select_parameter_with_cast() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(
            backend.execute("SELECT $1::int", &[Datum::Int32(42)]),
            Ok(BackendOutcome::Rows(
                vec![("?column?".to_owned(), oids::INT)],
                vec![vec![Datum::Int32(42)]]
            ))
        );
    }

    #[test]
    fn insert_then_scan() {
        let mut backend = backend_with_table();
        assert_eq!(
            backend.execute("insert into k values (1, 'one'), (2, 'two')", &[]),
            Ok(BackendOutcome::Updated(2))
        );
        match backend.execute("select * from k", &[]) {
            Ok(BackendOutcome::Rows(description, rows)) => {
                assert_eq!(
                    description,
                    vec![("id".to_owned(), oids::BIGINT), ("value".to_owned(), oids::VARCHAR)]
                );
                assert_eq!(rows.len(), 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn mutations_apply_in_order_on_flush() {
        let mut backend = backend_with_table();
        for (id, value) in &[(1, "one"), (2, "two")] {
            backend
                .buffer_mutation(Mutation {
                    table: "k".to_owned(),
                    op: MutationOp::Insert,
                    columns: vec!["id".to_owned(), "value".to_owned()],
                    values: vec![Datum::Int64(*id), Datum::Text((*value).to_owned())],
                })
                .unwrap();
        }
        assert_eq!(backend.flush_mutations(), Ok(2));
        assert_eq!(backend.rows("k").unwrap().len(), 2);
        assert_eq!(backend.applied_mutations().len(), 2);
    }

    #[test]
    fn discarded_mutations_never_apply() {
        let mut backend = backend_with_table();
        backend
            .buffer_mutation(Mutation {
                table: "k".to_owned(),
                op: MutationOp::Insert,
                columns: vec!["id".to_owned()],
                values: vec![Datum::Int64(1)],
            })
            .unwrap();
        backend.discard_mutations();
        assert_eq!(backend.flush_mutations(), Ok(0));
        assert!(backend.rows("k").unwrap().is_empty());
    }

    #[test]
    fn cancel_is_observed_as_query_canceled() {
        let mut backend = InMemoryBackend::new();
        let handle = backend.cancel_handle();
        handle.cancel();
        assert_eq!(backend.execute("select 1", &[]), Err(BackendError::query_canceled()));
        // the flag is cleared, the next statement runs
        assert!(backend.execute("select 1", &[]).is_ok());
    }

    #[test]
    fn timeout_fires_as_query_canceled() {
        let mut backend = InMemoryBackend::new();
        backend.set_statement_timeout(10);
        backend.set_latency_millis(50);
        assert_eq!(backend.execute("select 1", &[]), Err(BackendError::query_canceled()));
    }

    #[test]
    fn existence_checks() {
        let mut backend = backend_with_table();
        backend.execute("create index idx_k on k (id)", &[]).unwrap();
        assert_eq!(backend.table_exists("k"), Ok(true));
        assert_eq!(backend.table_exists("missing"), Ok(false));
        assert_eq!(backend.index_exists("idx_k"), Ok(true));
    }

    #[test]
    fn describe_table_scan() {
        let mut backend = backend_with_table();
        assert_eq!(
            backend.describe("select * from k"),
            Ok(vec![("id".to_owned(), oids::BIGINT), ("value".to_owned(), oids::VARCHAR)])
        );
        assert_eq!(backend.describe("insert into k values (1)"), Ok(vec![]));
    }
}
