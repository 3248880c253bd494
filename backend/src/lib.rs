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

//! The facade over the remote SQL service. One logical backend session is
//! owned by exactly one client connection. The in-memory implementation in
//! [`in_memory`] stands in for the remote service in the binary and in tests.

pub mod in_memory;

pub use in_memory::InMemoryBackend;

use std::fmt::{self, Display, Formatter};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use types::Datum;
use wire_protocol_payload as oids;

/// Column list of a result set: `(name, type oid)` pairs
pub type Description = Vec<(String, u32)>;

/// What a statement produced on the backend
#[derive(Debug, PartialEq)]
pub enum BackendOutcome {
    Rows(Description, Vec<Vec<Datum>>),
    Updated(u64),
    DdlAck(String),
}

/// An error reported by the backend; `code` is a SQLSTATE
#[derive(Debug, Clone, PartialEq)]
pub struct BackendError {
    pub code: String,
    pub message: String,
    pub hint: Option<String>,
}

impl BackendError {
    pub fn new<C: ToString, M: ToString>(code: C, message: M) -> BackendError {
        BackendError {
            code: code.to_string(),
            message: message.to_string(),
            hint: None,
        }
    }

    pub fn query_canceled() -> BackendError {
        BackendError::new("57014", "canceling statement due to user request")
    }

    pub fn table_not_found(table: &str) -> BackendError {
        BackendError::new("42P01", format!("relation \"{}\" does not exist", table))
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == "57014"
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A row-level write, distinct from a SQL statement. Columns not listed are
/// left untouched by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub table: String,
    pub op: MutationOp,
    pub columns: Vec<String>,
    pub values: Vec<Datum>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MutationOp {
    Insert,
    Update,
    Delete,
}

/// Cancellation token of an in-flight backend call. Cancelling is idempotent
/// and best-effort; the owning connection observes it as a `57014` error.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// One logical session against the remote SQL service.
///
/// Calls are serialized by the owning connection; a connection never has more
/// than one outstanding backend call.
pub trait BackendConnection: Send {
    /// Runs a statement with already-decoded parameter values
    fn execute(&mut self, sql: &str, params: &[Datum]) -> BackendResult<BackendOutcome>;

    /// Row description a statement would produce; empty means no data
    fn describe(&mut self, sql: &str) -> BackendResult<Description>;

    fn begin(&mut self) -> BackendResult<()>;

    fn commit(&mut self) -> BackendResult<()>;

    fn rollback(&mut self) -> BackendResult<()>;

    /// Queues a row write; the queue is bounded by the COPY engine above
    fn buffer_mutation(&mut self, mutation: Mutation) -> BackendResult<()>;

    /// Applies all queued mutations, returning how many were written
    fn flush_mutations(&mut self) -> BackendResult<u64>;

    /// Discards queued mutations without applying them
    fn discard_mutations(&mut self);

    fn table_exists(&mut self, table: &str) -> BackendResult<bool>;

    fn index_exists(&mut self, index: &str) -> BackendResult<bool>;

    /// Token the server uses to cancel this session's in-flight call
    fn cancel_handle(&self) -> CancelHandle;

    /// Client-requested timeout for subsequent statements; zero disables it
    fn set_statement_timeout(&mut self, millis: u64);
}

/// Wire type of a concrete value, used when a result description has to be
/// derived from data
pub fn datum_oid(datum: &Datum) -> u32 {
    match datum {
        Datum::Null => oids::TEXT,
        Datum::Bool(_) => oids::BOOL,
        Datum::Int16(_) => oids::SMALLINT,
        Datum::Int32(_) => oids::INT,
        Datum::Int64(_) => oids::BIGINT,
        Datum::Float32(_) => oids::REAL,
        Datum::Float64(_) => oids::DOUBLE_PRECISION,
        Datum::Numeric(_) => oids::NUMERIC,
        Datum::Text(_) => oids::TEXT,
        Datum::Bytes(_) => oids::BYTEA,
        Datum::Date(_) => oids::DATE,
        Datum::Timestamp(_) => oids::TIMESTAMP,
        Datum::TimestampTz(_) => oids::TIMESTAMPTZ,
        Datum::Jsonb(_) => oids::JSONB,
        Datum::Array(elements) => elements
            .iter()
            .find(|element| !element.is_null())
            .map(|element| match datum_oid(element) {
                oids::BOOL => oids::BOOL_ARRAY,
                oids::SMALLINT => oids::SMALLINT_ARRAY,
                oids::INT => oids::INT_ARRAY,
                oids::BIGINT => oids::BIGINT_ARRAY,
                oids::REAL => oids::REAL_ARRAY,
                oids::DOUBLE_PRECISION => oids::DOUBLE_PRECISION_ARRAY,
                oids::NUMERIC => oids::NUMERIC_ARRAY,
                oids::BYTEA => oids::BYTEA_ARRAY,
                oids::DATE => oids::DATE_ARRAY,
                oids::TIMESTAMP => oids::TIMESTAMP_ARRAY,
                oids::TIMESTAMPTZ => oids::TIMESTAMPTZ_ARRAY,
                oids::JSONB => oids::JSONB_ARRAY,
                _ => oids::TEXT_ARRAY,
            })
            .unwrap_or(oids::TEXT_ARRAY),
    }
}
