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

//! The per-connection state machine. One worker serves exactly one client:
//! it owns the session state, the statement cache and the backend session,
//! and consumes frames in the order they arrive.

use crate::copy::MutationWriter;
use crate::ddl::{DdlTranslator, Translation};
use crate::MAX_INVALID_MESSAGE_COUNT;
use backend::{BackendConnection, BackendError, BackendOutcome};
use chrono::FixedOffset;
use itertools::izip;
use query_parser::copy::CopyFormat;
use query_parser::set::{parse_reset, parse_set, parse_show, ResetTarget, ShowTarget};
use query_parser::{classify, parameter_count, split_statements, tokenize, StatementKind, TokenKind};
use query_response::{QueryError, QueryEvent};
use session::statement::{Portal, PortalState, PreparedStatement, StatementCache};
use session::SessionState;
use std::convert::TryFrom;
use std::io;
use types::{CodecContext, Datum, TypeError};
use wire_protocol::{WireConnection, WireError};
use wire_protocol_payload::{ColumnDescription, InboundMessage, OutboundMessage, PgFormat, TransactionStatus, VARCHAR};

/// Lifecycle of one served connection
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Authenticated,
    CopyIn,
    Terminated,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TxState {
    Idle,
    Explicit,
    Failed,
}

enum StatementOutcome {
    Done,
    EnteredCopy,
}

struct CopyState {
    writer: MutationWriter,
    sticky_error: Option<QueryError>,
}

/// Serves one client connection against one backend session
pub struct Worker<B: BackendConnection> {
    backend: B,
    session: SessionState,
    cache: StatementCache,
    status: ConnectionStatus,
    tx: TxState,
    skip_until_sync: bool,
    invalid_messages: usize,
    copy: Option<CopyState>,
}

impl<B: BackendConnection> Worker<B> {
    pub fn new(backend: B, session: SessionState) -> Worker<B> {
        Worker {
            backend,
            session,
            cache: StatementCache::default(),
            status: ConnectionStatus::Authenticated,
            tx: TxState::Idle,
            skip_until_sync: false,
            invalid_messages: 0,
            copy: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Consumes client messages until the connection terminates
    pub fn process<C: WireConnection>(&mut self, connection: &mut C) -> io::Result<()> {
        while self.status != ConnectionStatus::Terminated {
            match connection.receive()? {
                Ok(message) => {
                    log::debug!("client message {:?}", message);
                    self.handle(message, connection)?;
                }
                Err(error) if error.is_recoverable() => {
                    let description = match error {
                        WireError::UnknownTag(tag) => format!("unknown message type {:?}", tag as char),
                        WireError::InvalidDiscriminator(tag) => format!("invalid describe/close target {:?}", tag as char),
                        WireError::Frame(_) => unreachable!("frame errors are not recoverable"),
                    };
                    self.note_invalid(Some(QueryError::protocol_violation(description)), connection)?;
                }
                Err(error) => {
                    log::debug!("fatal frame error {:?}", error);
                    self.send_error(
                        QueryError::fatal_protocol_violation(format!("invalid frame: {:?}", error)),
                        connection,
                    )?;
                    connection.flush()?;
                    self.status = ConnectionStatus::Terminated;
                }
            }
        }
        Ok(())
    }

    fn handle<C: WireConnection>(&mut self, message: InboundMessage, connection: &mut C) -> io::Result<()> {
        match self.status {
            ConnectionStatus::CopyIn => self.handle_copy(message, connection),
            ConnectionStatus::Authenticated => self.handle_ready(message, connection),
            ConnectionStatus::Terminated => Ok(()),
        }
    }

    // regular (non-COPY) traffic

    fn handle_ready<C: WireConnection>(&mut self, message: InboundMessage, connection: &mut C) -> io::Result<()> {
        match message {
            InboundMessage::Query { sql } => self.simple_query(&sql, connection),
            InboundMessage::Terminate => {
                log::debug!("closing connection with client");
                self.status = ConnectionStatus::Terminated;
                Ok(())
            }
            InboundMessage::Flush => connection.flush(),
            InboundMessage::Sync => {
                if self.tx == TxState::Idle {
                    // the implicit transaction of the sync window closes here
                    let _ = self.backend.commit();
                    self.session.on_transaction_end();
                    self.cache.on_transaction_end();
                }
                self.skip_until_sync = false;
                self.send_ready(connection)?;
                connection.flush()
            }
            InboundMessage::Parse {
                statement_name,
                sql,
                param_types,
            } => {
                if self.skip_until_sync {
                    return Ok(());
                }
                match self.parse_message(statement_name, sql, param_types) {
                    Ok(()) => self.send_event(QueryEvent::ParseComplete, connection),
                    Err(error) => self.extended_error(error, connection),
                }
            }
            InboundMessage::Bind {
                portal_name,
                statement_name,
                param_formats,
                raw_params,
                result_formats,
            } => {
                if self.skip_until_sync {
                    return Ok(());
                }
                match self.bind_message(portal_name, statement_name, param_formats, raw_params, result_formats) {
                    Ok(()) => self.send_event(QueryEvent::BindComplete, connection),
                    Err(error) => self.extended_error(error, connection),
                }
            }
            InboundMessage::DescribeStatement { name } => {
                if self.skip_until_sync {
                    return Ok(());
                }
                match self.describe_statement(name) {
                    Ok(events) => {
                        for event in events {
                            self.send_event(event, connection)?;
                        }
                        Ok(())
                    }
                    Err(error) => self.extended_error(error, connection),
                }
            }
            InboundMessage::DescribePortal { name } => {
                if self.skip_until_sync {
                    return Ok(());
                }
                match self.describe_portal(name) {
                    Ok(event) => self.send_event(event, connection),
                    Err(error) => self.extended_error(error, connection),
                }
            }
            InboundMessage::Execute { portal_name, max_rows } => {
                if self.skip_until_sync {
                    return Ok(());
                }
                self.execute_message(portal_name, max_rows, connection)
            }
            InboundMessage::CloseStatement { name } => {
                if self.skip_until_sync {
                    return Ok(());
                }
                self.cache.close_statement(&name);
                self.send_event(QueryEvent::CloseComplete, connection)
            }
            InboundMessage::ClosePortal { name } => {
                if self.skip_until_sync {
                    return Ok(());
                }
                self.cache.close_portal(&name);
                self.send_event(QueryEvent::CloseComplete, connection)
            }
            InboundMessage::CopyData(_) | InboundMessage::CopyDone | InboundMessage::CopyFail(_) => {
                // COPY payload outside of COPY_IN mode
                self.note_invalid(None, connection)
            }
        }
    }

    // the simple-query protocol

    fn simple_query<C: WireConnection>(&mut self, sql: &str, connection: &mut C) -> io::Result<()> {
        let statements = match split_statements(sql) {
            Ok(statements) => statements,
            Err(error) => {
                self.send_error(QueryError::syntax_error(error), connection)?;
                self.send_ready(connection)?;
                return connection.flush();
            }
        };
        if statements.is_empty() {
            self.send_event(QueryEvent::EmptyQuery, connection)?;
            self.send_ready(connection)?;
            return connection.flush();
        }

        for statement in statements {
            let kind = match classify(&statement) {
                Ok(kind) => kind,
                Err(error) => {
                    self.fail_statement(QueryError::syntax_error(error), connection)?;
                    break;
                }
            };
            if self.tx == TxState::Failed && !matches!(kind, StatementKind::Commit | StatementKind::Rollback) {
                self.send_error(QueryError::transaction_aborted(), connection)?;
                break;
            }
            match self.dispatch_statement(&statement, kind, &[], &[], 0, None, true, connection)? {
                Ok(StatementOutcome::Done) => {}
                Ok(StatementOutcome::EnteredCopy) => {
                    // the response resumes with CommandComplete when the copy
                    // stream ends; no ReadyForQuery until then
                    return connection.flush();
                }
                Err(error) => {
                    self.fail_statement(error, connection)?;
                    break;
                }
            }
        }

        self.send_ready(connection)?;
        connection.flush()
    }

    fn fail_statement<C: WireConnection>(&mut self, error: QueryError, connection: &mut C) -> io::Result<()> {
        if self.tx == TxState::Explicit {
            self.tx = TxState::Failed;
        }
        self.send_error(error, connection)
    }

    // one statement, shared by the simple and the extended flow

    #[allow(clippy::too_many_arguments)]
    fn dispatch_statement<C: WireConnection>(
        &mut self,
        sql: &str,
        kind: StatementKind,
        params: &[Datum],
        result_formats: &[PgFormat],
        max_rows: i32,
        portal_name: Option<&str>,
        describe_rows: bool,
        connection: &mut C,
    ) -> io::Result<Result<StatementOutcome, QueryError>> {
        if sql.trim().is_empty() {
            self.send_event(QueryEvent::EmptyQuery, connection)?;
            return Ok(Ok(StatementOutcome::Done));
        }
        match kind {
            StatementKind::Begin => {
                if let Err(error) = self.backend.begin() {
                    return Ok(Err(backend_error(error)));
                }
                self.tx = TxState::Explicit;
                self.send_event(QueryEvent::TransactionStarted, connection)?;
            }
            StatementKind::Commit => {
                let event = if self.tx == TxState::Failed {
                    // committing a failed transaction rolls it back
                    if let Err(error) = self.backend.rollback() {
                        return Ok(Err(backend_error(error)));
                    }
                    QueryEvent::TransactionRolledBack
                } else {
                    if let Err(error) = self.backend.commit() {
                        return Ok(Err(backend_error(error)));
                    }
                    QueryEvent::TransactionCommitted
                };
                self.end_transaction();
                self.send_event(event, connection)?;
            }
            StatementKind::Rollback => {
                if let Err(error) = self.backend.rollback() {
                    return Ok(Err(backend_error(error)));
                }
                self.end_transaction();
                self.send_event(QueryEvent::TransactionRolledBack, connection)?;
            }
            StatementKind::Set => {
                let set = match parse_set(sql) {
                    Ok(set) => set,
                    Err(error) => return Ok(Err(QueryError::syntax_error(error))),
                };
                match self.session.set(set.scope, &set.name, set.value.as_deref()) {
                    Ok(reported) => {
                        if let Some((name, value)) = reported {
                            self.send_event(QueryEvent::ParameterStatus(name, value), connection)?;
                        }
                    }
                    Err(session::SessionError::UnknownSetting(name)) => {
                        return Ok(Err(QueryError::unknown_setting(name)));
                    }
                }
                self.backend.set_statement_timeout(self.session.statement_timeout_millis());
                self.send_event(QueryEvent::VariableSet, connection)?;
            }
            StatementKind::Show => {
                let target = match parse_show(sql) {
                    Ok(target) => target,
                    Err(error) => return Ok(Err(QueryError::syntax_error(error))),
                };
                match target {
                    ShowTarget::All => {
                        let all = self.session.show_all();
                        self.send_event(
                            QueryEvent::RowDescription(vec![
                                ColumnDescription::new("name", VARCHAR, -1),
                                ColumnDescription::new("setting", VARCHAR, -1),
                            ]),
                            connection,
                        )?;
                        let count = all.len();
                        for (name, value) in all {
                            self.send_event(
                                QueryEvent::DataRow(vec![Some(name.into_bytes()), Some(value.into_bytes())]),
                                connection,
                            )?;
                        }
                        self.send_event(QueryEvent::RecordsSelected(count), connection)?;
                    }
                    ShowTarget::Setting(name) => match self.session.show(&name) {
                        Ok(value) => {
                            self.send_event(
                                QueryEvent::RowDescription(vec![ColumnDescription::new(&name, VARCHAR, -1)]),
                                connection,
                            )?;
                            self.send_event(QueryEvent::DataRow(vec![Some(value.into_bytes())]), connection)?;
                            self.send_event(QueryEvent::VariableShown, connection)?;
                        }
                        Err(session::SessionError::UnknownSetting(name)) => {
                            return Ok(Err(QueryError::unknown_setting(name)));
                        }
                    },
                }
            }
            StatementKind::Reset => {
                let target = match parse_reset(sql) {
                    Ok(target) => target,
                    Err(error) => return Ok(Err(QueryError::syntax_error(error))),
                };
                match target {
                    ResetTarget::All => self.session.reset_all(),
                    ResetTarget::Setting(name) => {
                        if let Err(session::SessionError::UnknownSetting(name)) = self.session.reset(&name) {
                            return Ok(Err(QueryError::unknown_setting(name)));
                        }
                    }
                }
                self.send_event(QueryEvent::VariableReset, connection)?;
            }
            StatementKind::Copy => match self.begin_copy(sql) {
                Ok(event) => {
                    self.send_event(event, connection)?;
                    self.status = ConnectionStatus::CopyIn;
                    return Ok(Ok(StatementOutcome::EnteredCopy));
                }
                Err(error) => return Ok(Err(error)),
            },
            StatementKind::Ddl => {
                match DdlTranslator::translate(&mut self.backend, sql) {
                    Ok(Translation::Skip(tag)) => {
                        self.send_event(QueryEvent::DdlExecuted(tag.to_owned()), connection)?;
                    }
                    Ok(Translation::Execute(rewritten)) => {
                        match self.run_backend(&rewritten, params) {
                            Ok(BackendOutcome::DdlAck(tag)) => {
                                self.send_event(QueryEvent::DdlExecuted(tag), connection)?;
                            }
                            Ok(_) => {
                                return Ok(Err(QueryError::internal_error("unexpected backend reply to DDL")));
                            }
                            Err(error) => return Ok(Err(error)),
                        }
                    }
                    Err(error) => return Ok(Err(error)),
                }
            }
            StatementKind::ClientSide => {
                let first = first_keyword(sql);
                if first.as_deref() == Some("deallocate") {
                    match deallocate_target(sql) {
                        Some(DeallocateTarget::All) => {
                            // cheaper to rebuild than to walk names
                            self.cache = StatementCache::default();
                        }
                        Some(DeallocateTarget::Statement(name)) => self.cache.close_statement(&name),
                        None => return Ok(Err(QueryError::syntax_error(sql))),
                    }
                    self.send_event(QueryEvent::StatementDeallocated, connection)?;
                } else {
                    return Ok(Err(QueryError::feature_not_supported(format!(
                        "statement '{}'",
                        sql
                    ))));
                }
            }
            StatementKind::Query | StatementKind::Dml | StatementKind::Other => {
                match self.run_backend(sql, params) {
                    Ok(BackendOutcome::Rows(description, rows)) => {
                        let columns = self.column_descriptions(&description, result_formats);
                        if describe_rows {
                            self.send_event(QueryEvent::RowDescription(columns.clone()), connection)?;
                        }
                        let ctx = self.codec_context();
                        let mut encoded = Vec::with_capacity(rows.len());
                        for row in rows {
                            match encode_row(&row, &columns, &ctx) {
                                Ok(fields) => encoded.push(fields),
                                Err(error) => return Ok(Err(error)),
                            }
                        }
                        let total = encoded.len();
                        if max_rows > 0 && total > max_rows as usize {
                            let remaining = encoded.split_off(max_rows as usize);
                            let emitted = encoded.len();
                            for fields in encoded {
                                self.send_event(QueryEvent::DataRow(fields), connection)?;
                            }
                            if let Some(portal_name) = portal_name {
                                if let Some(portal) = self.cache.portal_mut(portal_name) {
                                    portal.suspend(remaining);
                                }
                            }
                            log::debug!("portal suspended after {} rows", emitted);
                            self.send_event(QueryEvent::PortalSuspended, connection)?;
                        } else {
                            for fields in encoded {
                                self.send_event(QueryEvent::DataRow(fields), connection)?;
                            }
                            if let Some(portal_name) = portal_name {
                                if let Some(portal) = self.cache.portal_mut(portal_name) {
                                    portal.set_state(PortalState::Done);
                                }
                            }
                            self.send_event(QueryEvent::RecordsSelected(total), connection)?;
                        }
                    }
                    Ok(BackendOutcome::Updated(count)) => {
                        let event = match first_keyword(sql).as_deref() {
                            Some("insert") => QueryEvent::RecordsInserted(count as usize),
                            Some("delete") => QueryEvent::RecordsDeleted(count as usize),
                            _ => QueryEvent::RecordsUpdated(count as usize),
                        };
                        if self.session.force_autocommit() && self.tx == TxState::Explicit {
                            if let Err(error) = self.backend.commit() {
                                return Ok(Err(backend_error(error)));
                            }
                            self.end_transaction();
                        }
                        self.send_event(event, connection)?;
                    }
                    Ok(BackendOutcome::DdlAck(tag)) => {
                        self.send_event(QueryEvent::DdlExecuted(tag), connection)?;
                    }
                    Err(error) => return Ok(Err(error)),
                }
            }
        }
        Ok(Ok(StatementOutcome::Done))
    }

    fn run_backend(&mut self, sql: &str, params: &[Datum]) -> Result<BackendOutcome, QueryError> {
        self.backend.set_statement_timeout(self.session.statement_timeout_millis());
        self.backend.execute(sql, params).map_err(backend_error)
    }

    fn end_transaction(&mut self) {
        self.tx = TxState::Idle;
        self.session.on_transaction_end();
        self.cache.on_transaction_end();
    }

    // extended-query messages

    fn parse_message(&mut self, name: String, sql: String, param_types: Vec<u32>) -> Result<(), QueryError> {
        let statements = split_statements(&sql).map_err(QueryError::syntax_error)?;
        if statements.len() > 1 {
            return Err(QueryError::syntax_error("cannot insert multiple commands into a prepared statement"));
        }
        let body = statements.into_iter().next().unwrap_or_default();
        let kind = classify(&body).map_err(QueryError::syntax_error)?;
        let statement = PreparedStatement::new(body, kind, param_types);
        self.cache
            .store_statement(name.clone(), statement)
            .map_err(|()| QueryError::statement_already_exists(name))
    }

    fn bind_message(
        &mut self,
        portal_name: String,
        statement_name: String,
        param_formats: Vec<i16>,
        raw_params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    ) -> Result<(), QueryError> {
        let statement = match self.cache.statement(&statement_name) {
            Some(statement) => statement.clone(),
            None => return Err(QueryError::statement_does_not_exist(statement_name)),
        };

        let expected = parameter_count(statement.sql()).map_err(QueryError::syntax_error)?;
        if raw_params.len() != expected {
            return Err(QueryError::protocol_violation(format!(
                "bind message supplies {} parameters, but prepared statement \"{}\" requires {}",
                raw_params.len(),
                statement_name,
                expected
            )));
        }

        let param_formats = pad_formats(&param_formats, raw_params.len())?;
        let ctx = self.codec_context();
        let mut params = Vec::with_capacity(raw_params.len());
        for (index, raw, format) in izip!(0.., raw_params.iter(), param_formats.iter()) {
            match raw {
                None => params.push(Datum::Null),
                Some(bytes) => {
                    let oid = statement
                        .param_types()
                        .get(index)
                        .copied()
                        .filter(|oid| *oid != 0)
                        .unwrap_or(wire_protocol_payload::TEXT);
                    let datum = types::decode(oid, *format, bytes, &ctx).map_err(type_error)?;
                    params.push(datum);
                }
            }
        }

        let result_formats = result_formats
            .into_iter()
            .map(PgFormat::try_from)
            .collect::<Result<Vec<PgFormat>, i16>>()
            .map_err(|code| QueryError::protocol_violation(format!("unknown format code {}", code)))?;

        let portal = Portal::new(
            statement_name,
            statement.sql().to_owned(),
            statement.kind(),
            params,
            result_formats,
        );
        self.cache.store_portal(portal_name, portal);
        Ok(())
    }

    fn describe_statement(&mut self, name: String) -> Result<Vec<QueryEvent>, QueryError> {
        let statement = match self.cache.statement(&name) {
            Some(statement) => statement.clone(),
            None => return Err(QueryError::statement_does_not_exist(name)),
        };
        let expected = parameter_count(statement.sql()).map_err(QueryError::syntax_error)?;
        let mut param_types: Vec<u32> = statement.param_types().to_vec();
        param_types.resize(expected, 0);

        let description = self.backend.describe(statement.sql()).map_err(backend_error)?;
        let columns = self.column_descriptions(&description, &[]);
        if let Some(statement) = self.cache.statement_mut(&name) {
            statement.set_described_fields(columns.clone());
        }

        Ok(vec![
            QueryEvent::StatementParameters(param_types),
            QueryEvent::StatementDescription(columns),
        ])
    }

    fn describe_portal(&mut self, name: String) -> Result<QueryEvent, QueryError> {
        let portal = match self.cache.portal(&name) {
            Some(portal) => portal.clone(),
            None => return Err(QueryError::portal_does_not_exist(name)),
        };
        let description = self.backend.describe(portal.sql()).map_err(backend_error)?;
        if description.is_empty() {
            return Ok(QueryEvent::NoData);
        }
        let columns = self.column_descriptions(&description, portal.result_formats());
        Ok(QueryEvent::StatementDescription(columns))
    }

    fn execute_message<C: WireConnection>(
        &mut self,
        portal_name: String,
        max_rows: i32,
        connection: &mut C,
    ) -> io::Result<()> {
        let portal = match self.cache.portal(&portal_name) {
            Some(portal) => portal.clone(),
            None => return self.extended_error(QueryError::portal_does_not_exist(portal_name), connection),
        };

        if portal.is_suspended() {
            return self.resume_portal(portal_name, max_rows, connection);
        }

        let params = portal.params().to_vec();
        let result_formats = portal.result_formats().to_vec();
        match self.dispatch_statement(
            &portal.sql().to_owned(),
            portal.kind(),
            &params,
            &result_formats,
            max_rows,
            Some(&portal_name),
            false,
            connection,
        )? {
            Ok(_) => Ok(()),
            Err(error) => self.extended_error(error, connection),
        }
    }

    fn resume_portal<C: WireConnection>(
        &mut self,
        portal_name: String,
        max_rows: i32,
        connection: &mut C,
    ) -> io::Result<()> {
        let mut rows = match self.cache.portal_mut(&portal_name) {
            Some(portal) => portal.take_suspended(),
            None => return self.extended_error(QueryError::portal_does_not_exist(portal_name), connection),
        };
        let total = rows.len();
        if max_rows > 0 && total > max_rows as usize {
            let remaining = rows.split_off(max_rows as usize);
            for fields in rows {
                self.send_event(QueryEvent::DataRow(fields), connection)?;
            }
            if let Some(portal) = self.cache.portal_mut(&portal_name) {
                portal.suspend(remaining);
            }
            self.send_event(QueryEvent::PortalSuspended, connection)
        } else {
            let emitted = rows.len();
            for fields in rows {
                self.send_event(QueryEvent::DataRow(fields), connection)?;
            }
            if let Some(portal) = self.cache.portal_mut(&portal_name) {
                portal.set_state(PortalState::Done);
            }
            self.send_event(QueryEvent::RecordsSelected(emitted), connection)
        }
    }

    // COPY sub-protocol

    fn begin_copy(&mut self, sql: &str) -> Result<QueryEvent, QueryError> {
        let header = query_parser::copy::parse_copy(sql).map_err(|error| {
            if error.contains("not supported") {
                QueryError::feature_not_supported(error)
            } else {
                QueryError::syntax_error(error)
            }
        })?;

        let exists = self.backend.table_exists(&header.table.value).map_err(backend_error)?;
        if !exists {
            return Err(QueryError::table_does_not_exist(&header.table.value));
        }

        let table_columns = self
            .backend
            .describe(&format!("select * from {}", header.table.value))
            .map_err(backend_error)?;
        let columns: Vec<(String, u32)> = if header.columns.is_empty() {
            table_columns
        } else {
            let mut selected = vec![];
            for column in &header.columns {
                match table_columns.iter().find(|(name, _)| *name == column.value) {
                    Some(found) => selected.push(found.clone()),
                    None => {
                        return Err(QueryError::backend_error(
                            "42703",
                            format!("column \"{}\" of relation \"{}\" does not exist", column.value, header.table.value),
                            None,
                        ));
                    }
                }
            }
            selected
        };

        let wire_format = match header.format {
            CopyFormat::Binary => PgFormat::Binary,
            _ => PgFormat::Text,
        };
        let column_formats = vec![i16::from(wire_format); columns.len()];

        let writer = MutationWriter::new(
            header.table.value,
            columns,
            header.format,
            header.delimiter,
            header.null_marker,
            header.has_header,
            self.session.partitioned_dml(),
            self.codec_context(),
        );
        self.copy = Some(CopyState {
            writer,
            sticky_error: None,
        });
        Ok(QueryEvent::CopyInStarted(wire_format, column_formats))
    }

    fn handle_copy<C: WireConnection>(&mut self, message: InboundMessage, connection: &mut C) -> io::Result<()> {
        match message {
            InboundMessage::CopyData(bytes) => {
                let mut state = match self.copy.take() {
                    Some(state) => state,
                    None => return Ok(()),
                };
                if state.sticky_error.is_none() {
                    if let Err(error) = state.writer.push(&bytes, &mut self.backend) {
                        // further payload is drained but not applied
                        state.writer.abort(&mut self.backend);
                        state.sticky_error = Some(error);
                    }
                }
                self.copy = Some(state);
                Ok(())
            }
            InboundMessage::CopyDone => {
                let mut state = match self.copy.take() {
                    Some(state) => state,
                    None => return Ok(()),
                };
                self.status = ConnectionStatus::Authenticated;
                match state.sticky_error.take() {
                    Some(error) => {
                        state.writer.abort(&mut self.backend);
                        let _ = self.backend.rollback();
                        self.fail_statement(error, connection)?;
                    }
                    None => match state.writer.finish(&mut self.backend) {
                        Ok(rows) => {
                            if let Err(error) = self.backend.commit() {
                                self.fail_statement(backend_error(error), connection)?;
                            } else {
                                self.send_event(QueryEvent::RecordsCopied(rows), connection)?;
                            }
                        }
                        Err(error) => self.fail_statement(error, connection)?,
                    },
                }
                self.send_ready(connection)?;
                connection.flush()
            }
            InboundMessage::CopyFail(reason) => {
                if let Some(mut state) = self.copy.take() {
                    state.writer.abort(&mut self.backend);
                }
                let _ = self.backend.rollback();
                self.status = ConnectionStatus::Authenticated;
                self.fail_statement(QueryError::copy_failed(reason), connection)?;
                self.send_ready(connection)?;
                connection.flush()
            }
            // some clients interleave Flush/Sync into the copy stream
            InboundMessage::Flush | InboundMessage::Sync => Ok(()),
            InboundMessage::Terminate => {
                if let Some(mut state) = self.copy.take() {
                    state.writer.abort(&mut self.backend);
                }
                self.status = ConnectionStatus::Terminated;
                Ok(())
            }
            _ => self.note_invalid(None, connection),
        }
    }

    // bookkeeping

    fn note_invalid<C: WireConnection>(&mut self, respond: Option<QueryError>, connection: &mut C) -> io::Result<()> {
        self.invalid_messages += 1;
        if self.invalid_messages > MAX_INVALID_MESSAGE_COUNT {
            self.send_error(
                QueryError::fatal_protocol_violation("terminating connection after too many invalid messages"),
                connection,
            )?;
            connection.flush()?;
            self.status = ConnectionStatus::Terminated;
            return Ok(());
        }
        if let Some(error) = respond {
            self.send_error(error, connection)?;
            connection.flush()?;
        }
        Ok(())
    }

    fn extended_error<C: WireConnection>(&mut self, error: QueryError, connection: &mut C) -> io::Result<()> {
        self.skip_until_sync = true;
        self.fail_statement(error, connection)
    }

    fn send_event<C: WireConnection>(&self, event: QueryEvent, connection: &mut C) -> io::Result<()> {
        connection.send(OutboundMessage::from(event))
    }

    fn send_error<C: WireConnection>(&self, error: QueryError, connection: &mut C) -> io::Result<()> {
        connection.send(OutboundMessage::from(error))
    }

    fn send_ready<C: WireConnection>(&self, connection: &mut C) -> io::Result<()> {
        let status = match self.tx {
            TxState::Idle => TransactionStatus::Idle,
            TxState::Explicit => TransactionStatus::InTransaction,
            TxState::Failed => TransactionStatus::Failed,
        };
        connection.send(OutboundMessage::ReadyForQuery(status))
    }

    fn column_descriptions(&self, description: &[(String, u32)], result_formats: &[PgFormat]) -> Vec<ColumnDescription> {
        description
            .iter()
            .enumerate()
            .map(|(index, (name, oid))| {
                let format = match result_formats {
                    [] => PgFormat::Text,
                    [only] => *only,
                    formats => formats.get(index).copied().unwrap_or(PgFormat::Text),
                };
                ColumnDescription::new(name, *oid, types::type_len(*oid)).with_format(format)
            })
            .collect()
    }

    fn codec_context(&self) -> CodecContext {
        CodecContext::with_timezone(timezone_offset(self.session.get("timezone").unwrap_or("UTC")))
    }
}

/// Resolves the session `TimeZone` into a fixed offset; zone names other
/// than UTC aliases fall back to UTC
fn timezone_offset(zone: &str) -> FixedOffset {
    let trimmed = zone.trim();
    match trimmed.to_lowercase().as_str() {
        "utc" | "gmt" | "z" | "universal" | "zulu" => return FixedOffset::east(0),
        _ => {}
    }
    let bytes = trimmed.as_bytes();
    if bytes.first() == Some(&b'+') || bytes.first() == Some(&b'-') {
        let sign = if bytes[0] == b'+' { 1 } else { -1 };
        let rest = &trimmed[1..];
        let (hours, minutes) = match rest.find(':') {
            Some(colon) => (
                rest[..colon].parse::<i32>().unwrap_or(0),
                rest[colon + 1..].parse::<i32>().unwrap_or(0),
            ),
            None => (rest.parse::<i32>().unwrap_or(0), 0),
        };
        return FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).unwrap_or_else(|| FixedOffset::east(0));
    }
    FixedOffset::east(0)
}

fn pad_formats(formats: &[i16], param_len: usize) -> Result<Vec<PgFormat>, QueryError> {
    let codes: Vec<i16> = match (formats.len(), param_len) {
        (0, n) => vec![0; n],
        (1, n) => vec![formats[0]; n],
        (m, n) if m == n => formats.to_vec(),
        (m, n) => {
            return Err(QueryError::protocol_violation(format!(
                "expected {} parameter format specifiers, but got {}",
                n, m
            )))
        }
    };
    codes
        .into_iter()
        .map(PgFormat::try_from)
        .collect::<Result<Vec<PgFormat>, i16>>()
        .map_err(|code| QueryError::protocol_violation(format!("unknown format code {}", code)))
}

fn encode_row(row: &[Datum], columns: &[ColumnDescription], ctx: &CodecContext) -> Result<Vec<Option<Vec<u8>>>, QueryError> {
    let mut fields = Vec::with_capacity(row.len());
    for (datum, column) in row.iter().zip(columns.iter()) {
        if datum.is_null() {
            fields.push(None);
            continue;
        }
        let encoded = types::encode(column.type_oid, column.format, datum, ctx).map_err(type_error)?;
        fields.push(Some(encoded));
    }
    Ok(fields)
}

fn backend_error(error: BackendError) -> QueryError {
    if error.is_cancellation() {
        QueryError::query_canceled()
    } else {
        QueryError::backend_error(error.code, error.message, error.hint)
    }
}

fn type_error(error: TypeError) -> QueryError {
    match error {
        TypeError::InvalidArgument { pg_type, message } => QueryError::invalid_text_representation(pg_type, message),
        TypeError::ProtocolViolation { pg_type } => QueryError::invalid_binary_representation(pg_type),
    }
}

#[derive(Debug)]
enum DeallocateTarget {
    All,
    Statement(String),
}

fn first_keyword(sql: &str) -> Option<String> {
    let tokens = tokenize(sql).ok()?;
    tokens.into_iter().find_map(|token| match token.kind {
        TokenKind::Word(word) => Some(word),
        _ => None,
    })
}

fn deallocate_target(sql: &str) -> Option<DeallocateTarget> {
    let tokens = tokenize(sql).ok()?;
    let mut at = 1;
    if tokens.get(at).map(|token| token.kind == TokenKind::Word("prepare".to_owned())) == Some(true) {
        at += 1;
    }
    match tokens.get(at).map(|token| &token.kind) {
        Some(TokenKind::Word(word)) if word == "all" => Some(DeallocateTarget::All),
        Some(TokenKind::Word(word)) => Some(DeallocateTarget::Statement(word.clone())),
        Some(TokenKind::QuotedIdent(name)) => Some(DeallocateTarget::Statement(name.clone())),
        _ => None,
    }
}
