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

use std::fmt::{self, Display, Formatter};
use wire_protocol_payload::{ColumnDescription, OutboundMessage, PgFormat};

pub type QueryResult = Result<QueryEvent, QueryError>;

/// Represents successful events that can happen in server backend
#[derive(Clone, Debug, PartialEq)]
pub enum QueryEvent {
    /// Table successfully created
    TableCreated,
    /// Table successfully dropped
    TableDropped,
    /// Index successfully created
    IndexCreated,
    /// Index successfully dropped
    IndexDropped,
    /// Generic data definition acknowledged with its command tag
    DdlExecuted(String),
    /// Variable successfully set
    VariableSet,
    /// Variable successfully reset
    VariableReset,
    /// Variable value returned to the client
    VariableShown,
    /// Prepared statement successfully deallocated
    StatementDeallocated,
    /// Transaction is started
    TransactionStarted,
    /// Transaction is committed
    TransactionCommitted,
    /// Transaction is rolled back
    TransactionRolledBack,
    /// Number of records inserted into a table
    RecordsInserted(usize),
    /// Number of records updated in a table
    RecordsUpdated(usize),
    /// Number of records deleted from a table
    RecordsDeleted(usize),
    /// Records selected from the backend
    RecordsSelected(usize),
    /// Number of rows loaded by a COPY
    RecordsCopied(usize),
    /// Row description information
    RowDescription(Vec<ColumnDescription>),
    /// Row data
    DataRow(Vec<Option<Vec<u8>>>),
    /// Parsing the extended query is complete
    ParseComplete,
    /// Binding the extended query is complete
    BindComplete,
    /// Closing a statement or portal is complete
    CloseComplete,
    /// Portal hit its row limit and can be executed again
    PortalSuspended,
    /// Prepared statement parameter types
    StatementParameters(Vec<u32>),
    /// Prepared statement row description
    StatementDescription(Vec<ColumnDescription>),
    /// Query produces no rows
    NoData,
    /// The query string was empty
    EmptyQuery,
    /// Server is ready to accept COPY payload
    CopyInStarted(PgFormat, Vec<i16>),
    /// A run-time parameter the client tracks has changed
    ParameterStatus(String, String),
}

impl From<QueryEvent> for OutboundMessage {
    fn from(event: QueryEvent) -> OutboundMessage {
        match event {
            QueryEvent::TableCreated => OutboundMessage::CommandComplete("CREATE TABLE".to_owned()),
            QueryEvent::TableDropped => OutboundMessage::CommandComplete("DROP TABLE".to_owned()),
            QueryEvent::IndexCreated => OutboundMessage::CommandComplete("CREATE INDEX".to_owned()),
            QueryEvent::IndexDropped => OutboundMessage::CommandComplete("DROP INDEX".to_owned()),
            QueryEvent::DdlExecuted(tag) => OutboundMessage::CommandComplete(tag),
            QueryEvent::VariableSet => OutboundMessage::CommandComplete("SET".to_owned()),
            QueryEvent::VariableReset => OutboundMessage::CommandComplete("RESET".to_owned()),
            QueryEvent::VariableShown => OutboundMessage::CommandComplete("SHOW".to_owned()),
            QueryEvent::StatementDeallocated => OutboundMessage::CommandComplete("DEALLOCATE".to_owned()),
            QueryEvent::TransactionStarted => OutboundMessage::CommandComplete("BEGIN".to_owned()),
            QueryEvent::TransactionCommitted => OutboundMessage::CommandComplete("COMMIT".to_owned()),
            QueryEvent::TransactionRolledBack => OutboundMessage::CommandComplete("ROLLBACK".to_owned()),
            QueryEvent::RecordsInserted(records) => OutboundMessage::CommandComplete(format!("INSERT 0 {}", records)),
            QueryEvent::RecordsUpdated(records) => OutboundMessage::CommandComplete(format!("UPDATE {}", records)),
            QueryEvent::RecordsDeleted(records) => OutboundMessage::CommandComplete(format!("DELETE {}", records)),
            QueryEvent::RecordsSelected(records) => OutboundMessage::CommandComplete(format!("SELECT {}", records)),
            QueryEvent::RecordsCopied(records) => OutboundMessage::CommandComplete(format!("COPY {}", records)),
            QueryEvent::RowDescription(columns) => OutboundMessage::RowDescription(columns),
            QueryEvent::DataRow(row) => OutboundMessage::DataRow(row),
            QueryEvent::ParseComplete => OutboundMessage::ParseComplete,
            QueryEvent::BindComplete => OutboundMessage::BindComplete,
            QueryEvent::CloseComplete => OutboundMessage::CloseComplete,
            QueryEvent::PortalSuspended => OutboundMessage::PortalSuspended,
            QueryEvent::StatementParameters(type_oids) => OutboundMessage::ParameterDescription(type_oids),
            QueryEvent::StatementDescription(columns) => {
                if columns.is_empty() {
                    OutboundMessage::NoData
                } else {
                    OutboundMessage::RowDescription(columns)
                }
            }
            QueryEvent::NoData => OutboundMessage::NoData,
            QueryEvent::EmptyQuery => OutboundMessage::EmptyQueryResponse,
            QueryEvent::CopyInStarted(format, column_formats) => OutboundMessage::CopyInResponse {
                format,
                column_formats,
            },
            QueryEvent::ParameterStatus(key, value) => OutboundMessage::ParameterStatus(key, value),
        }
    }
}

/// Message severities
/// Reference: defined in https://www.postgresql.org/docs/12/protocol-error-fields.html
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Severity {
    Error,
    Fatal,
    Panic,
    Warning,
    Notice,
    Debug,
    Info,
    Log,
}

// easy conversion into a string.
impl From<Severity> for &'static str {
    fn from(severity: Severity) -> &'static str {
        match severity {
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
            Severity::Panic => "PANIC",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Log => "LOG",
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
enum QueryErrorKind {
    ProtocolViolation(String),
    StatementDoesNotExist(String),
    PortalDoesNotExist(String),
    StatementAlreadyExists(String),
    SyntaxError(String),
    TableDoesNotExist(String),
    UnknownSetting(String),
    QueryCanceled,
    InternalError(String),
    FeatureNotSupported(String),
    InvalidParameterValue(String),
    InvalidTextRepresentation(String, String),
    InvalidBinaryRepresentation(String),
    TransactionAborted,
    TooManyConnections,
    CopyFailed(String),
    /// an error the backend reported, surfaced verbatim
    Backend {
        code: String,
        message: String,
        hint: Option<String>,
    },
}

impl QueryErrorKind {
    fn code(&self) -> &str {
        match self {
            QueryErrorKind::ProtocolViolation(_) => "08P01",
            QueryErrorKind::StatementDoesNotExist(_) => "26000",
            QueryErrorKind::PortalDoesNotExist(_) => "26000",
            QueryErrorKind::StatementAlreadyExists(_) => "42P05",
            QueryErrorKind::SyntaxError(_) => "42601",
            QueryErrorKind::TableDoesNotExist(_) => "42P01",
            QueryErrorKind::UnknownSetting(_) => "42704",
            QueryErrorKind::QueryCanceled => "57014",
            QueryErrorKind::InternalError(_) => "XX000",
            QueryErrorKind::FeatureNotSupported(_) => "0A000",
            QueryErrorKind::InvalidParameterValue(_) => "22023",
            QueryErrorKind::InvalidTextRepresentation(_, _) => "22P02",
            QueryErrorKind::InvalidBinaryRepresentation(_) => "08P01",
            QueryErrorKind::TransactionAborted => "25P02",
            QueryErrorKind::TooManyConnections => "53300",
            QueryErrorKind::CopyFailed(_) => "57014",
            QueryErrorKind::Backend { code, .. } => code,
        }
    }
}

impl Display for QueryErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            QueryErrorKind::ProtocolViolation(message) => write!(f, "{}", message),
            QueryErrorKind::StatementDoesNotExist(name) => {
                write!(f, "prepared statement \"{}\" does not exist", name)
            }
            QueryErrorKind::PortalDoesNotExist(name) => write!(f, "portal \"{}\" does not exist", name),
            QueryErrorKind::StatementAlreadyExists(name) => {
                write!(f, "prepared statement \"{}\" already exists", name)
            }
            QueryErrorKind::SyntaxError(message) => write!(f, "syntax error: {}", message),
            QueryErrorKind::TableDoesNotExist(table) => write!(f, "relation \"{}\" does not exist", table),
            QueryErrorKind::UnknownSetting(name) => {
                write!(f, "unrecognized configuration parameter \"{}\"", name)
            }
            QueryErrorKind::QueryCanceled => write!(f, "canceling statement due to user request"),
            QueryErrorKind::InternalError(message) => write!(f, "{}", message),
            QueryErrorKind::FeatureNotSupported(feature) => write!(f, "{} is not supported", feature),
            QueryErrorKind::InvalidParameterValue(message) => write!(f, "{}", message),
            QueryErrorKind::InvalidTextRepresentation(pg_type, value) => {
                write!(f, "invalid input syntax for type {}: \"{}\"", pg_type, value)
            }
            QueryErrorKind::InvalidBinaryRepresentation(pg_type) => {
                write!(f, "insufficient data left in message for type {}", pg_type)
            }
            QueryErrorKind::TransactionAborted => write!(
                f,
                "current transaction is aborted, commands ignored until end of transaction block"
            ),
            QueryErrorKind::TooManyConnections => write!(f, "sorry, too many clients already"),
            QueryErrorKind::CopyFailed(reason) => write!(f, "COPY from stdin failed: {}", reason),
            QueryErrorKind::Backend { message, .. } => write!(f, "{}", message),
        }
    }
}

/// Represents error during query execution
#[derive(Debug, PartialEq, Clone)]
pub struct QueryError {
    severity: Severity,
    kind: QueryErrorKind,
}

impl QueryError {
    pub fn code(&self) -> &str {
        self.kind.code()
    }

    pub fn severity(&self) -> &'static str {
        self.severity.into()
    }

    pub fn message(&self) -> String {
        format!("{}", self.kind)
    }

    pub fn hint(&self) -> Option<String> {
        match &self.kind {
            QueryErrorKind::Backend { hint, .. } => hint.clone(),
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    /// `true` for a query cancellation, either client requested or by timeout
    pub fn is_cancellation(&self) -> bool {
        self.kind == QueryErrorKind::QueryCanceled
    }

    /// protocol violation error constructor
    pub fn protocol_violation<S: ToString>(message: S) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::ProtocolViolation(message.to_string()),
        }
    }

    /// fatal protocol violation that terminates the connection
    pub fn fatal_protocol_violation<S: ToString>(message: S) -> QueryError {
        QueryError {
            severity: Severity::Fatal,
            kind: QueryErrorKind::ProtocolViolation(message.to_string()),
        }
    }

    /// prepared statement does not exist error constructor
    pub fn statement_does_not_exist<S: ToString>(name: S) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::StatementDoesNotExist(name.to_string()),
        }
    }

    /// portal does not exist error constructor
    pub fn portal_does_not_exist<S: ToString>(name: S) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::PortalDoesNotExist(name.to_string()),
        }
    }

    /// prepared statement already exists error constructor
    pub fn statement_already_exists<S: ToString>(name: S) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::StatementAlreadyExists(name.to_string()),
        }
    }

    /// syntax error in the expression as part of query
    pub fn syntax_error<S: ToString>(message: S) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::SyntaxError(message.to_string()),
        }
    }

    /// table does not exist error constructor
    pub fn table_does_not_exist<S: ToString>(table: S) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::TableDoesNotExist(table.to_string()),
        }
    }

    /// unrecognized configuration parameter error constructor
    pub fn unknown_setting<S: ToString>(name: S) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::UnknownSetting(name.to_string()),
        }
    }

    /// query canceled error constructor
    pub fn query_canceled() -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::QueryCanceled,
        }
    }

    /// internal error constructor
    pub fn internal_error<S: ToString>(message: S) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::InternalError(message.to_string()),
        }
    }

    /// not supported operation error constructor
    pub fn feature_not_supported<S: ToString>(feature: S) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::FeatureNotSupported(feature.to_string()),
        }
    }

    /// invalid parameter value error constructor
    pub fn invalid_parameter_value<S: ToString>(message: S) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::InvalidParameterValue(message.to_string()),
        }
    }

    /// invalid text representation error constructor
    pub fn invalid_text_representation<T: ToString, V: ToString>(pg_type: T, value: V) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::InvalidTextRepresentation(pg_type.to_string(), value.to_string()),
        }
    }

    /// invalid binary representation error constructor
    pub fn invalid_binary_representation<T: ToString>(pg_type: T) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::InvalidBinaryRepresentation(pg_type.to_string()),
        }
    }

    /// failed transaction block error constructor
    pub fn transaction_aborted() -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::TransactionAborted,
        }
    }

    /// connection limit reached error constructor
    pub fn too_many_connections() -> QueryError {
        QueryError {
            severity: Severity::Fatal,
            kind: QueryErrorKind::TooManyConnections,
        }
    }

    /// client requested COPY abort constructor
    pub fn copy_failed<S: ToString>(reason: S) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::CopyFailed(reason.to_string()),
        }
    }

    /// an error reported by the backend, surfaced with its own code and hint
    pub fn backend_error<C: ToString, M: ToString>(code: C, message: M, hint: Option<String>) -> QueryError {
        QueryError {
            severity: Severity::Error,
            kind: QueryErrorKind::Backend {
                code: code.to_string(),
                message: message.to_string(),
                hint,
            },
        }
    }
}

impl From<QueryError> for OutboundMessage {
    fn from(error: QueryError) -> OutboundMessage {
        OutboundMessage::Error {
            severity: error.severity().to_owned(),
            code: error.code().to_owned(),
            message: error.message(),
            hint: error.hint(),
        }
    }
}
