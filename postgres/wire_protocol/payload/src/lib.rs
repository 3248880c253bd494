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

//! Wire-level building blocks of the PostgreSQL frontend/backend protocol:
//! message tags, type OIDs and the inbound/outbound message variants that the
//! rest of the system exchanges with a client.

use std::convert::TryFrom;

// type oids
pub const BOOL: u32 = 16;
pub const BYTEA: u32 = 17;
pub const CHAR: u32 = 18;
pub const BIGINT: u32 = 20;
pub const SMALLINT: u32 = 21;
pub const INT: u32 = 23;
pub const TEXT: u32 = 25;
pub const REAL: u32 = 700;
pub const DOUBLE_PRECISION: u32 = 701;
pub const VARCHAR: u32 = 1043;
pub const DATE: u32 = 1082;
pub const TIMESTAMP: u32 = 1114;
pub const TIMESTAMPTZ: u32 = 1184;
pub const NUMERIC: u32 = 1700;
pub const JSONB: u32 = 3802;

// array type oids
pub const BOOL_ARRAY: u32 = 1000;
pub const BYTEA_ARRAY: u32 = 1001;
pub const SMALLINT_ARRAY: u32 = 1005;
pub const INT_ARRAY: u32 = 1007;
pub const BIGINT_ARRAY: u32 = 1016;
pub const TEXT_ARRAY: u32 = 1009;
pub const REAL_ARRAY: u32 = 1021;
pub const DOUBLE_PRECISION_ARRAY: u32 = 1022;
pub const VARCHAR_ARRAY: u32 = 1015;
pub const DATE_ARRAY: u32 = 1182;
pub const TIMESTAMP_ARRAY: u32 = 1115;
pub const TIMESTAMPTZ_ARRAY: u32 = 1185;
pub const NUMERIC_ARRAY: u32 = 1231;
pub const JSONB_ARRAY: u32 = 3807;

// frontend message tags
pub const QUERY: u8 = b'Q';
pub const PARSE: u8 = b'P';
pub const BIND: u8 = b'B';
pub const DESCRIBE: u8 = b'D';
pub const EXECUTE: u8 = b'E';
pub const SYNC: u8 = b'S';
pub const FLUSH: u8 = b'H';
pub const CLOSE: u8 = b'C';
pub const TERMINATE: u8 = b'X';
pub const COPY_DATA: u8 = b'd';
pub const COPY_DONE: u8 = b'c';
pub const COPY_FAIL: u8 = b'f';

// backend message tags
pub const AUTHENTICATION: u8 = b'R';
pub const BACKEND_KEY_DATA: u8 = b'K';
pub const PARAMETER_STATUS: u8 = b'S';
pub const READY_FOR_QUERY: u8 = b'Z';
pub const ROW_DESCRIPTION: u8 = b'T';
pub const DATA_ROW: u8 = b'D';
pub const COMMAND_COMPLETE: u8 = b'C';
pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
pub const NOTICE_RESPONSE: u8 = b'N';
pub const ERROR_RESPONSE: u8 = b'E';
pub const PARSE_COMPLETE: u8 = b'1';
pub const BIND_COMPLETE: u8 = b'2';
pub const CLOSE_COMPLETE: u8 = b'3';
pub const NO_DATA: u8 = b'n';
pub const PORTAL_SUSPENDED: u8 = b's';
pub const PARAMETER_DESCRIPTION: u8 = b't';
pub const COPY_IN_RESPONSE: u8 = b'G';

// error response field tags
pub const SEVERITY: u8 = b'S';
pub const CODE: u8 = b'C';
pub const MESSAGE: u8 = b'M';
pub const HINT: u8 = b'H';

// bootstrap protocol discriminators
pub const VERSION_3: i32 = 196_608;
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;
pub const SSL_REQUEST_CODE: i32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: i32 = 80_877_104;

/// Format of a parameter or result column on the wire
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PgFormat {
    Text,
    Binary,
}

impl TryFrom<i16> for PgFormat {
    type Error = i16;

    fn try_from(code: i16) -> Result<PgFormat, i16> {
        match code {
            0 => Ok(PgFormat::Text),
            1 => Ok(PgFormat::Binary),
            other => Err(other),
        }
    }
}

impl From<PgFormat> for i16 {
    fn from(format: PgFormat) -> i16 {
        match format {
            PgFormat::Text => 0,
            PgFormat::Binary => 1,
        }
    }
}

/// Transaction status reported in the trailing byte of `ReadyForQuery`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// not in a transaction block
    Idle,
    /// in a transaction block
    InTransaction,
    /// in a failed transaction block, queries rejected until rollback
    Failed,
}

impl TransactionStatus {
    pub fn as_byte(&self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// Description of a single column in a `RowDescription` message
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescription {
    pub name: String,
    pub type_oid: u32,
    pub type_len: i16,
    pub format: PgFormat,
}

impl ColumnDescription {
    pub fn new<S: ToString>(name: S, type_oid: u32, type_len: i16) -> ColumnDescription {
        ColumnDescription {
            name: name.to_string(),
            type_oid,
            type_len,
            format: PgFormat::Text,
        }
    }

    pub fn with_format(mut self, format: PgFormat) -> ColumnDescription {
        self.format = format;
        self
    }
}

/// Messages a client sends after the connection is established
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Query {
        sql: String,
    },
    Parse {
        statement_name: String,
        sql: String,
        param_types: Vec<u32>,
    },
    Bind {
        portal_name: String,
        statement_name: String,
        param_formats: Vec<i16>,
        raw_params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    DescribeStatement {
        name: String,
    },
    DescribePortal {
        name: String,
    },
    Execute {
        portal_name: String,
        max_rows: i32,
    },
    CloseStatement {
        name: String,
    },
    ClosePortal {
        name: String,
    },
    Flush,
    Sync,
    CopyData(Vec<u8>),
    CopyDone,
    CopyFail(String),
    Terminate,
}

/// Messages the server sends back to a client
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    AuthenticationCleartextPassword,
    AuthenticationOk,
    ParameterStatus(String, String),
    BackendKeyData(i32, i32),
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<ColumnDescription>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription(Vec<u32>),
    Error {
        severity: String,
        code: String,
        message: String,
        hint: Option<String>,
    },
    Notice {
        severity: String,
        code: String,
        message: String,
    },
    CopyInResponse {
        format: PgFormat,
        column_formats: Vec<i16>,
    },
}

fn tagged(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut buff = Vec::with_capacity(payload.len() + 5);
    buff.push(tag);
    buff.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
    buff.extend_from_slice(payload);
    buff
}

fn command_complete(command: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(command.as_bytes());
    payload.push(0);
    tagged(COMMAND_COMPLETE, &payload)
}

fn field_descriptions(columns: &[ColumnDescription]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(columns.len() as i16).to_be_bytes());
    for column in columns {
        payload.extend_from_slice(column.name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&0i32.to_be_bytes()); // table id
        payload.extend_from_slice(&0i16.to_be_bytes()); // column id
        payload.extend_from_slice(&column.type_oid.to_be_bytes());
        payload.extend_from_slice(&column.type_len.to_be_bytes());
        payload.extend_from_slice(&(-1i32).to_be_bytes()); // type modifier
        payload.extend_from_slice(&i16::from(column.format).to_be_bytes());
    }
    payload
}

impl From<OutboundMessage> for Vec<u8> {
    fn from(message: OutboundMessage) -> Vec<u8> {
        match message {
            OutboundMessage::AuthenticationCleartextPassword => vec![AUTHENTICATION, 0, 0, 0, 8, 0, 0, 0, 3],
            OutboundMessage::AuthenticationOk => vec![AUTHENTICATION, 0, 0, 0, 8, 0, 0, 0, 0],
            OutboundMessage::ParameterStatus(key, value) => {
                let mut payload = Vec::new();
                payload.extend_from_slice(key.as_bytes());
                payload.push(0);
                payload.extend_from_slice(value.as_bytes());
                payload.push(0);
                tagged(PARAMETER_STATUS, &payload)
            }
            OutboundMessage::BackendKeyData(conn_id, secret_key) => {
                let mut payload = Vec::new();
                payload.extend_from_slice(&conn_id.to_be_bytes());
                payload.extend_from_slice(&secret_key.to_be_bytes());
                tagged(BACKEND_KEY_DATA, &payload)
            }
            OutboundMessage::ReadyForQuery(status) => vec![READY_FOR_QUERY, 0, 0, 0, 5, status.as_byte()],
            OutboundMessage::RowDescription(columns) => tagged(ROW_DESCRIPTION, &field_descriptions(&columns)),
            OutboundMessage::DataRow(fields) => {
                let mut payload = Vec::new();
                payload.extend_from_slice(&(fields.len() as i16).to_be_bytes());
                for field in fields {
                    match field {
                        None => payload.extend_from_slice(&(-1i32).to_be_bytes()),
                        Some(value) => {
                            payload.extend_from_slice(&(value.len() as i32).to_be_bytes());
                            payload.extend_from_slice(&value);
                        }
                    }
                }
                tagged(DATA_ROW, &payload)
            }
            OutboundMessage::CommandComplete(tag) => command_complete(&tag),
            OutboundMessage::EmptyQueryResponse => vec![EMPTY_QUERY_RESPONSE, 0, 0, 0, 4],
            OutboundMessage::ParseComplete => vec![PARSE_COMPLETE, 0, 0, 0, 4],
            OutboundMessage::BindComplete => vec![BIND_COMPLETE, 0, 0, 0, 4],
            OutboundMessage::CloseComplete => vec![CLOSE_COMPLETE, 0, 0, 0, 4],
            OutboundMessage::NoData => vec![NO_DATA, 0, 0, 0, 4],
            OutboundMessage::PortalSuspended => vec![PORTAL_SUSPENDED, 0, 0, 0, 4],
            OutboundMessage::ParameterDescription(type_oids) => {
                let mut payload = Vec::new();
                payload.extend_from_slice(&(type_oids.len() as i16).to_be_bytes());
                for oid in type_oids {
                    payload.extend_from_slice(&oid.to_be_bytes());
                }
                tagged(PARAMETER_DESCRIPTION, &payload)
            }
            OutboundMessage::Error {
                severity,
                code,
                message,
                hint,
            } => {
                let mut payload = Vec::new();
                payload.push(SEVERITY);
                payload.extend_from_slice(severity.as_bytes());
                payload.push(0);
                payload.push(CODE);
                payload.extend_from_slice(code.as_bytes());
                payload.push(0);
                payload.push(MESSAGE);
                payload.extend_from_slice(message.as_bytes());
                payload.push(0);
                if let Some(hint) = hint {
                    payload.push(HINT);
                    payload.extend_from_slice(hint.as_bytes());
                    payload.push(0);
                }
                payload.push(0);
                tagged(ERROR_RESPONSE, &payload)
            }
            OutboundMessage::Notice {
                severity,
                code,
                message,
            } => {
                let mut payload = Vec::new();
                payload.push(SEVERITY);
                payload.extend_from_slice(severity.as_bytes());
                payload.push(0);
                payload.push(CODE);
                payload.extend_from_slice(code.as_bytes());
                payload.push(0);
                payload.push(MESSAGE);
                payload.extend_from_slice(message.as_bytes());
                payload.push(0);
                payload.push(0);
                tagged(NOTICE_RESPONSE, &payload)
            }
            OutboundMessage::CopyInResponse { format, column_formats } => {
                let mut payload = Vec::new();
                payload.push(match format {
                    PgFormat::Text => 0,
                    PgFormat::Binary => 1,
                });
                payload.extend_from_slice(&(column_formats.len() as i16).to_be_bytes());
                for column_format in column_formats {
                    payload.extend_from_slice(&column_format.to_be_bytes());
                }
                tagged(COPY_IN_RESPONSE, &payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_for_query_reflects_transaction_status() {
        let idle: Vec<u8> = OutboundMessage::ReadyForQuery(TransactionStatus::Idle).into();
        let in_tx: Vec<u8> = OutboundMessage::ReadyForQuery(TransactionStatus::InTransaction).into();
        let failed: Vec<u8> = OutboundMessage::ReadyForQuery(TransactionStatus::Failed).into();

        assert_eq!(idle, vec![READY_FOR_QUERY, 0, 0, 0, 5, b'I']);
        assert_eq!(in_tx, vec![READY_FOR_QUERY, 0, 0, 0, 5, b'T']);
        assert_eq!(failed, vec![READY_FOR_QUERY, 0, 0, 0, 5, b'E']);
    }

    #[test]
    fn command_complete_is_nul_terminated() {
        let encoded: Vec<u8> = OutboundMessage::CommandComplete("SELECT 1".to_owned()).into();
        assert_eq!(
            encoded,
            vec![
                COMMAND_COMPLETE,
                0,
                0,
                0,
                13,
                b'S',
                b'E',
                b'L',
                b'E',
                b'C',
                b'T',
                b' ',
                b'1',
                0
            ]
        );
    }

    #[test]
    fn data_row_encodes_null_as_negative_length() {
        let encoded: Vec<u8> = OutboundMessage::DataRow(vec![Some(b"1".to_vec()), None]).into();
        assert_eq!(
            encoded,
            vec![DATA_ROW, 0, 0, 0, 15, 0, 2, 0, 0, 0, 1, b'1', 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn row_description_single_column() {
        let encoded: Vec<u8> = OutboundMessage::RowDescription(vec![ColumnDescription::new("id", INT, 4)]).into();
        let mut expected = vec![ROW_DESCRIPTION, 0, 0, 0, 27, 0, 1];
        expected.extend_from_slice(b"id\0");
        expected.extend_from_slice(&0i32.to_be_bytes());
        expected.extend_from_slice(&0i16.to_be_bytes());
        expected.extend_from_slice(&INT.to_be_bytes());
        expected.extend_from_slice(&4i16.to_be_bytes());
        expected.extend_from_slice(&(-1i32).to_be_bytes());
        expected.extend_from_slice(&0i16.to_be_bytes());
        assert_eq!(encoded, expected);
    }

    #[test]
    fn error_response_carries_severity_code_and_message() {
        let encoded: Vec<u8> = OutboundMessage::Error {
            severity: "ERROR".to_owned(),
            code: "42601".to_owned(),
            message: "syntax error".to_owned(),
            hint: None,
        }
        .into();

        assert_eq!(encoded[0], ERROR_RESPONSE);
        let body = &encoded[5..];
        assert_eq!(body[0], SEVERITY);
        assert!(body.windows(6).any(|window| window == b"C42601"));
        assert_eq!(*body.last().unwrap(), 0);
    }

    #[test]
    fn copy_in_response_lists_column_formats() {
        let encoded: Vec<u8> = OutboundMessage::CopyInResponse {
            format: PgFormat::Text,
            column_formats: vec![0, 0, 0],
        }
        .into();
        assert_eq!(encoded, vec![COPY_IN_RESPONSE, 0, 0, 0, 13, 0, 0, 3, 0, 0, 0, 0, 0, 0]);
    }
}
