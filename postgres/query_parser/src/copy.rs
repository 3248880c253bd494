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

//! `COPY <table> [(columns)] FROM STDIN [WITH (…)]` header recognition.

use crate::{ident_of, tokenize, Ident, Token, TokenKind};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CopyFormat {
    Text,
    Csv,
    Binary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CopyHeader {
    pub table: Ident,
    pub columns: Vec<Ident>,
    pub format: CopyFormat,
    pub delimiter: char,
    pub null_marker: String,
    pub has_header: bool,
}

pub fn parse_copy(sql: &str) -> Result<CopyHeader, String> {
    let tokens = tokenize(sql).map_err(|error| error.to_string())?;
    let mut at = 0;
    if tokens.get(at).map(|token| token.is_word("copy")) != Some(true) {
        return Err("not a COPY statement".to_owned());
    }
    at += 1;

    let table = match tokens.get(at).and_then(ident_of) {
        Some(table) => table,
        None => return Err("missing table name".to_owned()),
    };
    at += 1;
    // schema qualification: keep the last segment
    let mut table = table;
    while tokens.get(at).map(|token| token.kind == TokenKind::Symbol('.')) == Some(true) {
        table = match tokens.get(at + 1).and_then(ident_of) {
            Some(segment) => segment,
            None => return Err("missing table name".to_owned()),
        };
        at += 2;
    }

    let mut columns = vec![];
    if tokens.get(at).map(|token| token.kind == TokenKind::Symbol('(')) == Some(true) {
        at += 1;
        loop {
            match tokens.get(at) {
                Some(token) if token.kind == TokenKind::Symbol(')') => {
                    at += 1;
                    break;
                }
                Some(token) if token.kind == TokenKind::Symbol(',') => at += 1,
                Some(token) => match ident_of(token) {
                    Some(column) => {
                        columns.push(column);
                        at += 1;
                    }
                    None => return Err("malformed column list".to_owned()),
                },
                None => return Err("malformed column list".to_owned()),
            }
        }
    }

    match tokens.get(at).and_then(Token::word) {
        Some("from") => at += 1,
        Some("to") => return Err("COPY TO is not supported".to_owned()),
        _ => return Err("expected FROM STDIN".to_owned()),
    }
    if tokens.get(at).map(|token| token.is_word("stdin")) != Some(true) {
        return Err("expected FROM STDIN".to_owned());
    }
    at += 1;

    let mut format = CopyFormat::Text;
    let mut delimiter = None;
    let mut null_marker = None;
    let mut has_header = false;

    if tokens.get(at).map(|token| token.is_word("with")) == Some(true) {
        at += 1;
    }
    match tokens.get(at) {
        None => {}
        Some(token) if token.kind == TokenKind::Symbol('(') => {
            at += 1;
            while let Some(token) = tokens.get(at) {
                if token.kind == TokenKind::Symbol(')') {
                    break;
                }
                if token.kind == TokenKind::Symbol(',') {
                    at += 1;
                    continue;
                }
                match token.word() {
                    Some("format") => {
                        format = match tokens.get(at + 1).and_then(Token::word) {
                            Some("text") => CopyFormat::Text,
                            Some("csv") => CopyFormat::Csv,
                            Some("binary") => CopyFormat::Binary,
                            other => return Err(format!("unknown COPY format {:?}", other)),
                        };
                        at += 2;
                    }
                    Some("delimiter") => {
                        delimiter = match tokens.get(at + 1).map(|token| &token.kind) {
                            Some(TokenKind::StringLiteral(value)) if value.chars().count() == 1 => {
                                value.chars().next()
                            }
                            _ => return Err("DELIMITER must be a single character".to_owned()),
                        };
                        at += 2;
                    }
                    Some("null") => {
                        null_marker = match tokens.get(at + 1).map(|token| &token.kind) {
                            Some(TokenKind::StringLiteral(value)) => Some(value.clone()),
                            _ => return Err("NULL must be a quoted string".to_owned()),
                        };
                        at += 2;
                    }
                    Some("header") => {
                        has_header = match tokens.get(at + 1).and_then(Token::word) {
                            Some("false") | Some("off") => {
                                at += 1;
                                false
                            }
                            Some("true") | Some("on") => {
                                at += 1;
                                true
                            }
                            _ => true,
                        };
                        at += 1;
                    }
                    other => return Err(format!("unknown COPY option {:?}", other)),
                }
            }
        }
        // legacy unparenthesized forms: WITH CSV / WITH BINARY
        Some(token) if token.is_word("csv") => format = CopyFormat::Csv,
        Some(token) if token.is_word("binary") => format = CopyFormat::Binary,
        Some(_) => return Err("malformed COPY options".to_owned()),
    }

    let delimiter = delimiter.unwrap_or(match format {
        CopyFormat::Csv => ',',
        _ => '\t',
    });
    let null_marker = null_marker.unwrap_or_else(|| match format {
        CopyFormat::Csv => String::new(),
        _ => "\\N".to_owned(),
    });

    Ok(CopyHeader {
        table,
        columns,
        format,
        delimiter,
        null_marker,
        has_header,
    })
}
