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

//! `SET` / `SHOW` / `RESET` recognition. Setting names are case-insensitive
//! and may be dotted (`spanner.autocommit_dml_mode`).

use crate::{tokenize, Token, TokenKind};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SetScope {
    Session,
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetStatement {
    pub scope: SetScope,
    pub name: String,
    /// `None` stands for `DEFAULT`
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShowTarget {
    All,
    Setting(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResetTarget {
    All,
    Setting(String),
}

fn setting_name(tokens: &[Token], at: usize) -> Option<(String, usize)> {
    let mut name = match &tokens.get(at)?.kind {
        TokenKind::Word(word) => word.clone(),
        TokenKind::QuotedIdent(ident) => ident.to_lowercase(),
        _ => return None,
    };
    let mut at = at + 1;
    while tokens.get(at).map(|token| token.kind == TokenKind::Symbol('.')) == Some(true) {
        match &tokens.get(at + 1)?.kind {
            TokenKind::Word(word) => {
                name.push('.');
                name.push_str(word);
            }
            TokenKind::QuotedIdent(ident) => {
                name.push('.');
                name.push_str(&ident.to_lowercase());
            }
            _ => return None,
        }
        at += 2;
    }
    Some((name, at))
}

/// Parses `SET [LOCAL|SESSION] name {=|TO} value` and `SET TIME ZONE value`
pub fn parse_set(sql: &str) -> Result<SetStatement, String> {
    let tokens = tokenize(sql).map_err(|error| error.to_string())?;
    let mut at = 0;
    if tokens.get(at).map(|token| token.is_word("set")) != Some(true) {
        return Err("not a SET statement".to_owned());
    }
    at += 1;

    let scope = match tokens.get(at).and_then(Token::word) {
        Some("local") => {
            at += 1;
            SetScope::Local
        }
        Some("session") => {
            at += 1;
            SetScope::Session
        }
        _ => SetScope::Session,
    };

    if tokens.get(at).map(|token| token.is_word("time")) == Some(true)
        && tokens.get(at + 1).map(|token| token.is_word("zone")) == Some(true)
    {
        let value = setting_value(sql, &tokens, at + 2)?;
        return Ok(SetStatement {
            scope,
            name: "timezone".to_owned(),
            value,
        });
    }

    let (name, next) = setting_name(&tokens, at).ok_or_else(|| "missing setting name".to_owned())?;
    at = next;

    match tokens.get(at) {
        Some(token) if token.kind == TokenKind::Symbol('=') || token.is_word("to") => at += 1,
        _ => return Err("expected = or TO".to_owned()),
    }

    let value = setting_value(sql, &tokens, at)?;
    Ok(SetStatement { scope, name, value })
}

fn setting_value(sql: &str, tokens: &[Token], at: usize) -> Result<Option<String>, String> {
    let rest = &tokens[at.min(tokens.len())..];
    match rest {
        [] => Err("missing value".to_owned()),
        [only] => match &only.kind {
            TokenKind::Word(word) if word == "default" => Ok(None),
            TokenKind::StringLiteral(value) => Ok(Some(value.clone())),
            TokenKind::Word(word) => Ok(Some(word.clone())),
            TokenKind::Number(value) => Ok(Some(value.clone())),
            _ => Err("unexpected value".to_owned()),
        },
        // a comma list or multi-word value travels as written
        [first, .., last] => Ok(Some(sql[first.start..last.end].to_owned())),
    }
}

/// Parses `SHOW name` and `SHOW ALL`
pub fn parse_show(sql: &str) -> Result<ShowTarget, String> {
    let tokens = tokenize(sql).map_err(|error| error.to_string())?;
    if tokens.first().map(|token| token.is_word("show")) != Some(true) {
        return Err("not a SHOW statement".to_owned());
    }
    if tokens.get(1).map(|token| token.is_word("all")) == Some(true) && tokens.len() == 2 {
        return Ok(ShowTarget::All);
    }
    if tokens.get(1).map(|token| token.is_word("time")) == Some(true)
        && tokens.get(2).map(|token| token.is_word("zone")) == Some(true)
    {
        return Ok(ShowTarget::Setting("timezone".to_owned()));
    }
    setting_name(&tokens, 1)
        .map(|(name, _)| ShowTarget::Setting(name))
        .ok_or_else(|| "missing setting name".to_owned())
}

/// Parses `RESET name` and `RESET ALL`
pub fn parse_reset(sql: &str) -> Result<ResetTarget, String> {
    let tokens = tokenize(sql).map_err(|error| error.to_string())?;
    if tokens.first().map(|token| token.is_word("reset")) != Some(true) {
        return Err("not a RESET statement".to_owned());
    }
    if tokens.get(1).map(|token| token.is_word("all")) == Some(true) && tokens.len() == 2 {
        return Ok(ResetTarget::All);
    }
    setting_name(&tokens, 1)
        .map(|(name, _)| ResetTarget::Setting(name))
        .ok_or_else(|| "missing setting name".to_owned())
}
