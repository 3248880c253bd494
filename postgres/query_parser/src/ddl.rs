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

//! Identifier extraction and the text surgery behind data-definition
//! rewrites: `IF [NOT] EXISTS` removal and the stripping of a
//! `CONSTRAINT pk_<table> PRIMARY KEY` clause down to its bare keyword form.

use crate::{ident_of, tokenize, Ident, ParseError, Token, TokenKind};

/// The data-definition statements the system rewrites
#[derive(Debug, Clone, PartialEq)]
pub enum DdlTarget {
    CreateTable { table: Ident, if_not_exists: bool },
    CreateIndex { index: Ident, unique: bool, if_not_exists: bool },
    DropTable { table: Ident, if_exists: bool },
    DropIndex { index: Ident, if_exists: bool },
    Other,
}

/// Recognizes CREATE TABLE / CREATE [UNIQUE] INDEX / DROP TABLE / DROP INDEX
/// and pulls out the target identifier
pub fn ddl_target(sql: &str) -> Result<DdlTarget, ParseError> {
    let tokens = tokenize(sql)?;
    let mut at = 0;
    let word = |at: usize| tokens.get(at).and_then(Token::word);

    match word(at) {
        Some("create") => {
            at += 1;
            let unique = word(at) == Some("unique");
            if unique {
                at += 1;
            }
            let object = word(at);
            match object {
                Some("table") | Some("index") => {
                    let is_table = object == Some("table");
                    at += 1;
                    let if_not_exists = word(at) == Some("if") && word(at + 1) == Some("not") && word(at + 2) == Some("exists");
                    if if_not_exists {
                        at += 3;
                    }
                    let name = match qualified_name(&tokens, at) {
                        Some(name) => name,
                        None => return Ok(DdlTarget::Other),
                    };
                    if is_table {
                        Ok(DdlTarget::CreateTable {
                            table: name,
                            if_not_exists,
                        })
                    } else {
                        Ok(DdlTarget::CreateIndex {
                            index: name,
                            unique,
                            if_not_exists,
                        })
                    }
                }
                _ => Ok(DdlTarget::Other),
            }
        }
        Some("drop") => {
            at += 1;
            let object = word(at);
            match object {
                Some("table") | Some("index") => {
                    let is_table = object == Some("table");
                    at += 1;
                    let if_exists = word(at) == Some("if") && word(at + 1) == Some("exists");
                    if if_exists {
                        at += 2;
                    }
                    let name = match qualified_name(&tokens, at) {
                        Some(name) => name,
                        None => return Ok(DdlTarget::Other),
                    };
                    if is_table {
                        Ok(DdlTarget::DropTable { table: name, if_exists })
                    } else {
                        Ok(DdlTarget::DropIndex { index: name, if_exists })
                    }
                }
                _ => Ok(DdlTarget::Other),
            }
        }
        _ => Ok(DdlTarget::Other),
    }
}

/// Reads a possibly schema-qualified name and returns its last segment
fn qualified_name(tokens: &[Token], mut at: usize) -> Option<Ident> {
    let mut name = ident_of(tokens.get(at)?)?;
    loop {
        at += 1;
        if tokens.get(at).map(|token| token.kind == TokenKind::Symbol('.')) != Some(true) {
            return Some(name);
        }
        at += 1;
        name = ident_of(tokens.get(at)?)?;
    }
}

/// Removes the first `IF [NOT] EXISTS` clause from the statement text
pub fn strip_if_clause(sql: &str) -> Result<String, ParseError> {
    let tokens = tokenize(sql)?;
    for (index, token) in tokens.iter().enumerate() {
        if !token.is_word("if") {
            continue;
        }
        let clause_end = if tokens.get(index + 1).map(|t| t.is_word("not")) == Some(true)
            && tokens.get(index + 2).map(|t| t.is_word("exists")) == Some(true)
        {
            tokens[index + 2].end
        } else if tokens.get(index + 1).map(|t| t.is_word("exists")) == Some(true) {
            tokens[index + 1].end
        } else {
            continue;
        };
        return Ok(remove_span(sql, token.start, clause_end));
    }
    Ok(sql.to_owned())
}

/// Strips `CONSTRAINT <name>` in front of `PRIMARY KEY` when and only when
/// the name is exactly `pk_<table>` (matched case-insensitively). Other named
/// constraints are left intact.
pub fn strip_named_primary_key(sql: &str, table: &Ident) -> Result<String, ParseError> {
    let tokens = tokenize(sql)?;
    let expected = format!("pk_{}", table.value);
    for (index, token) in tokens.iter().enumerate() {
        if !token.is_word("constraint") {
            continue;
        }
        let name = match tokens.get(index + 1).and_then(ident_of) {
            Some(name) => name,
            None => continue,
        };
        let primary_key = tokens.get(index + 2).map(|t| t.is_word("primary")) == Some(true)
            && tokens.get(index + 3).map(|t| t.is_word("key")) == Some(true);
        if primary_key && name.matches_ignore_case(&expected) {
            return Ok(remove_span(sql, token.start, tokens[index + 1].end));
        }
    }
    Ok(sql.to_owned())
}

/// Removes `sql[start..end]` along with a single trailing space, if any
fn remove_span(sql: &str, start: usize, mut end: usize) -> String {
    if sql[end..].starts_with(' ') {
        end += 1;
    }
    let mut out = String::with_capacity(sql.len());
    out.push_str(&sql[..start]);
    out.push_str(&sql[end..]);
    out
}

/// Extracts `(name, type)` pairs from a CREATE TABLE column list; table-level
/// constraint entries are skipped
pub fn create_table_columns(sql: &str) -> Result<Vec<(Ident, String)>, ParseError> {
    let tokens = tokenize(sql)?;
    let open = match tokens.iter().position(|token| token.kind == TokenKind::Symbol('(')) {
        Some(position) => position,
        None => return Ok(vec![]),
    };

    let mut columns = vec![];
    let mut depth = 1;
    let mut entry: Vec<&Token> = vec![];
    for token in &tokens[open + 1..] {
        match token.kind {
            TokenKind::Symbol('(') => {
                depth += 1;
                entry.push(token);
            }
            TokenKind::Symbol(')') => {
                depth -= 1;
                if depth == 0 {
                    push_column(sql, &entry, &mut columns);
                    break;
                }
                entry.push(token);
            }
            TokenKind::Symbol(',') if depth == 1 => {
                push_column(sql, &entry, &mut columns);
                entry.clear();
            }
            _ => entry.push(token),
        }
    }
    Ok(columns)
}

fn push_column<'t>(sql: &str, entry: &[&'t Token], columns: &mut Vec<(Ident, String)>) {
    let name = match entry.first().and_then(|token| ident_of(token)) {
        Some(name) => name,
        None => return,
    };
    if !name.quoted
        && matches!(
            name.value.as_str(),
            "constraint" | "primary" | "unique" | "foreign" | "check" | "exclude"
        )
    {
        return;
    }
    // the type runs from the second token until a column constraint begins
    let mut type_end = None;
    let mut type_start = None;
    for token in &entry[1..] {
        let stop = token
            .word()
            .map(|word| {
                matches!(
                    word,
                    "primary" | "not" | "null" | "unique" | "references" | "default" | "check" | "constraint"
                )
            })
            .unwrap_or(false);
        if stop {
            break;
        }
        if type_start.is_none() {
            type_start = Some(token.start);
        }
        type_end = Some(token.end);
    }
    if let (Some(start), Some(end)) = (type_start, type_end) {
        columns.push((name, sql[start..end].to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unquoted(value: &str) -> Ident {
        Ident {
            value: value.to_owned(),
            quoted: false,
        }
    }

    #[test]
    fn create_table_target() {
        assert_eq!(
            ddl_target("create table if not exists foo (id bigint)").unwrap(),
            DdlTarget::CreateTable {
                table: unquoted("foo"),
                if_not_exists: true,
            }
        );
        assert_eq!(
            ddl_target("CREATE TABLE public.bar (id bigint)").unwrap(),
            DdlTarget::CreateTable {
                table: unquoted("bar"),
                if_not_exists: false,
            }
        );
    }

    #[test]
    fn create_unique_index_target() {
        assert_eq!(
            ddl_target("create unique index if not exists idx_foo on foo (id)").unwrap(),
            DdlTarget::CreateIndex {
                index: unquoted("idx_foo"),
                unique: true,
                if_not_exists: true,
            }
        );
    }

    #[test]
    fn drop_targets() {
        assert_eq!(
            ddl_target("drop table if exists foo").unwrap(),
            DdlTarget::DropTable {
                table: unquoted("foo"),
                if_exists: true,
            }
        );
        assert_eq!(
            ddl_target("DROP INDEX idx_foo").unwrap(),
            DdlTarget::DropIndex {
                index: unquoted("idx_foo"),
                if_exists: false,
            }
        );
    }

    #[test]
    fn other_statements_are_not_rewritten() {
        assert_eq!(ddl_target("create view v as select 1").unwrap(), DdlTarget::Other);
        assert_eq!(ddl_target("select 1").unwrap(), DdlTarget::Other);
    }

    #[test]
    fn strip_if_not_exists_keeps_the_rest() {
        assert_eq!(
            strip_if_clause("create table if not exists foo (id bigint primary key)").unwrap(),
            "create table foo (id bigint primary key)"
        );
    }

    #[test]
    fn strip_if_exists_on_drop() {
        assert_eq!(strip_if_clause("drop table if exists foo").unwrap(), "drop table foo");
    }

    #[test]
    fn matching_pk_constraint_is_stripped() {
        assert_eq!(
            strip_named_primary_key(
                "create table foo (id bigint, value text, constraint pk_foo primary key (id))",
                &unquoted("foo")
            )
            .unwrap(),
            "create table foo (id bigint, value text, primary key (id))"
        );
    }

    #[test]
    fn non_matching_pk_constraint_is_kept() {
        let sql = "create table foo (id bigint, value text, constraint pk_a1b2 primary key (id))";
        assert_eq!(strip_named_primary_key(sql, &unquoted("foo")).unwrap(), sql);
    }

    #[test]
    fn quoted_pk_constraint_matches_case_insensitively() {
        let rewritten = strip_named_primary_key(
            "CREATE TABLE \"user\" (\"id\" bigint, CONSTRAINT \"PK_user\" PRIMARY KEY (\"id\"))",
            &Ident {
                value: "user".to_owned(),
                quoted: true,
            },
        )
        .unwrap();
        assert_eq!(
            rewritten,
            "CREATE TABLE \"user\" (\"id\" bigint, PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn differently_named_constraints_survive() {
        let sql = "create table t (id bigint, constraint uq_t unique (id))";
        assert_eq!(strip_named_primary_key(sql, &unquoted("t")).unwrap(), sql);
    }

    #[test]
    fn column_extraction() {
        let columns = create_table_columns(
            "create table t (id bigint primary key, name varchar(100) not null, price numeric(10,2), primary key (id))",
        )
        .unwrap();
        assert_eq!(
            columns,
            vec![
                (unquoted("id"), "bigint".to_owned()),
                (unquoted("name"), "varchar(100)".to_owned()),
                (unquoted("price"), "numeric(10,2)".to_owned()),
            ]
        );
    }

    #[test]
    fn quoted_column_names_preserve_case() {
        let columns = create_table_columns("create table t (\"Id\" bigint)").unwrap();
        assert_eq!(
            columns,
            vec![(
                Ident {
                    value: "Id".to_owned(),
                    quoted: true,
                },
                "bigint".to_owned()
            )]
        );
    }
}
