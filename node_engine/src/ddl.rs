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

//! Rewrites incoming data definition into the stricter dialect the backend
//! accepts. `IF [NOT] EXISTS` is emulated with an existence check, and a
//! `CONSTRAINT pk_<table> PRIMARY KEY` clause is reduced to the bare
//! `PRIMARY KEY` form the backend understands.

use backend::BackendConnection;
use query_parser::ddl::{ddl_target, strip_if_clause, strip_named_primary_key, DdlTarget};
use query_response::QueryError;

/// Result of translating one data-definition statement
#[derive(Debug, PartialEq)]
pub enum Translation {
    /// run the rewritten statement on the backend
    Execute(String),
    /// the statement is a no-op; report success with this command tag
    Skip(&'static str),
}

pub struct DdlTranslator;

impl DdlTranslator {
    /// Rewrites `sql` for the backend, consulting it for object existence
    /// when the statement carries an `IF [NOT] EXISTS` clause
    pub fn translate<B: BackendConnection>(backend: &mut B, sql: &str) -> Result<Translation, QueryError> {
        let target = ddl_target(sql).map_err(|error| QueryError::syntax_error(error))?;
        match target {
            DdlTarget::CreateTable { table, if_not_exists } => {
                if if_not_exists && object_exists(backend.table_exists(&table.value))? {
                    log::debug!("table {} already exists, skipping create", table.value);
                    return Ok(Translation::Skip("CREATE TABLE"));
                }
                let mut rewritten = if if_not_exists {
                    strip_if_clause(sql).map_err(|error| QueryError::syntax_error(error))?
                } else {
                    sql.to_owned()
                };
                rewritten = strip_named_primary_key(&rewritten, &table).map_err(|error| QueryError::syntax_error(error))?;
                Ok(Translation::Execute(rewritten))
            }
            DdlTarget::CreateIndex { index, if_not_exists, .. } => {
                if if_not_exists && object_exists(backend.index_exists(&index.value))? {
                    log::debug!("index {} already exists, skipping create", index.value);
                    return Ok(Translation::Skip("CREATE INDEX"));
                }
                if if_not_exists {
                    Ok(Translation::Execute(
                        strip_if_clause(sql).map_err(|error| QueryError::syntax_error(error))?,
                    ))
                } else {
                    Ok(Translation::Execute(sql.to_owned()))
                }
            }
            DdlTarget::DropTable { table, if_exists } => {
                if if_exists && !object_exists(backend.table_exists(&table.value))? {
                    log::debug!("table {} does not exist, skipping drop", table.value);
                    return Ok(Translation::Skip("DROP TABLE"));
                }
                if if_exists {
                    Ok(Translation::Execute(
                        strip_if_clause(sql).map_err(|error| QueryError::syntax_error(error))?,
                    ))
                } else {
                    Ok(Translation::Execute(sql.to_owned()))
                }
            }
            DdlTarget::DropIndex { index, if_exists } => {
                if if_exists && !object_exists(backend.index_exists(&index.value))? {
                    log::debug!("index {} does not exist, skipping drop", index.value);
                    return Ok(Translation::Skip("DROP INDEX"));
                }
                if if_exists {
                    Ok(Translation::Execute(
                        strip_if_clause(sql).map_err(|error| QueryError::syntax_error(error))?,
                    ))
                } else {
                    Ok(Translation::Execute(sql.to_owned()))
                }
            }
            DdlTarget::Other => Ok(Translation::Execute(sql.to_owned())),
        }
    }
}

fn object_exists(result: backend::BackendResult<bool>) -> Result<bool, QueryError> {
    result.map_err(|error| QueryError::backend_error(error.code, error.message, error.hint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::InMemoryBackend;

    fn backend_with_table(table_ddl: &str) -> InMemoryBackend {
        let mut backend = InMemoryBackend::new();
        backend.execute(table_ddl, &[]).unwrap();
        backend
    }

    #[test]
    fn create_if_not_exists_becomes_a_skip_when_the_table_exists() {
        let mut backend = backend_with_table("create table foo (id bigint)");
        assert_eq!(
            DdlTranslator::translate(&mut backend, "create table if not exists foo (id bigint primary key)"),
            Ok(Translation::Skip("CREATE TABLE"))
        );
    }

    #[test]
    fn create_if_not_exists_is_stripped_when_the_table_is_missing() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(
            DdlTranslator::translate(&mut backend, "create table if not exists foo (id bigint primary key)"),
            Ok(Translation::Execute("create table foo (id bigint primary key)".to_owned()))
        );
    }

    #[test]
    fn drop_if_exists_becomes_a_skip_when_the_table_is_missing() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(
            DdlTranslator::translate(&mut backend, "drop table if exists foo"),
            Ok(Translation::Skip("DROP TABLE"))
        );
    }

    #[test]
    fn drop_if_exists_is_stripped_when_the_table_exists() {
        let mut backend = backend_with_table("create table foo (id bigint)");
        assert_eq!(
            DdlTranslator::translate(&mut backend, "drop table if exists foo"),
            Ok(Translation::Execute("drop table foo".to_owned()))
        );
    }

    #[test]
    fn matching_pk_constraint_is_reduced_to_bare_primary_key() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(
            DdlTranslator::translate(
                &mut backend,
                "create table foo (id bigint, value text, constraint pk_foo primary key (id))"
            ),
            Ok(Translation::Execute(
                "create table foo (id bigint, value text, primary key (id))".to_owned()
            ))
        );
    }

    #[test]
    fn foreign_named_pk_constraint_is_untouched() {
        let mut backend = InMemoryBackend::new();
        let sql = "create table foo (id bigint, value text, constraint pk_a1b2 primary key (id))";
        assert_eq!(
            DdlTranslator::translate(&mut backend, sql),
            Ok(Translation::Execute(sql.to_owned()))
        );
    }

    #[test]
    fn index_rewrites_use_index_existence() {
        let mut backend = backend_with_table("create table foo (id bigint)");
        backend.execute("create index idx_foo on foo (id)", &[]).unwrap();
        assert_eq!(
            DdlTranslator::translate(&mut backend, "create index if not exists idx_foo on foo (id)"),
            Ok(Translation::Skip("CREATE INDEX"))
        );
        assert_eq!(
            DdlTranslator::translate(&mut backend, "drop index if exists idx_other"),
            Ok(Translation::Skip("DROP INDEX"))
        );
    }

    #[test]
    fn non_rewritten_statements_pass_through() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(
            DdlTranslator::translate(&mut backend, "alter table foo add column c text"),
            Ok(Translation::Execute("alter table foo add column c text".to_owned()))
        );
    }
}
