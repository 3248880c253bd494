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

//! Prepared statements maintain in-progress state during a session.
//!
//! For the Frontend/Backend protocol, there are multiple steps to use
//! prepared statements:
//!
//! 1. Receive a `Parse` message naming a prepared statement, possibly with
//!    declared parameter types.
//! 2. After validation, we stash the statement in the cache of the current
//!    connection.
//! 3. The client issues a `Bind` message, which provides a name for a portal
//!    and associates that name with a previously-named prepared statement.
//!    This is the point at which all parameters are bound, there are no
//!    longer any free variables permitted.
//! 4. The client issues an `Execute` message with the name of a portal,
//!    causing rows to be produced.
//!
//! The empty name selects the unnamed statement/portal, which is silently
//! replaced by the next Parse/Bind. Named statements persist until an
//! explicit Close or the end of the connection; closing a statement closes
//! every portal bound from it.

use query_parser::StatementKind;
use std::collections::HashMap;
use types::Datum;
use wire_protocol_payload::{ColumnDescription, PgFormat};

/// A prepared statement.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedStatement {
    sql: String,
    kind: StatementKind,
    param_types: Vec<u32>,
    described_fields: Option<Vec<ColumnDescription>>,
}

impl PreparedStatement {
    pub fn new(sql: String, kind: StatementKind, param_types: Vec<u32>) -> PreparedStatement {
        PreparedStatement {
            sql,
            kind,
            param_types,
            described_fields: None,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn param_types(&self) -> &[u32] {
        &self.param_types
    }

    pub fn described_fields(&self) -> Option<&[ColumnDescription]> {
        self.described_fields.as_deref()
    }

    pub fn set_described_fields(&mut self, fields: Vec<ColumnDescription>) {
        self.described_fields = Some(fields);
    }
}

/// Execution progress of a portal
#[derive(Clone, Debug, PartialEq)]
pub enum PortalState {
    Bound,
    Executing,
    Done,
}

/// A portal represents the execution state of a running or runnable query.
#[derive(Clone, Debug, PartialEq)]
pub struct Portal {
    statement_name: String,
    sql: String,
    kind: StatementKind,
    params: Vec<Datum>,
    result_formats: Vec<PgFormat>,
    state: PortalState,
    /// rows left over after a maxRows-limited Execute
    suspended_rows: Vec<Vec<Option<Vec<u8>>>>,
}

impl Portal {
    pub fn new(statement_name: String, sql: String, kind: StatementKind, params: Vec<Datum>, result_formats: Vec<PgFormat>) -> Portal {
        Portal {
            statement_name,
            sql,
            kind,
            params,
            result_formats,
            state: PortalState::Bound,
            suspended_rows: vec![],
        }
    }

    pub fn statement_name(&self) -> &str {
        &self.statement_name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn params(&self) -> &[Datum] {
        &self.params
    }

    pub fn result_formats(&self) -> &[PgFormat] {
        &self.result_formats
    }

    pub fn state(&self) -> &PortalState {
        &self.state
    }

    pub fn set_state(&mut self, state: PortalState) {
        self.state = state;
    }

    pub fn suspend(&mut self, remaining: Vec<Vec<Option<Vec<u8>>>>) {
        self.suspended_rows = remaining;
        self.state = PortalState::Executing;
    }

    pub fn take_suspended(&mut self) -> Vec<Vec<Option<Vec<u8>>>> {
        std::mem::take(&mut self.suspended_rows)
    }

    pub fn is_suspended(&self) -> bool {
        self.state == PortalState::Executing && !self.suspended_rows.is_empty()
    }
}

/// Per-connection registry of prepared statements and portals
#[derive(Debug, Default)]
pub struct StatementCache {
    statements: HashMap<String, PreparedStatement>,
    portals: HashMap<String, Portal>,
}

impl StatementCache {
    pub fn statement(&self, name: &str) -> Option<&PreparedStatement> {
        self.statements.get(name)
    }

    pub fn statement_mut(&mut self, name: &str) -> Option<&mut PreparedStatement> {
        self.statements.get_mut(name)
    }

    /// Stores a statement under a name. A named statement must not already
    /// exist; the unnamed one is silently replaced.
    pub fn store_statement(&mut self, name: String, statement: PreparedStatement) -> Result<(), ()> {
        if !name.is_empty() && self.statements.contains_key(&name) {
            return Err(());
        }
        if name.is_empty() {
            // replacing the unnamed statement invalidates its portals
            self.portals.retain(|_, portal| !portal.statement_name().is_empty());
        }
        self.statements.insert(name, statement);
        Ok(())
    }

    /// Drops a statement and every portal bound from it; absent names are a
    /// no-op per protocol
    pub fn close_statement(&mut self, name: &str) {
        self.statements.remove(name);
        self.portals.retain(|_, portal| portal.statement_name() != name);
    }

    pub fn portal(&self, name: &str) -> Option<&Portal> {
        self.portals.get(name)
    }

    pub fn portal_mut(&mut self, name: &str) -> Option<&mut Portal> {
        self.portals.get_mut(name)
    }

    pub fn store_portal(&mut self, name: String, portal: Portal) {
        self.portals.insert(name, portal);
    }

    pub fn close_portal(&mut self, name: &str) {
        self.portals.remove(name);
    }

    /// Portals do not survive the transaction they were created in
    pub fn on_transaction_end(&mut self) {
        self.portals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(sql: &str) -> PreparedStatement {
        PreparedStatement::new(sql.to_owned(), StatementKind::Query, vec![])
    }

    fn portal(statement_name: &str) -> Portal {
        Portal::new(
            statement_name.to_owned(),
            "select 1".to_owned(),
            StatementKind::Query,
            vec![],
            vec![],
        )
    }

    #[test]
    fn named_statement_is_not_replaceable() {
        let mut cache = StatementCache::default();
        assert_eq!(cache.store_statement("s1".to_owned(), statement("select 1")), Ok(()));
        assert_eq!(cache.store_statement("s1".to_owned(), statement("select 2")), Err(()));
        assert_eq!(cache.statement("s1").unwrap().sql(), "select 1");
    }

    #[test]
    fn unnamed_statement_is_silently_replaced() {
        let mut cache = StatementCache::default();
        assert_eq!(cache.store_statement("".to_owned(), statement("select 1")), Ok(()));
        assert_eq!(cache.store_statement("".to_owned(), statement("select 2")), Ok(()));
        assert_eq!(cache.statement("").unwrap().sql(), "select 2");
    }

    #[test]
    fn replacing_unnamed_statement_drops_its_portal() {
        let mut cache = StatementCache::default();
        cache.store_statement("".to_owned(), statement("select 1")).unwrap();
        cache.store_portal("p".to_owned(), portal(""));
        cache.store_statement("".to_owned(), statement("select 2")).unwrap();
        assert!(cache.portal("p").is_none());
    }

    #[test]
    fn closing_a_statement_invalidates_its_portals() {
        let mut cache = StatementCache::default();
        cache.store_statement("s1".to_owned(), statement("select 1")).unwrap();
        cache.store_portal("p1".to_owned(), portal("s1"));
        cache.store_portal("p2".to_owned(), portal("s1"));
        cache.store_portal("other".to_owned(), portal("s2"));

        cache.close_statement("s1");

        assert!(cache.statement("s1").is_none());
        assert!(cache.portal("p1").is_none());
        assert!(cache.portal("p2").is_none());
        assert!(cache.portal("other").is_some());
    }

    #[test]
    fn close_of_absent_entry_is_a_no_op() {
        let mut cache = StatementCache::default();
        cache.close_statement("missing");
        cache.close_portal("missing");
    }

    #[test]
    fn portals_are_dropped_at_transaction_end() {
        let mut cache = StatementCache::default();
        cache.store_statement("s1".to_owned(), statement("select 1")).unwrap();
        cache.store_portal("p1".to_owned(), portal("s1"));

        cache.on_transaction_end();

        assert!(cache.portal("p1").is_none());
        assert!(cache.statement("s1").is_some());
    }
}
