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

use super::*;
use crate::worker::tests::{command_complete, error_code, query, ready_idle, worker, worker_with_table, MockConnection};

#[test]
fn create_if_not_exists_of_an_existing_table_is_a_silent_success() {
    let mut connection = MockConnection::new(vec![
        query("create table if not exists k (id bigint primary key)"),
        query("insert into k values (1, 'one')"),
    ]);
    let mut worker = worker_with_table();

    worker.process(&mut connection).unwrap();

    // no backend DDL ran: the original two-column definition survives
    assert_eq!(connection.outbound[0], command_complete("CREATE TABLE"));
    assert_eq!(connection.outbound[1], ready_idle());
    assert_eq!(connection.outbound[2], command_complete("INSERT 0 1"));
}

#[test]
fn create_if_not_exists_of_a_missing_table_creates_it() {
    let mut connection = MockConnection::new(vec![
        query("create table if not exists fresh (id bigint)"),
        query("select * from fresh"),
    ]);
    let mut worker = worker();

    worker.process(&mut connection).unwrap();

    assert_eq!(connection.outbound[0], command_complete("CREATE TABLE"));
    assert_eq!(connection.outbound[3], command_complete("SELECT 0"));
}

#[test]
fn drop_if_exists_of_a_missing_table_is_a_silent_success() {
    let mut connection = MockConnection::new(vec![query("drop table if exists missing")]);
    let mut worker = worker();

    worker.process(&mut connection).unwrap();

    assert_eq!(connection.outbound, vec![command_complete("DROP TABLE"), ready_idle()]);
}

#[test]
fn drop_without_if_exists_still_errors() {
    let mut connection = MockConnection::new(vec![query("drop table missing")]);
    let mut worker = worker();

    worker.process(&mut connection).unwrap();

    assert_eq!(error_code(&connection.outbound[0]), Some("42P01"));
}

#[test]
fn named_pk_constraint_is_stripped_before_the_backend_sees_it() {
    let mut connection = MockConnection::new(vec![
        query("create table orders (id bigint, total numeric, constraint pk_orders primary key (id))"),
        query("insert into orders values (1, 9.99)"),
    ]);
    let mut worker = worker();

    worker.process(&mut connection).unwrap();

    // the backend accepted the rewritten definition
    assert_eq!(connection.outbound[0], command_complete("CREATE TABLE"));
    assert_eq!(connection.outbound[2], command_complete("INSERT 0 1"));
}
