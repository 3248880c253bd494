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
use backend::InMemoryBackend;
use crate::worker::tests::{command_complete, error_code, query, ready_failed, ready_idle, ready_in_tx, worker, MockConnection};

#[test]
fn statement_timeout_surfaces_as_query_canceled() {
    let mut backend = InMemoryBackend::new();
    backend.set_latency_millis(500);
    let mut worker = Worker::new(backend, SessionState::default());
    let mut connection = MockConnection::new(vec![
        query("set spanner.statement_timeout = 100"),
        query("select 1"),
    ]);

    worker.process(&mut connection).unwrap();

    assert_eq!(connection.outbound[0], command_complete("SET"));
    assert_eq!(connection.outbound[1], ready_idle());
    assert_eq!(error_code(&connection.outbound[2]), Some("57014"));
    // no open transaction: ready reports idle
    assert_eq!(connection.outbound[3], ready_idle());
}

#[test]
fn timeout_inside_a_transaction_fails_it() {
    let mut backend = InMemoryBackend::new();
    backend.set_latency_millis(500);
    let mut worker = Worker::new(backend, SessionState::default());
    let mut connection = MockConnection::new(vec![
        query("set statement_timeout = 100"),
        query("begin"),
        query("select 1"),
    ]);

    worker.process(&mut connection).unwrap();

    assert_eq!(connection.outbound[2], command_complete("BEGIN"));
    assert_eq!(connection.outbound[3], ready_in_tx());
    assert_eq!(error_code(&connection.outbound[4]), Some("57014"));
    assert_eq!(connection.outbound[5], ready_failed());
}

#[test]
fn cancel_handle_interrupts_the_next_backend_call() {
    let mut worker = worker();
    let handle = worker.backend().cancel_handle();
    handle.cancel();
    let mut connection = MockConnection::new(vec![query("select 1"), query("select 1")]);

    worker.process(&mut connection).unwrap();

    // the canceled call reports 57014, the following one succeeds
    assert_eq!(error_code(&connection.outbound[0]), Some("57014"));
    assert_eq!(connection.outbound[1], ready_idle());
    assert_eq!(connection.outbound[4], command_complete("SELECT 1"));
    assert_eq!(connection.outbound[5], ready_idle());
}
