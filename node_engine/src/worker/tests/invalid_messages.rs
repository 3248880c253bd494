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
use crate::worker::tests::{command_complete, query, ready_idle, worker, MockConnection};
use crate::MAX_INVALID_MESSAGE_COUNT;
use wire_protocol::WireError;

#[test]
fn misplaced_copy_data_below_the_threshold_keeps_the_connection() {
    let mut inbound: Vec<InboundMessage> = (0..MAX_INVALID_MESSAGE_COUNT)
        .map(|_| InboundMessage::CopyData(b"1\tone\n".to_vec()))
        .collect();
    inbound.push(query("select 1"));
    let mut connection = MockConnection::new(inbound);
    let mut worker = worker();

    worker.process(&mut connection).unwrap();

    // the misplaced payload was skipped silently, the query still runs
    assert_eq!(worker.status(), ConnectionStatus::Terminated);
    assert_eq!(connection.outbound.len(), 4);
    assert_eq!(connection.outbound[2], command_complete("SELECT 1"));
    assert_eq!(connection.outbound[3], ready_idle());
}

#[test]
fn exceeding_the_threshold_terminates_with_a_fatal_error() {
    let inbound: Vec<InboundMessage> = (0..MAX_INVALID_MESSAGE_COUNT + 1)
        .map(|_| InboundMessage::CopyData(b"1\tone\n".to_vec()))
        .collect();
    let mut connection = MockConnection::new(inbound);
    let mut worker = worker();

    worker.process(&mut connection).unwrap();

    assert_eq!(worker.status(), ConnectionStatus::Terminated);
    assert_eq!(connection.outbound.len(), 1);
    match &connection.outbound[0] {
        OutboundMessage::Error { severity, code, .. } => {
            assert_eq!(severity, "FATAL");
            assert_eq!(code, "08P01");
        }
        other => panic!("expected a fatal error, got {:?}", other),
    }
    let encoded: Vec<u8> = connection.outbound[0].clone().into();
    assert_eq!(encoded[0], b'E');
}

#[test]
fn unknown_message_tag_is_answered_and_counted() {
    let mut connection = MockConnection::with_results(vec![
        Err(WireError::UnknownTag(b'z')),
        Ok(query("select 1")),
    ]);
    let mut worker = worker();

    worker.process(&mut connection).unwrap();

    match &connection.outbound[0] {
        OutboundMessage::Error { code, .. } => assert_eq!(code, "08P01"),
        other => panic!("expected an error, got {:?}", other),
    }
    assert_eq!(connection.outbound[3], command_complete("SELECT 1"));
}

#[test]
fn broken_frame_is_fatal() {
    let mut connection = MockConnection::with_results(vec![
        Err(WireError::Frame(wire_protocol::FrameError::UnterminatedString)),
        Ok(query("select 1")),
    ]);
    let mut worker = worker();

    worker.process(&mut connection).unwrap();

    assert_eq!(worker.status(), ConnectionStatus::Terminated);
    assert_eq!(connection.outbound.len(), 1);
    match &connection.outbound[0] {
        OutboundMessage::Error { severity, .. } => assert_eq!(severity, "FATAL"),
        other => panic!("expected a fatal error, got {:?}", other),
    }
}
