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
use std::sync::{Arc, Mutex};

impl Securing<TestData, TestData> for TestData {
    fn secure(self, _socket: TestData) -> Result<TestData, ()> {
        Ok(self)
    }
}

#[derive(Clone)]
pub struct TestData {
    inner: Arc<Mutex<DataInner>>,
}

impl Plain for TestData {}

impl Secure for TestData {}

impl TestData {
    pub fn new(content: Vec<&[u8]>) -> TestData {
        TestData {
            inner: Arc::new(Mutex::new(DataInner {
                read_buffer: content.concat(),
                read_index: 0,
                write_buffer: vec![],
            })),
        }
    }

    pub fn read_result(&self) -> Vec<u8> {
        self.inner.lock().unwrap().write_buffer.clone()
    }
}

impl Read for TestData {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.lock().unwrap().read(buf)
    }
}

impl Write for TestData {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().unwrap().flush()
    }
}

struct DataInner {
    read_buffer: Vec<u8>,
    read_index: usize,
    write_buffer: Vec<u8>,
}

impl Read for DataInner {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.len() > self.read_buffer.len() - self.read_index {
            Err(io::Error::from(io::ErrorKind::UnexpectedEof))
        } else {
            for (i, item) in buf.iter_mut().enumerate() {
                *item = self.read_buffer[self.read_index + i];
            }
            self.read_index += buf.len();
            Ok(buf.len())
        }
    }
}

impl Write for DataInner {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn startup_frame(props: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&VERSION_3.to_be_bytes());
    for (key, value) in props {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    let mut frame = Vec::new();
    frame.extend_from_slice(&(body.len() as i32 + 4).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

fn ssl_request_frame() -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&8i32.to_be_bytes());
    frame.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    frame
}

fn cancel_request_frame(conn_id: i32, secret_key: i32) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&16i32.to_be_bytes());
    frame.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
    frame.extend_from_slice(&conn_id.to_be_bytes());
    frame.extend_from_slice(&secret_key.to_be_bytes());
    frame
}

#[test]
fn trying_read_from_empty_stream() {
    let socket = TestData::new(vec![]);
    let connection: Connection<New, TestData, TestData> = Connection::new(socket);

    assert!(connection.hand_shake::<TestData>(None, SslMode::Disable).is_err());
}

#[test]
fn startup_message_carries_properties() {
    let frame = startup_frame(&[("user", "app"), ("database", "db"), ("TimeZone", "UTC")]);
    let socket = TestData::new(vec![&frame]);
    let connection: Connection<New, TestData, TestData> = Connection::new(socket);

    match connection.hand_shake::<TestData>(None, SslMode::Disable).unwrap() {
        Bootstrap::Connect(connection) => {
            assert_eq!(connection.properties().get("user"), Some(&"app".to_owned()));
            assert_eq!(connection.properties().get("database"), Some(&"db".to_owned()));
            assert_eq!(connection.properties().get("TimeZone"), Some(&"UTC".to_owned()));
        }
        Bootstrap::Cancel { .. } => panic!("unexpected cancel request"),
    }
}

#[test]
fn ssl_request_is_declined_without_identity() {
    let ssl = ssl_request_frame();
    let startup = startup_frame(&[("user", "app")]);
    let socket = TestData::new(vec![&ssl, &startup]);
    let connection: Connection<New, TestData, TestData> = Connection::new(socket.clone());

    match connection.hand_shake::<TestData>(None, SslMode::Allow).unwrap() {
        Bootstrap::Connect(_) => {}
        Bootstrap::Cancel { .. } => panic!("unexpected cancel request"),
    }
    assert_eq!(socket.read_result(), vec![b'N']);
}

#[test]
fn required_ssl_without_identity_aborts_startup() {
    let ssl = ssl_request_frame();
    let socket = TestData::new(vec![&ssl]);
    let connection: Connection<New, TestData, TestData> = Connection::new(socket.clone());

    assert!(connection.hand_shake::<TestData>(None, SslMode::Require).is_err());
    assert_eq!(socket.read_result(), vec![b'N']);
}

#[test]
fn second_ssl_request_is_a_protocol_violation() {
    let first = ssl_request_frame();
    let second = ssl_request_frame();
    let socket = TestData::new(vec![&first, &second]);
    let connection: Connection<New, TestData, TestData> = Connection::new(socket);

    assert!(connection.hand_shake::<TestData>(None, SslMode::Allow).is_err());
}

#[test]
fn cancel_request_short_circuits() {
    let frame = cancel_request_frame(7, 123_456);
    let socket = TestData::new(vec![&frame]);
    let connection: Connection<New, TestData, TestData> = Connection::new(socket);

    match connection.hand_shake::<TestData>(None, SslMode::Disable).unwrap() {
        Bootstrap::Cancel { conn_id, secret_key } => {
            assert_eq!(conn_id, 7);
            assert_eq!(secret_key, 123_456);
        }
        Bootstrap::Connect(_) => panic!("expected cancel request"),
    }
}

#[test]
fn authentication_exchange_accepts_any_password() {
    let startup = startup_frame(&[("user", "app")]);
    let mut password = vec![b'p'];
    password.extend_from_slice(&11i32.to_be_bytes());
    password.extend_from_slice(b"secret\0");
    let socket = TestData::new(vec![&startup, &password]);
    let connection: Connection<New, TestData, TestData> = Connection::new(socket.clone());

    let connection = match connection.hand_shake::<TestData>(None, SslMode::Disable).unwrap() {
        Bootstrap::Connect(connection) => connection,
        Bootstrap::Cancel { .. } => panic!("unexpected cancel request"),
    };
    connection.authenticate(false).unwrap();

    let written = socket.read_result();
    // cleartext password request followed by authentication ok
    assert_eq!(&written[..9], &[b'R', 0, 0, 0, 8, 0, 0, 0, 3]);
    assert_eq!(&written[9..], &[b'R', 0, 0, 0, 8, 0, 0, 0, 0]);
}

#[test]
fn trusted_client_skips_password_exchange() {
    let startup = startup_frame(&[("user", "app")]);
    let socket = TestData::new(vec![&startup]);
    let connection: Connection<New, TestData, TestData> = Connection::new(socket.clone());

    let connection = match connection.hand_shake::<TestData>(None, SslMode::Disable).unwrap() {
        Bootstrap::Connect(connection) => connection,
        Bootstrap::Cancel { .. } => panic!("unexpected cancel request"),
    };
    connection.authenticate(true).unwrap();

    assert_eq!(socket.read_result(), vec![b'R', 0, 0, 0, 8, 0, 0, 0, 0]);
}

#[test]
fn backend_keys_end_with_ready_for_query() {
    let startup = startup_frame(&[("user", "app")]);
    let socket = TestData::new(vec![&startup]);
    let connection: Connection<New, TestData, TestData> = Connection::new(socket.clone());

    let connection = match connection.hand_shake::<TestData>(None, SslMode::Disable).unwrap() {
        Bootstrap::Connect(connection) => connection,
        Bootstrap::Cancel { .. } => panic!("unexpected cancel request"),
    };
    connection
        .authenticate(true)
        .unwrap()
        .send_params(&[("server_version", "14.1")])
        .unwrap()
        .send_backend_keys(3, 42)
        .unwrap();

    let written = socket.read_result();
    assert_eq!(written.last(), Some(&b'I'));
    assert!(written.windows(4).any(|window| window == b"14.1"));
}
