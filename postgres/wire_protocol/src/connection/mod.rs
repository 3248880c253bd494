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

//! Bootstrap of a client connection: the untagged startup frames, the SSL
//! negotiation, authentication and the initial parameter/backend-key exchange.
//! Each stage is a typestate of [`Connection`].

use crate::MAX_FRAME_LENGTH;
use native_tls::{Identity, TlsAcceptor, TlsStream};
use std::{
    collections::HashMap,
    convert::TryInto,
    fmt::{self, Debug, Formatter},
    io::{self, Read, Write},
    net::TcpStream,
    str,
};
use wire_protocol_payload::{
    OutboundMessage, TransactionStatus, CANCEL_REQUEST_CODE, GSSENC_REQUEST_CODE, SSL_REQUEST_CODE, VERSION_3,
};

const ACCEPT_SSL: u8 = b'S';
const REJECT_SSL: u8 = b'N';

/// How the server answers `SSLRequest`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SslMode {
    /// always decline
    Disable,
    /// accept when a certificate is configured
    Allow,
    /// accept when a certificate is configured, fail startup otherwise
    Require,
    /// same acceptance rule as `Allow`
    Enable,
}

impl SslMode {
    fn accepts(&self, identity_configured: bool) -> bool {
        match self {
            SslMode::Disable => false,
            SslMode::Allow | SslMode::Enable | SslMode::Require => identity_configured,
        }
    }
}

pub trait Securing<P: Plain, S: Secure>: Clone {
    #[allow(clippy::result_unit_err)]
    fn secure(self, socket: P) -> Result<S, ()>;
}

impl Securing<TcpStream, TlsStream<TcpStream>> for Identity {
    fn secure(self, socket: TcpStream) -> Result<TlsStream<TcpStream>, ()> {
        TlsAcceptor::new(self).map_err(|_| ())?.accept(socket).map_err(|_| ())
    }
}

pub trait Plain: Read + Write {}

pub trait Secure: Read + Write {}

impl Plain for TcpStream {}

#[cfg(unix)]
impl Plain for std::os::unix::net::UnixStream {}

impl Secure for TlsStream<TcpStream> {}

// TLS is never negotiated over a local socket; the identity only satisfies
// the channel's type parameters there
#[cfg(unix)]
impl Securing<std::os::unix::net::UnixStream, TlsStream<TcpStream>> for Identity {
    fn secure(self, _socket: std::os::unix::net::UnixStream) -> Result<TlsStream<TcpStream>, ()> {
        Err(())
    }
}

pub enum Channel<P: Plain, S: Secure> {
    Plain(P),
    Secure(S),
}

impl<P: Plain, S: Secure> Channel<P, S> {
    pub fn read_tag(&mut self) -> io::Result<u8> {
        let buff = &mut [0u8; 1];
        self.read_exact(buff.as_mut())?;
        Ok(buff[0])
    }

    pub fn read_message_len(&mut self) -> io::Result<usize> {
        let buff = &mut [0u8; 4];
        self.read_exact(buff.as_mut())?;
        let len = i32::from_be_bytes(*buff);
        if len < 4 || len as usize > MAX_FRAME_LENGTH + 4 {
            return Err(io::ErrorKind::InvalidData.into());
        }
        Ok(len as usize - 4)
    }

    pub fn read_message(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut message = vec![0; len];
        self.read_exact(&mut message)?;
        Ok(message)
    }
}

impl<P: Plain, S: Secure> Read for Channel<P, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Channel::Plain(socket) => socket.read(buf),
            Channel::Secure(socket) => socket.read(buf),
        }
    }
}

impl<P: Plain, S: Secure> Write for Channel<P, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Channel::Plain(socket) => socket.write(buf),
            Channel::Secure(socket) => socket.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Channel::Plain(socket) => socket.flush(),
            Channel::Secure(socket) => socket.flush(),
        }
    }
}

/// A client request discovered during bootstrap: either a session to serve or
/// a cancellation of another session
pub enum Bootstrap<P: Plain, S: Secure> {
    Connect(Connection<HandShake, P, S>),
    Cancel { conn_id: i32, secret_key: i32 },
}

pub struct Connection<State, P: Plain, S: Secure> {
    channel: Channel<P, S>,
    state: State,
}

impl<State, P: Plain, S: Secure> Debug for Connection<State, P, S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Connection")
    }
}

impl<P: Plain, S: Secure> Connection<New, P, S> {
    pub fn new(socket: P) -> Connection<New, P, S> {
        Connection {
            channel: Channel::Plain(socket),
            state: New,
        }
    }

    /// Runs the bootstrap sub-protocol: SSL/GSSENC negotiation followed by
    /// either a StartupMessage or a CancelRequest.
    pub fn hand_shake<Sec: Securing<P, S>>(
        self,
        identity: Option<Sec>,
        ssl_mode: SslMode,
    ) -> io::Result<Bootstrap<P, S>> {
        let mut channel = self.channel;
        let mut ssl_done = false;
        loop {
            let len = channel.read_message_len()?;
            let request = channel.read_message(len)?;
            let (code, message) = Self::parse_setup(&request)?;
            match code {
                VERSION_3 => {
                    let props = Self::parse_props(message)?;
                    log::debug!("startup parameters {:?}", props);
                    return Ok(Bootstrap::Connect(Connection {
                        channel,
                        state: HandShake {
                            props: props.into_iter().collect(),
                        },
                    }));
                }
                CANCEL_REQUEST_CODE => {
                    let mut cursor = message;
                    let conn_id = read_i32(&mut cursor)?;
                    let secret_key = read_i32(&mut cursor)?;
                    return Ok(Bootstrap::Cancel { conn_id, secret_key });
                }
                SSL_REQUEST_CODE => {
                    if ssl_done {
                        // the SSL byte is exchanged exactly once per connection
                        return Err(io::ErrorKind::InvalidData.into());
                    }
                    ssl_done = true;
                    let identity_configured = identity.is_some();
                    channel = match (channel, identity.clone()) {
                        (Channel::Plain(mut socket), Some(identity)) if ssl_mode.accepts(identity_configured) => {
                            socket.write_all(&[ACCEPT_SSL])?;
                            socket.flush()?;
                            let secure_socket = identity
                                .secure(socket)
                                .map_err(|()| io::Error::from(io::ErrorKind::ConnectionAborted))?;
                            Channel::Secure(secure_socket)
                        }
                        (mut channel, _) => {
                            if ssl_mode == SslMode::Require {
                                channel.write_all(&[REJECT_SSL])?;
                                channel.flush()?;
                                return Err(io::ErrorKind::ConnectionAborted.into());
                            }
                            channel.write_all(&[REJECT_SSL])?;
                            channel.flush()?;
                            channel
                        }
                    };
                }
                GSSENC_REQUEST_CODE => {
                    channel.write_all(&[REJECT_SSL])?;
                    channel.flush()?;
                }
                _ => return Err(io::ErrorKind::InvalidData.into()),
            }
        }
    }

    fn parse_props(message: &[u8]) -> io::Result<Vec<(String, String)>> {
        let mut req = message;
        let mut props = vec![];
        loop {
            let (key, message) = read_cstr(req)?;
            req = message;
            if key.is_empty() {
                break;
            }
            let (value, message) = read_cstr(req)?;
            req = message;
            props.push((key, value));
        }
        Ok(props)
    }

    fn parse_setup(message: &[u8]) -> io::Result<(i32, &[u8])> {
        if message.len() < 4 {
            return Err(io::ErrorKind::InvalidData.into());
        }
        let code = i32::from_be_bytes(message[0..4].try_into().expect("4 bytes"));
        Ok((code, &message[4..]))
    }
}

fn read_cstr(message: &[u8]) -> io::Result<(String, &[u8])> {
    if let Some(pos) = message.iter().position(|b| *b == 0) {
        let value = str::from_utf8(&message[0..pos])
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?
            .to_owned();
        Ok((value, &message[pos + 1..]))
    } else {
        Err(io::ErrorKind::InvalidData.into())
    }
}

fn read_i32(message: &mut &[u8]) -> io::Result<i32> {
    if message.len() < 4 {
        return Err(io::ErrorKind::InvalidData.into());
    }
    let value = i32::from_be_bytes(message[0..4].try_into().expect("4 bytes"));
    *message = &message[4..];
    Ok(value)
}

impl<P: Plain, S: Secure> Connection<HandShake, P, S> {
    /// startup parameters the client sent
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.state.props
    }

    /// Performs the password exchange. With `trust_clients` the exchange is
    /// skipped entirely and the client is accepted at once.
    pub fn authenticate(mut self, trust_clients: bool) -> io::Result<Connection<Authenticated, P, S>> {
        if !trust_clients {
            let request: Vec<u8> = OutboundMessage::AuthenticationCleartextPassword.into();
            self.channel.write_all(&request)?;
            self.channel.flush()?;

            // we are ok with any password that client sent
            let _tag = self.channel.read_tag()?;
            let len = self.channel.read_message_len()?;
            let _message = self.channel.read_message(len)?;
        }

        let ok: Vec<u8> = OutboundMessage::AuthenticationOk.into();
        self.channel.write_all(&ok)?;
        self.channel.flush()?;

        log::debug!("auth ok");

        Ok(Connection {
            channel: self.channel,
            state: Authenticated { props: self.state.props },
        })
    }
}

impl<P: Plain, S: Secure> Connection<Authenticated, P, S> {
    pub fn send_params(mut self, params: &[(&str, &str)]) -> io::Result<Connection<AllocateBackendKey, P, S>> {
        for (key, value) in params {
            let message: Vec<u8> = OutboundMessage::ParameterStatus((*key).to_owned(), (*value).to_owned()).into();
            self.channel.write_all(&message)?;
        }
        self.channel.flush()?;
        Ok(Connection {
            channel: self.channel,
            state: AllocateBackendKey { props: self.state.props },
        })
    }
}

impl<P: Plain, S: Secure> Connection<AllocateBackendKey, P, S> {
    pub fn send_backend_keys(mut self, conn_id: i32, secret_key: i32) -> io::Result<Connection<Established, P, S>> {
        let keys: Vec<u8> = OutboundMessage::BackendKeyData(conn_id, secret_key).into();
        self.channel.write_all(&keys)?;
        let ready: Vec<u8> = OutboundMessage::ReadyForQuery(TransactionStatus::Idle).into();
        self.channel.write_all(&ready)?;
        self.channel.flush()?;

        Ok(Connection {
            channel: self.channel,
            state: Established { props: self.state.props },
        })
    }
}

impl<P: Plain, S: Secure> Connection<Established, P, S> {
    pub fn into_parts(self) -> (Channel<P, S>, HashMap<String, String>) {
        (self.channel, self.state.props)
    }
}

#[derive(Debug)]
pub struct New;

#[derive(Debug)]
pub struct HandShake {
    props: HashMap<String, String>,
}

#[derive(Debug)]
pub struct Authenticated {
    props: HashMap<String, String>,
}

#[derive(Debug)]
pub struct AllocateBackendKey {
    props: HashMap<String, String>,
}

#[derive(Debug)]
pub struct Established {
    props: HashMap<String, String>,
}

#[cfg(test)]
mod tests;
