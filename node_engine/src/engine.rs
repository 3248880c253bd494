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

//! The accept loop. Listens on TCP and optionally on a Unix-domain socket,
//! runs the bootstrap handshake, allocates a `(connection id, secret key)`
//! pair and hands the established channel to a [`Worker`] on its own thread.
//! Cancel requests are routed through the shared [`ConnSupervisor`].

use crate::supervisor::ConnSupervisor;
use crate::worker::Worker;
use backend::{BackendConnection, InMemoryBackend};
use native_tls::Identity;
use session::SessionState;
use std::io;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use wire_protocol::connection::{Bootstrap, Connection, New, Plain, SslMode};
use wire_protocol::ClientConnection;

const HOST: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

const MIN_CONN_ID: i32 = 1;
const MAX_CONN_ID: i32 = 1 << 16;

/// Everything the server needs, threaded through explicitly instead of
/// living in process-wide statics
pub struct ServerContext {
    pub project: String,
    pub instance: String,
    pub default_database: String,
    pub tcp_port: u16,
    pub unix_socket_dir: Option<PathBuf>,
    pub ssl_mode: SslMode,
    pub identity: Option<Identity>,
    pub trust_clients: bool,
}

struct Shared {
    supervisor: Mutex<ConnSupervisor>,
    ssl_mode: SslMode,
    identity: Option<Identity>,
    trust_clients: bool,
}

/// Binds the listeners and serves connections until the process exits
pub fn start(context: ServerContext) -> io::Result<()> {
    let shared = Arc::new(Shared {
        supervisor: Mutex::new(ConnSupervisor::new(MIN_CONN_ID, MAX_CONN_ID)),
        ssl_mode: context.ssl_mode,
        identity: context.identity,
        trust_clients: context.trust_clients,
    });

    log::info!(
        "serving project {} instance {} database {}",
        context.project,
        context.instance,
        context.default_database
    );

    #[cfg(unix)]
    {
        if let Some(dir) = &context.unix_socket_dir {
            let path = dir.join(format!(".s.PGSQL.{}", context.tcp_port));
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let listener = std::os::unix::net::UnixListener::bind(&path)?;
            log::info!("listening on {}", path.display());
            let shared = Arc::clone(&shared);
            thread::Builder::new().name("unix-listener".to_owned()).spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(socket) => spawn_connection(socket, Arc::clone(&shared)),
                        Err(error) => log::error!("unix accept error {:?}", error),
                    }
                }
            })?;
        }
    }

    let listener = TcpListener::bind((HOST, context.tcp_port))?;
    log::info!("listening on port {}", context.tcp_port);
    for stream in listener.incoming() {
        match stream {
            Ok(socket) => spawn_connection(socket, Arc::clone(&shared)),
            Err(error) => log::error!("accept error {:?}", error),
        }
    }
    Ok(())
}

fn spawn_connection<P>(socket: P, shared: Arc<Shared>)
where
    P: Plain + Send + 'static,
    Identity: wire_protocol::connection::Securing<P, native_tls::TlsStream<TcpStream>>,
{
    let spawned = thread::Builder::new().name("connection".to_owned()).spawn(move || {
        if let Err(error) = serve(socket, &shared) {
            log::debug!("connection finished with {:?}", error);
        }
    });
    if let Err(error) = spawned {
        log::error!("could not spawn connection thread {:?}", error);
    }
}

fn serve<P>(socket: P, shared: &Shared) -> io::Result<()>
where
    P: Plain + Send + 'static,
    Identity: wire_protocol::connection::Securing<P, native_tls::TlsStream<TcpStream>>,
{
    let connection: Connection<New, P, native_tls::TlsStream<TcpStream>> = Connection::new(socket);
    let connection = match connection.hand_shake(shared.identity.clone(), shared.ssl_mode)? {
        Bootstrap::Cancel { conn_id, secret_key } => {
            // an independent, short-lived connection cancelling another one
            let issued = shared.supervisor.lock().unwrap().cancel(conn_id, secret_key);
            log::debug!("cancel request for connection-{}, issued: {}", conn_id, issued);
            return Ok(());
        }
        Bootstrap::Connect(connection) => connection,
    };

    let session = SessionState::from_startup(connection.properties());
    let connection = connection.authenticate(shared.trust_clients)?;
    let parameters = startup_parameters(&session);
    let parameter_refs: Vec<(&str, &str)> = parameters
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();
    let connection = connection.send_params(&parameter_refs)?;

    let backend = InMemoryBackend::new();
    let (conn_id, secret_key) = match shared.supervisor.lock().unwrap().alloc(backend.cancel_handle()) {
        Ok(allocated) => allocated,
        Err(()) => {
            log::error!("connection id space exhausted");
            return Err(io::ErrorKind::Other.into());
        }
    };

    log::debug!("start service on connection-{}", conn_id);
    let connection = connection.send_backend_keys(conn_id, secret_key)?;
    let (channel, properties) = connection.into_parts();
    let mut client = ClientConnection::new(channel, properties);

    let mut worker = Worker::new(backend, session);
    let served = worker.process(&mut client);

    shared.supervisor.lock().unwrap().free(conn_id);
    log::debug!("stop service of connection-{}", conn_id);
    served
}

/// The ParameterStatus set announced right after authentication
fn startup_parameters(session: &SessionState) -> Vec<(String, String)> {
    [
        "server_version",
        "application_name",
        "is_superuser",
        "session_authorization",
        "integer_datetimes",
        "server_encoding",
        "client_encoding",
        "DateStyle",
        "IntervalStyle",
        "standard_conforming_strings",
        "TimeZone",
    ]
    .iter()
    .map(|name| {
        let value = session.get(name).unwrap_or("").to_owned();
        ((*name).to_owned(), value)
    })
    .collect()
}
