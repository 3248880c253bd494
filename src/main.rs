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

use clap::{Parser, ValueEnum};
use node_engine::ServerContext;
use std::path::PathBuf;
use std::process;
use wire_protocol::connection::SslMode;

/// PostgreSQL wire-protocol front end for a cloud SQL backend
#[derive(Parser)]
#[command(name = "pg_gateway", version)]
struct Args {
    /// cloud project of the backing instance
    #[arg(short = 'p', long = "project", default_value = "test-project")]
    project: String,

    /// instance to connect databases to
    #[arg(short = 'i', long = "instance", default_value = "test-instance")]
    instance: String,

    /// database served to clients that do not name one
    #[arg(short = 'd', long = "database", default_value = "postgres")]
    database: String,

    /// TCP port to listen on
    #[arg(short = 's', long = "port", default_value_t = 5432)]
    port: u16,

    /// directory for the Unix-domain socket; no socket without it
    #[arg(long = "dir")]
    unix_socket_dir: Option<PathBuf>,

    /// accept clients without a password exchange (local development)
    #[arg(short = 'x', long = "disable-auth")]
    disable_auth: bool,

    /// how to answer SSLRequest
    #[arg(long = "ssl", value_enum, default_value_t = SslArg::Disable)]
    ssl: SslArg,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum SslArg {
    Disable,
    Allow,
    Require,
    Enable,
}

impl From<SslArg> for SslMode {
    fn from(arg: SslArg) -> SslMode {
        match arg {
            SslArg::Disable => SslMode::Disable,
            SslArg::Allow => SslMode::Allow,
            SslArg::Require => SslMode::Require,
            SslArg::Enable => SslMode::Enable,
        }
    }
}

fn main() {
    // bad arguments exit with code 2 through clap
    let args = Args::parse();

    simple_logger::SimpleLogger::new().init().expect("logger to initialize");

    let context = ServerContext {
        project: args.project,
        instance: args.instance,
        default_database: args.database,
        tcp_port: args.port,
        unix_socket_dir: args.unix_socket_dir,
        ssl_mode: args.ssl.into(),
        identity: None,
        trust_clients: args.disable_auth,
    };

    if let Err(error) = node_engine::start(context) {
        log::error!("server failed to start: {}", error);
        process::exit(1);
    }
}
