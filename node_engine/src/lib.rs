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

//! The per-connection engine: the worker state machine that serves one
//! client, the COPY mutation writer, the DDL rewriter and the server accept
//! loop that ties them to sockets.

mod copy;
mod ddl;
mod engine;
mod supervisor;
mod worker;

pub use crate::copy::MutationWriter;
pub use crate::ddl::DdlTranslator;
pub use crate::engine::{start, ServerContext};
pub use crate::supervisor::{ConnId, ConnSecretKey, ConnSupervisor};
pub use crate::worker::{ConnectionStatus, Worker};

/// A connection that keeps sending messages that are invalid in its current
/// mode is closed once this many of them have been skipped.
pub const MAX_INVALID_MESSAGE_COUNT: usize = 100;
