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

use backend::CancelHandle;
use rand::Rng;
use std::collections::{HashMap, VecDeque};

/// Connection ID
pub type ConnId = i32;
/// Connection secret key
pub type ConnSecretKey = i32;

/// Manages allocation of connection IDs and secret keys, and routes
/// cancellation requests to the backend call of the target connection.
pub struct ConnSupervisor {
    next_id: ConnId,
    max_id: ConnId,
    free_ids: VecDeque<ConnId>,
    current_mapping: HashMap<ConnId, (ConnSecretKey, CancelHandle)>,
}

impl ConnSupervisor {
    /// Creates a new Connection Supervisor.
    pub fn new(min_id: ConnId, max_id: ConnId) -> ConnSupervisor {
        ConnSupervisor {
            next_id: min_id,
            max_id,
            free_ids: VecDeque::new(),
            current_mapping: HashMap::new(),
        }
    }

    /// Allocates a new connection ID and secret key for a connection whose
    /// in-flight work is cancelled through `cancel_handle`.
    pub fn alloc(&mut self, cancel_handle: CancelHandle) -> Result<(ConnId, ConnSecretKey), ()> {
        let conn_id = self.generate_conn_id()?;
        let secret_key = rand::thread_rng().gen();
        self.current_mapping.insert(conn_id, (secret_key, cancel_handle));
        Ok((conn_id, secret_key))
    }

    /// Releases a connection ID back to the pool.
    pub fn free(&mut self, conn_id: ConnId) {
        if self.current_mapping.remove(&conn_id).is_some() {
            self.free_ids.push_back(conn_id);
        }
    }

    /// Validates whether the secret key matches the specified connection ID.
    pub fn verify(&self, conn_id: ConnId, secret_key: ConnSecretKey) -> bool {
        match self.current_mapping.get(&conn_id) {
            Some((stored, _)) => *stored == secret_key,
            None => false,
        }
    }

    /// Cancels the in-flight backend call of the target connection when the
    /// secret matches; a mismatch is silently ignored. Returns whether a
    /// cancellation was issued.
    pub fn cancel(&self, conn_id: ConnId, secret_key: ConnSecretKey) -> bool {
        match self.current_mapping.get(&conn_id) {
            Some((stored, handle)) if *stored == secret_key => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    fn generate_conn_id(&mut self) -> Result<ConnId, ()> {
        match self.free_ids.pop_front() {
            Some(id) => Ok(id),
            None => {
                let id = self.next_id;
                if id > self.max_id {
                    return Err(());
                }
                self.next_id += 1;
                Ok(id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_until_freed() {
        let mut supervisor = ConnSupervisor::new(1, 3);
        let (first, _) = supervisor.alloc(CancelHandle::default()).unwrap();
        let (second, _) = supervisor.alloc(CancelHandle::default()).unwrap();
        assert_ne!(first, second);

        supervisor.free(first);
        let (third, _) = supervisor.alloc(CancelHandle::default()).unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn exhausted_pool_is_an_error() {
        let mut supervisor = ConnSupervisor::new(1, 1);
        supervisor.alloc(CancelHandle::default()).unwrap();
        assert_eq!(supervisor.alloc(CancelHandle::default()), Err(()));
    }

    #[test]
    fn verify_checks_the_secret() {
        let mut supervisor = ConnSupervisor::new(1, 10);
        let (conn_id, secret_key) = supervisor.alloc(CancelHandle::default()).unwrap();
        assert!(supervisor.verify(conn_id, secret_key));
        assert!(!supervisor.verify(conn_id, secret_key.wrapping_add(1)));
        assert!(!supervisor.verify(conn_id + 1, secret_key));
    }

    #[test]
    fn cancel_reaches_only_the_matching_connection() {
        let mut supervisor = ConnSupervisor::new(1, 10);
        let target = CancelHandle::default();
        let other = CancelHandle::default();
        let (conn_id, secret_key) = supervisor.alloc(target.clone()).unwrap();
        supervisor.alloc(other.clone()).unwrap();

        assert!(supervisor.cancel(conn_id, secret_key));
        assert!(target.is_canceled());
        assert!(!other.is_canceled());
    }

    #[test]
    fn mismatched_secret_is_silently_ignored() {
        let mut supervisor = ConnSupervisor::new(1, 10);
        let target = CancelHandle::default();
        let (conn_id, secret_key) = supervisor.alloc(target.clone()).unwrap();

        assert!(!supervisor.cancel(conn_id, secret_key.wrapping_add(7)));
        assert!(!target.is_canceled());
    }
}
