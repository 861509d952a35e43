//! Mock Store (C6): in-memory indexed set of mocks, filtered/unfiltered,
//! ordered iteration, atomic swap.
//!
//! Directly modeled on `session.rs`'s `SessionManagerTask`: a
//! single-writer actor reached via an mpsc request/oneshot-response
//! channel. Every state-changing operation and every snapshot read is
//! serialized through the one task that owns the maps, which is what
//! makes `promote` a true compare-and-swap rather than a racy
//! read-modify-write across threads.

use std::collections::HashMap;

use async_trait::async_trait;
use mimic_task::{ShutdownSignal, Task};
use tokio::sync::{mpsc, oneshot};

use super::{Mock, MockId};

enum Command {
    ReplaceFiltered(Vec<Mock>, oneshot::Sender<()>),
    ReplaceUnfiltered(Vec<Mock>, oneshot::Sender<()>),
    Insert(Mock, oneshot::Sender<()>),
    Delete(MockId, oneshot::Sender<()>),
    AllFiltered(oneshot::Sender<Vec<Mock>>),
    AllUnfiltered(oneshot::Sender<Vec<Mock>>),
    FlagUsed(MockId, oneshot::Sender<()>),
    Promote {
        id: MockId,
        expected_version: u64,
        updated: Mock,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle to the mock store actor.
#[derive(Clone)]
pub struct MockStoreHandle {
    commands: mpsc::UnboundedSender<Command>,
}

fn sorted_snapshot(map: &HashMap<MockId, Mock>) -> Vec<Mock> {
    let mut snapshot: Vec<Mock> = map.values().cloned().collect();
    snapshot.sort_by_key(|mock| mock.request_at_ms);
    snapshot
}

impl MockStoreHandle {
    pub async fn replace_filtered(&self, mocks: Vec<Mock>) {
        let (reply, recv) = oneshot::channel();
        let _ = self.commands.send(Command::ReplaceFiltered(mocks, reply));
        let _ = recv.await;
    }

    pub async fn replace_unfiltered(&self, mocks: Vec<Mock>) {
        let (reply, recv) = oneshot::channel();
        let _ = self.commands.send(Command::ReplaceUnfiltered(mocks, reply));
        let _ = recv.await;
    }

    pub async fn insert(&self, mock: Mock) {
        let (reply, recv) = oneshot::channel();
        let _ = self.commands.send(Command::Insert(mock, reply));
        let _ = recv.await;
    }

    pub async fn delete(&self, id: MockId) {
        let (reply, recv) = oneshot::channel();
        let _ = self.commands.send(Command::Delete(id, reply));
        let _ = recv.await;
    }

    /// Snapshot in ascending request-timestamp order, per §8's
    /// "MockStore snapshots are monotonic in request-timestamp" invariant.
    pub async fn all_filtered(&self) -> Vec<Mock> {
        let (reply, recv) = oneshot::channel();
        let _ = self.commands.send(Command::AllFiltered(reply));
        recv.await.unwrap_or_default()
    }

    pub async fn all_unfiltered(&self) -> Vec<Mock> {
        let (reply, recv) = oneshot::channel();
        let _ = self.commands.send(Command::AllUnfiltered(reply));
        recv.await.unwrap_or_default()
    }

    pub async fn flag_used(&self, id: MockId) {
        let (reply, recv) = oneshot::channel();
        let _ = self.commands.send(Command::FlagUsed(id, reply));
        let _ = recv.await;
    }

    /// Compare-and-swap on identity: succeeds only if `id` is still
    /// filtered and its version matches the snapshot the caller matched
    /// against. This is the linearization point of "I claimed this mock"
    /// (§4.6, §8): exactly one concurrent caller can win per transition.
    pub async fn promote(&self, id: MockId, expected_version: u64, updated: Mock) -> bool {
        let (reply, recv) = oneshot::channel();
        let _ = self.commands.send(Command::Promote {
            id,
            expected_version,
            updated,
            reply,
        });
        recv.await.unwrap_or(false)
    }
}

/// The store's backing task. Owns both maps; every mutation and every
/// snapshot read happens on this task, so there is no separate lock to
/// reason about beyond "is my turn on the channel".
pub struct MockStore {
    commands: mpsc::UnboundedReceiver<Command>,
    handle: MockStoreHandle,
    filtered: HashMap<MockId, Mock>,
    unfiltered: HashMap<MockId, Mock>,
}

impl MockStore {
    pub fn new() -> (Self, MockStoreHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = MockStoreHandle { commands: tx };
        (
            Self {
                commands: rx,
                handle: handle.clone(),
                filtered: HashMap::new(),
                unfiltered: HashMap::new(),
            },
            handle,
        )
    }

    pub fn handle(&self) -> MockStoreHandle {
        self.handle.clone()
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ReplaceFiltered(mocks, reply) => {
                self.filtered = mocks.into_iter().map(|m| (m.id, m)).collect();
                let _ = reply.send(());
            }
            Command::ReplaceUnfiltered(mocks, reply) => {
                self.unfiltered = mocks.into_iter().map(|m| (m.id, m)).collect();
                let _ = reply.send(());
            }
            Command::Insert(mock, reply) => {
                if mock.filtered {
                    self.filtered.insert(mock.id, mock);
                } else {
                    self.unfiltered.insert(mock.id, mock);
                }
                let _ = reply.send(());
            }
            Command::Delete(id, reply) => {
                self.filtered.remove(&id);
                self.unfiltered.remove(&id);
                let _ = reply.send(());
            }
            Command::AllFiltered(reply) => {
                let _ = reply.send(sorted_snapshot(&self.filtered));
            }
            Command::AllUnfiltered(reply) => {
                let _ = reply.send(sorted_snapshot(&self.unfiltered));
            }
            Command::FlagUsed(id, reply) => {
                if let Some(mock) = self.filtered.get_mut(&id) {
                    mock.used = true;
                } else if let Some(mock) = self.unfiltered.get_mut(&id) {
                    mock.used = true;
                }
                let _ = reply.send(());
            }
            Command::Promote {
                id,
                expected_version,
                updated,
                reply,
            } => {
                let won = match self.filtered.get(&id) {
                    Some(current) if current.version == expected_version => true,
                    _ => false,
                };

                if won {
                    self.filtered.remove(&id);
                    let mut updated = updated;
                    updated.filtered = false;
                    updated.version = expected_version + 1;
                    self.unfiltered.insert(id, updated);
                }

                let _ = reply.send(won);
            }
        }
    }
}

#[async_trait]
impl Task for MockStore {
    type Output = ();

    const NAME: &'static str = "mock store";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                _ = shutdown_signal.wait() => {
                    break;
                }
            }
        }
    }
}
