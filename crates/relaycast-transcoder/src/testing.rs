//! Scripted processes for tests.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::process::{ChildProcess, ExitInfo, ProcessSpawner, SpawnedProcess};

/// Line printed by mock processes once they produce output.
pub const READY_LINE: &str = "Output #0, hls, to 'index.m3u8':";

/// What a spawned mock process does.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Reports output and runs until stopped.
    Ready,

    /// Reports output, then exits with `code` after `after`.
    ExitAfter { after: Duration, code: i32 },

    /// Exits with `code` without reporting output.
    FailToStart { code: i32 },

    /// Never reports output and ignores graceful stop.
    Hang,

    /// Reports output but only exits when killed.
    IgnoreTerminate,

    /// The spawn itself fails.
    SpawnError,
}

#[derive(Default)]
struct State {
    script: Mutex<VecDeque<MockBehavior>>,
    default: Mutex<Option<MockBehavior>>,
    args: Mutex<Vec<Vec<String>>>,
    processes: Mutex<Vec<Arc<MockProcess>>>,
    spawns: AtomicUsize,
    alive: AtomicUsize,
    max_alive: AtomicUsize,
    kills: AtomicUsize,
}

/// Spawner handing out scripted processes. Clones share state.
#[derive(Clone)]
pub struct MockSpawner {
    state: Arc<State>,
}

impl MockSpawner {
    pub fn new(default: MockBehavior) -> Self {
        let state = State::default();
        *state.default.lock() = Some(default);
        Self {
            state: Arc::new(state),
        }
    }

    /// Queue a behavior for the next spawn.
    pub fn push(&self, behavior: MockBehavior) {
        self.state.script.lock().push_back(behavior);
    }

    /// Behavior used once the queue is empty.
    pub fn set_default(&self, behavior: MockBehavior) {
        *self.state.default.lock() = Some(behavior);
    }

    /// Successful spawns.
    pub fn spawn_count(&self) -> usize {
        self.state.spawns.load(Ordering::SeqCst)
    }

    /// Arguments of every spawn attempt.
    pub fn spawned_args(&self) -> Vec<Vec<String>> {
        self.state.args.lock().clone()
    }

    /// Processes that have not exited.
    pub fn alive(&self) -> usize {
        self.state.alive.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running processes.
    pub fn max_alive(&self) -> usize {
        self.state.max_alive.load(Ordering::SeqCst)
    }

    /// Processes that had to be killed.
    pub fn kills(&self) -> usize {
        self.state.kills.load(Ordering::SeqCst)
    }

    /// Make every running process exit with `code`.
    pub fn exit_all(&self, code: i32) {
        for process in self.state.processes.lock().iter() {
            process.finish(ExitInfo {
                code: Some(code),
                signal: None,
            });
        }
    }

    fn next_behavior(&self) -> MockBehavior {
        if let Some(behavior) = self.state.script.lock().pop_front() {
            return behavior;
        }
        self.state
            .default
            .lock()
            .clone()
            .unwrap_or(MockBehavior::Ready)
    }
}

#[async_trait]
impl ProcessSpawner for MockSpawner {
    async fn spawn(&self, _program: &Path, args: &[String]) -> io::Result<SpawnedProcess> {
        self.state.args.lock().push(args.to_vec());
        let behavior = self.next_behavior();

        if matches!(behavior, MockBehavior::SpawnError) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "mock transcoder missing"));
        }

        let spawns = self.state.spawns.fetch_add(1, Ordering::SeqCst);
        let alive = self.state.alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_alive.fetch_max(alive, Ordering::SeqCst);

        let (exit_tx, exit_rx) = watch::channel(None);
        let process = Arc::new(MockProcess {
            exit: exit_tx,
            state: Arc::downgrade(&self.state),
        });
        self.state.processes.lock().push(process.clone());

        let (lines, diagnostics) = mpsc::channel(16);
        let ready = !matches!(behavior, MockBehavior::Hang | MockBehavior::FailToStart { .. });
        let _ = lines.try_send(format!("mock transcoder {spawns} starting"));
        if ready {
            let _ = lines.try_send(READY_LINE.to_string());
        }

        match behavior {
            MockBehavior::FailToStart { code } => {
                let _ = lines.try_send("Could not open input".to_string());
                process.finish(ExitInfo {
                    code: Some(code),
                    signal: None,
                });
            }
            MockBehavior::ExitAfter { after, code } => {
                let process = process.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    process.finish(ExitInfo {
                        code: Some(code),
                        signal: None,
                    });
                });
            }
            _ => {}
        }

        let honors_terminate = !matches!(behavior, MockBehavior::Hang | MockBehavior::IgnoreTerminate);

        Ok(SpawnedProcess {
            child: Box::new(MockChild {
                process,
                exit: exit_rx,
                honors_terminate,
                _lines: lines,
            }),
            diagnostics,
        })
    }
}

struct MockProcess {
    exit: watch::Sender<Option<ExitInfo>>,
    state: std::sync::Weak<State>,
}

impl MockProcess {
    fn finish(&self, exit: ExitInfo) -> bool {
        let finished = self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(exit);
            true
        });
        if finished {
            if let Some(state) = self.state.upgrade() {
                state.alive.fetch_sub(1, Ordering::SeqCst);
            }
        }
        finished
    }
}

struct MockChild {
    process: Arc<MockProcess>,
    exit: watch::Receiver<Option<ExitInfo>>,
    honors_terminate: bool,
    // Keeps the diagnostics channel open for the process lifetime.
    _lines: mpsc::Sender<String>,
}

#[async_trait]
impl ChildProcess for MockChild {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn terminate(&mut self) -> io::Result<()> {
        if self.honors_terminate {
            self.process.finish(ExitInfo {
                code: Some(0),
                signal: None,
            });
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        let killed = self.process.finish(ExitInfo {
            code: None,
            signal: Some(9),
        });
        if killed {
            if let Some(state) = self.process.state.upgrade() {
                state.kills.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        loop {
            if let Some(exit) = *self.exit.borrow_and_update() {
                return Ok(exit);
            }
            if self.exit.changed().await.is_err() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock process lost"));
            }
        }
    }
}

impl Drop for MockChild {
    fn drop(&mut self) {
        // Dropping a real child kills it.
        self.process.finish(ExitInfo {
            code: None,
            signal: Some(9),
        });
    }
}
