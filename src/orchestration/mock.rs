//! Mock runtime for testing
//!
//! Simulates resource starts without running containers or processes.
//! Counters record what the engine asked for so tests can assert on
//! dedup, reference counting, and teardown.

use crate::error::{CorralError, CorralResult};
use crate::orchestration::dial::dial_address;
use crate::orchestration::exec::ExecSpec;
use crate::orchestration::runtime::{
    OutputStream, ProcessExit, ProcessHandle, Runtime, Signal, StartedProcess,
};
use crate::service::Port;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Default)]
struct MockState {
    next_id: u64,
    /// Exit senders of resources that have not terminated yet
    running: HashMap<String, oneshot::Sender<ProcessExit>>,
    started: Vec<ExecSpec>,
    fail_next_starts: usize,
    exec_codes: VecDeque<i32>,
}

/// Mock runtime for testing
pub struct MockRuntime {
    state: Mutex<MockState>,
    starts: AtomicUsize,
    kills: AtomicUsize,
    releases: AtomicUsize,
    execs: AtomicUsize,
    /// Delay before each start returns, to widen race windows
    pub start_delay: Duration,
    /// Delay inside each release, holding teardowns in Stopping
    pub stop_delay: Duration,
    /// Exit code returned by `exec` once scripted codes run out
    pub default_exec_code: i32,
    /// If set, every started resource exits immediately with this code
    pub exit_on_start: Option<i32>,
    /// Lines every started resource prints on stdout
    pub output: Vec<String>,
    /// Address every resource is reachable at; `dial` connects here
    pub address: String,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create a mock runtime whose starts succeed immediately
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            starts: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
            start_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
            default_exec_code: 0,
            exit_on_start: None,
            output: Vec::new(),
            address: "127.0.0.1".to_string(),
        }
    }

    /// Create a mock runtime whose starts take `delay`
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::new()
        }
    }

    /// Make the next `n` starts fail
    pub fn fail_next_starts(&self, n: usize) {
        self.state.lock().fail_next_starts = n;
    }

    /// Queue exit codes returned by successive `exec` calls
    pub fn script_exec_codes(&self, codes: impl IntoIterator<Item = i32>) {
        self.state.lock().exec_codes.extend(codes);
    }

    /// Simulate a resource terminating on its own
    ///
    /// Returns false if the resource is not running.
    pub fn crash(&self, handle: &ProcessHandle, code: i32) -> bool {
        match self.state.lock().running.remove(&handle.id) {
            Some(tx) => {
                let _ = tx.send(ProcessExit { code: Some(code) });
                true
            }
            None => false,
        }
    }

    /// Number of successful low-level starts
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of kill signals delivered
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Number of releases
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Number of `exec` calls
    pub fn execs(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    /// Number of resources that have not terminated
    pub fn running(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Specs of every successful start, in order
    pub fn started_specs(&self) -> Vec<ExecSpec> {
        self.state.lock().started.clone()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn is_available(&self) -> CorralResult<bool> {
        Ok(true)
    }

    async fn ensure_ready(&self) -> CorralResult<()> {
        Ok(())
    }

    async fn start(&self, spec: &ExecSpec) -> CorralResult<StartedProcess> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let (tx, exited) = oneshot::channel();
        let handle = {
            let mut state = self.state.lock();
            if state.fail_next_starts > 0 {
                state.fail_next_starts -= 1;
                return Err(CorralError::ContainerStart(format!(
                    "mock start failure for {}",
                    spec.hostname
                )));
            }

            state.next_id += 1;
            let handle = ProcessHandle {
                id: format!("mock-{:04}", state.next_id),
                pid: None,
            };
            state.started.push(spec.clone());
            match self.exit_on_start {
                Some(code) => {
                    let _ = tx.send(ProcessExit { code: Some(code) });
                }
                None => {
                    state.running.insert(handle.id.clone(), tx);
                }
            }
            handle
        };
        self.starts.fetch_add(1, Ordering::SeqCst);

        let mut text = self.output.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        let stdout: OutputStream = Box::new(Cursor::new(text.into_bytes()));

        Ok(StartedProcess {
            handle,
            stdout: Some(stdout),
            stderr: None,
            exited,
        })
    }

    async fn signal(&self, handle: &ProcessHandle, signal: Signal) -> CorralResult<()> {
        if signal == Signal::Kill {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(tx) = self.state.lock().running.remove(&handle.id) {
            let _ = tx.send(ProcessExit { code: None });
        }
        Ok(())
    }

    async fn release(&self, _handle: &ProcessHandle) -> CorralResult<()> {
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exec(&self, _handle: &ProcessHandle, _args: &[String]) -> CorralResult<i32> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        let scripted = self.state.lock().exec_codes.pop_front();
        Ok(scripted.unwrap_or(self.default_exec_code))
    }

    async fn dial(
        &self,
        _handle: &ProcessHandle,
        port: &Port,
        timeout: Duration,
    ) -> CorralResult<()> {
        dial_address(&self.address, port, timeout).await
    }

    async fn network_address(&self, _handle: &ProcessHandle) -> CorralResult<String> {
        Ok(self.address.clone())
    }

    fn runtime_name(&self) -> &'static str {
        "mock"
    }
}
