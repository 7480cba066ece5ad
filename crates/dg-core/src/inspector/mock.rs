//! In-memory inspector for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{GuardianSignature, ProcessInfo, ProcessInspector};
use dg_common::ProcessId;

#[derive(Debug, Default)]
pub struct MockInspector {
    processes: Mutex<HashMap<u32, ProcessInfo>>,
}

impl MockInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: ProcessInfo) {
        if let Ok(mut procs) = self.processes.lock() {
            procs.insert(info.pid.0, info);
        }
    }

    /// Register a live process with the given argv.
    pub fn add_process<S: Into<String>>(&self, pid: u32, argv: impl IntoIterator<Item = S>) {
        self.insert(ProcessInfo {
            pid: ProcessId(pid),
            command_line: argv.into_iter().map(Into::into).collect(),
            is_alive: true,
        });
    }

    /// Register a live process that matches `signature`.
    pub fn add_guardian(&self, pid: u32, signature: &GuardianSignature) {
        let mut argv = vec![signature.exe_name.clone()];
        argv.extend(
            signature
                .worker_args()
                .into_iter()
                .map(|a| a.to_string_lossy().into_owned()),
        );
        self.add_process(pid, argv);
    }

    pub fn remove(&self, pid: u32) {
        if let Ok(mut procs) = self.processes.lock() {
            procs.remove(&pid);
        }
    }
}

impl ProcessInspector for MockInspector {
    fn inspect(&self, pid: ProcessId) -> Option<ProcessInfo> {
        self.processes.lock().ok()?.get(&pid.0).cloned()
    }
}
