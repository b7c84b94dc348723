pub mod corelib;
pub mod ffi;
pub mod interning;
pub mod interpreter;
pub mod lookup;
pub mod natives;
pub mod port;
pub mod process;
pub mod program;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod stack_walker;

use std::path::Path;
use std::sync::Arc;

use heap::HeapSettings;

pub use interpreter::{interpret, InterruptKind};
pub use process::{Process, ProcessState};
pub use program::Program;
pub use scheduler::Scheduler;
pub use session::Session;
pub use snapshot::{Literal, ProgramBuilder, SnapshotError};

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Session(#[from] session::SessionError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// The embedder-facing handle created by [`setup`]. The print
/// interceptor chain and the platform singletons hang off it; there is
/// no module-scope mutable state.
pub struct Environment {
    settings: HeapSettings,
    worker_count: usize,
    ffi: ffi::SharedLibraryRegistry,
}

/// `Setup()`: create an environment with default sizing.
pub fn setup() -> Environment {
    Environment {
        settings: HeapSettings::default(),
        worker_count: std::thread::available_parallelism().map_or(2, |n| n.get()),
        ffi: ffi::SharedLibraryRegistry::new(),
    }
}

impl Environment {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn with_settings(mut self, settings: HeapSettings) -> Self {
        self.settings = settings;
        self
    }

    /// `AddDefaultSharedLibrary(name)`.
    pub fn add_default_shared_library(&self, name: &str) {
        self.ffi.add_default(name);
    }

    pub fn ffi(&self) -> &ffi::SharedLibraryRegistry {
        &self.ffi
    }

    /// Load a snapshot without running it.
    pub fn load_snapshot(&self, bytes: &[u8]) -> Result<Arc<Program>, VmError> {
        Ok(snapshot::load(bytes, self.settings)?)
    }

    /// `RunSnapshot(bytes)`: load, spawn the root process and drive the
    /// scheduler until termination. Returns the process exit status:
    /// zero on clean termination, nonzero when an uncaught exception
    /// tore the program down.
    pub fn run_snapshot(&self, bytes: &[u8]) -> Result<i32, VmError> {
        let program = self.load_snapshot(bytes)?;
        self.run_program(&program)
    }

    pub fn run_program(&self, program: &Arc<Program>) -> Result<i32, VmError> {
        let scheduler = Scheduler::new(program.clone(), self.worker_count);
        let main_process = program.spawn_process_for_main();
        Ok(scheduler.run(main_process))
    }

    /// `RunSnapshotFromFile(path)`.
    pub fn run_snapshot_from_file(&self, path: &Path) -> Result<i32, VmError> {
        let bytes = std::fs::read(path)?;
        self.run_snapshot(&bytes)
    }

    /// `WaitForDebuggerConnection(port)`: load the snapshot, then block
    /// until a debugger connects and serve the session.
    pub fn wait_for_debugger_connection(
        &self,
        port: u16,
        bytes: &[u8],
    ) -> Result<i32, VmError> {
        let program = self.load_snapshot(bytes)?;
        let session = Session::wait_for_connection(program, port)?;
        Ok(session.serve()?)
    }

    /// `TearDown()`.
    pub fn tear_down(self) {}
}
