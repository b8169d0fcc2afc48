//! Process-wide runtime context.
//!
//! One [`Runtime`] exists per OS process. It owns the log sink and records
//! how the process was started, which re-exec needs later on. Components
//! receive it by reference from the master instead of reaching for globals.

use crate::error::{MasterError, MasterResult};
use crate::logging::LogSink;
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

static RUNTIME_ACTIVE: AtomicBool = AtomicBool::new(false);

/// How this process was launched.
#[derive(Debug, Clone)]
pub struct StartContext {
    /// Program path as invoked.
    pub program: OsString,
    /// Arguments after the program.
    pub args: Vec<OsString>,
    /// Working directory at launch.
    pub cwd: PathBuf,
}

impl StartContext {
    /// Capture the current process's argv and cwd.
    pub fn capture() -> MasterResult<Self> {
        let mut argv = env::args_os();
        let program = argv.next().unwrap_or_else(|| OsString::from("marionette"));
        Ok(Self {
            program,
            args: argv.collect(),
            cwd: env::current_dir()?,
        })
    }

    /// Basename of the program, for service ids and logs.
    pub fn program_name(&self) -> String {
        PathBuf::from(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "marionette".to_string())
    }
}

/// The process-wide context.
#[derive(Debug)]
pub struct Runtime {
    sink: LogSink,
    start_ctx: StartContext,
    started_at: Instant,
}

impl Runtime {
    /// Build the context for this process.
    ///
    /// # Errors
    ///
    /// `MasterError::SecondRuntime` if another `Runtime` is alive in this process.
    pub fn init(sink: LogSink, start_ctx: StartContext) -> MasterResult<Self> {
        if RUNTIME_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(MasterError::SecondRuntime);
        }
        Ok(Self {
            sink,
            start_ctx,
            started_at: Instant::now(),
        })
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    pub fn start_ctx(&self) -> &StartContext {
        &self.start_ctx
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        RUNTIME_ACTIVE.store(false, Ordering::SeqCst);
    }
}
