//! Fuel-metered interpreter executor.
//!
//! Runs a precompiled CPython-on-WASI module under wasmtime. The engine,
//! linker and compiled module are built once and shared; every call gets
//! its own `Store` (fuel counter, linear memory, WASI context) and its own
//! scratch directory for stdout/stderr capture.
//!
//! Fuel replaces a wall-clock timeout: the same code with the same budget
//! burns the same fuel regardless of host load.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use wasmtime::{Engine, Linker, Module, Store, Trap};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, OutputFile, WasiCtxBuilder};

use super::error::{SandboxError, SandboxResult, TrapKind};

/// Where the interpreter module is expected, relative to the working directory.
pub const DEFAULT_MODULE_PATH: &str = "var/python-3.12.0.wasm";

/// Release artifact the module is obtained from. Never fetched automatically.
pub const PYTHON_WASM_URL: &str = "https://github.com/vmware-labs/webassembly-language-runtimes/releases/download/python%2F3.12.0%2B20231211-040d5a6/python-3.12.0.wasm";

/// Default per-call fuel budget.
pub const DEFAULT_FUEL: u64 = 400_000_000;

/// `argv[0]` seen by the guest.
const INTERPRETER_ARGV0: &str = "python";

/// Size of a Wasm linear-memory page.
const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Outcome of a guest run that completed normally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRunResult {
    /// Everything the guest wrote to stdout.
    pub output: String,
    /// Final linear-memory size in 64 KiB pages.
    pub memory_pages: u64,
    /// Final linear-memory size in bytes.
    pub memory_bytes: u64,
    /// Budget minus remaining fuel.
    pub fuel_consumed: u64,
}

impl fmt::Display for ExecutionRunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "result:")?;
        writeln!(f)?;
        writeln!(f, "{}", self.output)?;
        writeln!(
            f,
            "mem size pages of {}kb: {}",
            WASM_PAGE_SIZE / 1024,
            self.memory_pages
        )?;
        writeln!(f, "data length: {}", self.memory_bytes)?;
        writeln!(f, "fuel consumed: {}", self.fuel_consumed)
    }
}

/// Shared, immutable half of the interpreter executor.
///
/// `Engine`, `Linker` and `Module` are all `Send + Sync`, so one executor
/// can serve concurrent calls; per-call state never leaves [`WasmExecutor::run`].
pub struct WasmExecutor {
    engine: Engine,
    linker: Linker<WasiP1Ctx>,
    module: Module,
    module_path: PathBuf,
}

impl fmt::Debug for WasmExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmExecutor")
            .field("module_path", &self.module_path)
            .finish_non_exhaustive()
    }
}

impl WasmExecutor {
    /// Loads and compiles the interpreter module at `path`.
    ///
    /// A missing file is [`SandboxError::ArtifactMissing`]: the caller cannot
    /// proceed and should tell the user where to download it.
    pub fn load(path: impl AsRef<Path>) -> SandboxResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SandboxError::ArtifactMissing {
                path: path.to_path_buf(),
                url: PYTHON_WASM_URL.to_string(),
            });
        }

        let engine = build_engine()?;
        info!("Compiling interpreter module {}", path.display());
        let module = Module::from_file(&engine, path).map_err(SandboxError::engine)?;
        Self::assemble(engine, module, path.to_path_buf())
    }

    fn assemble(engine: Engine, module: Module, module_path: PathBuf) -> SandboxResult<Self> {
        let mut linker = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |ctx| ctx).map_err(SandboxError::engine)?;
        Ok(Self {
            engine,
            linker,
            module,
            module_path,
        })
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    /// Runs `python -c <code>` with `fuel` units of budget.
    ///
    /// Blocks the calling thread until the guest finishes or traps. A trap
    /// (fuel exhaustion, nonzero exit, runtime fault) is returned as
    /// [`SandboxError::GuestTrap`], never as a partial result.
    pub fn run(&self, code: &str, fuel: u64) -> SandboxResult<ExecutionRunResult> {
        // Dropped on every return path, taking both capture files with it.
        let scratch = tempfile::tempdir().map_err(SandboxError::host)?;
        let out_log = scratch.path().join("out.log");
        let err_log = scratch.path().join("err.log");

        let mut builder = WasiCtxBuilder::new();
        builder
            .preopened_dir(".", "/", DirPerms::all(), FilePerms::all())
            .map_err(SandboxError::engine)?
            .args(&[INTERPRETER_ARGV0, "-c", code])
            .stdout(OutputFile::new(File::create(&out_log).map_err(SandboxError::host)?))
            .stderr(OutputFile::new(File::create(&err_log).map_err(SandboxError::host)?));

        let mut store = Store::new(&self.engine, builder.build_p1());
        store.set_fuel(fuel).map_err(SandboxError::engine)?;

        let instance = match self.linker.instantiate(&mut store, &self.module) {
            Ok(instance) => instance,
            // A start section can trap too; anything else is a link failure.
            Err(err) if err.downcast_ref::<Trap>().is_some() => {
                drop(store);
                return Err(guest_failure(err, &err_log));
            }
            Err(err) => return Err(SandboxError::engine(err)),
        };

        let memory = instance.get_memory(&mut store, "memory");
        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(SandboxError::engine)?;

        if let Err(err) = start.call(&mut store, ()) {
            // `proc_exit(0)` unwinds as an error but is a normal finish.
            if exit_status(&err) != Some(0) {
                drop(store);
                return Err(guest_failure(err, &err_log));
            }
        }

        let (memory_pages, memory_bytes) = match memory {
            Some(memory) => (memory.size(&store), memory.data_size(&store) as u64),
            None => (0, 0),
        };
        let remaining = store.get_fuel().map_err(SandboxError::engine)?;
        drop(store);

        let output = read_output(&out_log)?;
        debug!(
            "Guest finished: {} bytes of output, {} fuel consumed",
            output.len(),
            fuel.saturating_sub(remaining)
        );

        Ok(ExecutionRunResult {
            output,
            memory_pages,
            memory_bytes,
            fuel_consumed: fuel.saturating_sub(remaining),
        })
    }
}

fn build_engine() -> SandboxResult<Engine> {
    let mut config = wasmtime::Config::new();
    config.consume_fuel(true);
    if let Err(e) = config.cache_config_load_default() {
        warn!("Module cache unavailable, compiling without it: {e:#}");
    }
    Engine::new(&config).map_err(SandboxError::engine)
}

/// Exit status carried by a `proc_exit` unwind, if that is what `err` is.
fn exit_status(err: &wasmtime::Error) -> Option<i32> {
    err.downcast_ref::<I32Exit>().map(|exit| exit.0)
}

/// Turns an abnormal guest termination into a `GuestTrap`, attaching
/// whatever the guest wrote to stderr.
fn guest_failure(err: wasmtime::Error, err_log: &Path) -> SandboxError {
    let stderr = read_capture(err_log);
    if !stderr.is_empty() {
        debug!("Guest stderr:\n{stderr}");
    }
    let trap = classify_trap(err, stderr);
    warn!("{trap}");
    trap
}

fn classify_trap(err: wasmtime::Error, stderr: String) -> SandboxError {
    let kind = if let Some(code) = exit_status(&err) {
        TrapKind::Exit(code)
    } else if matches!(err.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
        TrapKind::OutOfFuel
    } else {
        TrapKind::Fault
    };
    SandboxError::GuestTrap {
        kind,
        message: format!("{err:#}"),
        stderr,
    }
}

/// Reads the guest's stdout after a normal finish. A capture that cannot be
/// read is an error, never an empty result.
fn read_output(path: &Path) -> SandboxResult<String> {
    let bytes = std::fs::read(path).map_err(SandboxError::host)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Best-effort read used only to attach stderr to a trap.
fn read_capture(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!("Could not read {}: {e}", path.display());
            String::new()
        }
    }
}
