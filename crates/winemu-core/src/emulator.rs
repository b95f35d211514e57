//! Emulator facade: map an image, build its process, run it in sessions.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::api::{EmulatorConfig, RunOutcome, RunRequest, TraceSink};
use crate::cpu::{CpuBackend, X64Interpreter};
use crate::engine::ExecutionEngine;
use crate::logger::Logger;
use crate::mapper::{MapError, MappedBinary, ModuleMapper, ModuleTable};
use crate::memory::{AddressSpace, MemoryError};
use crate::process::{ProcessContext, ProcessParams};
use crate::syscall::{NtKernel, SyscallHandler};

/// Failure to construct an emulator.
#[derive(Debug, Error)]
pub enum EmulatorError {
    /// The image or one of its dependencies could not be mapped.
    #[error("failed to map image: {0}")]
    Map(#[from] MapError),
    /// Process setup could not allocate its regions.
    #[error("failed to set up process: {0}")]
    Memory(#[from] MemoryError),
    /// The main image is a DLL without an entry point.
    #[error("{module} has no entry point")]
    MissingEntryPoint {
        /// Main image name.
        module: String,
    },
}

/// One emulated process and the machinery that runs it.
///
/// Instances share no mutable state; each carries its own [`Logger`].
pub struct WindowsEmulator<B = X64Interpreter, S = NtKernel> {
    logger: Logger,
    config: EmulatorConfig,
    engine: ExecutionEngine<B, S>,
    process: ProcessContext,
    trace: Option<Box<dyn TraceSink>>,
}

impl WindowsEmulator {
    /// Maps `path` with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`WindowsEmulator::with_backends`].
    pub fn new(path: impl AsRef<Path>) -> Result<Self, EmulatorError> {
        Self::with_config(path, EmulatorConfig::default())
    }

    /// Maps `path` with the built-in interpreter and kernel.
    ///
    /// # Errors
    ///
    /// See [`WindowsEmulator::with_backends`].
    pub fn with_config(
        path: impl AsRef<Path>,
        config: EmulatorConfig,
    ) -> Result<Self, EmulatorError> {
        let kernel = NtKernel::new(config.syscalls);
        Self::with_backends(path, config, X64Interpreter::new(), kernel)
    }
}

impl<B: CpuBackend, S: SyscallHandler> WindowsEmulator<B, S> {
    /// Maps `path` and its dependencies and prepares the process to run
    /// from the image's entry point.
    ///
    /// # Errors
    ///
    /// Returns [`EmulatorError::Map`] when mapping fails,
    /// [`EmulatorError::MissingEntryPoint`] for a DLL without an entry point
    /// and [`EmulatorError::Memory`] when process setup cannot allocate.
    pub fn with_backends(
        path: impl AsRef<Path>,
        config: EmulatorConfig,
        backend: B,
        syscalls: S,
    ) -> Result<Self, EmulatorError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());
        let logger = logger_for(&name, &config);
        let mut space = AddressSpace::new();
        let mut modules = ModuleTable::new();
        let main = ModuleMapper::new(&config.mapper, &logger).map(&mut space, &mut modules, path)?;
        Self::assemble(logger, config, space, modules, &main, backend, syscalls)
    }

    /// Like [`Self::with_backends`] for an in-memory image named `name`.
    /// Dependencies come from the configured search paths.
    ///
    /// # Errors
    ///
    /// See [`WindowsEmulator::with_backends`].
    pub fn from_image_bytes(
        name: &str,
        bytes: &[u8],
        config: EmulatorConfig,
        backend: B,
        syscalls: S,
    ) -> Result<Self, EmulatorError> {
        let logger = logger_for(name, &config);
        let mut space = AddressSpace::new();
        let mut modules = ModuleTable::new();
        let main = ModuleMapper::new(&config.mapper, &logger).map_bytes(
            &mut space,
            &mut modules,
            name,
            bytes,
        )?;
        Self::assemble(logger, config, space, modules, &main, backend, syscalls)
    }

    fn assemble(
        logger: Logger,
        config: EmulatorConfig,
        space: AddressSpace,
        modules: ModuleTable,
        main: &Arc<MappedBinary>,
        backend: B,
        syscalls: S,
    ) -> Result<Self, EmulatorError> {
        let entry = main
            .entry_point()
            .ok_or_else(|| EmulatorError::MissingEntryPoint {
                module: main.name().to_owned(),
            })?;
        let params = ProcessParams {
            stack_size: config.stack_size,
            terminate_process: config.syscalls.terminate_process,
        };
        let process = ProcessContext::create(space, modules, main, entry, params)?;
        logger.debug(format_args!(
            "process ready: entry {entry:#x}, {} modules, {} regions",
            process.modules().len(),
            process.memory().region_count()
        ));
        Ok(Self {
            logger,
            config,
            engine: ExecutionEngine::new(backend, syscalls),
            process,
            trace: None,
        })
    }

    /// Runs (or resumes) the process.
    ///
    /// Arguments are handed to the guest by the first call that may execute
    /// an instruction; later calls ignore them.
    pub fn start(&mut self, request: RunRequest) -> RunOutcome {
        match self.trace.as_deref_mut() {
            Some(sink) => self
                .engine
                .run(&mut self.process, &request, &self.logger, sink),
            None => self
                .engine
                .run(&mut self.process, &request, &self.logger, &mut ()),
        }
    }

    /// Process state: registers, memory, modules, counters, termination.
    #[must_use]
    pub const fn process(&self) -> &ProcessContext {
        &self.process
    }

    /// Main image.
    #[must_use]
    pub fn main_module(&self) -> Option<&Arc<MappedBinary>> {
        self.process.modules().iter().next()
    }

    /// Configuration the instance was built with.
    #[must_use]
    pub const fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Diagnostic output of this instance.
    #[must_use]
    pub const fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Mutable access to this instance's logger.
    pub const fn logger_mut(&mut self) -> &mut Logger {
        &mut self.logger
    }

    /// Installs a sink receiving every subsequent [`crate::TraceEvent`].
    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.trace = Some(sink);
    }

    /// Removes and returns the installed sink.
    pub fn take_trace_sink(&mut self) -> Option<Box<dyn TraceSink>> {
        self.trace.take()
    }
}

impl<B, S> std::fmt::Debug for WindowsEmulator<B, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowsEmulator")
            .field("logger", &self.logger)
            .field("config", &self.config)
            .field("process", &self.process)
            .field("tracing", &self.trace.is_some())
            .finish_non_exhaustive()
    }
}

fn logger_for(image: &str, config: &EmulatorConfig) -> Logger {
    let mut logger = Logger::for_image(image);
    logger.disable_output(!config.log_output);
    logger
}
