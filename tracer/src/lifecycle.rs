//! Process and thread lifecycle.
//!
//! A [`Tracer`] is created once at process init and carries all shared
//! state; the host runtime owns one [`PerThread`] per application thread
//! (stashed in its TLS field) and passes it into the thread event callbacks.
//! Block instrumentation events are served by the `BlockEvents` impl in
//! [`crate::emitter`]; thread events by the `ThreadEvents` impl here.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use runtime_api::{
    Arch, BufferAllocator, CalleeRef, DefaultFileOps, FileOps, HostRuntime, PhysTranslator,
    SystemAllocator, ThreadEvents, TracePipe, TLS_OFFS_BUF_PTR, TLS_OFFS_DCACHE, TLS_OFFS_ICACHE,
};

use crate::buffer::{OwnedBuffer, PerThread};
use crate::instru::{Instru, OfflineInstru, OnlineInstru};
use crate::options::Options;
use crate::{TracerError, BUF_HDR_SLOTS, MAX_NUM_ENTRIES};

/// Clean-call target draining the calling thread's buffer.
pub const DRAIN_CALLEE: CalleeRef = CalleeRef("trace_buffer_drain");

/// File holding the serialized module list inside the output directory.
pub const MODULE_LIST_FILENAME: &str = "modules.log";

const MODULE_LIST_VERSION: u32 = 1;

/// Extension of per-thread raw trace files.
const OUTFILE_SUFFIX: &str = "raw";

const NUM_OF_TRIES: usize = 10_000;

/// ARM-Linux cacheflush syscall number.
const SYS_CACHEFLUSH: i64 = 0x0f0002;

/// Callback taking ownership of a drained buffer instead of a synchronous
/// file write; returns false on failure.
pub type HandoffFn = Box<dyn Fn(&mut (dyn Write + Send), OwnedBuffer) -> bool + Send + Sync>;

/// Collaborators the host environment supplies at init.
pub struct Collaborators {
    pub allocator: Box<dyn BufferAllocator>,
    pub file_ops: Box<dyn FileOps>,
    pub pipe: Option<Box<dyn TracePipe>>,
    pub phys: Option<Box<dyn PhysTranslator>>,
    pub handoff: Option<HandoffFn>,
    pub exit_cb: Option<Box<dyn FnOnce() + Send>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            allocator: Box::new(SystemAllocator),
            file_ops: Box::new(DefaultFileOps),
            pipe: None,
            phys: None,
            handoff: None,
            exit_cb: None,
        }
    }
}

/// The tracer core context.
pub struct Tracer {
    pub(crate) options: Options,
    pub(crate) arch: Arch,
    pub(crate) instru: Box<dyn Instru>,
    pub(crate) allocator: Box<dyn BufferAllocator>,
    file_ops: Box<dyn FileOps>,
    pub(crate) handoff: Option<HandoffFn>,
    exit_cb: Option<Box<dyn FnOnce() + Send>>,
    pub(crate) pipe: Option<Mutex<Box<dyn TracePipe>>>,
    module_file: Mutex<Option<Box<dyn Write + Send>>>,
    pub(crate) phys: Option<Box<dyn PhysTranslator>>,
    /// Global reference count, gathered from threads as they exit.
    num_refs: Mutex<u64>,
    /// Mutable copy of the option: OOM continuation lowers it to suppress
    /// all further output.
    max_trace_size: AtomicU64,
    pub(crate) atomic_write_size: usize,
    pub(crate) trace_buf_size: usize,
    pub(crate) redzone_size: usize,
    pub(crate) max_buf_size: usize,
    pub(crate) buf_hdr_slots_size: usize,
    logsubdir: Mutex<PathBuf>,
}

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    let Ok(guard) = mutex.lock() else {
        tracing::error!(what, "lock is poisoned");
        panic!()
    };
    guard
}

fn init_logging(verbose: u32) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

impl Tracer {
    /// Process init. Validates options, opens the output directory or the
    /// pipe, and selects the instrumentation strategy. The host registers
    /// the returned context for block, thread, syscall, fork and exit
    /// events.
    pub fn new(
        host: &dyn HostRuntime,
        options: Options,
        collaborators: Collaborators,
    ) -> Result<Tracer, TracerError> {
        init_logging(options.verbose);
        let arch = host.arch();

        if !options.offline && options.ipc_name.is_empty() {
            return Err(TracerError::Usage("ipc name is required for online mode"));
        }
        if !options.offline && collaborators.pipe.is_none() {
            return Err(TracerError::Usage("online mode requires a pipe"));
        }
        if options.offline && options.outdir.is_empty() {
            return Err(TracerError::Usage("outdir is required for offline mode"));
        }
        if options.l0_filter {
            let lines_ok = |size: u64| {
                options.line_size.is_power_of_two()
                    && size >= options.line_size
                    && (size / options.line_size).is_power_of_two()
            };
            if !lines_ok(options.l0d_size) || !lines_ok(options.l0i_size) {
                return Err(TracerError::FilterGeometry);
            }
        }
        if options.use_physical && collaborators.phys.is_none() {
            tracing::warn!("physical translation unavailable: using virtual addresses");
        }

        let instru: Box<dyn Instru> = if options.offline {
            Box::new(OfflineInstru::new(arch))
        } else {
            Box::new(OnlineInstru::new(arch, options.online_instr_types))
        };

        let mut pipe = collaborators.pipe;
        let atomic_write_size = pipe
            .as_ref()
            .map(|p| p.atomic_write_size())
            .unwrap_or_default();
        if let Some(pipe) = pipe.as_mut() {
            if !pipe.maximize_buffer() {
                tracing::warn!("failed to maximize pipe buffer: performance may suffer");
            }
        }

        let entry = instru.sizeof_entry();
        let trace_buf_size = entry * MAX_NUM_ENTRIES;
        let redzone_size = entry * MAX_NUM_ENTRIES;
        let phys = if options.use_physical {
            collaborators.phys
        } else {
            None
        };

        let tracer = Tracer {
            arch,
            instru,
            allocator: collaborators.allocator,
            file_ops: collaborators.file_ops,
            handoff: collaborators.handoff,
            exit_cb: collaborators.exit_cb,
            pipe: pipe.map(Mutex::new),
            module_file: Mutex::new(None),
            phys,
            num_refs: Mutex::new(0),
            max_trace_size: AtomicU64::new(options.max_trace_size),
            atomic_write_size,
            trace_buf_size,
            redzone_size,
            max_buf_size: trace_buf_size + redzone_size,
            buf_hdr_slots_size: entry * BUF_HDR_SLOTS,
            logsubdir: Mutex::new(PathBuf::new()),
            options,
        };

        if tracer.options.offline {
            tracer.init_offline_dir(host)?;
        }
        tracing::debug!(arch = %arch, "tracer initialized");
        Ok(tracer)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Total references seen by exited threads.
    pub fn num_refs(&self) -> u64 {
        *lock(&self.num_refs, "num_refs")
    }

    pub(crate) fn max_trace_size(&self) -> u64 {
        self.max_trace_size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_max_trace_size(&self, value: u64) {
        self.max_trace_size.store(value, Ordering::Relaxed);
    }

    pub(crate) fn have_phys(&self) -> bool {
        self.phys.is_some()
    }

    /// Create a unique output subdirectory and the module-list file inside
    /// it, retrying against name collisions.
    fn init_offline_dir(&self, host: &dyn HostRuntime) -> Result<(), TracerError> {
        let outdir = Path::new(&self.options.outdir);
        for i in 0..NUM_OF_TRIES {
            let dir = outdir.join(format!(
                "{}.{:05}.{:04}.dir",
                host.app_name(),
                host.process_id(),
                i
            ));
            if self.file_ops.create_dir(&dir).is_err() {
                continue;
            }
            tracing::info!(dir = %dir.display(), "log directory created");
            let mut module_file = self.file_ops.open_file(&dir.join(MODULE_LIST_FILENAME))?;
            writeln!(module_file, "module list version {MODULE_LIST_VERSION}")?;
            *lock(&self.module_file, "module_file") = Some(module_file);
            *lock(&self.logsubdir, "logsubdir") = dir;
            return Ok(());
        }
        Err(TracerError::OutputDir(outdir.to_path_buf()))
    }

    /// Per-thread file and header setup, shared between thread init and the
    /// fork path.
    fn init_thread_in_process(&self, host: &dyn HostRuntime, data: &mut PerThread) {
        let tid = host.thread_id();
        if self.options.offline {
            let logsubdir = lock(&self.logsubdir, "logsubdir").clone();
            let mut file = None;
            for i in 0..NUM_OF_TRIES {
                let path = logsubdir.join(format!(
                    "{}.{:05}.{:04}.{}",
                    host.app_name(),
                    tid,
                    i,
                    OUTFILE_SUFFIX
                ));
                if let Ok(opened) = self.file_ops.open_file(&path) {
                    tracing::debug!(path = %path.display(), "created thread trace file");
                    file = Some(opened);
                    break;
                }
            }
            let Some(file) = file else {
                tracing::error!("failed to create a thread trace file");
                panic!()
            };
            data.file = Some(file);

            // The header triple leads the first buffer so the first drain
            // writes it out ahead of the entries.
            let Some(buf) = data.buf.as_mut() else {
                tracing::error!("thread has no trace buffer");
                panic!()
            };
            let base = buf.base();
            let bytes = buf.bytes_mut();
            let mut offs = self.instru.append_thread_header(bytes, tid);
            data.init_header_size = offs;
            offs += self.instru.append_tid(&mut bytes[offs..], tid);
            offs += self.instru.append_pid(&mut bytes[offs..], host.process_id());
            data.tls.set(TLS_OFFS_BUF_PTR, base + offs as u64);
        } else {
            // Register the thread with the simulator before any chunk of it
            // can arrive.
            let entry = self.instru.sizeof_entry();
            let mut proc_info = vec![0u8; 3 * entry];
            let mut offs = self.instru.append_thread_header(&mut proc_info, tid);
            offs += self.instru.append_tid(&mut proc_info[offs..], tid);
            offs += self.instru.append_pid(&mut proc_info[offs..], host.process_id());
            self.pipe_write_all(&proc_info[..offs]);

            let Some(buf) = data.buf.as_ref() else {
                tracing::error!("thread has no trace buffer");
                panic!()
            };
            data.tls
                .set(TLS_OFFS_BUF_PTR, buf.base() + self.buf_hdr_slots_size as u64);
        }

        if self.options.l0_filter {
            let lines = |size: u64| (size / self.options.line_size) as usize;
            let dcache = vec![0u64; lines(self.options.l0d_size)].into_boxed_slice();
            data.tls.set(TLS_OFFS_DCACHE, dcache.as_ptr() as u64);
            data.l0_dcache = Some(dcache);
            let icache = vec![0u64; lines(self.options.l0i_size)].into_boxed_slice();
            data.tls.set(TLS_OFFS_ICACHE, icache.as_ptr() as u64);
            data.l0_icache = Some(icache);
        }
    }

    /// Process exit: closes the module-list file or the pipe and runs the
    /// embedder's exit callback. The host unregisters all events before
    /// dropping the context.
    pub fn exit(mut self) {
        let num_refs = *lock(&self.num_refs, "num_refs");
        tracing::info!(num_refs, "tracer exiting process");
        *lock(&self.module_file, "module_file") = None;
        if let Some(exit_cb) = self.exit_cb.take() {
            exit_cb();
        }
        // Instrumentation strategy, pipe and remaining state drop here.
    }
}

impl ThreadEvents for Tracer {
    type ThreadData = PerThread;

    fn thread_init(&self, host: &dyn HostRuntime) -> PerThread {
        let mut data = PerThread::new(host.thread_id());
        self.create_buffer(&mut data);
        self.init_thread_in_process(host, &mut data);
        data
    }

    fn thread_exit(&self, _host: &dyn HostRuntime, mut data: PerThread) {
        let max_size = self.max_trace_size();
        if let Some(base) = data.buf.as_ref().map(|b| b.base()) {
            if max_size > 0 && data.bytes_written > max_size {
                // Over the limit only the footer is written.
                data.tls
                    .set(TLS_OFFS_BUF_PTR, base + self.buf_hdr_slots_size as u64);
            }
        }
        let tid = data.tid();
        data.append(|bytes| self.instru.append_thread_exit(bytes, tid));

        self.drain(&mut data, true);

        if self.options.offline {
            data.file = None;
        }
        data.l0_dcache = None;
        data.l0_icache = None;

        *lock(&self.num_refs, "num_refs") += data.num_refs;
        // Buffers (including any reserve) free with `data`.
    }

    /// Child side of a fork. Open files were closed on the fork, so the
    /// child needs a new output directory, module list, and thread file;
    /// reference counting restarts for the new process.
    fn fork_init(&self, host: &dyn HostRuntime, data: &mut PerThread) {
        data.num_refs = 0;
        if self.options.offline && self.init_offline_dir(host).is_err() {
            tracing::error!(outdir = %self.options.outdir, "failed to create a subdir");
            panic!()
        }
        data.file = None;
        self.init_thread_in_process(host, data);
    }

    /// Outstanding entries are written out before a syscall can observe (or
    /// end) the thread, unless a handoff owner is pacing the buffers.
    fn pre_syscall(
        &self,
        host: &dyn HostRuntime,
        data: &mut PerThread,
        sysnum: i64,
        params: &[u64],
    ) -> bool {
        if host.arch() == Arch::Arm && sysnum == SYS_CACHEFLUSH {
            // cacheflush params: start, end, flags.
            let start = params.first().copied().unwrap_or(0);
            let end = params.get(1).copied().unwrap_or(0);
            if end > start {
                data.append(|bytes| self.instru.append_iflush(bytes, start, (end - start) as usize));
            }
        }
        if self.handoff.is_none() {
            self.drain(data, false);
        }
        true
    }
}
