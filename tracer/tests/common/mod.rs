//! Shared collaborator doubles for the end-to-end tests.
#![allow(dead_code)] // each test binary uses its own subset

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use memtracer::entry::{self, TraceType, TRACE_ENTRY_SIZE};
use memtracer::PerThread;
use runtime_api::{
    Arch, BufferAllocator, ExpandError, FileOps, HostRuntime, InstrList, PhysTranslator, TracePipe,
};

pub struct TestHost {
    pub arch: Arch,
    pub tid: u32,
    pub pid: u32,
}

impl TestHost {
    pub fn new(arch: Arch) -> TestHost {
        TestHost {
            arch,
            tid: 42,
            pid: 7001,
        }
    }
}

impl HostRuntime for TestHost {
    fn arch(&self) -> Arch {
        self.arch
    }
    fn thread_id(&self) -> u32 {
        self.tid
    }
    fn process_id(&self) -> u32 {
        self.pid
    }
    fn app_name(&self) -> &str {
        "app"
    }
    fn expand_rep_string(&self, _bb: &mut InstrList) -> Result<bool, ExpandError> {
        Ok(false)
    }
}

/// In-memory filesystem honoring the write-require-new contract, shared
/// between the tracer and the assertions.
#[derive(Clone, Default)]
pub struct MemFs {
    inner: Arc<Mutex<MemFsInner>>,
}

#[derive(Default)]
struct MemFsInner {
    dirs: Vec<PathBuf>,
    files: HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>,
}

struct MemFile(Arc<Mutex<Vec<u8>>>);

impl Write for MemFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MemFs {
    pub fn dir_count(&self) -> usize {
        self.inner.lock().unwrap().dirs.len()
    }

    /// Contents of files whose name carries the given extension.
    pub fn files_with_extension(&self, ext: &str) -> Vec<(PathBuf, Vec<u8>)> {
        let inner = self.inner.lock().unwrap();
        let mut files: Vec<(PathBuf, Vec<u8>)> = inner
            .files
            .iter()
            .filter(|(path, _)| path.extension().is_some_and(|e| e == ext))
            .map(|(path, bytes)| (path.clone(), bytes.lock().unwrap().clone()))
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        files
    }

    pub fn single_file_with_extension(&self, ext: &str) -> Vec<u8> {
        let mut files = self.files_with_extension(ext);
        assert_eq!(files.len(), 1, "expected a single .{ext} file");
        files.pop().unwrap().1
    }
}

impl FileOps for MemFs {
    fn open_file(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.files.contains_key(path) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        let bytes = Arc::new(Mutex::new(Vec::new()));
        inner.files.insert(path.to_path_buf(), bytes.clone());
        Ok(Box::new(MemFile(bytes)))
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.dirs.iter().any(|d| d == path) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        inner.dirs.push(path.to_path_buf());
        Ok(())
    }
}

/// Pipe double recording every write as one chunk.
#[derive(Clone)]
pub struct TestPipe {
    pub atomic: usize,
    pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TestPipe {
    pub fn new(atomic: usize) -> TestPipe {
        TestPipe {
            atomic,
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }
}

impl TracePipe for TestPipe {
    fn atomic_write_size(&self) -> usize {
        self.atomic
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    fn maximize_buffer(&mut self) -> bool {
        true
    }
}

/// Allocator failing every request past a budget.
pub struct FlakyAllocator {
    budget: usize,
    count: AtomicUsize,
}

impl FlakyAllocator {
    pub fn new(budget: usize) -> FlakyAllocator {
        FlakyAllocator {
            budget,
            count: AtomicUsize::new(0),
        }
    }
}

impl BufferAllocator for FlakyAllocator {
    fn alloc_raw(&self, size: usize) -> Option<Box<[u8]>> {
        if self.count.fetch_add(1, Ordering::Relaxed) >= self.budget {
            return None;
        }
        Some(vec![0u8; size].into_boxed_slice())
    }
}

/// Translator adding a fixed offset below a limit, failing above it.
pub struct OffsetPhys {
    pub offset: u64,
    pub limit: u64,
}

impl PhysTranslator for OffsetPhys {
    fn virtual2physical(&self, virt: u64) -> u64 {
        if virt < self.limit {
            virt + self.offset
        } else {
            0
        }
    }
}

/// Append one entry at the write pointer the way inline code would.
pub fn append_entry(data: &mut PerThread, ty: TraceType, size: u16, addr: u64) {
    data.append(|bytes| {
        entry::write_entry(bytes, ty, size, addr);
        TRACE_ENTRY_SIZE
    });
}

pub fn parse_entries(bytes: &[u8]) -> Vec<(TraceType, u16, u64)> {
    assert_eq!(bytes.len() % TRACE_ENTRY_SIZE, 0);
    bytes
        .chunks(TRACE_ENTRY_SIZE)
        .map(|cell| {
            (
                entry::entry_type(cell).expect("known entry type"),
                entry::entry_size(cell),
                entry::entry_addr(cell),
            )
        })
        .collect()
}
