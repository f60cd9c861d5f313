//! Online-mode framing over the shared pipe.

mod common;

use common::{append_entry, parse_entries, OffsetPhys, TestHost, TestPipe};
use memtracer::entry::TraceType;
use memtracer::{Collaborators, Options, Tracer, TRACE_ENTRY_SIZE};
use runtime_api::{Arch, ThreadEvents};

fn online_options() -> Options {
    let mut options = Options::default();
    options.ipc_name = "memtrace-test".into();
    options
}

fn online_tracer(pipe: &TestPipe, options: Options, host: &TestHost) -> Tracer {
    let collaborators = Collaborators {
        pipe: Some(Box::new(pipe.clone())),
        ..Collaborators::default()
    };
    Tracer::new(host, options, collaborators).unwrap()
}

/// Instruction groups of one fetch plus two data refs, the common shape.
fn fill_groups(data: &mut memtracer::PerThread, groups: usize) {
    for i in 0..groups as u64 {
        append_entry(data, TraceType::Instr, 4, 0x40_0000 + i * 16);
        append_entry(data, TraceType::Read, 8, 0x7000_0000 + i * 64);
        append_entry(data, TraceType::Write, 8, 0x7100_0000 + i * 64);
    }
}

#[test]
fn thread_init_registers_over_the_pipe() {
    let pipe = TestPipe::new(4096);
    let host = TestHost::new(Arch::X86_64);
    let tracer = online_tracer(&pipe, online_options(), &host);
    let _data = tracer.thread_init(&host);

    let chunks = pipe.chunks();
    assert_eq!(chunks.len(), 1);
    let triple = parse_entries(&chunks[0]);
    assert_eq!(triple.len(), 3);
    assert_eq!(triple[0].0, TraceType::Header);
    assert_eq!(triple[1], (TraceType::Thread, 4, 42));
    assert_eq!(triple[2], (TraceType::Pid, 4, 7001));
}

#[test]
fn chunks_respect_atomic_size_and_carry_thread_tags() {
    // Five entries per atomic write.
    let pipe = TestPipe::new(5 * TRACE_ENTRY_SIZE);
    let host = TestHost::new(Arch::X86_64);
    let tracer = online_tracer(&pipe, online_options(), &host);
    let mut data = tracer.thread_init(&host);

    fill_groups(&mut data, 12);
    tracer.drain(&mut data, false);

    let chunks = pipe.chunks();
    assert!(chunks.len() > 2, "payload must have split");
    for chunk in &chunks[1..] {
        // Atomicity bound.
        assert!(chunk.len() <= 5 * TRACE_ENTRY_SIZE);
        let entries = parse_entries(chunk);
        // Thread-tag framing.
        assert_eq!(entries[0], (TraceType::Thread, 4, 42));
        // Splits happen only before instruction entries, so data entries
        // stay with their instruction.
        assert_eq!(entries[1].0, TraceType::Instr);
    }

    // Round trip: every emitted entry arrives exactly once.
    let all: Vec<_> = chunks[1..]
        .iter()
        .flat_map(|chunk| parse_entries(chunk))
        .collect();
    let instrs = all.iter().filter(|e| e.0 == TraceType::Instr).count();
    let reads = all.iter().filter(|e| e.0 == TraceType::Read).count();
    let writes = all.iter().filter(|e| e.0 == TraceType::Write).count();
    assert_eq!((instrs, reads, writes), (12, 12, 12));
}

#[test]
fn physical_rewrite_applies_only_to_translatable_addresses() {
    let pipe = TestPipe::new(4096);
    let host = TestHost::new(Arch::X86_64);
    let mut options = online_options();
    options.use_physical = true;
    let collaborators = Collaborators {
        pipe: Some(Box::new(pipe.clone())),
        phys: Some(Box::new(OffsetPhys {
            offset: 0x10_0000,
            limit: 0x8000_0000,
        })),
        ..Collaborators::default()
    };
    let tracer = Tracer::new(&host, options, collaborators).unwrap();
    let mut data = tracer.thread_init(&host);

    append_entry(&mut data, TraceType::Instr, 4, 0x40_0000);
    append_entry(&mut data, TraceType::Read, 8, 0x2000);
    append_entry(&mut data, TraceType::Read, 8, 0xffff_0000_0000);
    tracer.drain(&mut data, false);

    let chunks = pipe.chunks();
    let entries = parse_entries(&chunks[1]);
    assert_eq!(entries[0], (TraceType::Thread, 4, 42));
    // Translated: virtual plus the mapping offset.
    assert_eq!(entries[1], (TraceType::Instr, 4, 0x40_0000 + 0x10_0000));
    assert_eq!(entries[2], (TraceType::Read, 8, 0x2000 + 0x10_0000));
    // Untranslatable addresses stay virtual; the entry is never dropped.
    assert_eq!(entries[3], (TraceType::Read, 8, 0xffff_0000_0000));
}

#[test]
fn online_mode_requires_a_pipe_and_a_name() {
    let host = TestHost::new(Arch::X86_64);
    let mut options = online_options();
    options.ipc_name = String::new();
    assert!(Tracer::new(&host, options, Collaborators::default()).is_err());

    let options = online_options();
    assert!(Tracer::new(&host, options, Collaborators::default()).is_err());
}

#[test]
fn filter_geometry_must_be_power_of_two() {
    let pipe = TestPipe::new(4096);
    let host = TestHost::new(Arch::X86_64);
    let mut options = online_options();
    options.l0_filter = true;
    options.l0d_size = 48 * 1024; // 768 lines: not a power of two
    let collaborators = Collaborators {
        pipe: Some(Box::new(pipe.clone())),
        ..Collaborators::default()
    };
    assert!(Tracer::new(&host, options, collaborators).is_err());
}

#[test]
fn filter_thread_init_allocates_cache_arrays() {
    let pipe = TestPipe::new(4096);
    let host = TestHost::new(Arch::X86_64);
    let mut options = online_options();
    options.l0_filter = true;
    let tracer = online_tracer(&pipe, options, &host);
    let data = tracer.thread_init(&host);

    // Both cache arrays are published through the TLS slots for inline code.
    assert_ne!(data.tls_slot(runtime_api::TLS_OFFS_DCACHE), 0);
    assert_ne!(data.tls_slot(runtime_api::TLS_OFFS_ICACHE), 0);
    tracer.thread_exit(&host, data);
}
