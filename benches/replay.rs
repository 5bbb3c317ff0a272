use gcreplay::trace::{
    AllocKind, Allocation, GcKind, NativeDecoder, NativeHeader, ParserGcInfo, TraceWriter,
};
use gcreplay::symbols::{AllocatedType, AllocationSite, CallSite, TypeLayout};
use gcreplay::{sanity_trace, ParserConfig, ParsingInfo, RootPtr, Symbols, TraceParser};
use harness::{bench, Bencher};
use std::io::Cursor;
use std::sync::{Arc, Mutex};

const NONCE: u32 = 0x5eed;
const CYCLES: u64 = 32;
const OBJECTS_PER_CYCLE: u64 = 4096;

struct Context {
    trace: Vec<u8>,
    symbols: Arc<Symbols>,
}

static CONTEXT: Mutex<Option<Context>> = Mutex::new(None);

fn synthetic_symbols() -> Symbols {
    let mut symbols = Symbols::new(8).with_nonce(NONCE);
    symbols.insert_type(AllocatedType {
        id: 1,
        super_id: None,
        name: "bench/Node".to_string(),
        layout: TypeLayout::Instance { size: 24 },
        fields: vec![],
    });
    symbols.insert_site(AllocationSite {
        id: 1,
        allocated_type: Some(1),
        call_sites: vec![CallSite {
            declaring_type: "bench.Main".to_string(),
            method: "grow".to_string(),
            params: String::new(),
            bci: 0,
        }],
    });
    symbols
}

/// A linked heap where every cycle allocates a batch, promotes the even
/// objects and lets the odd ones die
fn synthetic_trace() -> Vec<u8> {
    let mut w = TraceWriter::new(NativeHeader::new(NONCE));
    let young = 0x1000_0000u64;
    let mut old = 0x8000_0000u64;
    for cycle in 1..=CYCLES {
        for i in 0..OBJECTS_PER_CYCLE {
            let addr = young + i * 32;
            w.alloc(&Allocation {
                addr,
                thread: 1,
                site: 1,
                type_id: 1,
                kind: AllocKind::C2,
                size: 24,
                array_length: None,
                is_mirror: false,
            });
            if i >= 2 {
                w.pointer(addr, 0, addr - 64);
            }
        }
        let gc = ParserGcInfo {
            id: cycle as u32,
            kind: if cycle % 8 == 0 { GcKind::Major } else { GcKind::Minor },
            cause: "Allocation Failure".to_string(),
            concurrent: false,
            failed: false,
            timestamp: cycle * 1000,
        };
        w.gc_start(&gc);
        w.roots(&[(RootPtr::JniGlobal { weak: false }, young)]);
        for i in 0..OBJECTS_PER_CYCLE {
            let addr = young + i * 32;
            if i % 2 == 0 {
                w.move_object(addr, old);
                old += 32;
            } else {
                w.die(addr);
            }
        }
        w.gc_end(&gc);
    }
    w.into_bytes()
}

fn startup() {
    let context = Context {
        trace: synthetic_trace(),
        symbols: Arc::new(synthetic_symbols()),
    };
    *CONTEXT.lock().unwrap() = Some(context);
}

fn teardown() {
    let _context = CONTEXT.lock().unwrap().take().unwrap();
}

#[bench(startup=startup, teardown=teardown)]
fn replay(b: &Bencher) {
    let guard = CONTEXT.lock().unwrap();
    let context = guard.as_ref().unwrap();
    let mut outcome = None;
    b.time(|| {
        let decoder = NativeDecoder::new(Cursor::new(context.trace.clone()), context.symbols.clone()).unwrap();
        let info = ParsingInfo {
            from: 0,
            to: context.trace.len() as u64,
            position: 0,
        };
        let parser = TraceParser::from_source(Box::new(decoder), context.symbols.clone(), ParserConfig::default(), info);
        outcome = Some(parser.run().unwrap());
    });
    let outcome = outcome.unwrap();
    b.add_stat("events", outcome.events);
    b.add_stat("cycles", outcome.cycles as u64);
    b.add_stat("live_objects", outcome.graph.len() as u64);
    b.add_stat("reachable_objects", sanity_trace(&outcome.graph).objects as u64);
    b.add_stat("violations", outcome.report.total());
}
