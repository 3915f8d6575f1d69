use quickcheck::{Arbitrary, Gen};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segalloc::{Address, AllocError, ArenaGrower, Config, Fit, SegAlloc, VecGrower};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    // Allocate this many bytes.
    Alloc(usize),

    // Allocate this many items of this many bytes each, zero filled.
    Calloc(usize, usize),

    // Resize the n^th allocation to this many bytes, or no-op if it has
    // already been freed. The allocation keeps its number.
    Realloc(usize, usize),

    // Free the n^th allocation we've made, or no-op if it has already been
    // freed.
    Free(usize),
}

pub use Operation::*;

// The default chunk size; large allocations span several of them.
const CHUNK: usize = 2048;

impl Operation {
    /// Whether this operation creates a new numbered allocation.
    pub fn allocates(&self) -> bool {
        matches!(*self, Alloc(_) | Calloc(..))
    }

    fn arbitrary_size(rng: &mut StdRng) -> usize {
        // Zero sized allocation 1/1000 times.
        if rng.gen_ratio(1, 1000) {
            return 0;
        }

        // Do a large allocation with probability P = 1/20.
        if rng.gen_ratio(1, 20) {
            return rng.gen_range(1..10) * CHUNK + rng.gen_range(0..CHUNK);
        }

        // Small allocation, half of them straddling a size class boundary.
        if rng.gen() {
            rng.gen_range(1..64)
        } else {
            let class = rng.gen_range(4..12);
            (1 << class) - 8 + rng.gen_range(0..8)
        }
    }

    fn arbitrary_free(rng: &mut StdRng, active_allocs: &mut Vec<usize>) -> Operation {
        assert!(!active_allocs.is_empty());
        let i = rng.gen_range(0..active_allocs.len());
        Free(active_allocs.swap_remove(i))
    }
}

fn parse_args(s: &str, name: &str) -> Option<Vec<usize>> {
    let args = s.strip_prefix(name)?.strip_prefix('(')?.strip_suffix("),")?;
    args.split(',').map(|n| n.trim().parse().ok()).collect()
}

impl FromStr for Operation {
    type Err = ();

    fn from_str(s: &str) -> Result<Operation, ()> {
        let s = s.trim();
        let parsed = [
            ("Alloc", 1),
            ("Calloc", 2),
            ("Realloc", 2),
            ("Free", 1),
        ]
        .iter()
        .find_map(|&(name, arity)| {
            parse_args(s, name)
                .filter(|args| args.len() == arity)
                .map(|args| (name, args))
        });

        match parsed {
            Some(("Alloc", args)) => Ok(Alloc(args[0])),
            Some(("Calloc", args)) => Ok(Calloc(args[0], args[1])),
            Some(("Realloc", args)) => Ok(Realloc(args[0], args[1])),
            Some(("Free", args)) => Ok(Free(args[0])),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Operations(pub Vec<Operation>);

impl FromStr for Operations {
    type Err = ();

    fn from_str(s: &str) -> Result<Operations, ()> {
        s.lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map(Operations)
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "extra_assertions")] {
        const NUM_OPERATIONS: usize = 1_000;
    } else {
        const NUM_OPERATIONS: usize = 10_000;
    }
}

// How often the runner stops to check the whole heap.
const CHECK_INTERVAL: usize = 500;

/// The number of the allocation made by the operation at `index`.
fn alloc_number(ops: &[Operation], index: usize) -> usize {
    ops[..index].iter().filter(|op| op.allocates()).count()
}

/// `ops` without the allocation made at `index`, nor any later use of it,
/// renumbering the allocations after it.
fn without_alloc(ops: &[Operation], index: usize) -> Vec<Operation> {
    let n = alloc_number(ops, index);
    ops.iter()
        .enumerate()
        .filter_map(|(j, op)| match *op {
            _ if j == index => None,
            Free(k) | Realloc(k, _) if k == n => None,
            Free(k) if k > n => Some(Free(k - 1)),
            Realloc(k, size) if k > n => Some(Realloc(k - 1, size)),
            op => Some(op),
        })
        .collect()
}

fn halved(op: Operation) -> Option<Operation> {
    match op {
        Alloc(n) if n > 0 => Some(Alloc(n / 2)),
        Calloc(count, size) if count > 1 => Some(Calloc(count / 2, size)),
        Realloc(k, n) if n > 0 => Some(Realloc(k, n / 2)),
        _ => None,
    }
}

impl Operations {
    /// A random trace of `NUM_OPERATIONS` operations, followed by frees of
    /// everything still live.
    pub fn generate(seed: u64) -> Operations {
        let mut rng = StdRng::seed_from_u64(seed);
        let rng = &mut rng;

        let mut num_allocs = 0;
        let mut active_allocs = vec![];
        let mut operations = Vec::with_capacity(NUM_OPERATIONS);

        for _ in 0..NUM_OPERATIONS {
            // Free with P = 1/3 so that the heap keeps growing, but
            // coalescing still gets plenty of work.
            if !active_allocs.is_empty() && rng.gen_ratio(1, 3) {
                operations.push(Operation::arbitrary_free(rng, &mut active_allocs));
            } else if !active_allocs.is_empty() && rng.gen_ratio(1, 10) {
                let n = active_allocs[rng.gen_range(0..active_allocs.len())];
                operations.push(Realloc(n, Operation::arbitrary_size(rng)));
            } else {
                active_allocs.push(num_allocs);
                num_allocs += 1;
                if rng.gen_ratio(1, 20) {
                    operations.push(Calloc(rng.gen_range(0..16), rng.gen_range(1..64)));
                } else {
                    operations.push(Alloc(Operation::arbitrary_size(rng)));
                }
            }
        }

        operations.reserve_exact(active_allocs.len());
        while !active_allocs.is_empty() {
            operations.push(Operation::arbitrary_free(rng, &mut active_allocs));
        }

        Operations(operations)
    }

    pub fn run_single_threaded(&self) {
        let mut heap = SegAlloc::new().unwrap();
        self.run_with_allocator(&mut heap);
    }

    pub fn run_best_fit(&self) {
        let config = Config::default().fit(Fit::BestFit);
        let mut heap = SegAlloc::init(VecGrower::new(), config).unwrap();
        self.run_with_allocator(&mut heap);
    }

    /// Each trace on its own heap, each heap on its own thread.
    pub fn run_multi_threaded(ops0: Operations, ops1: Operations, ops2: Operations, ops3: Operations) {
        use std::thread;

        let handles: Vec<_> = [ops0, ops1, ops2, ops3]
            .into_iter()
            .map(|ops| {
                let heap = SegAlloc::new().unwrap();
                thread::spawn(move || {
                    let mut heap = heap;
                    ops.run_with_allocator(&mut heap);
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                panic!("Thread {} Failed", i);
            }
        }
    }

    /// Run the trace against `heap`, shadowing every live allocation and
    /// asserting that the allocator never hands out overlapping, misaligned,
    /// or out of bounds memory, and never loses a byte of client data.
    pub fn run_with_allocator<G: ArenaGrower>(&self, heap: &mut SegAlloc<G>) {
        let mut shadow = Shadow::default();

        for (i, op) in self.0.iter().cloned().enumerate() {
            match op {
                Alloc(n) => {
                    let ptr = or_out_of_memory(heap.try_allocate(n));
                    shadow.push(heap, ptr, n);
                }
                Calloc(count, size) => {
                    let ptr = or_out_of_memory(heap.try_allocate_zeroed(count, size));
                    if let Some(ptr) = ptr {
                        let payload = heap.payload(ptr).unwrap();
                        assert!(payload.iter().all(|&b| b == 0), "{} is not zeroed", ptr);
                    }
                    shadow.push(heap, ptr, count * size);
                }
                Realloc(idx, n) => shadow.resize(heap, idx, n),
                Free(idx) => {
                    if let Some(live) = shadow.take(heap, idx) {
                        heap.release(Some(live.ptr)).unwrap();
                    }
                }
            }

            if i % CHECK_INTERVAL == 0 {
                heap.check_heap(&format!("after operation {}: {:?}", i, op))
                    .unwrap();
            }
        }

        let stats = heap.check_heap("end of trace").unwrap();
        assert_eq!(stats.allocated_blocks, shadow.ranges.len());
        assert_eq!(stats.arena_bytes, heap.arena_size());
    }

    /// Run the trace without any checking, for benchmarks.
    pub fn replay<G: ArenaGrower>(&self, heap: &mut SegAlloc<G>) {
        let mut allocs = vec![];
        for op in self.0.iter().cloned() {
            match op {
                Alloc(n) => allocs.push(heap.allocate(n)),
                Calloc(count, size) => allocs.push(heap.allocate_zeroed(count, size)),
                Realloc(idx, n) => {
                    if let Some(entry) = allocs.get_mut(idx) {
                        if entry.is_some() {
                            *entry = heap.resize(*entry, n);
                        }
                    }
                }
                Free(idx) => {
                    if let Some(entry) = allocs.get_mut(idx) {
                        let _ = heap.release(entry.take());
                    }
                }
            }
        }
    }

    const NUM_BUCKETS: u64 = 20;

    pub fn size_histogram(&self) -> histo::Histogram {
        let mut histogram = histo::Histogram::with_buckets(Self::NUM_BUCKETS);
        for op in &self.0 {
            let n = match *op {
                Alloc(n) | Realloc(_, n) => n,
                Calloc(count, size) => count * size,
                Free(_) => continue,
            };
            let n = (n as f64).log2().round();
            histogram.add(n as u64);
        }
        histogram
    }

    pub fn lifetime_histogram(&self) -> histo::Histogram {
        let mut histogram = histo::Histogram::with_buckets(Self::NUM_BUCKETS);
        let mut born = vec![];
        for (i, op) in self.0.iter().enumerate() {
            if op.allocates() {
                born.push(i);
            } else if let Free(n) = *op {
                if let Some(&j) = born.get(n) {
                    histogram.add((i - j) as u64);
                }
            }
        }
        histogram
    }
}

impl Arbitrary for Operations {
    #[inline(never)]
    fn arbitrary(g: &mut Gen) -> Operations {
        // Drawing every decision from `Gen` is slower than the allocator
        // under test, so only the seed comes from it.
        Operations::generate(u64::arbitrary(g))
    }

    #[inline(never)]
    fn shrink(&self) -> Box<dyn Iterator<Item = Operations>> {
        let ops = self.0.clone();
        let prefixes =
            (0..self.0.len()).map(move |i| Operations(ops.iter().cloned().take(i).collect()));

        let free_indices: Vec<_> = self
            .0
            .iter()
            .enumerate()
            .filter_map(|(i, op)| if let Free(_) = *op { Some(i) } else { None })
            .collect();

        let ops = self.0.clone();
        let without_frees = free_indices.into_iter().map(move |i| {
            Operations(
                ops.iter()
                    .enumerate()
                    .filter_map(|(j, op)| if i == j { None } else { Some(*op) })
                    .collect(),
            )
        });

        let alloc_indices: Vec<_> = self
            .0
            .iter()
            .enumerate()
            .filter_map(|(i, op)| if op.allocates() { Some(i) } else { None })
            .collect();

        let ops = self.0.clone();
        let without_allocs = alloc_indices
            .into_iter()
            .map(move |i| Operations(without_alloc(&ops, i)));

        let ops = self.0.clone();
        let smaller = (0..self.0.len()).filter_map(move |i| {
            let op = halved(ops[i])?;
            let mut ops = ops.clone();
            ops[i] = op;
            Some(Operations(ops))
        });

        Box::new(
            prefixes
                .chain(without_frees)
                .chain(without_allocs)
                .chain(smaller),
        )
    }
}

fn or_out_of_memory(result: Result<Option<Address>, AllocError>) -> Option<Address> {
    match result {
        Ok(ptr) => ptr,
        Err(AllocError::OutOfMemory { .. }) => None,
        Err(e) => panic!("unexpected allocator error: {}", e),
    }
}

#[derive(Debug, Clone, Copy)]
struct Live {
    ptr: Address,
    len: usize,
    fill: u8,
}

/// What the client believes the heap holds.
#[derive(Default)]
struct Shadow {
    // Indexed by allocation number; `None` once freed, or if it never
    // succeeded.
    allocs: Vec<Option<Live>>,
    // Usable payload ranges of live allocations, start to end.
    ranges: BTreeMap<usize, usize>,
}

impl Shadow {
    fn push<G: ArenaGrower>(&mut self, heap: &mut SegAlloc<G>, ptr: Option<Address>, len: usize) {
        let fill = (self.allocs.len() as u8).wrapping_mul(31) | 1;
        let live = ptr.map(|ptr| self.claim(heap, Live { ptr, len, fill }));
        self.allocs.push(live);
    }

    /// Check a fresh allocation against every live one, then fill its
    /// payload with its pattern.
    fn claim<G: ArenaGrower>(&mut self, heap: &mut SegAlloc<G>, live: Live) -> Live {
        let start = live.ptr.offset();
        assert_eq!(start % 8, 0, "{} is misaligned", live.ptr);

        let usable = heap.usable_size(live.ptr).unwrap();
        assert!(usable >= live.len, "{} holds {} < {}", live.ptr, usable, live.len);
        let end = start + usable;
        let bounds = heap.heap_bounds();
        assert!(bounds.start <= start && end <= bounds.end, "{} out of bounds", live.ptr);

        if let Some((&prev_start, &prev_end)) = self.ranges.range(..start).next_back() {
            assert!(
                prev_end <= start,
                "{} overlaps {:#x}..{:#x}",
                live.ptr,
                prev_start,
                prev_end
            );
        }
        if let Some((&next_start, &next_end)) = self.ranges.range(start..).next() {
            assert!(
                end <= next_start,
                "{} overlaps {:#x}..{:#x}",
                live.ptr,
                next_start,
                next_end
            );
        }
        self.ranges.insert(start, end);

        heap.payload_mut(live.ptr).unwrap()[..live.len].fill(live.fill);
        live
    }

    /// Forget allocation `idx`, checking its bytes survived untouched.
    fn take<G: ArenaGrower>(&mut self, heap: &SegAlloc<G>, idx: usize) -> Option<Live> {
        let live = self.allocs.get_mut(idx)?.take()?;
        let payload = heap.payload(live.ptr).unwrap();
        assert!(
            payload[..live.len].iter().all(|&b| b == live.fill),
            "allocation {} at {} was clobbered",
            idx,
            live.ptr
        );
        self.ranges.remove(&live.ptr.offset());
        Some(live)
    }

    fn resize<G: ArenaGrower>(&mut self, heap: &mut SegAlloc<G>, idx: usize, len: usize) {
        let live = match self.take(heap, idx) {
            Some(live) => live,
            None => return,
        };

        match heap.try_resize(Some(live.ptr), len) {
            Ok(Some(ptr)) => {
                let kept = live.len.min(len);
                let payload = heap.payload(ptr).unwrap();
                assert!(
                    payload[..kept].iter().all(|&b| b == live.fill),
                    "resize of allocation {} lost data",
                    idx
                );
                let moved = self.claim(heap, Live { ptr, len, ..live });
                self.allocs[idx] = Some(moved);
            }
            Ok(None) => assert_eq!(len, 0),
            Err(AllocError::OutOfMemory { .. }) => {
                // The old allocation must be untouched.
                let kept = self.claim(heap, live);
                self.allocs[idx] = Some(kept);
            }
            Err(e) => panic!("unexpected allocator error: {}", e),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

macro_rules! run_quickchecks {
    ($name:ident) => {
        #[test]
        fn $name() {
            fn single_threaded(ops: Operations) {
                ops.run_single_threaded();
            }

            init_logger();
            quickcheck::QuickCheck::new()
                .tests(1)
                .quickcheck(single_threaded as fn(Operations));
        }
    };
}

// Let the test harness run each of our single threaded quickchecks concurrently
// with each other.
run_quickchecks!(quickchecks_0);
run_quickchecks!(quickchecks_1);
run_quickchecks!(quickchecks_2);
run_quickchecks!(quickchecks_3);

#[test]
fn best_fit_quickchecks() {
    fn best_fit(ops: Operations) {
        ops.run_best_fit();
    }

    init_logger();
    quickcheck::QuickCheck::new()
        .tests(1)
        .quickcheck(best_fit as fn(Operations));
}

#[test]
fn multi_threaded_quickchecks() {
    init_logger();
    quickcheck::QuickCheck::new().tests(1).quickcheck(
        Operations::run_multi_threaded as fn(Operations, Operations, Operations, Operations),
    );
}

#[cfg(test)]
mod quickchecks {
    use super::*;

    quickcheck::quickcheck! {
        fn single_allocation_with_size(size: usize) -> bool {
            let size = size % 65536;
            let mut heap = SegAlloc::new().unwrap();
            match heap.allocate(size) {
                Some(ptr) => heap.usable_size(ptr).unwrap() >= size && ptr.offset() % 8 == 0,
                None => size == 0,
            }
        }

        fn allocate_then_release_leaves_one_free_block(sizes: Vec<u16>) -> bool {
            let mut heap = SegAlloc::new().unwrap();
            let ptrs: Vec<_> = sizes.iter().map(|&n| heap.allocate(n as usize)).collect();
            for ptr in ptrs {
                heap.release(ptr).unwrap();
            }
            let stats = heap.check_heap("released everything").unwrap();
            stats.allocated_blocks == 0 && stats.free_blocks == 1
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

#[test]
fn parse_trace() {
    let ops: Operations = "Alloc(16),\nCalloc(4, 8),\nRealloc(0, 100),\nFree(1),\n"
        .parse()
        .unwrap();
    assert_eq!(ops.0, vec![Alloc(16), Calloc(4, 8), Realloc(0, 100), Free(1)]);
    ops.run_single_threaded();

    assert!("Alloc(16)".parse::<Operation>().is_err());
    assert!("Free(1, 2),".parse::<Operation>().is_err());
}

#[test]
fn shrinking_drops_dependent_operations() {
    let ops = vec![Alloc(8), Alloc(16), Realloc(1, 32), Free(0), Free(1)];
    assert_eq!(without_alloc(&ops, 0), vec![Alloc(16), Realloc(0, 32), Free(0)]);
    assert_eq!(without_alloc(&ops, 1), vec![Alloc(8), Free(0)]);
}

#[test]
fn regression_test_0() {
    Operations(vec![Alloc(1)]).run_single_threaded();
}

#[test]
fn regression_test_1() {
    Operations(vec![Alloc(1414), Free(0), Alloc(1414), Free(1)]).run_single_threaded();
}

#[test]
fn regression_test_2() {
    Operations(vec![Alloc(168), Free(0), Alloc(0), Alloc(168), Free(2)]).run_single_threaded();
}

#[test]
fn regression_test_3() {
    Operations(vec![Alloc(13672), Free(0), Alloc(1)]).run_single_threaded();
}

#[test]
fn realloc_chain() {
    Operations(vec![
        Alloc(40),
        Alloc(40),
        Alloc(40),
        Free(1),
        Realloc(0, 80),
        Realloc(0, 20),
        Realloc(0, 5000),
        Realloc(2, 0),
        Free(0),
    ])
    .run_single_threaded();
}

#[test]
fn allocate_size_zero() {
    use std::iter;
    Operations(
        iter::repeat(Alloc(0))
            .take(1000)
            .chain((0..1000).map(Free))
            .collect(),
    )
    .run_single_threaded();
}

#[test]
fn allocate_many_small() {
    use std::iter;

    Operations(
        iter::repeat(Alloc(64))
            .take(100)
            .chain((0..100).map(Free))
            .chain(iter::repeat(Alloc(1024)).take(100))
            .chain((0..100).map(|i| Free(i + 100)))
            .collect(),
    )
    .run_single_threaded();
}

#[test]
fn allocate_many_large() {
    use std::iter;

    Operations(
        iter::repeat(Alloc(2056))
            .take(100)
            .chain((0..100).map(Free))
            .chain(iter::repeat(Alloc(8192)).take(100))
            .chain((0..100).map(|i| Free(i + 100)))
            .collect(),
    )
    .run_single_threaded();
}

#[test]
fn exhausting_a_small_arena() {
    use segalloc::Bytes;

    init_logger();

    let mut heap = SegAlloc::init(VecGrower::with_limit(Bytes(64 * 1024)), Config::default())
        .unwrap();
    Operations(
        std::iter::repeat(Alloc(4000))
            .take(40)
            .chain((0..40).map(Free))
            .chain(std::iter::repeat(Alloc(4000)).take(10))
            .collect(),
    )
    .run_with_allocator(&mut heap);
}

// This takes too long with our extra assertion checks enabled.
#[test]
#[cfg(not(feature = "extra_assertions"))]
fn stress() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(0x5ea1_a110c);
    let mut heap = SegAlloc::new().unwrap();
    let mut ptrs: Vec<(Address, usize)> = Vec::new();

    for _ in 0..20_000 {
        let free = !ptrs.is_empty()
            && ((ptrs.len() < 1_000 && rng.gen_ratio(1, 3)) || rng.gen());
        if free {
            let idx = rng.gen_range(0..ptrs.len());
            let (ptr, _) = ptrs.swap_remove(idx);
            heap.release(Some(ptr)).unwrap();
            continue;
        }

        if !ptrs.is_empty() && rng.gen_ratio(1, 100) {
            let idx = rng.gen_range(0..ptrs.len());
            let (ptr, old) = ptrs.swap_remove(idx);
            let new = if rng.gen() {
                rng.gen_range(old..old * 2)
            } else if old > 10 {
                rng.gen_range(old / 2..old)
            } else {
                ptrs.push((ptr, old));
                continue;
            };
            let tmp = heap.payload(ptr).unwrap()[..old.min(new)].to_vec();
            let ptr = heap.resize(Some(ptr), new).unwrap();
            assert_eq!(&heap.payload(ptr).unwrap()[..tmp.len()], &tmp[..]);
            ptrs.push((ptr, new));
        }

        let size = if rng.gen() {
            rng.gen_range(1..128)
        } else {
            rng.gen_range(1..8 * 1024)
        };
        let zero = rng.gen_ratio(1, 50);
        let ptr = if zero {
            heap.allocate_zeroed(1, size).unwrap()
        } else {
            heap.allocate(size).unwrap()
        };
        let payload = &mut heap.payload_mut(ptr).unwrap()[..size];
        if zero {
            assert!(payload.iter().all(|&b| b == 0));
        }
        payload.fill(0xce);
        ptrs.push((ptr, size));
    }

    let stats = heap.check_heap("stress").unwrap();
    assert_eq!(stats.allocated_blocks, ptrs.len());

    for (ptr, _) in ptrs.drain(..) {
        heap.release(Some(ptr)).unwrap();
    }
    let stats = heap.check_heap("stress, all released").unwrap();
    assert_eq!((stats.allocated_blocks, stats.free_blocks), (0, 1));
}
