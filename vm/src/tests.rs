//! End-to-end behaviour of the subsystem on a simulated machine.

use crate::address_space::{AddressSpace, ProcessMemory};
use crate::block::{BlockDevice, RamDisk};
use crate::file::test::MemoryFile;
use crate::frame_table::FrameId;
use crate::mem::{PhysicalAllocator, UserPool};
use crate::paging::SoftPageTable;
use crate::{
    init, page_fault, system, Backing, FaultContext, FaultKind, FileBacking, Pid, Result, Tid,
    VmConfig, VmError, VmSystem,
};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use kidneyos_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};

const BASE: usize = 0x0804_8000;

fn page(i: usize) -> usize {
    BASE + i * PAGE_FRAME_SIZE
}

fn pattern(seed: usize) -> Vec<u8> {
    (0..PAGE_FRAME_SIZE)
        .map(|i| ((i + seed * 31) % 251) as u8)
        .collect()
}

fn machine(frames: usize, swap_slots: u32) -> (Arc<VmSystem>, Arc<UserPool>) {
    let pool = Arc::new(UserPool::new(frames));
    let swap = (swap_slots > 0)
        .then(|| Box::new(RamDisk::new(swap_slots * SECTORS_PER_PAGE)) as Box<dyn BlockDevice>);
    let vm = Arc::new(VmSystem::new(VmConfig::default(), pool.clone(), swap));
    (vm, pool)
}

struct Process {
    space: AddressSpace,
    mapper: Arc<SoftPageTable>,
    tid: Tid,
}

impl Process {
    fn new(vm: &Arc<VmSystem>, pool: &Arc<UserPool>, pid: Pid) -> Self {
        let mapper = Arc::new(SoftPageTable::new(pool.clone()));
        Self {
            space: AddressSpace::new(vm.clone(), pid, mapper.clone()),
            mapper,
            tid: pid,
        }
    }

    fn ctx(&self) -> FaultContext {
        self.ctx_for(self.tid)
    }

    fn ctx_for(&self, tid: Tid) -> FaultContext {
        FaultContext {
            tid,
            esp: self.space.vm().config().user_top,
        }
    }

    fn zero_pages(&self, count: usize) {
        for i in 0..count {
            self.space.register(page(i), true, Backing::Zero).unwrap();
        }
    }

    /// Loads from user memory, faulting pages in as the processor would.
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        self.read_as(self.tid, addr, buf)
    }

    fn write(&self, addr: usize, buf: &[u8]) -> Result<()> {
        self.write_as(self.tid, addr, buf)
    }

    /// Like [`read`](Self::read), from thread `tid` of this process.
    fn read_as(&self, tid: Tid, addr: usize, buf: &mut [u8]) -> Result<()> {
        for _ in 0..1000 {
            if self.mapper.read_user(addr, buf) {
                return Ok(());
            }
            self.space.fault(addr, &self.ctx_for(tid))?;
        }
        panic!("read at {addr:#X} keeps faulting");
    }

    fn write_as(&self, tid: Tid, addr: usize, buf: &[u8]) -> Result<()> {
        for _ in 0..1000 {
            if self.mapper.write_user(addr, buf) {
                return Ok(());
            }
            self.space.fault(addr, &self.ctx_for(tid))?;
        }
        panic!("write at {addr:#X} keeps faulting");
    }

    fn read_page(&self, i: usize) -> Vec<u8> {
        let mut buf = vec![0; PAGE_FRAME_SIZE];
        self.read(page(i), &mut buf).unwrap();
        buf
    }
}

/// Checks that frames and resident pages correspond one to one, that no
/// page is both resident and swapped, and that swap and pool accounting
/// agree with the pages.
fn check_invariants(vm: &VmSystem, spaces: &[&AddressSpace]) {
    let frames: Vec<(FrameId, Arc<ProcessMemory>, usize)> = vm
        .frames
        .lock()
        .iter()
        .map(|(id, frame)| (id, frame.memory.clone(), frame.vaddr()))
        .collect();

    for (id, memory, vaddr) in &frames {
        let pages = memory.pages.lock();
        let page = pages.as_ref().unwrap().lookup(*vaddr).unwrap();
        assert_eq!(page.frame(), Some(*id), "frame {id} points at {vaddr:#X}");
    }

    let (mut resident, mut swapped) = (0, 0);
    for space in spaces {
        let pages = space.memory().pages.lock();
        for page in pages.as_ref().unwrap().iter() {
            assert!(!(page.is_resident() && page.is_swapped()));
            if let Some(id) = page.frame() {
                resident += 1;
                assert!(frames.iter().any(|(other, memory, vaddr)| {
                    *other == id && *vaddr == page.vaddr() && Arc::ptr_eq(memory, space.memory())
                }));
            }
            if let Some(slot) = page.slot() {
                swapped += 1;
                assert!(vm.swap.lock().is_slot_used(slot));
            }
        }
    }

    assert_eq!(resident, frames.len());
    assert_eq!(vm.swap_slots() - vm.free_swap_slots(), swapped);
    assert_eq!(vm.memory.capacity() - vm.free_frames(), frames.len());
}

#[test]
fn first_touch_is_zero_filled() {
    let (vm, pool) = machine(4, 0);
    let p = Process::new(&vm, &pool, 1);
    p.zero_pages(1);

    assert_eq!(p.space.fault(page(0) + 123, &p.ctx()), Ok(FaultKind::Load));
    assert!(p.read_page(0).iter().all(|&b| b == 0));
    assert_eq!(p.space.resident_pages(), 1);
    assert!(p.space.lookup(page(0) + 5).unwrap().is_resident());
    check_invariants(&vm, &[&p.space]);
}

#[test]
fn fault_on_resident_page_remaps() {
    let (vm, pool) = machine(4, 0);
    let p = Process::new(&vm, &pool, 1);
    p.zero_pages(1);
    p.write(page(0), &[42]).unwrap();

    assert_eq!(p.space.fault(page(0), &p.ctx()), Ok(FaultKind::Remap));
    // The mapping, and with it the dirty bit, survives.
    assert!(crate::paging::PageMapper::is_dirty(&*p.mapper, page(0)));
    assert_eq!(vm.resident_frames(), 1);
}

#[test]
fn unregistered_address_is_a_segfault() {
    let (vm, pool) = machine(4, 0);
    let p = Process::new(&vm, &pool, 1);

    assert_eq!(
        p.space.fault(page(3), &p.ctx()),
        Err(VmError::SegmentationFault)
    );
    assert!(!page_fault(&p.space, page(3), &p.ctx()));
    // Kernel addresses never grow the stack.
    let ctx = FaultContext { tid: 1, esp: 0x8000_1000 };
    assert_eq!(
        p.space.fault(0x8000_0010, &ctx),
        Err(VmError::SegmentationFault)
    );
    assert_eq!(vm.resident_frames(), 0);
}

#[test]
fn duplicate_registration_fails() {
    let (vm, pool) = machine(1, 0);
    let p = Process::new(&vm, &pool, 1);
    p.zero_pages(1);
    assert_eq!(
        p.space.register(page(0) + 8, false, Backing::Zero),
        Err(VmError::AlreadyMapped)
    );
}

#[test]
fn stack_grows_within_slack_of_esp() {
    let (vm, pool) = machine(4, 0);
    let p = Process::new(&vm, &pool, 1);
    let esp = vm.config().user_top - PAGE_FRAME_SIZE;
    let ctx = FaultContext { tid: 1, esp };

    assert_eq!(p.space.fault(esp - 64, &ctx), Err(VmError::SegmentationFault));
    assert_eq!(p.space.fault(esp - 31, &ctx), Ok(FaultKind::StackGrowth));

    let page = p.space.lookup(esp - 31).unwrap();
    assert!(page.writable() && page.is_resident());
    assert!(matches!(page.backing(), Backing::Zero));
    assert_eq!(vm.stats().stack_growths, 1);
    check_invariants(&vm, &[&p.space]);
}

#[test]
fn stack_cannot_grow_past_its_limit() {
    let (vm, pool) = machine(4, 0);
    let p = Process::new(&vm, &pool, 1);
    let below = vm.config().stack_bottom() - 4;
    let ctx = FaultContext { tid: 1, esp: below };
    assert_eq!(p.space.fault(below, &ctx), Err(VmError::SegmentationFault));
}

#[test]
fn dirty_pages_round_trip_through_swap() {
    let (vm, pool) = machine(1, 8);
    let p = Process::new(&vm, &pool, 1);
    p.zero_pages(3);

    let contents = [vec![0; PAGE_FRAME_SIZE], vec![0xFF; PAGE_FRAME_SIZE], pattern(3)];
    for (i, data) in contents.iter().enumerate() {
        p.write(page(i), data).unwrap();
        check_invariants(&vm, &[&p.space]);
    }
    assert_eq!(p.space.resident_pages(), 1);
    assert_eq!(p.space.swapped_pages(), 2);

    for (i, data) in contents.iter().enumerate() {
        assert_eq!(&p.read_page(i), data, "page {i}");
        check_invariants(&vm, &[&p.space]);
    }

    let stats = vm.stats();
    assert_eq!(stats.swap_ins, 3);
    assert_eq!(stats.swap_outs, 5);
    assert_eq!(stats.clean_discards, 0);
}

#[test]
fn swapped_in_page_is_never_discarded() {
    let (vm, pool) = machine(1, 4);
    let p = Process::new(&vm, &pool, 1);
    p.zero_pages(2);

    p.write(page(0), &pattern(1)).unwrap();
    p.read_page(1);
    // Swapped back in and only read, so the frame looks clean.
    assert_eq!(p.read_page(0), pattern(1));
    p.read_page(1);
    assert_eq!(p.read_page(0), pattern(1));
    check_invariants(&vm, &[&p.space]);
}

#[test]
fn clean_pages_are_reclaimed_without_io() {
    let (vm, pool) = machine(1, 0);
    let p = Process::new(&vm, &pool, 1);
    p.zero_pages(3);

    for round in 0..2 {
        for i in 0..3 {
            assert!(p.read_page(i).iter().all(|&b| b == 0), "round {round} page {i}");
            check_invariants(&vm, &[&p.space]);
        }
    }

    assert_eq!(vm.swap_io(), (0, 0));
    assert_eq!(vm.stats().clean_discards, 5);
    assert_eq!(p.space.resident_pages(), 1);
    assert_eq!(p.space.swapped_pages(), 0);
}

#[test]
fn exhaustion_without_swap() {
    let (vm, pool) = machine(1, 0);
    let p = Process::new(&vm, &pool, 1);
    p.zero_pages(2);
    p.write(page(0), &[1, 2, 3]).unwrap();

    let err = p.space.fault(page(1), &p.ctx()).unwrap_err();
    assert_eq!(err, VmError::NoVictimAvailable);
    assert!(err.is_fatal());
    assert_eq!(p.space.evict(page(0), p.tid), Err(VmError::SwapExhausted));

    // Nothing moved.
    let mut buf = [0; 3];
    assert!(p.mapper.read_user(page(0), &mut buf));
    assert_eq!(buf, [1, 2, 3]);
    check_invariants(&vm, &[&p.space]);
}

#[test]
#[should_panic(expected = "unrecoverable page fault")]
fn page_fault_halts_when_out_of_memory() {
    let (vm, pool) = machine(1, 0);
    let p = Process::new(&vm, &pool, 1);
    p.zero_pages(2);
    p.write(page(0), &[1]).unwrap();
    page_fault(&p.space, page(1), &p.ctx());
}

#[test]
fn file_pages_load_and_zero_fill() {
    let (vm, pool) = machine(2, 0);
    let p = Process::new(&vm, &pool, 1);
    let file = Arc::new(MemoryFile::new(&[0x5A; 300]));
    p.space
        .register(page(0), false, Backing::File(FileBacking::new(file.clone(), 100, 200, false)))
        .unwrap();

    let data = p.read_page(0);
    assert!(data[..200].iter().all(|&b| b == 0x5A));
    assert!(data[200..].iter().all(|&b| b == 0));
    // Read only.
    assert!(!p.mapper.write_user(page(0), &[1]));
}

#[test]
fn short_file_read_kills_the_process() {
    let (vm, pool) = machine(2, 0);
    let p = Process::new(&vm, &pool, 1);
    let file = Arc::new(MemoryFile::new(&[1; 100]));
    p.space
        .register(page(0), true, Backing::File(FileBacking::new(file, 0, 200, false)))
        .unwrap();

    assert_eq!(p.space.fault(page(0), &p.ctx()), Err(VmError::ShortRead));
    assert!(!page_fault(&p.space, page(0), &p.ctx()));
    assert_eq!(vm.free_frames(), 2);
    check_invariants(&vm, &[&p.space]);
}

#[test]
fn dirty_file_pages_are_written_back() {
    let (vm, pool) = machine(1, 0);
    let p = Process::new(&vm, &pool, 1);
    let file = Arc::new(MemoryFile::new(&[1; PAGE_FRAME_SIZE]));
    let backing = FileBacking::new(file.clone(), 0, PAGE_FRAME_SIZE, true);
    p.space.register(page(0), true, Backing::File(backing)).unwrap();
    p.space.register(page(1), true, Backing::Zero).unwrap();

    p.write(page(0) + 10, &[9, 9]).unwrap();
    p.read_page(1);
    assert_eq!(&file.contents()[8..14], [1, 1, 9, 9, 1, 1]);
    assert_eq!(vm.stats().write_backs, 1);

    assert_eq!(&p.read_page(0)[8..14], [1, 1, 9, 9, 1, 1]);
    assert_eq!(vm.swap_io(), (0, 0));
    check_invariants(&vm, &[&p.space]);
}

#[test]
fn dirty_private_file_pages_go_to_swap() {
    let (vm, pool) = machine(1, 2);
    let p = Process::new(&vm, &pool, 1);
    let file = Arc::new(MemoryFile::new(&[1; 64]));
    let backing = FileBacking::new(file.clone(), 0, 64, false);
    p.space.register(page(0), true, Backing::File(backing)).unwrap();
    p.space.register(page(1), true, Backing::Zero).unwrap();

    p.write(page(0), &[7]).unwrap();
    p.read_page(1);
    assert_eq!(p.space.swapped_pages(), 1);
    assert_eq!(file.contents(), [1; 64]);

    let data = p.read_page(0);
    assert_eq!(data[0], 7);
    assert!(data[1..64].iter().all(|&b| b == 1));
}

#[test]
fn unmap_releases_frame_and_slot() {
    let (vm, pool) = machine(1, 4);
    let p = Process::new(&vm, &pool, 1);
    p.zero_pages(2);
    p.write(page(0), &[1]).unwrap();
    p.write(page(1), &[2]).unwrap();
    assert_eq!(vm.free_swap_slots(), 3);

    p.space.unmap(page(0), p.tid);
    assert_eq!(vm.free_swap_slots(), 4);
    p.space.unmap(page(1), p.tid);
    assert_eq!(vm.free_frames(), 1);
    assert!(p.space.lookup(page(1)).is_none());

    // Unmapping twice is harmless.
    p.space.unmap(page(1), p.tid);
    check_invariants(&vm, &[&p.space]);
}

#[test]
fn unmap_writes_back_dirty_file_page() {
    let (vm, pool) = machine(2, 0);
    let p = Process::new(&vm, &pool, 1);
    let file = Arc::new(MemoryFile::new(&[0; 16]));
    let backing = FileBacking::new(file.clone(), 0, 16, true);
    p.space.register(page(0), true, Backing::File(backing)).unwrap();

    p.write(page(0) + 4, &[3]).unwrap();
    p.space.unmap(page(0), p.tid);
    assert_eq!(file.contents()[4], 3);
    assert_eq!(vm.free_frames(), 2);
}

#[test]
fn exit_releases_everything() {
    let (vm, pool) = machine(2, 8);
    let p = Process::new(&vm, &pool, 1);
    p.zero_pages(5);
    for i in 0..5 {
        p.write(page(i), &pattern(i)).unwrap();
    }
    assert_eq!(vm.free_frames(), 0);
    assert_eq!(vm.free_swap_slots(), 5);

    p.space.exit(p.tid);
    assert_eq!(vm.free_frames(), 2);
    assert_eq!(vm.free_swap_slots(), 8);
    assert_eq!(vm.resident_frames(), 0);
    assert_eq!(p.space.fault(page(0), &p.ctx()), Err(VmError::NoPageTable));
    assert_eq!(
        p.space.register(page(9), true, Backing::Zero),
        Err(VmError::NoPageTable)
    );
    assert_eq!(p.space.resident_pages(), 0);
}

/// Registers a write-back file page at `page(0)` and dirties its first byte.
fn dirty_file_page(p: &Process) -> Arc<MemoryFile> {
    let file = Arc::new(MemoryFile::new(&[0; 16]));
    let backing = FileBacking::new(file.clone(), 0, 16, true);
    p.space.register(page(0), true, Backing::File(backing)).unwrap();
    p.write(page(0), &[5]).unwrap();
    file
}

#[test]
fn exit_write_back_waits_for_file_lock() {
    let (vm, pool) = machine(2, 0);
    let p = Process::new(&vm, &pool, 1);
    let file = dirty_file_page(&p);

    // Thread 2 of the process is in the middle of file I/O.
    let held = vm.file_lock.lock(2);
    let done = AtomicBool::new(false);
    let (finished_early, written_early) = std::thread::scope(|scope| {
        scope.spawn(|| {
            p.space.exit(3);
            done.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(50));
        let observed = (done.load(Ordering::SeqCst), file.contents()[0]);
        drop(held);
        observed
    });

    assert!(!finished_early);
    assert_eq!(written_early, 0);
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(file.contents()[0], 5);
    assert_eq!(vm.free_frames(), 2);
}

#[test]
fn exit_from_file_lock_holder_recurses() {
    let (vm, pool) = machine(2, 0);
    let p = Process::new(&vm, &pool, 1);
    let file = dirty_file_page(&p);

    let _held = vm.file_lock.lock(p.tid);
    p.space.exit(p.tid);
    assert_eq!(file.contents()[0], 5);
}

#[test]
fn drop_write_back_waits_for_file_lock() {
    let (vm, pool) = machine(2, 0);
    let p = Process::new(&vm, &pool, 1);
    let file = dirty_file_page(&p);

    // The thread that would have been charged for the I/O holds the lock.
    let held = vm.file_lock.lock(p.tid);
    let done = AtomicBool::new(false);
    let (finished_early, written_early) = std::thread::scope(|scope| {
        let done = &done;
        scope.spawn(move || {
            drop(p);
            done.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(50));
        let observed = (done.load(Ordering::SeqCst), file.contents()[0]);
        drop(held);
        observed
    });

    assert!(!finished_early);
    assert_eq!(written_early, 0);
    assert_eq!(file.contents()[0], 5);
    assert!(!vm.file_lock.is_locked());
}

#[test]
fn dropping_the_address_space_exits() {
    let (vm, pool) = machine(2, 8);
    let p = Process::new(&vm, &pool, 1);
    p.zero_pages(3);
    for i in 0..3 {
        p.write(page(i), &[1]).unwrap();
    }
    drop(p);
    assert_eq!(vm.free_frames(), 2);
    assert_eq!(vm.free_swap_slots(), 8);
}

#[test]
fn processes_evict_each_other() {
    let (vm, pool) = machine(2, 8);
    let a = Process::new(&vm, &pool, 1);
    let b = Process::new(&vm, &pool, 2);
    a.zero_pages(2);
    b.zero_pages(2);

    for i in 0..2 {
        a.write(page(i), &pattern(i)).unwrap();
        b.write(page(i), &pattern(10 + i)).unwrap();
        check_invariants(&vm, &[&a.space, &b.space]);
    }
    for i in 0..2 {
        assert_eq!(b.read_page(i), pattern(10 + i));
        assert_eq!(a.read_page(i), pattern(i));
    }
    check_invariants(&vm, &[&a.space, &b.space]);

    drop(a);
    check_invariants(&vm, &[&b.space]);
    assert_eq!(b.read_page(0), pattern(10));
}

#[test]
fn concurrent_faults_keep_memory_consistent() {
    const PAGES: usize = 6;
    let (vm, pool) = machine(4, 32);
    let processes: Vec<Process> = (1..=3).map(|pid| Process::new(&vm, &pool, pid)).collect();
    for p in &processes {
        p.zero_pages(PAGES);
    }

    std::thread::scope(|scope| {
        for p in &processes {
            scope.spawn(move || {
                let seed = usize::from(p.tid) * 100;
                for round in 0..3 {
                    for i in 0..PAGES {
                        p.write(page(i), &pattern(seed + round * PAGES + i)).unwrap();
                    }
                    for i in 0..PAGES {
                        assert_eq!(p.read_page(i), pattern(seed + round * PAGES + i));
                    }
                }
            });
        }
    });

    let spaces: Vec<&AddressSpace> = processes.iter().map(|p| &p.space).collect();
    check_invariants(&vm, &spaces);
    assert_eq!(
        processes.iter().map(|p| p.space.resident_pages()).sum::<usize>(),
        4
    );
}

#[test]
fn threads_of_one_process_fault_shared_pages() {
    const PAGES: usize = 6;
    const THREADS: Tid = 4;
    let (vm, pool) = machine(3, 16);
    let p = Process::new(&vm, &pool, 1);
    p.zero_pages(PAGES);

    std::thread::scope(|scope| {
        for tid in 1..=THREADS {
            let p = &p;
            scope.spawn(move || {
                // Each thread owns an 8 byte lane of every page.
                let lane = usize::from(tid) * 8;
                let start = usize::from(tid);
                for round in 0..12u8 {
                    let tag = [u8::try_from(tid).unwrap() << 4 | round; 8];
                    for k in 0..PAGES {
                        let i = (start + k) % PAGES;
                        p.write_as(tid, page(i) + lane, &tag).unwrap();
                    }
                    for k in 0..PAGES {
                        let i = (start + k) % PAGES;
                        let mut buf = [0; 8];
                        p.read_as(tid, page(i) + lane, &mut buf).unwrap();
                        assert_eq!(buf, tag, "thread {tid} page {i} round {round}");
                    }
                }
            });
        }
    });

    check_invariants(&vm, &[&p.space]);
    assert_eq!(p.space.resident_pages(), 3);
    assert_eq!(p.space.resident_pages() + p.space.swapped_pages(), PAGES);
    for i in 0..PAGES {
        let data = p.read_page(i);
        for tid in 1..=THREADS {
            let lane = usize::from(tid) * 8;
            let expected = u8::try_from(tid).unwrap() << 4 | 11;
            assert!(data[lane..lane + 8].iter().all(|&b| b == expected));
        }
    }
}

#[test]
fn global_instance() {
    let pool = Arc::new(UserPool::new(2));
    let vm = init(VmConfig::default(), pool.clone(), None);
    assert!(Arc::ptr_eq(vm, system()));

    let p = Process::new(vm, &pool, 1);
    p.zero_pages(1);
    assert!(page_fault(&p.space, page(0), &p.ctx()));
    assert_eq!(system().resident_frames(), 1);
}
