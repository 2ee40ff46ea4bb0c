//! The process-wide pool facade is at-most-once and routes through the
//! same buddy instance. Lives in its own test binary because the global
//! cell survives for the whole process.

use kernel_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_pmm::global;
use kernel_vmem::PhysMapper;

struct HostMapper;

impl PhysMapper for HostMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *(pa.as_u64() as *mut T) }
    }
}

#[repr(align(4096))]
struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

#[test]
fn init_once_then_allocate() {
    // Nothing works before init.
    assert!(global::stats().is_none());
    assert!(global::alloc_page().is_none());

    let mut frames = Vec::with_capacity(128);
    for _ in 0..128 {
        frames.push(Aligned4K([0u8; 4096]));
    }
    let start = PhysicalAddress::new(frames.as_ptr() as u64);
    let size = frames.len() as u64 * PAGE_SIZE;
    // The global pool keeps pointing into the region; never drop it.
    std::mem::forget(frames);

    assert!(global::init(&HostMapper, start, size));
    // Second init is a logged no-op.
    assert!(!global::init(&HostMapper, start, size));

    let stats = global::stats().expect("initialized");
    let baseline = stats.free_frames;

    let page = global::alloc_page().expect("page");
    let run = global::alloc(3).expect("order-3 block");
    assert_eq!(
        global::stats().expect("stats").free_frames,
        baseline - 1 - 8
    );

    global::retain(page);
    global::free_page(page);
    // Still referenced once.
    assert_eq!(
        global::with(|pool| pool.ref_count(page)).expect("pool"),
        1
    );

    global::free_page(page);
    global::free(run, 3);
    assert_eq!(global::stats().expect("stats").free_frames, baseline);
}
