//! End-to-end: the buddy pool feeding the virtual-memory manager.

use kernel_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_pmm::BuddyFrameAlloc;
use kernel_vmem::{AddressSpaceManager, PageEntryBits, PhysMapper};

/// Identity mapper: in hosted tests a "physical" address is a host pointer
/// into the test region.
struct HostMapper;

impl PhysMapper for HostMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *(pa.as_u64() as *mut T) }
    }
}

#[repr(align(4096))]
struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

struct TestRegion {
    frames: Vec<Aligned4K>,
}

impl TestRegion {
    fn new(frame_count: usize) -> Self {
        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            frames.push(Aligned4K([0u8; 4096]));
        }
        Self { frames }
    }

    fn start(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frames.as_ptr() as u64)
    }

    fn size(&self) -> u64 {
        self.frames.len() as u64 * PAGE_SIZE
    }
}

fn zero_root(root: PhysicalAddress) {
    let table: &mut [u64; 512] = unsafe { HostMapper.phys_to_mut(root) };
    table.fill(0);
}

fn rw() -> PageEntryBits {
    PageEntryBits::new().with_writable(true)
}

#[test]
fn region_lifecycle_returns_every_frame() {
    let region = TestRegion::new(512);
    let mut pool = BuddyFrameAlloc::init(&HostMapper, region.start(), region.size())
        .expect("pool init");

    let kernel_root = pool.alloc_page().expect("kernel root");
    zero_root(kernel_root);
    let baseline = pool.stats().free_frames;

    {
        let mut mgr = AddressSpaceManager::new(&HostMapper, &mut pool, kernel_root);
        let s = mgr.create().expect("space");

        let base = mgr
            .alloc_region(s, VirtualAddress::new(0x5000_0000), 16 * 1024, rw())
            .expect("region");
        assert_eq!(base.as_u64(), 0x5000_0000);

        // Four distinct frames, all page-aligned and pool-owned.
        let mut frames = Vec::new();
        for i in 0..4u64 {
            let pa = mgr.translate(s, base + i * PAGE_SIZE).expect("mapped");
            assert!(pa.is_page_aligned());
            assert!(!frames.contains(&pa));
            frames.push(pa);
        }

        mgr.free_region(s, base, 16 * 1024);
        for i in 0..4u64 {
            assert!(!mgr.is_mapped(s, base + i * PAGE_SIZE));
        }

        mgr.destroy(s).expect("destroy");
    }

    // Region frames, page tables and the space root all came back.
    assert_eq!(pool.stats().free_frames, baseline);
}

#[test]
fn map_translate_through_pool_backed_tables() {
    let region = TestRegion::new(256);
    let mut pool = BuddyFrameAlloc::init(&HostMapper, region.start(), region.size())
        .expect("pool init");

    let kernel_root = pool.alloc_page().expect("kernel root");
    zero_root(kernel_root);

    let mut mgr = AddressSpaceManager::new(&HostMapper, &mut pool, kernel_root);
    let s = mgr.create().expect("space");

    let va = VirtualAddress::new(0x4000_0000);
    let backing = PhysicalAddress::new(0x0001_0000);
    mgr.map(s, va, backing, rw().with_user(true)).expect("map");

    assert_eq!(
        mgr.translate(s, VirtualAddress::new(0x4000_0123)),
        Some(PhysicalAddress::new(0x0001_0123))
    );

    assert!(mgr.clear_page_flags(s, va, PageEntryBits::new().with_writable(true)));
    let flags = mgr.page_flags(s, va).expect("flags");
    assert!(flags.present() && !flags.writable() && flags.user());
}

#[test]
fn shared_frames_survive_one_destroy() {
    let region = TestRegion::new(256);
    let mut pool = BuddyFrameAlloc::init(&HostMapper, region.start(), region.size())
        .expect("pool init");

    let kernel_root = pool.alloc_page().expect("kernel root");
    zero_root(kernel_root);
    let baseline = pool.stats().free_frames;

    // One frame referenced by two address spaces.
    let shared = pool.alloc_page().expect("shared frame");
    pool.retain(shared);
    assert_eq!(pool.ref_count(shared), 2);

    {
        let mut mgr = AddressSpaceManager::new(&HostMapper, &mut pool, kernel_root);
        let a = mgr.create().expect("space a");
        let b = mgr.create().expect("space b");

        let va = VirtualAddress::new(0x3000_0000);
        mgr.map(a, va, shared, rw()).expect("map a");
        mgr.map(b, va, shared, rw()).expect("map b");

        // Tearing down the first space must not reclaim the shared frame.
        mgr.destroy(a).expect("destroy a");
        mgr.destroy(b).expect("destroy b");
    }

    // Both references are gone now; the pool is back to its baseline.
    assert_eq!(pool.ref_count(shared), 0);
    assert_eq!(pool.stats().free_frames, baseline);
}
