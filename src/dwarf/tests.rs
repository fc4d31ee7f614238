use core::{cell::Cell, ffi};
use std::sync::{Arc, Barrier};

use tracing_subscriber::EnvFilter;

use super::{
    divination::{self, FoundObject, LazySymbol, ObjectLookup},
    find_unwind_sections,
    phdr::{self, ModuleSegmentView, Phdr, PhdrSource, Visitor},
    Lookup,
};
use crate::{memory::FakeMemory, UnwindInfoSections};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::TRACE.into())
                .from_env_lossy(),
        )
        .with_test_writer()
        .try_init();
}

fn segment(p_type: u32, vaddr: usize, memsz: usize) -> Phdr {
    Phdr {
        p_type,
        p_flags: 0,
        p_offset: 0,
        p_vaddr: vaddr as _,
        p_paddr: vaddr as _,
        p_filesz: memsz as _,
        p_memsz: memsz as _,
        p_align: 0x1000,
    }
}

struct FakeModule {
    bias: usize,
    phdrs: Vec<Phdr>,
}

/// A loader with some modules and no `_dl_find_object`.
struct FakeLoader {
    modules: Vec<FakeModule>,
    visited: Cell<usize>,
}

impl PhdrSource for FakeLoader {
    fn each_module(&self, visit: &mut Visitor<'_>) {
        for module in &self.modules {
            self.visited.set(self.visited.get() + 1);
            let view = ModuleSegmentView {
                base: module.bias,
                phdrs: &module.phdrs,
            };
            if visit(&view).is_break() {
                break;
            }
        }
    }
}

struct FakeFindObject(Vec<FoundObject>);

impl ObjectLookup for FakeFindObject {
    fn find_object(&self, addr: usize) -> Option<FoundObject> {
        self.0
            .iter()
            .copied()
            .find(|object| (object.map_start..object.map_end).contains(&addr))
    }
}

/// A module mapped at 0x1000..0x3000 with its `.eh_frame_hdr` at
/// 0x2500 (64 bytes) pointing at `.eh_frame` at 0x2600. Followed by a module
/// at 0x10000 without any unwind info.
fn loader() -> FakeLoader {
    FakeLoader {
        modules: vec![
            FakeModule {
                bias: 0x1000,
                phdrs: vec![
                    segment(libc::PT_LOAD, 0, 0x1000),
                    segment(libc::PT_LOAD, 0x1000, 0x1000),
                    segment(libc::PT_GNU_EH_FRAME, 0x1500, 64),
                ],
            },
            FakeModule {
                bias: 0x10000,
                phdrs: vec![segment(libc::PT_LOAD, 0, 0x1000)],
            },
        ],
        visited: Cell::new(0),
    }
}

fn memory() -> FakeMemory {
    #[rustfmt::skip]
    let hdr = [
        1, 0x1b, 0x03, 0x3b,
        0xfc, 0, 0, 0, // .eh_frame is at 0x2600
        0, 0, 0, 0,
    ];
    let mut memory = FakeMemory::new(0x1000, 0x2000);
    memory.write(0x2500, &hdr);
    memory
}

fn fast(eh_frame_hdr: usize) -> FakeFindObject {
    FakeFindObject(vec![FoundObject {
        map_start: 0x1000,
        map_end: 0x3000,
        eh_frame_hdr,
    }])
}

const FROM_PHDRS: UnwindInfoSections = UnwindInfoSections {
    dso_base: 0x1000,
    text_segment_length: 0x2000,
    dwarf_index_section: 0x2500,
    dwarf_index_section_length: Some(64),
    dwarf_section: 0x2600,
    dwarf_section_length: Some(0xa00),
};

const FROM_DL_FIND_OBJECT: UnwindInfoSections = UnwindInfoSections {
    dwarf_index_section_length: None,
    dwarf_section_length: None,
    ..FROM_PHDRS
};

#[test]
fn phdr_scan_finds_module() {
    init_tracing();
    let loader = loader();
    assert_eq!(phdr::find(&loader, &memory(), 0x1234), Some(FROM_PHDRS));
    assert_eq!(loader.visited.get(), 1);
}

#[test]
fn dl_find_object_finds_module() {
    init_tracing();
    assert_eq!(
        divination::find(Some(&fast(0x2500)), &memory(), 0x1234),
        Lookup::Found(FROM_DL_FIND_OBJECT)
    );
}

#[test]
fn both_ways_agree() {
    init_tracing();
    let loader = loader();
    let memory = memory();
    for addr in [0x1000, 0x1234, 0x2fff] {
        let Lookup::Found(quick) = divination::find(Some(&fast(0x2500)), &memory, addr) else {
            panic!("dl_find_object didn't find {addr:#x}");
        };
        let slow = phdr::find(&loader, &memory, addr).unwrap();
        assert_eq!(quick.dso_base, slow.dso_base);
        assert_eq!(quick.dwarf_index_section, slow.dwarf_index_section);
        assert_eq!(quick.dwarf_section, slow.dwarf_section);
    }
}

#[test]
fn without_dl_find_object() {
    init_tracing();
    let loader = loader();
    assert_eq!(
        find_unwind_sections(None::<&FakeFindObject>, &loader, &memory(), 0x1234),
        Some(FROM_PHDRS)
    );
    assert_eq!(loader.visited.get(), 1);
}

#[test]
fn prefers_dl_find_object() {
    init_tracing();
    let loader = loader();
    assert_eq!(
        find_unwind_sections(Some(&fast(0x2500)), &loader, &memory(), 0x1234),
        Some(FROM_DL_FIND_OBJECT)
    );
    assert_eq!(loader.visited.get(), 0);
}

#[test]
fn falls_back_when_dl_find_object_doesnt_know() {
    init_tracing();
    let loader = loader();
    let service = FakeFindObject(Vec::new());
    assert_eq!(
        find_unwind_sections(Some(&service), &loader, &memory(), 0x1234),
        Some(FROM_PHDRS)
    );
    assert_eq!(loader.visited.get(), 1);
}

#[test]
fn falls_back_when_dl_find_object_is_out_of_range() {
    init_tracing();
    struct Confused;
    impl ObjectLookup for Confused {
        fn find_object(&self, _addr: usize) -> Option<FoundObject> {
            Some(FoundObject {
                map_start: 0x10000,
                map_end: 0x11000,
                eh_frame_hdr: 0x2500,
            })
        }
    }

    assert_eq!(
        divination::find(Some(&Confused), &memory(), 0x1234),
        Lookup::Unavailable
    );
    assert_eq!(
        find_unwind_sections(Some(&Confused), &loader(), &memory(), 0x1234),
        Some(FROM_PHDRS)
    );
}

#[test]
fn no_eh_frame_from_dl_find_object_is_final() {
    init_tracing();
    let loader = loader();
    assert_eq!(
        divination::find(Some(&fast(0)), &memory(), 0x1234),
        Lookup::NotFound
    );
    assert_eq!(
        find_unwind_sections(Some(&fast(0)), &loader, &memory(), 0x1234),
        None
    );
    assert_eq!(loader.visited.get(), 0);
}

#[test]
fn broken_header_from_dl_find_object_is_final() {
    init_tracing();
    let loader = loader();
    let mut memory = memory();
    memory.write(0x2500, &[2]);

    assert_eq!(
        find_unwind_sections(Some(&fast(0x2500)), &loader, &memory, 0x1234),
        None
    );
    assert_eq!(loader.visited.get(), 0);
}

#[test]
fn broken_header_from_phdrs() {
    init_tracing();
    let mut memory = memory();
    memory.write(0x2501, &[0x0d]);
    assert_eq!(phdr::find(&loader(), &memory, 0x1234), None);
}

#[test]
fn eh_frame_outside_of_module() {
    init_tracing();
    let mut memory = memory();
    // pcrel 0x2504 + 0x10000
    memory.write(0x2504, &0x10000_i32.to_ne_bytes());
    assert_eq!(phdr::find(&loader(), &memory, 0x1234), None);
}

#[test]
fn module_without_eh_frame_hdr() {
    init_tracing();
    let loader = loader();
    assert_eq!(
        find_unwind_sections(None::<&FakeFindObject>, &loader, &memory(), 0x10010),
        None
    );
    assert_eq!(loader.visited.get(), 2);
}

#[test]
fn address_outside_of_every_module() {
    init_tracing();
    let loader = loader();
    let memory = memory();

    assert!(find_unwind_sections(Some(&fast(0x2500)), &loader, &memory, 0x1234).is_some());
    for addr in [0, 0xfff, 0x3000, 0x11000, usize::MAX] {
        assert_eq!(
            find_unwind_sections(Some(&fast(0x2500)), &loader, &memory, addr),
            None
        );
    }
    assert_eq!(loader.visited.get(), 10);
}

#[test]
fn lookups_are_idempotent() {
    init_tracing();
    let loader = loader();
    let memory = memory();
    let first = find_unwind_sections(None::<&FakeFindObject>, &loader, &memory, 0x1234);
    let second = find_unwind_sections(None::<&FakeFindObject>, &loader, &memory, 0x1234);
    assert_eq!(first, second);
}

#[test]
fn lookup_or_else() {
    assert_eq!(Lookup::Found(1).or_else(|| Some(2)), Some(1));
    assert_eq!(Lookup::NotFound.or_else(|| Some(2)), None);
    assert_eq!(Lookup::<i32>::Unavailable.or_else(|| Some(2)), Some(2));
    assert_eq!(Lookup::<i32>::Unavailable.or_else(|| None), None);
}

#[inline(never)]
fn somewhere_in_this_binary() {}

#[test]
fn live_process() {
    init_tracing();
    let pc = somewhere_in_this_binary as *const ffi::c_void;

    let found = crate::find_unwind_sections(pc).expect("no unwind info for the test binary");
    assert!((found.dso_base..found.dso_base + found.text_segment_length).contains(&pc.addr()));
    assert_ne!(found.dwarf_section, 0);

    let slow = super::dl_iterate_phdr(pc).expect("dl_iterate_phdr didn't find the test binary");
    let hdr = unsafe {
        super::decode_eh_frame_hdr(
            core::ptr::with_exposed_provenance(slow.dwarf_index_section),
            slow.dwarf_index_section_length,
        )
    }
    .unwrap();
    assert_eq!(hdr.eh_frame_ptr, slow.dwarf_section);
    assert!(slow.dwarf_section_length.is_some());

    match super::dl_find_object(pc) {
        Lookup::Found(fast) => {
            assert_eq!(fast, found);
            assert_eq!(fast.dso_base, slow.dso_base);
            assert_eq!(fast.dwarf_index_section, slow.dwarf_index_section);
            assert_eq!(fast.dwarf_section, slow.dwarf_section);
        }
        Lookup::Unavailable => assert_eq!(slow, found),
        Lookup::NotFound => panic!("dl_find_object says the test binary has no eh_frame"),
    }

    assert_eq!(crate::find_unwind_sections(pc), Some(found));
}

#[test]
fn live_process_unmapped() {
    init_tracing();
    let pc = core::ptr::without_provenance::<ffi::c_void>(0x10);
    assert_eq!(crate::find_unwind_sections(pc), None);
    assert_eq!(super::dl_iterate_phdr(pc), None);
}

#[test]
fn racing_threads_agree_on_lazy_symbol() {
    static MALLOC: LazySymbol = LazySymbol::new(c"malloc");
    static MISSING: LazySymbol = LazySymbol::new(c"uwufind_no_such_symbol");

    // SAFETY: nul-terminated name, valid handle
    let malloc = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"malloc".as_ptr()) }.addr();
    assert_ne!(malloc, 0);

    let start = Arc::new(Barrier::new(8));
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let start = Arc::clone(&start);
            std::thread::spawn(move || {
                start.wait();
                (MALLOC.get().addr(), MISSING.get().addr())
            })
        })
        .collect();

    for thread in threads {
        assert_eq!(thread.join().unwrap(), (malloc, 0));
    }
    assert_eq!(MALLOC.get().addr(), malloc);
    assert!(MISSING.get().is_null());
}
