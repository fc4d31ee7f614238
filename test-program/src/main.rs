use std::ffi;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uwufind::dwarf::{self, Lookup};

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::TRACE.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    let addrs: [(&str, *const ffi::c_void); 4] = [
        ("main", main as *const ffi::c_void),
        ("libc malloc", libc::malloc as *const ffi::c_void),
        ("heap", Box::into_raw(Box::new(0_u64)).cast()),
        ("null page", std::ptr::without_provenance(0x10)),
    ];

    for (name, pc) in addrs {
        let _span = tracing::info_span!("lookup", name, ?pc).entered();

        let fast = dwarf::dl_find_object(pc);
        let slow = dwarf::dl_iterate_phdr(pc);
        let found = uwufind::find_unwind_sections(pc);

        println!("{name} ({pc:p})");
        match fast {
            Lookup::Found(sections) => println!("  _dl_find_object: {sections:#x?}"),
            Lookup::NotFound => println!("  _dl_find_object: no unwind info"),
            Lookup::Unavailable => println!("  _dl_find_object: can't tell"),
        }
        println!("  dl_iterate_phdr: {slow:#x?}");
        println!("  result:          {found:#x?}");
    }
}
