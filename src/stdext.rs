use core::ffi;

/// Calls `f` with the last `dlerror` message, if the dynamic linker has one.
pub(crate) fn with_dlerror_str<R>(f: impl FnOnce(&str) -> R) -> R {
    // SAFETY: dlerror returns either null or a nul-terminated string that stays
    // valid until the next dl* call on this thread.
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        return f("<no dlerror>");
    }
    // SAFETY: non-null, see above
    let cstr = unsafe { ffi::CStr::from_ptr(msg) };
    f(cstr
        .to_str()
        .unwrap_or("<error message contained invalid utf8>"))
}
