use std::ffi::CStr;

use libc::c_void;

/// Resolve the next definition of `name` down the dynamic-library chain.
/// Without the underlying libc symbol nothing can work, so a failed lookup
/// is unrecoverable.
pub(crate) fn must_resolve(name: &CStr) -> *mut c_void {
    let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if ptr.is_null() {
        eprintln!(
            "capfs: fatal: no downstream definition of {}",
            name.to_string_lossy()
        );
        std::process::abort();
    }
    ptr
}

/// Fetch (and cache in a per-call-site static) the real version of an
/// interposed function:
///
/// ```ignore
/// let real_open = real!(fn open(*const c_char, c_int, mode_t) -> c_int);
/// ```
///
/// Resolution happens lazily at the first call, never from the constructor:
/// several libc entry points run before constructors do.
macro_rules! real {
    (fn $name:ident($($arg:ty),* $(,)?) -> $ret:ty) => {{
        static SLOT: ::std::sync::atomic::AtomicPtr<::libc::c_void> =
            ::std::sync::atomic::AtomicPtr::new(::std::ptr::null_mut());
        let mut ptr = SLOT.load(::std::sync::atomic::Ordering::Relaxed);
        if ptr.is_null() {
            let name = unsafe {
                ::std::ffi::CStr::from_bytes_with_nul_unchecked(
                    concat!(stringify!($name), "\0").as_bytes(),
                )
            };
            ptr = $crate::real::must_resolve(name);
            SLOT.store(ptr, ::std::sync::atomic::Ordering::Relaxed);
        }
        #[allow(clippy::missing_transmute_annotations)]
        unsafe {
            ::std::mem::transmute::<
                *mut ::libc::c_void,
                unsafe extern "C" fn($($arg),*) -> $ret,
            >(ptr)
        }
    }};
}

pub(crate) use real;
