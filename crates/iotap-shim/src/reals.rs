//! Real-symbol resolution.
//!
//! Every interposed entry point forwards to the real libc implementation,
//! found once with `dlsym(RTLD_NEXT)` and cached in an atomic so the lookup
//! is paid a single time per symbol. A lookup that fails leaves the hook
//! degraded (it reports an error to its caller) rather than panicking:
//! unwinding across the C ABI inside a preloaded library is not an option.

use libc::{c_char, c_int, c_void, mode_t, off_t, size_t, ssize_t, FILE};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

pub type OpenFn = unsafe extern "C" fn(*const c_char, c_int, mode_t) -> c_int;
pub type CreatFn = unsafe extern "C" fn(*const c_char, mode_t) -> c_int;
pub type OpenatFn = unsafe extern "C" fn(c_int, *const c_char, c_int, mode_t) -> c_int;
pub type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
pub type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
pub type PreadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, off_t) -> ssize_t;
pub type PwriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t, off_t) -> ssize_t;
pub type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
pub type FopenFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut FILE;
pub type FreopenFn = unsafe extern "C" fn(*const c_char, *const c_char, *mut FILE) -> *mut FILE;
pub type FreadFn = unsafe extern "C" fn(*mut c_void, size_t, size_t, *mut FILE) -> size_t;
pub type FwriteFn = unsafe extern "C" fn(*const c_void, size_t, size_t, *mut FILE) -> size_t;
pub type FcloseFn = unsafe extern "C" fn(*mut FILE) -> c_int;

#[cfg(target_os = "linux")]
pub type Pread64Fn = unsafe extern "C" fn(c_int, *mut c_void, size_t, libc::off64_t) -> ssize_t;
#[cfg(target_os = "linux")]
pub type Pwrite64Fn = unsafe extern "C" fn(c_int, *const c_void, size_t, libc::off64_t) -> ssize_t;

struct RealSymbol {
    ptr: AtomicPtr<c_void>,
    /// Nul-terminated so it can go straight to `dlsym`.
    name: &'static str,
}

impl RealSymbol {
    const fn new(name: &'static str) -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            name,
        }
    }

    fn resolve(&self) -> *mut c_void {
        let cached = self.ptr.load(Ordering::Acquire);
        if !cached.is_null() {
            return cached;
        }
        let found = unsafe { libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr() as *const c_char) };
        self.ptr.store(found, Ordering::Release);
        found
    }
}

macro_rules! real_symbol {
    ($getter:ident, $sym:literal, $ty:ty) => {
        pub fn $getter() -> Option<$ty> {
            static SYM: RealSymbol = RealSymbol::new(concat!($sym, "\0"));
            let p = SYM.resolve();
            if p.is_null() {
                None
            } else {
                // Safety: dlsym returned this address for exactly this
                // symbol; the signature is the platform's prototype.
                Some(unsafe { std::mem::transmute::<*mut c_void, $ty>(p) })
            }
        }
    };
}

real_symbol!(real_open, "open", OpenFn);
real_symbol!(real_creat, "creat", CreatFn);
real_symbol!(real_openat, "openat", OpenatFn);
real_symbol!(real_read, "read", ReadFn);
real_symbol!(real_write, "write", WriteFn);
real_symbol!(real_pread, "pread", PreadFn);
real_symbol!(real_pwrite, "pwrite", PwriteFn);
real_symbol!(real_close, "close", CloseFn);
real_symbol!(real_fopen, "fopen", FopenFn);
real_symbol!(real_freopen, "freopen", FreopenFn);
real_symbol!(real_fread, "fread", FreadFn);
real_symbol!(real_fwrite, "fwrite", FwriteFn);
real_symbol!(real_fclose, "fclose", FcloseFn);

// Large-file aliases are a glibc affair; macOS has no *64 symbols.
#[cfg(target_os = "linux")]
real_symbol!(real_open64, "open64", OpenFn);
#[cfg(target_os = "linux")]
real_symbol!(real_creat64, "creat64", CreatFn);
#[cfg(target_os = "linux")]
real_symbol!(real_openat64, "openat64", OpenatFn);
#[cfg(target_os = "linux")]
real_symbol!(real_pread64, "pread64", Pread64Fn);
#[cfg(target_os = "linux")]
real_symbol!(real_pwrite64, "pwrite64", Pwrite64Fn);
#[cfg(target_os = "linux")]
real_symbol!(real_fopen64, "fopen64", FopenFn);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_symbols_resolve_on_this_platform() {
        assert!(real_open().is_some());
        assert!(real_read().is_some());
        assert!(real_write().is_some());
        assert!(real_close().is_some());
        assert!(real_fopen().is_some());
        assert!(real_fclose().is_some());
    }
}
