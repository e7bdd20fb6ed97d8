//! Lock process memory so key material never reaches a swap file.

use std::io;

/// `mlockall(MCL_CURRENT | MCL_FUTURE)`. Requires `CAP_IPC_LOCK` (or a
/// generous `RLIMIT_MEMLOCK`); callers treat failure as a warning, not
/// a reason to refuse service.
#[cfg(unix)]
pub fn lock_process_memory() -> io::Result<()> {
    use std::os::raw::c_int;

    extern "C" {
        fn mlockall(flags: c_int) -> c_int;
    }

    const MCL_CURRENT: c_int = 1;
    const MCL_FUTURE: c_int = 2;

    // SAFETY: mlockall takes no pointers and only affects this process.
    if unsafe { mlockall(MCL_CURRENT | MCL_FUTURE) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn lock_process_memory() -> io::Result<()> {
    Ok(())
}
