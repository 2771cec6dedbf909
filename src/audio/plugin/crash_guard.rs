//! Survive a plugin crashing inside its process call
//!
//! On Linux and macOS a SIGSEGV, SIGBUS or SIGABRT raised while a guarded
//! closure runs jumps back to the guard, which reports the signal. The plugin
//! is left in an undefined state and must never be called again.
//!
//! Elsewhere the closure runs unguarded.
//!
//! Nothing on the crash path may allocate or log.

/// A crash was caught; carries the signal number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crash(pub i32);

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod imp {
    use super::Crash;
    use std::cell::UnsafeCell;
    use std::os::raw::c_void;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use std::sync::Once;

    /// Large enough for sigjmp_buf on every supported target
    type SigJmpBuf = [u64; 128];

    type InfoHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void);
    type PlainHandler = extern "C" fn(libc::c_int);

    extern "C" {
        #[cfg_attr(target_os = "linux", link_name = "__sigsetjmp")]
        fn sigsetjmp(env: *mut SigJmpBuf, savemask: libc::c_int) -> libc::c_int;
        fn siglongjmp(env: *mut SigJmpBuf, val: libc::c_int) -> !;
    }

    const GUARDED_SIGNALS: [libc::c_int; 3] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGABRT];

    struct Landing {
        env: UnsafeCell<SigJmpBuf>,
        armed: AtomicBool,
        signal: AtomicI32,
    }

    // One landing per thread: a fault elsewhere never jumps into this stack
    thread_local! {
        static LANDING: Landing = const {
            Landing {
                env: UnsafeCell::new([0; 128]),
                armed: AtomicBool::new(false),
                signal: AtomicI32::new(0),
            }
        };
    }

    static INSTALL: Once = Once::new();
    static mut PREVIOUS: [Option<libc::sigaction>; 3] = [None, None, None];

    fn landing() -> *const Landing {
        LANDING.with(|landing| landing as *const Landing)
    }

    extern "C" fn on_signal(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
        let landing = unsafe { &*landing() };
        if landing.armed.swap(false, Ordering::SeqCst) {
            landing.signal.store(signal, Ordering::SeqCst);
            unsafe { siglongjmp(landing.env.get(), 1) }
        }

        // Not ours: hand over to whoever was installed before, or die normally
        unsafe {
            let previous = GUARDED_SIGNALS
                .iter()
                .position(|&s| s == signal)
                .and_then(|i| (*std::ptr::addr_of!(PREVIOUS))[i]);

            match previous {
                Some(action)
                    if action.sa_sigaction != libc::SIG_DFL
                        && action.sa_sigaction != libc::SIG_IGN =>
                {
                    if action.sa_flags & libc::SA_SIGINFO != 0 {
                        let handler: InfoHandler = std::mem::transmute(action.sa_sigaction);
                        handler(signal, info, context);
                    } else {
                        let handler: PlainHandler = std::mem::transmute(action.sa_sigaction);
                        handler(signal);
                    }
                }
                _ => {
                    libc::signal(signal, libc::SIG_DFL);
                    libc::raise(signal);
                }
            }
        }
    }

    fn install() {
        INSTALL.call_once(|| unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as InfoHandler as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
            libc::sigemptyset(&mut action.sa_mask);

            let previous = &mut *std::ptr::addr_of_mut!(PREVIOUS);
            for (i, &signal) in GUARDED_SIGNALS.iter().enumerate() {
                let mut old: libc::sigaction = std::mem::zeroed();
                if libc::sigaction(signal, &action, &mut old) == 0 {
                    previous[i] = Some(old);
                }
            }
            log::info!("Plugin crash guard installed");
        });
    }

    /// Call once from a control thread so the audio thread never installs handlers
    pub fn prepare() {
        install();
    }

    pub fn with_crash_guard<T>(f: impl FnOnce() -> T) -> Result<T, Crash> {
        install();

        unsafe {
            let landing = &*landing();
            if sigsetjmp(landing.env.get(), 1) != 0 {
                return Err(Crash(landing.signal.load(Ordering::SeqCst)));
            }
            landing.armed.store(true, Ordering::SeqCst);
            let result = f();
            landing.armed.store(false, Ordering::SeqCst);
            Ok(result)
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod imp {
    use super::Crash;

    pub fn prepare() {}

    pub fn with_crash_guard<T>(f: impl FnOnce() -> T) -> Result<T, Crash> {
        Ok(f())
    }
}

pub use imp::{prepare, with_crash_guard};
