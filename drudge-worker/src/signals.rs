//! OS signal plumbing shared by workers and the supervisor.
//!
//! Handlers installed here do nothing but set a bit in a process-wide atomic
//! mask. The owning control loop calls [`drain`] and performs the actual state
//! transition outside of the signal-handling context.
//!
//! Signals the platform cannot deliver are reported by [`install`] with a
//! warning and skipped; the remaining signals are still installed.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Signals understood by drudge processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSignal {
    Term,
    Int,
    Quit,
    Hup,
    Usr1,
    Usr2,
    Cont,
}

impl ControlSignal {
    pub const ALL: [ControlSignal; 7] = [
        ControlSignal::Term,
        ControlSignal::Int,
        ControlSignal::Quit,
        ControlSignal::Hup,
        ControlSignal::Usr1,
        ControlSignal::Usr2,
        ControlSignal::Cont,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ControlSignal::Term => "TERM",
            ControlSignal::Int => "INT",
            ControlSignal::Quit => "QUIT",
            ControlSignal::Hup => "HUP",
            ControlSignal::Usr1 => "USR1",
            ControlSignal::Usr2 => "USR2",
            ControlSignal::Cont => "CONT",
        }
    }

    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    #[cfg(unix)]
    pub fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            ControlSignal::Term => Signal::SIGTERM,
            ControlSignal::Int => Signal::SIGINT,
            ControlSignal::Quit => Signal::SIGQUIT,
            ControlSignal::Hup => Signal::SIGHUP,
            ControlSignal::Usr1 => Signal::SIGUSR1,
            ControlSignal::Usr2 => Signal::SIGUSR2,
            ControlSignal::Cont => Signal::SIGCONT,
        }
    }

    #[cfg(unix)]
    fn from_raw(signum: nix::libc::c_int) -> Option<Self> {
        use nix::libc;
        match signum {
            libc::SIGTERM => Some(ControlSignal::Term),
            libc::SIGINT => Some(ControlSignal::Int),
            libc::SIGQUIT => Some(ControlSignal::Quit),
            libc::SIGHUP => Some(ControlSignal::Hup),
            libc::SIGUSR1 => Some(ControlSignal::Usr1),
            libc::SIGUSR2 => Some(ControlSignal::Usr2),
            libc::SIGCONT => Some(ControlSignal::Cont),
            _ => None,
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

/// Signals received but not yet handled, one bit per [`ControlSignal`]
static PENDING: AtomicU32 = AtomicU32::new(0);

#[cfg(unix)]
extern "C" fn record_signal(signum: nix::libc::c_int) {
    // Only async-signal-safe work here
    if let Some(signal) = ControlSignal::from_raw(signum) {
        PENDING.fetch_or(signal.bit(), Ordering::SeqCst);
    }
}

/// Install handlers for `signals`, returning the ones that were installed
pub fn install(signals: &[ControlSignal]) -> Vec<ControlSignal> {
    let mut installed = Vec::with_capacity(signals.len());

    for &signal in signals {
        match install_one(signal) {
            Ok(()) => installed.push(signal),
            Err(e) => warn!("Signal {} not supported: {}", signal, e),
        }
    }

    debug!("Installed handlers for {:?}", installed);
    installed
}

#[cfg(unix)]
fn install_one(signal: ControlSignal) -> std::io::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};

    let action = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only performs an atomic fetch_or
    unsafe { sigaction(signal.as_nix(), &action) }?;
    Ok(())
}

#[cfg(not(unix))]
fn install_one(_signal: ControlSignal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are not available on this platform",
    ))
}

/// Take every pending signal, clearing the mask
pub fn drain() -> Vec<ControlSignal> {
    let bits = PENDING.swap(0, Ordering::SeqCst);
    ControlSignal::ALL
        .into_iter()
        .filter(|signal| bits & signal.bit() != 0)
        .collect()
}

/// Restore default dispositions and forget pending signals.
///
/// Called in a freshly forked child so it does not act on signals that were
/// meant for its parent.
pub fn reset() {
    #[cfg(unix)]
    {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};

        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for signal in ControlSignal::ALL {
            // SAFETY: restoring the default disposition installs no handler code
            if let Err(e) = unsafe { sigaction(signal.as_nix(), &action) } {
                debug!("Could not reset {}: {}", signal, e);
            }
        }
    }

    PENDING.store(0, Ordering::SeqCst);
}

/// Whether `signal` is currently routed to the pending mask
#[cfg(unix)]
pub fn is_installed(signal: ControlSignal) -> bool {
    use nix::libc;

    let mut current = std::mem::MaybeUninit::<libc::sigaction>::zeroed();
    // SAFETY: a null new action only reads the current disposition
    let rc = unsafe {
        libc::sigaction(
            signal.as_nix() as libc::c_int,
            std::ptr::null(),
            current.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return false;
    }
    // SAFETY: zero-initialized and filled in by the successful call above
    let current = unsafe { current.assume_init() };
    let handler: extern "C" fn(libc::c_int) = record_signal;
    current.sa_sigaction == handler as libc::sighandler_t
}

#[cfg(not(unix))]
pub fn is_installed(_signal: ControlSignal) -> bool {
    false
}

/// Send a signal to a process
#[cfg(unix)]
pub fn send(pid: i32, signal: ControlSignal) -> std::io::Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid), signal.as_nix())?;
    Ok(())
}

#[cfg(not(unix))]
pub fn send(_pid: i32, _signal: ControlSignal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are not available on this platform",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_raised_signal_is_recorded_and_drained() {
        let installed = install(&[ControlSignal::Usr2]);
        assert_eq!(installed, vec![ControlSignal::Usr2]);
        assert!(is_installed(ControlSignal::Usr2));

        nix::sys::signal::raise(ControlSignal::Usr2.as_nix()).unwrap();
        assert!(drain().contains(&ControlSignal::Usr2));
        assert!(!drain().contains(&ControlSignal::Usr2));

        reset();
        assert!(!is_installed(ControlSignal::Usr2));
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(ControlSignal::Quit.to_string(), "SIGQUIT");
        assert_eq!(ControlSignal::from_raw(nix::libc::SIGCONT), Some(ControlSignal::Cont));
        assert_eq!(ControlSignal::from_raw(nix::libc::SIGKILL), None);
    }
}
