//! Unrecoverable collector errors.
//!
//! Nothing here is handled locally: a heap whose invariants no longer hold
//! cannot be made consistent again, so every [`Fatal`] ends the process.

use std::fmt;

use crate::sync::lock_rank::LockRank;

#[derive(Debug)]
pub enum Fatal {
    /// The reserved address range cannot hold `requested` more bytes.
    OutOfAddressSpace { requested: usize },
    /// The OS refused to commit, release or reserve memory.
    OsMemory(std::io::Error),
    /// A pointer into the heap reservation that does not name a live object.
    BadPointer { value: usize, reason: &'static str },
    /// Verification found a reachable object the concurrent mark missed.
    MissedMark { object: usize },
    /// A collection phase transition out of order.
    InvalidPhase { expected: &'static str, found: &'static str },
    LockOrder { held: LockRank, acquiring: LockRank },
    SpanCorruption { span: u32, detail: &'static str },
    DoubleFree { addr: usize },
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fatal::OutOfAddressSpace { requested } => write!(
                f,
                "out of memory: cannot allocate {} bytes from the heap reservation",
                requested
            ),
            Fatal::OsMemory(err) => write!(f, "runtime: OS memory operation failed: {}", err),
            Fatal::BadPointer { value, reason } => {
                write!(f, "found bad pointer in heap {:#x}: {}", value, reason)
            }
            Fatal::MissedMark { object } => write!(
                f,
                "checkmark found unmarked object {:#x} reachable from roots",
                object
            ),
            Fatal::InvalidPhase { expected, found } => write!(
                f,
                "gc phase transition out of order: expected {}, found {}",
                expected, found
            ),
            Fatal::LockOrder { held, acquiring } => write!(
                f,
                "lock ordering problem: acquiring {:?} while holding {:?}",
                acquiring, held
            ),
            Fatal::SpanCorruption { span, detail } => {
                write!(f, "span {} corrupted: {}", span, detail)
            }
            Fatal::DoubleFree { addr } => write!(f, "double free of heap memory at {:#x}", addr),
        }
    }
}

#[cold]
pub fn throw(fatal: Fatal) -> ! {
    log::error!(target: "gc", "fatal error: {}", fatal);
    eprintln!("fatal error: {}", fatal);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let msg = Fatal::BadPointer {
            value: 0x1000,
            reason: "free span",
        }
        .to_string();
        assert!(msg.contains("0x1000"));
        assert!(msg.contains("free span"));

        let msg = Fatal::LockOrder {
            held: LockRank::PageAlloc,
            acquiring: LockRank::Central,
        }
        .to_string();
        assert!(msg.contains("Central"));
    }
}
