//! Reservation and commitment of OS memory for the heap.
//!
//! The whole heap lives in one range reserved at start up. Arenas are
//! committed inside it as the heap grows and individual page runs may later
//! be released back to the OS by the scavenger.

use std::io;

use super::{align_usize, is_aligned};

/// Whether pages released with [`VirtualMemory::release`] read back as zero
/// once they are touched again.
#[cfg(any(target_os = "linux", windows))]
pub const RELEASE_ZEROES: bool = true;
#[cfg(not(any(target_os = "linux", windows)))]
pub const RELEASE_ZEROES: bool = false;

pub fn page_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        } else {
            unsafe {
                let mut info: winapi::um::sysinfoapi::SYSTEM_INFO = std::mem::zeroed();
                winapi::um::sysinfoapi::GetSystemInfo(&mut info);
                info.dwPageSize as usize
            }
        }
    }
}

fn last_os_error() -> io::Error {
    io::Error::from_raw_os_error(errno::errno().0)
}

/// A reserved, initially inaccessible, range of address space.
pub struct VirtualMemory {
    start: usize,
    size: usize,
    mapped_start: usize,
    mapped_size: usize,
}

impl VirtualMemory {
    /// Reserves `size` bytes whose start is aligned to `alignment`.
    pub fn reserve(size: usize, alignment: usize) -> io::Result<Self> {
        let size = align_usize(size, alignment);
        let mapped_size = size + alignment;
        let mapped_start = unsafe { os::reserve(mapped_size)? };
        let start = align_usize(mapped_start, alignment);
        debug_assert!(is_aligned(start, alignment));
        Ok(Self {
            start,
            size,
            mapped_start,
            mapped_size,
        })
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Makes `[addr, addr + size)` readable and writable.
    pub fn commit(&self, addr: usize, size: usize) -> io::Result<()> {
        debug_assert!(self.contains(addr) && addr + size <= self.end());
        unsafe { os::commit(addr, size) }
    }

    /// Returns the physical pages backing `[addr, addr + size)` to the OS.
    /// The range stays reserved and must go through [`VirtualMemory::reuse`]
    /// before it is touched again.
    pub fn release(&self, addr: usize, size: usize) -> io::Result<()> {
        debug_assert!(self.contains(addr) && addr + size <= self.end());
        unsafe { os::release(addr, size) }
    }

    /// Prepares a released range for use again.
    pub fn reuse(&self, addr: usize, size: usize) -> io::Result<()> {
        debug_assert!(self.contains(addr) && addr + size <= self.end());
        unsafe { os::reuse(addr, size) }
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = os::unreserve(self.mapped_start, self.mapped_size) {
                log::warn!(target: "gc", "failed to unmap heap reservation: {}", err);
            }
        }
    }
}

#[cfg(unix)]
mod os {
    use super::*;

    pub unsafe fn reserve(size: usize) -> io::Result<usize> {
        let addr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        );

        if addr == libc::MAP_FAILED {
            return Err(last_os_error());
        }
        Ok(addr as usize)
    }

    pub unsafe fn unreserve(addr: usize, size: usize) -> io::Result<()> {
        if libc::munmap(addr as _, size) != 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    pub unsafe fn commit(addr: usize, size: usize) -> io::Result<()> {
        if libc::mprotect(addr as _, size, libc::PROT_READ | libc::PROT_WRITE) != 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    pub unsafe fn release(addr: usize, size: usize) -> io::Result<()> {
        if libc::madvise(addr as _, size, libc::MADV_DONTNEED) != 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    pub unsafe fn reuse(_addr: usize, _size: usize) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE},
    };

    pub unsafe fn reserve(size: usize) -> io::Result<usize> {
        let addr = VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS);
        if addr.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(addr as usize)
    }

    pub unsafe fn unreserve(addr: usize, _size: usize) -> io::Result<()> {
        if VirtualFree(addr as _, 0, MEM_RELEASE) == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn commit(addr: usize, size: usize) -> io::Result<()> {
        if VirtualAlloc(addr as _, size, MEM_COMMIT, PAGE_READWRITE).is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn release(addr: usize, size: usize) -> io::Result<()> {
        if VirtualFree(addr as _, size, MEM_DECOMMIT) == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn reuse(addr: usize, size: usize) -> io::Result<()> {
        commit(addr, size)
    }
}
