//! Volatile access to the physical TIS window.

use super::{Registers, Result, TisError, WINDOW_SIZE};
use ambassador::Delegate;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::ptr::{self, NonNull};

/// Raw volatile register window.
pub struct Mmio {
    base: NonNull<u8>,
    len: usize,
}

impl Mmio {
    /// # Safety
    /// `base` must point to `len` bytes of mapped TIS registers which stay
    /// mapped for as long as the returned value lives.
    pub unsafe fn new(base: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(base).map(|base| Self { base, len })
    }

    fn at(&self, offset: usize, width: usize) -> *mut u8 {
        assert!(offset + width <= self.len, "TIS offset {offset:#x} out of range");
        // SAFETY: bounds checked above, the window is mapped per `new`
        unsafe { self.base.as_ptr().add(offset) }
    }
}

impl Registers for Mmio {
    fn read8(&mut self, offset: usize) -> u8 {
        // SAFETY: `at` keeps the access inside the mapped window
        unsafe { ptr::read_volatile(self.at(offset, 1)) }
    }

    fn write8(&mut self, offset: usize, value: u8) {
        // SAFETY: as above
        unsafe { ptr::write_volatile(self.at(offset, 1), value) }
    }

    fn read32(&mut self, offset: usize) -> u32 {
        // SAFETY: as above, 32-bit registers are naturally aligned
        unsafe { ptr::read_volatile(self.at(offset, 4) as *const u32) }
    }
}

/// The TIS window mapped from `/dev/mem`.
#[derive(Delegate)]
#[delegate(Registers, target = "mmio")]
pub struct DevMem {
    mmio: Mmio,
    mapping: *mut libc::c_void,
}

impl DevMem {
    pub fn open(base: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open("/dev/mem")?;
        let offset = libc::off_t::try_from(base)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "TIS base out of range"))?;

        // SAFETY: a fresh shared mapping of a device file, checked below
        let mapping = unsafe {
            libc::mmap(
                ptr::null_mut(),
                WINDOW_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(TisError::Map(io::Error::last_os_error()));
        }
        log::debug!("Mapped TIS window at {:#x}", base);

        // SAFETY: `mapping` covers WINDOW_SIZE bytes until dropped
        let mmio = unsafe { Mmio::new(mapping.cast(), WINDOW_SIZE) }
            .ok_or_else(|| TisError::Map(io::Error::new(io::ErrorKind::Other, "null mapping")))?;
        Ok(Self { mmio, mapping })
    }
}

impl Drop for DevMem {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly what `open` mapped
        unsafe {
            libc::munmap(self.mapping, WINDOW_SIZE);
        }
    }
}
