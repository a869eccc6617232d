use super::PatchError;
use super::Result;
use log::trace;
use region::Protection;
use std::ops::Range;

#[cfg(target_os = "windows")]
use winapi::{
    shared::minwindef::{DWORD, LPCVOID},
    um::{
        libloaderapi::GetModuleHandleW,
        processthreadsapi::{FlushInstructionCache, GetCurrentProcess},
        psapi::{GetModuleInformation, MODULEINFO},
    },
};

/// Memory is a contiguous region patches are searched and written in.
///
/// Every address handed to it is absolute: `base()` maps to the first byte
/// returned by `view()`.
pub trait Memory {
    fn base(&self) -> usize;

    /// view returns the whole region, used for signature scanning.
    fn view(&self) -> Result<&[u8]>;

    /// read copies `size` bytes starting at `address`.
    fn read(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        let data = self.view()?;
        let range =
            span(self.base(), data.len(), address, size).ok_or(PatchError::ReadPtrError(address, size))?;
        Ok(data[range].to_vec())
    }

    /// write replaces the bytes starting at `address`.
    fn write(&mut self, address: usize, bytes: &[u8]) -> Result<()>;
}

/// span converts an absolute address range into a range relative to `base`,
/// or None if it leaves the region.
fn span(base: usize, len: usize, address: usize, size: usize) -> Option<Range<usize>> {
    let start = address.checked_sub(base)?;
    let end = start.checked_add(size)?;
    if end > len {
        return None;
    }
    Some(start..end)
}

/// Buffer is an owned copy of a memory region placed at a virtual base address.
///
/// It is used to scan dumped images offline and to exercise patches without
/// touching live code pages.
///
/// Example
/// ```rust
///    use mempatch::memory::{Buffer, Memory};
///    let mut memory = Buffer::new(0x1400_0000, vec![0x0F, 0x84, 0xD0, 0x01]);
///    memory.write(0x1400_0001, &[0x90]).unwrap();
///    assert_eq!(memory.read(0x1400_0000, 2).unwrap(), vec![0x0F, 0x90]);
/// ```
#[derive(Clone, Debug)]
pub struct Buffer {
    base: usize,
    data: Vec<u8>,
}
impl Buffer {
    pub fn new(base: usize, data: Vec<u8>) -> Self {
        Buffer { base, data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
impl Memory for Buffer {
    fn base(&self) -> usize {
        self.base
    }

    fn view(&self) -> Result<&[u8]> {
        Ok(&self.data)
    }

    fn write(&mut self, address: usize, bytes: &[u8]) -> Result<()> {
        trace!("Writing {} bytes at {:#x}", bytes.len(), address);
        let range = span(self.base, self.data.len(), address, bytes.len())
            .ok_or(PatchError::WritePtrError(address, bytes.len()))?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }
}

/// ModuleImage is a region of the current process, usually the loaded image of
/// the host executable.
///
/// Writes temporarily make the touched pages writable through a `ProtectGuard`.
pub struct ModuleImage {
    base: usize,
    size: usize,
}
impl ModuleImage {
    /// # Safety
    /// `base..base + size` must stay mapped and readable for the lifetime of the
    /// returned value.
    pub unsafe fn new(base: usize, size: usize) -> Self {
        ModuleImage { base, size }
    }

    /// main_module returns the image of the executable that started the process.
    #[cfg(target_os = "windows")]
    pub fn main_module() -> Result<Self> {
        unsafe {
            let module = GetModuleHandleW(std::ptr::null());
            if module.is_null() {
                return Err(PatchError::IoError(std::io::Error::last_os_error()));
            }
            let mut info: MODULEINFO = std::mem::zeroed();
            if GetModuleInformation(
                GetCurrentProcess(),
                module,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as DWORD,
            ) == 0
            {
                return Err(PatchError::IoError(std::io::Error::last_os_error()));
            }
            trace!(
                "Main module at {:#x} ({:#x} bytes)",
                info.lpBaseOfDll as usize,
                info.SizeOfImage
            );
            Ok(ModuleImage::new(
                info.lpBaseOfDll as usize,
                info.SizeOfImage as usize,
            ))
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}
impl Memory for ModuleImage {
    fn base(&self) -> usize {
        self.base
    }

    fn view(&self) -> Result<&[u8]> {
        Ok(unsafe { std::slice::from_raw_parts(self.base as *const u8, self.size) })
    }

    fn write(&mut self, address: usize, bytes: &[u8]) -> Result<()> {
        span(self.base, self.size, address, bytes.len())
            .ok_or(PatchError::WritePtrError(address, bytes.len()))?;
        trace!("Writing {} bytes at {:#x}", bytes.len(), address);
        unsafe {
            let _guard = ProtectGuard::new(address, bytes.len())?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }
        Ok(())
    }
}

/// ProtectGuard makes a span of memory writable and restores the previous
/// protection of every touched region when dropped, on every exit path.
///
/// By its operations, this structure is unsafe.
///
/// Example
/// ```rust,no_run
///    let address: usize = 0x1400_0000;
///    unsafe {
///        let _guard = mempatch::memory::ProtectGuard::new(address, 6).unwrap();
///        std::ptr::write(address as *mut u8, 0xE9);
///    }
/// ```
pub struct ProtectGuard {
    address: usize,
    size: usize,
    _handle: region::ProtectGuard,
}
impl ProtectGuard {
    /// # Safety
    /// The span must be mapped in the current process.
    pub unsafe fn new(address: usize, size: usize) -> Result<Self> {
        let handle =
            region::protect_with_handle(address as *const u8, size, Protection::READ_WRITE_EXECUTE)
                .map_err(|e| PatchError::ProtectError(address, size, e.to_string()))?;
        trace!("Unprotected {:#x} ({} bytes)", address, size);
        Ok(ProtectGuard {
            address,
            size,
            _handle: handle,
        })
    }
}
impl Drop for ProtectGuard {
    fn drop(&mut self) {
        trace!("Restoring protection of {:#x} ({} bytes)", self.address, self.size);
        #[cfg(target_os = "windows")]
        unsafe {
            FlushInstructionCache(GetCurrentProcess(), self.address as LPCVOID, self.size);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::Cell;

    /// Counting wraps a memory region and counts scans and writes.
    pub struct Counting<M> {
        pub inner: M,
        pub scans: Cell<usize>,
        pub writes: usize,
        pub fail_writes: bool,
    }
    impl<M: Memory> Counting<M> {
        pub fn new(inner: M) -> Self {
            Counting {
                inner,
                scans: Cell::new(0),
                writes: 0,
                fail_writes: false,
            }
        }

        pub fn scans(&self) -> usize {
            self.scans.get()
        }
    }
    impl<M: Memory> Memory for Counting<M> {
        fn base(&self) -> usize {
            self.inner.base()
        }

        fn view(&self) -> Result<&[u8]> {
            self.scans.set(self.scans.get() + 1);
            self.inner.view()
        }

        fn read(&self, address: usize, size: usize) -> Result<Vec<u8>> {
            self.inner.read(address, size)
        }

        fn write(&mut self, address: usize, bytes: &[u8]) -> Result<()> {
            if self.fail_writes {
                return Err(PatchError::ProtectError(
                    address,
                    bytes.len(),
                    "denied".to_string(),
                ));
            }
            self.writes += 1;
            self.inner.write(address, bytes)
        }
    }
}
