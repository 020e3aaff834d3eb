//! Executable code buffers
//!
//! Wraps the platform primitives for writable-then-executable pages behind a
//! small append/finalize interface. Pages are allocated read-write, filled,
//! then flipped to read-execute; on AArch64 the instruction cache is
//! invalidated as part of finalizing. Apple Silicon uses `MAP_JIT` mappings
//! with per-thread write protection instead of an mprotect flip.

use super::CodegenError;

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
mod sys {
    use std::os::raw::{c_int, c_void};
    extern "C" {
        pub fn pthread_jit_write_protect_np(enabled: c_int);
        pub fn sys_icache_invalidate(start: *mut c_void, len: usize);
    }
}

enum Mapping {
    #[cfg_attr(all(target_os = "macos", target_arch = "aarch64"), allow(dead_code))]
    Region(region::Allocation),
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    MapJit { ptr: *mut u8, size: usize },
}

impl Mapping {
    fn ptr(&self) -> *mut u8 {
        match self {
            Mapping::Region(a) => a.as_ptr::<u8>() as *mut u8,
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            Mapping::MapJit { ptr, .. } => *ptr,
        }
    }

    fn size(&self) -> usize {
        match self {
            Mapping::Region(a) => a.len(),
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            Mapping::MapJit { size, .. } => *size,
        }
    }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
impl Drop for Mapping {
    fn drop(&mut self) {
        if let Mapping::MapJit { ptr, size } = *self {
            // Safety: the mapping was created by mmap in `alloc_rw`.
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, size);
            }
        }
    }
}

fn alloc_rw(size: usize) -> Result<Mapping, CodegenError> {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        // Safety: anonymous MAP_JIT mapping; checked for MAP_FAILED below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_JIT,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CodegenError::Memory("mmap(MAP_JIT) failed".into()));
        }
        // Writes require the thread's JIT protection to be lifted.
        unsafe { sys::pthread_jit_write_protect_np(0) };
        Ok(Mapping::MapJit {
            ptr: ptr as *mut u8,
            size,
        })
    }
    #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
    {
        region::alloc(size, region::Protection::READ_WRITE)
            .map(Mapping::Region)
            .map_err(|e| CodegenError::Memory(e.to_string()))
    }
}

#[cfg(all(target_arch = "aarch64", not(target_os = "macos")))]
fn invalidate_icache(ptr: *mut u8, len: usize) {
    // Clean the data cache to the point of unification, then invalidate the
    // instruction cache over the same range. 64-byte lines are the common
    // case; the dc/ic pair is safe on larger-line parts too.
    let start = ptr as usize & !63;
    let end = ptr as usize + len;
    unsafe {
        let mut addr = start;
        while addr < end {
            std::arch::asm!("dc cvau, {0}", in(reg) addr);
            addr += 64;
        }
        std::arch::asm!("dsb ish");
        let mut addr = start;
        while addr < end {
            std::arch::asm!("ic ivau, {0}", in(reg) addr);
            addr += 64;
        }
        std::arch::asm!("dsb ish", "isb");
    }
}

/// A writable buffer being filled with machine code.
pub struct CodeBuffer {
    mem: Mapping,
    len: usize,
}

impl CodeBuffer {
    /// Allocate a read-write buffer able to hold at least `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self, CodegenError> {
        let size = capacity.max(1);
        let mem = alloc_rw(size)?;
        Ok(CodeBuffer { mem, len: 0 })
    }

    /// Append raw bytes.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), CodegenError> {
        if self.len + bytes.len() > self.mem.size() {
            return Err(CodegenError::CodeTooLarge);
        }
        // Safety: bounds checked above; the mapping is writable.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.mem.ptr().add(self.len),
                bytes.len(),
            );
        }
        self.len += bytes.len();
        Ok(())
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flip the pages to read-execute and invalidate the instruction cache
    /// where the platform requires it.
    pub fn finalize(self) -> Result<ExecBuf, CodegenError> {
        let ptr = self.mem.ptr();
        let size = self.mem.size();

        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            unsafe {
                sys::pthread_jit_write_protect_np(1);
                sys::sys_icache_invalidate(ptr as *mut std::os::raw::c_void, self.len);
            }
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            // Safety: ptr/size describe exactly the pages we own.
            unsafe {
                region::protect(ptr, size, region::Protection::READ_EXECUTE)
                    .map_err(|e| CodegenError::Memory(e.to_string()))?;
            }
            #[cfg(target_arch = "aarch64")]
            invalidate_icache(ptr, self.len);
        }

        Ok(ExecBuf {
            mem: self.mem,
            len: self.len,
        })
    }
}

/// A finalized, immutable, executable code region. Once published it is
/// never written again; dropping it unmaps the pages.
pub struct ExecBuf {
    mem: Mapping,
    len: usize,
}

impl ExecBuf {
    /// Entry address of the region.
    pub fn ptr(&self) -> *const u8 {
        self.mem.ptr()
    }

    /// Bytes of code in the region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region holds no code.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy of the published bytes (the region stays byte-identical for its
    /// lifetime; this is for tests and diagnostics).
    pub fn bytes(&self) -> Vec<u8> {
        // Safety: the region is readable and self.len bytes were written.
        unsafe { std::slice::from_raw_parts(self.ptr(), self.len) }.to_vec()
    }
}

/// Probe whether the platform grants writable-then-executable memory.
/// Called once at JIT init; failure makes the JIT report itself unavailable.
pub fn probe() -> Result<(), CodegenError> {
    let mut cb = CodeBuffer::with_capacity(16)?;
    // A single return instruction, never executed.
    #[cfg(target_arch = "x86_64")]
    cb.write(&[0xC3])?;
    #[cfg(target_arch = "aarch64")]
    cb.write(&0xD65F_03C0u32.to_le_bytes())?;
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    cb.write(&[0])?;
    let _exec = cb.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_finalize() {
        let mut cb = CodeBuffer::with_capacity(64).unwrap();
        cb.write(&[0x90, 0x90, 0xC3]).unwrap();
        assert_eq!(cb.len(), 3);
        let exec = cb.finalize().unwrap();
        assert_eq!(exec.len(), 3);
        assert_eq!(exec.bytes(), vec![0x90, 0x90, 0xC3]);
    }

    #[test]
    fn test_overflow_rejected() {
        let mut cb = CodeBuffer::with_capacity(4).unwrap();
        // The mapping is page-granular, so fill the whole page first.
        let page = region::page::size();
        let filler = vec![0u8; page];
        cb.write(&filler).unwrap();
        assert!(matches!(cb.write(&[0]), Err(CodegenError::CodeTooLarge)));
    }

    #[test]
    fn test_probe() {
        probe().unwrap();
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_execute_trivial_function() {
        // mov eax, 42; ret
        let mut cb = CodeBuffer::with_capacity(16).unwrap();
        cb.write(&[0xB8, 42, 0, 0, 0, 0xC3]).unwrap();
        let exec = cb.finalize().unwrap();
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(exec.ptr()) };
        assert_eq!(f(), 42);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_execute_trivial_function() {
        // mov w0, #42; ret
        let mut cb = CodeBuffer::with_capacity(16).unwrap();
        cb.write(&0x5280_0540u32.to_le_bytes()).unwrap();
        cb.write(&0xD65F_03C0u32.to_le_bytes()).unwrap();
        let exec = cb.finalize().unwrap();
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(exec.ptr()) };
        assert_eq!(f(), 42);
    }
}
