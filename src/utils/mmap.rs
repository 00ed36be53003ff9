use std::ptr::null_mut;

/// Anonymous memory reservation used to back heap spaces. The reservation is
/// made in one piece at heap construction; spaces are carved out of it and
/// never own their payload mapping.
pub struct Mmap {
    start: *mut u8,
    end: *mut u8,
    size: usize,
}

impl Mmap {
    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn uninit() -> Self {
        Self {
            start: null_mut(),
            end: null_mut(),
            size: 0,
        }
    }

    pub fn new(size: usize) -> Self {
        unsafe {
            let map = libc::mmap(
                core::ptr::null_mut(),
                size as _,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if map == libc::MAP_FAILED {
                // Construction-time backend failure is fatal, there is no heap
                // to run without the reservation.
                panic!("heap reservation of {} bytes failed", size);
            }
            Self {
                start: map as *mut u8,
                end: (map as usize + size) as *mut u8,
                size,
            }
        }
    }

    pub fn start(&self) -> *mut u8 {
        self.start
    }

    pub fn end(&self) -> *mut u8 {
        self.end
    }

    pub fn contains(&self, addr: *const u8) -> bool {
        addr >= self.start as *const u8 && addr < self.end as *const u8
    }

    /// Release physical pages backing `[page, page + size)` while keeping the
    /// reservation itself.
    pub fn dontneed(&self, page: *mut u8, size: usize) {
        unsafe {
            libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
        }
    }

    pub fn commit(&self, page: *mut u8, size: usize) {
        unsafe {
            libc::madvise(page as *mut _, size as _, libc::MADV_WILLNEED);
        }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if self.start.is_null() {
            return;
        }
        unsafe {
            libc::munmap(self.start as *mut _, self.size as _);
        }
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}
