//! Virtual ring buffer.
//!
//! A contiguous byte pipe whose backing pages are mapped twice, back to
//! back, so a span that logically wraps around the end of the ring is still
//! one contiguous slice of memory. Producers write at `space_ptr`, consumers
//! read at `data_ptr`; neither side ever has to split an access at the seam.
//!
//! Layout of the reservation (`mem_ptr`, `PROT_NONE`):
//!
//! ```text
//! | guard | lower mapping | upper mapping | guard |
//!           ^lower_ptr      ^upper_ptr
//! ```
//!
//! Both mappings are `MAP_FIXED | MAP_SHARED` views of the same unlinked
//! temporary file, so a write through one is visible through the other.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::slice;

use crate::util::{page_size, round_up_to_page_size};
use crate::{Error, Result};

#[derive(Debug)]
pub struct Vrb {
    mem_ptr: *mut u8,
    mem_ptr_size: usize,
    lower_ptr: *mut u8,
    upper_ptr: *mut u8,
    ptr_size: usize,
    data_ptr: *mut u8,
    space_ptr: *mut u8,
}

impl Vrb {
    /// Build a ring of at least `size` bytes (rounded up to a whole page;
    /// zero means one page). `file_pattern` is a `mkstemp` template for the
    /// backing file, which is unlinked immediately and survives only as an
    /// open descriptor for the duration of this call.
    pub fn new(size: usize, file_pattern: &str) -> Result<Self> {
        let sz = page_size();
        let size = if size == 0 {
            sz
        } else {
            round_up_to_page_size(size)
        };
        let mem_ptr_size = size * 2 + sz * 2;

        // Safety: fresh PROT_NONE reservation; nothing else maps here.
        let mem_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mem_ptr_size,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if mem_ptr == libc::MAP_FAILED {
            return Err(Error::BufferMmap(io::Error::last_os_error()));
        }
        let mem_ptr = mem_ptr as *mut u8;

        match unsafe { Self::map_pair(mem_ptr, size, file_pattern) } {
            Ok((lower_ptr, upper_ptr)) => Ok(Self {
                mem_ptr,
                mem_ptr_size,
                lower_ptr,
                upper_ptr,
                ptr_size: size,
                data_ptr: lower_ptr,
                space_ptr: lower_ptr,
            }),
            Err(e) => {
                // Safety: releasing the reservation made above.
                unsafe { libc::munmap(mem_ptr as *mut libc::c_void, mem_ptr_size) };
                Err(Error::BufferMmap(e))
            }
        }
    }

    /// Map the backing file twice inside the reservation starting at
    /// `mem_ptr`. Returns the two alias addresses.
    ///
    /// # Safety
    ///
    /// `mem_ptr` must be a reservation of at least `2 * size + 2 * page`
    /// bytes owned by the caller.
    unsafe fn map_pair(mem_ptr: *mut u8, size: usize, file_pattern: &str) -> io::Result<(*mut u8, *mut u8)> {
        let sz = page_size();
        let lower_ptr = mem_ptr.add(sz);
        let upper_ptr = lower_ptr.add(size);

        let template = CString::new(file_pattern).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "nul byte in buffer file pattern")
        })?;
        let mut template = template.into_bytes_with_nul();

        let old_umask = libc::umask(0o077);
        let fd = libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char);
        libc::umask(old_umask);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // The file only needs to exist as a descriptor.
        let rv = libc::unlink(template.as_ptr() as *const libc::c_char);
        if rv < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        if libc::ftruncate(fd, size as libc::off_t) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        for &addr in &[lower_ptr, upper_ptr] {
            let p = libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_FIXED | libc::MAP_SHARED,
                fd,
                0,
            );
            if p == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            if p != addr as *mut libc::c_void {
                libc::close(fd);
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "MAP_FIXED returned a different address",
                ));
            }
        }

        libc::close(fd);
        Ok((lower_ptr, upper_ptr))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ptr_size
    }

    /// Unread bytes between the consumer and the producer.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.space_ptr as usize - self.data_ptr as usize
    }

    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.ptr_size - self.bytes()
    }

    /// The producer's contiguous write window of `len` bytes.
    pub fn space_mut(&mut self, len: usize) -> &mut [u8] {
        assert!(len <= self.free_bytes());
        // Safety: [space_ptr, space_ptr + free_bytes) stays inside the
        // double mapping, and the window is disjoint from any unread data.
        unsafe { slice::from_raw_parts_mut(self.space_ptr, len) }
    }

    /// The consumer's contiguous read window of `len` bytes.
    pub fn data(&self, len: usize) -> &[u8] {
        assert!(len <= self.bytes());
        // Safety: [data_ptr, data_ptr + bytes) stays inside the double
        // mapping.
        unsafe { slice::from_raw_parts(self.data_ptr, len) }
    }

    /// Publish `size` produced bytes.
    pub fn give(&mut self, size: usize) -> Result<()> {
        if size > self.free_bytes() {
            return Err(Error::BufferNoSpace);
        }
        // Safety: bounded by free_bytes, so space_ptr stays within
        // data_ptr + capacity, i.e. inside the upper mapping.
        self.space_ptr = unsafe { self.space_ptr.add(size) };
        Ok(())
    }

    /// Consume `size` unread bytes.
    pub fn take(&mut self, size: usize) -> Result<()> {
        if size > self.bytes() {
            return Err(Error::InvalidArgument);
        }
        // Safety: bounded by bytes(); the rebase below keeps both pointers
        // inside the mappings.
        self.data_ptr = unsafe { self.data_ptr.add(size) };
        if self.data_ptr >= self.upper_ptr {
            // Both pointers slide down together so their difference (the
            // unread byte count) is preserved.
            self.data_ptr = unsafe { self.data_ptr.sub(self.ptr_size) };
            self.space_ptr = unsafe { self.space_ptr.sub(self.ptr_size) };
        }
        Ok(())
    }

    /// Rebuild the mappings with a new capacity, carrying the unread bytes
    /// over. Callers must hold whatever higher-level exclusion applies.
    pub fn resize(&mut self, size: usize, file_pattern: &str) -> Result<()> {
        let mut new = Vrb::new(size, file_pattern)?;
        let unread = self.bytes();
        if unread > new.capacity() {
            return Err(Error::BufferNoSpace);
        }
        new.space_mut(unread).copy_from_slice(self.data(unread));
        new.give(unread)?;
        *self = new;
        Ok(())
    }
}

impl Drop for Vrb {
    fn drop(&mut self) {
        // Safety: one call releases the whole reservation, aliases included:
        // munmap operates on the address range, not on individual mappings.
        unsafe {
            libc::munmap(self.mem_ptr as *mut libc::c_void, self.mem_ptr_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pattern(dir: &tempfile::TempDir) -> String {
        dir.path().join("vrb.XXXXXX").to_str().unwrap().to_string()
    }

    #[test]
    fn accounting() {
        let dir = tempfile::tempdir().unwrap();
        let mut vrb = Vrb::new(0, &pattern(&dir)).unwrap();
        let cap = vrb.capacity();
        assert_eq!(cap, page_size());
        assert_eq!(vrb.bytes(), 0);
        assert_eq!(vrb.free_bytes(), cap);

        vrb.give(100).unwrap();
        assert_eq!(vrb.bytes(), 100);
        assert_eq!(vrb.free_bytes(), cap - 100);

        vrb.take(40).unwrap();
        assert_eq!(vrb.bytes(), 60);

        assert!(matches!(vrb.take(61), Err(Error::InvalidArgument)));
        assert!(matches!(vrb.give(cap), Err(Error::BufferNoSpace)));
    }

    #[test]
    fn full_capacity_is_usable() {
        let dir = tempfile::tempdir().unwrap();
        let mut vrb = Vrb::new(0, &pattern(&dir)).unwrap();
        let cap = vrb.capacity();
        vrb.give(cap).unwrap();
        assert_eq!(vrb.bytes(), cap);
        assert_eq!(vrb.free_bytes(), 0);
        vrb.take(cap).unwrap();
        assert_eq!(vrb.bytes(), 0);
        assert_eq!(vrb.free_bytes(), cap);
    }

    #[test]
    fn wraparound_is_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let mut vrb = Vrb::new(0, &pattern(&dir)).unwrap();
        let cap = vrb.capacity();

        // Move the window so that a 16-byte span straddles the seam.
        vrb.give(cap - 8).unwrap();
        vrb.take(cap - 8).unwrap();
        assert_eq!(vrb.bytes(), 0);

        let payload: Vec<u8> = (0u8..16).collect();
        vrb.space_mut(16).copy_from_slice(&payload);
        vrb.give(16).unwrap();
        assert_eq!(vrb.data(16), &payload[..]);
        vrb.take(16).unwrap();
        assert_eq!(vrb.bytes(), 0);
    }

    #[test]
    fn aliased_mappings_share_pages() {
        let dir = tempfile::tempdir().unwrap();
        let mut vrb = Vrb::new(0, &pattern(&dir)).unwrap();
        let cap = vrb.capacity();
        // Fill the whole ring, then check the bytes written through the
        // upper half of the window read back after the rebase.
        vrb.give(cap - 4).unwrap();
        vrb.take(cap - 4).unwrap();
        vrb.space_mut(8).copy_from_slice(b"abcdefgh");
        vrb.give(8).unwrap();
        vrb.take(4).unwrap(); // crosses upper_ptr, rebases both pointers
        assert_eq!(vrb.data(4), b"efgh");
    }

    #[test]
    fn resize_preserves_unread_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let p = pattern(&dir);
        let mut vrb = Vrb::new(0, &p).unwrap();
        vrb.space_mut(5).copy_from_slice(b"hello");
        vrb.give(5).unwrap();

        vrb.resize(page_size() * 2, &p).unwrap();
        assert_eq!(vrb.capacity(), page_size() * 2);
        assert_eq!(vrb.bytes(), 5);
        assert_eq!(vrb.data(5), b"hello");
    }

    #[test]
    fn bad_pattern_is_reported() {
        let err = Vrb::new(0, "/nonexistent-dir/vrb.XXXXXX").unwrap_err();
        assert!(matches!(err, Error::BufferMmap(_)));
    }
}
