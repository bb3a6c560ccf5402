// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Anonymous page mappings with alignment guarantees. Everything the
//! runtime takes from the OS goes through here: arena extents, obstack
//! slabs, the kind map, and the intern table's bucket reservation.

use core::ptr::NonNull;

use rustix::mm::{MapFlags, ProtFlags, mmap_anonymous, munmap};

use crate::{Error, Result};

pub const PAGE_SIZE: usize = 4096;

/// Maps `len` bytes of zeroed read-write memory aligned to `align`
/// (a power of two). Alignment above the page size is produced by
/// over-mapping and trimming the edges.
pub fn map_aligned(len: usize, align: usize) -> Result<NonNull<u8>> {
    debug_assert!(align.is_power_of_two());
    debug_assert!(len % PAGE_SIZE == 0);

    if align <= PAGE_SIZE {
        return map(len, MapFlags::PRIVATE);
    }

    let padded = len + align;
    let raw = map(padded, MapFlags::PRIVATE)?;
    let addr = raw.as_ptr() as usize;
    let aligned = addr.next_multiple_of(align);

    let lead = aligned - addr;
    let trail = padded - len - lead;
    // Safety: both ranges are page-aligned sub-ranges of the mapping we
    // just created and are not handed out to anyone.
    unsafe {
        if lead != 0 {
            munmap(raw.as_ptr().cast(), lead).expect("munmap failed");
        }
        if trail != 0 {
            munmap((aligned + len) as *mut _, trail).expect("munmap failed");
        }
    }

    // Non-null: `aligned` lies inside a successful mapping.
    Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
}

/// Reserves `len` bytes of address space without committing backing
/// store up front. Untouched pages read as zero and cost nothing.
pub fn reserve(len: usize) -> Result<NonNull<u8>> {
    map(len, MapFlags::PRIVATE | MapFlags::NORESERVE)
}

fn map(len: usize, flags: MapFlags) -> Result<NonNull<u8>> {
    // Safety: requesting a fresh anonymous mapping; no existing memory is
    // affected.
    let ptr = unsafe {
        mmap_anonymous(
            core::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            flags,
        )
    }
    .map_err(|errno| {
        log::error!("anonymous mmap of {len} bytes failed: {errno}");
        Error::OutOfMemory
    })?;
    Ok(NonNull::new(ptr.cast()).expect("mmap returned null"))
}

/// Returns `len` bytes previously obtained from [`map_aligned`] or
/// [`reserve`].
///
/// # Safety
///
/// `ptr..ptr + len` must be exactly a region returned by this module and
/// no longer referenced.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    // Safety: per the contract above.
    unsafe {
        munmap(ptr.as_ptr().cast(), len).expect("munmap failed");
    }
}

/// Advise the kernel to exclude a range from core dumps. Best effort.
pub fn dont_dump(ptr: NonNull<u8>, len: usize) {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            // Safety: advice only; does not change the mapping.
            let _ = unsafe {
                rustix::mm::madvise(ptr.as_ptr().cast(), len, rustix::mm::Advice::LinuxDontDump)
            };
        } else {
            let _ = (ptr, len);
        }
    }
}
