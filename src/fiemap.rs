//! `FS_IOC_FIEMAP` wrapper: resolves a byte range of a file to physical
//! extents on the backing block device.

use std::ffi::c_long;
use std::io;
use std::os::unix::io::RawFd;

/// ioctl macro: command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: read/write command.
macro_rules! iowr {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(3u64, $a, $b, std::mem::size_of::<$c>() as c_long as u64)
    };
}

/// Bit in `fe_flags` meaning the extent's physical location could not be
/// determined (e.g. an unallocated hole, or a filesystem that doesn't
/// support the query). Such extents carry no usable `physical` address.
const FIEMAP_EXTENT_UNKNOWN: u32 = 0x0001;

/// Tell the kernel to return `fm_extent_count` in one call, looping if it
/// reports more than we asked for.
const FIEMAP_FLAG_SYNC: u32 = 0;

#[repr(C)]
struct FiemapHeader {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct FiemapExtentRaw {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

/// One physical extent backing part of a file, as reported by the kernel.
#[derive(Debug, Clone, Copy)]
pub struct Extent {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
    pub unknown: bool,
}

impl From<FiemapExtentRaw> for Extent {
    fn from(raw: FiemapExtentRaw) -> Self {
        Self {
            logical: raw.fe_logical,
            physical: raw.fe_physical,
            length: raw.fe_length,
            unknown: raw.fe_flags & FIEMAP_EXTENT_UNKNOWN != 0,
        }
    }
}

/// Runs the two-phase FIEMAP protocol over `[offset, offset+length)` of the
/// open file `fd`: first with `fm_extent_count = 0` to learn how many
/// extents the kernel wants to report, then again with `count + 1` slack.
/// Retries with a larger buffer if the kernel reports it filled the buffer
/// exactly (meaning there may be more extents than we allocated for).
pub fn resolve(fd: RawFd, offset: u64, length: u64) -> io::Result<Vec<Extent>> {
    let fm_fiemap: c_long = iowr!(b'f' as u64, 11, FiemapHeader) as c_long;

    let mut count = query_extent_count(fd, fm_fiemap, offset, length)?;
    loop {
        let want = count as u32 + 1;
        let (extents, mapped) = fetch_extents(fd, fm_fiemap, offset, length, want)?;
        if mapped < want {
            return Ok(extents);
        }
        // The kernel filled the buffer; there may be more extents than we
        // asked for. Grow and retry.
        count = mapped as u64;
    }
}

fn query_extent_count(fd: RawFd, cmd: c_long, offset: u64, length: u64) -> io::Result<u64> {
    let mut header = FiemapHeader {
        fm_start: offset,
        fm_length: length,
        fm_flags: FIEMAP_FLAG_SYNC,
        fm_mapped_extents: 0,
        fm_extent_count: 0,
        fm_reserved: 0,
    };
    let ret = unsafe { libc::ioctl(fd, cmd as _, &mut header as *mut FiemapHeader) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(header.fm_mapped_extents as u64)
}

fn fetch_extents(
    fd: RawFd,
    cmd: c_long,
    offset: u64,
    length: u64,
    extent_count: u32,
) -> io::Result<(Vec<Extent>, u32)> {
    let header_size = std::mem::size_of::<FiemapHeader>();
    let extent_size = std::mem::size_of::<FiemapExtentRaw>();
    let buf_len = header_size + extent_size * extent_count as usize;
    let mut buf = vec![0u8; buf_len];

    {
        let header = buf.as_mut_ptr() as *mut FiemapHeader;
        unsafe {
            (*header).fm_start = offset;
            (*header).fm_length = length;
            (*header).fm_flags = FIEMAP_FLAG_SYNC;
            (*header).fm_mapped_extents = 0;
            (*header).fm_extent_count = extent_count;
            (*header).fm_reserved = 0;
        }
    }

    let ret = unsafe { libc::ioctl(fd, cmd as _, buf.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let mapped = unsafe { (*(buf.as_ptr() as *const FiemapHeader)).fm_mapped_extents };

    let mut extents = Vec::with_capacity(mapped as usize);
    for i in 0..mapped as usize {
        let offset_in_buf = header_size + i * extent_size;
        let raw = unsafe {
            std::ptr::read_unaligned(buf.as_ptr().add(offset_in_buf) as *const FiemapExtentRaw)
        };
        extents.push(Extent::from(raw));
    }
    Ok((extents, mapped))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_flag_is_detected() {
        let raw = FiemapExtentRaw {
            fe_logical: 0,
            fe_physical: 0,
            fe_length: 4096,
            fe_reserved64: [0; 2],
            fe_flags: FIEMAP_EXTENT_UNKNOWN,
            fe_reserved: [0; 3],
        };
        let extent: Extent = raw.into();
        assert!(extent.unknown);
    }

    #[test]
    fn known_extent_is_not_flagged_unknown() {
        let raw = FiemapExtentRaw {
            fe_logical: 4096,
            fe_physical: 1_000_000,
            fe_length: 4096,
            fe_reserved64: [0; 2],
            fe_flags: 0,
            fe_reserved: [0; 3],
        };
        let extent: Extent = raw.into();
        assert!(!extent.unknown);
        assert_eq!(extent.physical, 1_000_000);
    }
}
