use core::ptr::NonNull;

use super::{MapLoadError, PageSource, Protection};

const MAPS_PATH: &[u8] = b"/proc/self/maps\0";
const READ_CHUNK: usize = 4096;
const LINE_MAX: usize = 512;

/// [`PageSource`] built on `mmap(2)`, `munmap(2)`, `mprotect(2)`,
/// `madvise(2)`, `sbrk(2)` and `/proc/self/maps`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixMMapSource;

impl UnixMMapSource {
    pub const fn new() -> Self {
        Self
    }
}

// SAFETY: every method is a thin wrapper over a system call and never allocates.
unsafe impl PageSource for UnixMMapSource {
    fn page_size(&self) -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        if size <= 0 {
            crate::page::DEFAULT_PAGE_SIZE
        } else {
            size as usize
        }
    }

    fn map(&self, hint: Option<NonNull<u8>>, len: usize) -> Option<NonNull<u8>> {
        let addr = hint.map_or(core::ptr::null_mut(), |h| h.as_ptr().cast());

        let x = unsafe {
            libc::mmap(
                addr,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if x == libc::MAP_FAILED {
            return None;
        }

        NonNull::new(x.cast())
    }

    unsafe fn unmap(&self, base: NonNull<u8>, len: usize) {
        let result = unsafe { libc::munmap(base.as_ptr().cast(), len) };

        // reporting through the usual channels may allocate
        #[cfg(debug_assertions)]
        if result != 0 {
            libc::abort();
        }
        #[cfg(not(debug_assertions))]
        let _ = result;
    }

    unsafe fn protect(&self, base: NonNull<u8>, len: usize, prot: Protection) -> bool {
        let prot = match prot {
            Protection::None => libc::PROT_NONE,
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        };

        unsafe { libc::mprotect(base.as_ptr().cast(), len, prot) == 0 }
    }

    unsafe fn invalidate(&self, base: NonNull<u8>, len: usize) -> bool {
        #[cfg(target_os = "linux")]
        let result = unsafe { libc::madvise(base.as_ptr().cast(), len, libc::MADV_FREE) };

        #[cfg(not(target_os = "linux"))]
        let result = unsafe { libc::madvise(base.as_ptr().cast(), len, libc::MADV_DONTNEED) };

        result == 0
    }

    fn grow_heap(&self, increment: isize) -> Option<NonNull<u8>> {
        let old = unsafe { libc::sbrk(increment as libc::intptr_t) };

        if old as usize == usize::MAX {
            return None;
        }

        NonNull::new(old.cast())
    }

    fn heap_break(&self) -> *mut u8 {
        unsafe { libc::sbrk(0).cast() }
    }

    fn load_map(&self, sink: &mut dyn FnMut(usize, usize)) -> Result<(), MapLoadError> {
        let fd = unsafe { libc::open(MAPS_PATH.as_ptr().cast(), libc::O_RDONLY | libc::O_CLOEXEC) };

        if fd < 0 {
            return Err(MapLoadError::Unreadable);
        }

        let result = read_maps(fd, sink);

        unsafe {
            libc::close(fd);
        }

        result
    }
}

fn read_maps(fd: libc::c_int, sink: &mut dyn FnMut(usize, usize)) -> Result<(), MapLoadError> {
    let mut chunk = [0u8; READ_CHUNK];
    let mut line = [0u8; LINE_MAX];
    let mut line_len = 0;
    let mut line_no = 0;

    loop {
        let n = unsafe { libc::read(fd, chunk.as_mut_ptr().cast(), READ_CHUNK) };

        if n < 0 {
            return Err(MapLoadError::Unreadable);
        }
        if n == 0 {
            break;
        }

        for &byte in &chunk[..n as usize] {
            if byte == b'\n' {
                line_no += 1;
                let (start, end) = parse_range(&line[..line_len])
                    .ok_or(MapLoadError::Malformed { line: line_no })?;
                sink(start, end);
                line_len = 0;
            } else if line_len < LINE_MAX {
                // only the leading address range matters, the tail may be truncated
                line[line_len] = byte;
                line_len += 1;
            }
        }
    }

    if line_len != 0 {
        line_no += 1;
        let (start, end) =
            parse_range(&line[..line_len]).ok_or(MapLoadError::Malformed { line: line_no })?;
        sink(start, end);
    }

    Ok(())
}

/// Parses the leading `start-end` hexadecimal pair of a maps line.
pub(crate) fn parse_range(line: &[u8]) -> Option<(usize, usize)> {
    let dash = line.iter().position(|&b| b == b'-')?;
    let space = line[dash..].iter().position(|&b| b == b' ').map_or(line.len(), |p| p + dash);

    let start = parse_hex(&line[..dash])?;
    let end = parse_hex(&line[dash + 1..space])?;

    if start >= end {
        return None;
    }

    Some((start, end))
}

fn parse_hex(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() {
        return None;
    }

    let mut value: usize = 0;
    for &d in digits {
        let nibble = match d {
            b'0'..=b'9' => d - b'0',
            b'a'..=b'f' => d - b'a' + 10,
            b'A'..=b'F' => d - b'A' + 10,
            _ => return None,
        };
        value = value.checked_mul(16)?.checked_add(nibble as usize)?;
    }

    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_maps_lines() {
        let line = b"7f3a1c000000-7f3a1c021000 rw-p 00000000 00:00 0 ";
        assert_eq!(parse_range(line), Some((0x7f3a1c000000, 0x7f3a1c021000)));

        let line = b"55d0c0a00000-55d0c0a21000 r--p 00000000 08:01 1234    /usr/bin/app";
        assert_eq!(parse_range(line), Some((0x55d0c0a00000, 0x55d0c0a21000)));

        assert_eq!(parse_range(b"garbage"), None);
        assert_eq!(parse_range(b"2000-1000 r--p"), None);
        assert_eq!(parse_range(b"-1000 r--p"), None);
    }

    #[test]
    fn map_unmap_and_load() {
        let source = UnixMMapSource::new();
        let page = source.page_size();
        assert!(page.is_power_of_two());

        let base = source.map(None, page * 2).unwrap();
        assert_eq!(base.as_ptr() as usize % page, 0);

        unsafe {
            base.as_ptr().write_bytes(0xAB, page * 2);
            assert!(source.invalidate(base, page));
            assert!(source.protect(base, page, Protection::Read));
            assert!(source.protect(base, page, Protection::ReadWrite));
        }

        let mut found = false;
        let mut last_start = 0;
        let mut sorted = true;
        let addr = base.as_ptr() as usize;
        let result = source.load_map(&mut |start, end| {
            sorted &= start >= last_start;
            last_start = start;
            found |= start <= addr && addr < end;
        });

        #[cfg(target_os = "linux")]
        {
            assert_eq!(result, Ok(()));
            assert!(found);
            assert!(sorted);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = (result, found, sorted);

        unsafe {
            source.unmap(base, page * 2);
        }
    }
}
