use nix::{
    errno::Errno,
    sys::utsname::uname,
    unistd::{sysconf, SysconfVar::PAGE_SIZE},
};
use std::{
    ffi::{CString, OsStr},
    mem::size_of,
    slice,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

lazy_static! {
    static ref SYSTEM_PAGE_SIZE: usize = page_size_init();
}

fn page_size_init() -> usize {
    match sysconf(PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => 4096,
    }
}

pub fn page_size() -> usize {
    *SYSTEM_PAGE_SIZE
}

pub fn ceil_page_size(size: usize) -> usize {
    (size + page_size() - 1) & !(page_size() - 1)
}

/// `readlink(2)` into a `PATH_MAX` buffer. A target that fills the buffer
/// is reported as ENAMETOOLONG instead of being silently truncated.
pub fn read_link(path: &Path) -> nix::Result<PathBuf> {
    let c_path = to_cstring(path)?;
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let ret = unsafe {
        libc::readlink(
            c_path.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    let len = Errno::result(ret)? as usize;
    if len >= buf.len() {
        return Err(Errno::ENAMETOOLONG);
    }
    buf.truncate(len);
    Ok(PathBuf::from(OsStr::from_bytes(&buf)))
}

pub fn to_cstring(path: &Path) -> nix::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

/// `KERNEL_VERSION(a, b, c)` of a release string like `5.10.0-8-amd64`.
/// Missing or non numeric parts count as 0.
pub fn parse_kernel_release(release: &str) -> u32 {
    let mut parts = [0u32; 3];
    for (i, part) in release.splitn(3, '.').enumerate() {
        let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
        parts[i] = digits.parse().unwrap_or(0);
        if digits.len() != part.len() {
            break;
        }
    }
    kernel_version(parts[0], parts[1], parts[2])
}

pub fn kernel_version(major: u32, minor: u32, revision: u32) -> u32 {
    (major << 16) + (minor << 8) + revision.min(255)
}

pub fn host_kernel_release() -> String {
    uname().release().to_owned()
}

/// Raw bytes of a plain C struct.
pub fn u8_slice<D: Sized>(val: &D) -> &[u8] {
    unsafe { slice::from_raw_parts(val as *const D as *const u8, size_of::<D>()) }
}

pub fn u8_slice_mut<D: Sized>(val: &mut D) -> &mut [u8] {
    unsafe { slice::from_raw_parts_mut(val as *mut D as *mut u8, size_of::<D>()) }
}

/// A scratch directory unique to this process and `tag`, removed first if
/// a previous run left it behind.
#[cfg(test)]
pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("vroot-test-{}-{}", std::process::id(), tag));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_release_parsing() {
        assert_eq!(kernel_version(2, 6, 16), parse_kernel_release("2.6.16"));
        assert_eq!(kernel_version(5, 10, 0), parse_kernel_release("5.10.0-8-amd64"));
        assert_eq!(kernel_version(3, 0, 0), parse_kernel_release("3"));
        assert_eq!(kernel_version(4, 19, 0), parse_kernel_release("4.19-rc1"));
        assert!(parse_kernel_release("2.6.27") > parse_kernel_release("2.6.16"));
    }

    #[test]
    fn read_link_of_scratch_symlink() {
        let dir = scratch_dir("util-readlink");
        let link = dir.join("link");
        std::os::unix::fs::symlink("some/target", &link).unwrap();
        assert_eq!(PathBuf::from("some/target"), read_link(&link).unwrap());
        assert_eq!(Err(Errno::ENOENT), read_link(&dir.join("missing")));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn page_rounding() {
        assert_eq!(0, ceil_page_size(0));
        assert_eq!(page_size(), ceil_page_size(1));
    }
}
