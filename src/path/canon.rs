//! Guest-side path canonicalization.
//!
//! Walks a path one component at a time the way the kernel's path lookup
//! does, except that every lookup is made on the host location of the
//! guest path resolved so far. `..` can never climb above the guest `/`,
//! so a tracee can't escape its root whatever the symlinks in it say.

use crate::{
    path::binding::{with_trailing_slash, Bindings},
    util::read_link,
};
use libc::{S_IFDIR, S_IFLNK, S_IFMT};
use nix::{errno::Errno, sys::stat::lstat};
use std::{
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

/// Same limit as the kernel.
pub const MAXSYMLINKS: usize = 40;

const PATH_MAX: usize = libc::PATH_MAX as usize;
const NAME_MAX: usize = 255;

/// What a magic `/proc` link resolves to for the calling tracee.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProcLink {
    /// An absolute guest path.
    Target(PathBuf),
    /// Not a path at all (`pipe:[1234]`, `anon_inode:...`): the link itself
    /// is the final object.
    Opaque,
}

/// Where canonicalization gets its host view from.
pub trait Resolver {
    /// Host location of the canonical guest path `guest`.
    fn host_path(&mut self, guest: &Path, is_final: bool) -> nix::Result<PathBuf>;

    /// Magic `/proc` links whose host value would be wrong for the guest.
    fn proc_link(&mut self, _guest: &Path) -> nix::Result<Option<ProcLink>> {
        Ok(None)
    }
}

/// Plain binding lookup with no tracee behind it. Used before any tracee
/// exists (command-line validation) and by tests.
pub struct BindingsResolver<'a> {
    pub bindings: &'a Bindings,
}

impl<'a> Resolver for BindingsResolver<'a> {
    fn host_path(&mut self, guest: &Path, _is_final: bool) -> nix::Result<PathBuf> {
        Ok(self.bindings.guest_to_host(guest))
    }
}

/// Resolve `user_path` against the canonical guest directory `base`.
///
/// The result is a canonical absolute guest path. The last component is
/// only dereferenced when `deref_final` is set; it may not exist (creation
/// syscalls). A trailing `/`, or a final `.` or `..`, requires a directory
/// and is kept as a trailing `/`.
pub fn canonicalize(
    resolver: &mut dyn Resolver,
    base: &Path,
    user_path: &Path,
    deref_final: bool,
    nb_readlink: usize,
) -> nix::Result<PathBuf> {
    if nb_readlink > MAXSYMLINKS {
        return Err(Errno::ELOOP);
    }
    let bytes = user_path.as_os_str().as_bytes();
    if !base.is_absolute() || bytes.is_empty() {
        return Err(Errno::EINVAL);
    }
    if bytes.len() >= PATH_MAX {
        return Err(Errno::ENAMETOOLONG);
    }

    let mut guest = if bytes[0] == b'/' {
        PathBuf::from("/")
    } else {
        base.to_path_buf()
    };
    let mut force_dir = bytes.len() > 1 && bytes.ends_with(b"/");
    let components: Vec<&[u8]> = bytes.split(|&b| b == b'/').filter(|c| !c.is_empty()).collect();

    for (i, component) in components.iter().enumerate() {
        let is_final = i + 1 == components.len();
        if component.len() >= NAME_MAX {
            return Err(Errno::ENAMETOOLONG);
        }

        match *component {
            b"." => {
                force_dir |= is_final;
                continue;
            }
            b".." => {
                guest.pop();
                force_dir |= is_final;
                continue;
            }
            _ => (),
        }

        let candidate = guest.join(OsStr::from_bytes(component));
        if candidate.as_os_str().len() >= PATH_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        let dereference = !is_final || deref_final || force_dir;

        if let Some(link) = resolver.proc_link(&candidate)? {
            match link {
                ProcLink::Target(target) if dereference => {
                    guest = canonicalize(resolver, &guest, &target, true, nb_readlink + 1)?;
                }
                ProcLink::Target(_) => guest = candidate,
                ProcLink::Opaque if is_final => guest = candidate,
                ProcLink::Opaque => return Err(Errno::ENOTDIR),
            }
            continue;
        }

        let host = resolver.host_path(&candidate, is_final)?;
        let stat = match lstat(&host) {
            Ok(stat) => stat,
            // Creation syscalls name a final component that doesn't exist yet.
            Err(Errno::ENOENT) if is_final => {
                guest = candidate;
                continue;
            }
            Err(err) => return Err(err),
        };

        let file_type = stat.st_mode & S_IFMT;
        if file_type == S_IFLNK && dereference {
            let target = read_link(&host)?;
            if target.as_os_str().is_empty() {
                return Err(Errno::ENOENT);
            }
            // Relative targets are relative to the directory holding the
            // link, which is what `guest` still is at this point.
            guest = canonicalize(resolver, &guest, &target, true, nb_readlink + 1)?;
            continue;
        }

        if file_type != S_IFDIR && file_type != S_IFLNK && (!is_final || force_dir) {
            return Err(Errno::ENOTDIR);
        }
        guest = candidate;
    }

    if force_dir && guest != Path::new("/") {
        guest = with_trailing_slash(guest);
    }
    Ok(guest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::scratch_dir;
    use std::{fs, os::unix::fs::symlink};

    /// rootfs layout shared by most tests:
    ///
    /// ```text
    /// /etc/passwd
    /// /dir/file
    /// /dir/sub/
    /// /link -> /dir/sub
    /// /rel -> dir/file
    /// /loop1 -> loop2, /loop2 -> loop1
    /// /escape -> ../../../../etc
    /// ```
    fn rootfs(tag: &str) -> PathBuf {
        let root = scratch_dir(tag);
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/passwd"), b"root:x:0:0").unwrap();
        fs::create_dir_all(root.join("dir/sub")).unwrap();
        fs::write(root.join("dir/file"), b"").unwrap();
        fs::create_dir_all(root.join("other")).unwrap();
        symlink("/dir/sub", root.join("link")).unwrap();
        symlink("dir/file", root.join("rel")).unwrap();
        symlink("loop2", root.join("loop1")).unwrap();
        symlink("loop1", root.join("loop2")).unwrap();
        symlink("../../../../etc", root.join("escape")).unwrap();
        root
    }

    fn canon(root: &Path, path: &str, deref: bool) -> nix::Result<PathBuf> {
        let bindings = Bindings::new(root.to_path_buf(), vec![]);
        let mut resolver = BindingsResolver {
            bindings: &bindings,
        };
        canonicalize(&mut resolver, Path::new("/"), Path::new(path), deref, 0)
    }

    #[test]
    fn dots_never_climb_above_root() {
        let root = rootfs("canon-dots");
        assert_eq!(PathBuf::from("/etc/passwd"), canon(&root, "/../../../etc/passwd", true).unwrap());
        assert_eq!(PathBuf::from("/etc/passwd"), canon(&root, "/escape/passwd", true).unwrap());
        assert_eq!(PathBuf::from("/dir/file"), canon(&root, "/dir/./sub/../file", true).unwrap());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn symlinks_follow_kernel_rules() {
        let root = rootfs("canon-links");
        // `..` applies to the link target, not to the link's parent.
        assert_eq!(PathBuf::from("/dir/file"), canon(&root, "/link/../file", true).unwrap());
        assert_eq!(PathBuf::from("/dir/file"), canon(&root, "/rel", true).unwrap());
        // Final component kept as is without dereference.
        assert_eq!(PathBuf::from("/rel"), canon(&root, "/rel", false).unwrap());
        assert_eq!(PathBuf::from("/dir/sub/"), canon(&root, "/link/", false).unwrap());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn symlink_loop_is_eloop() {
        let root = rootfs("canon-loop");
        assert_eq!(Err(Errno::ELOOP), canon(&root, "/loop1", true));
        assert_eq!(Err(Errno::ELOOP), canon(&root, "/loop1/x", false));
        // Not dereferenced, hence not an error.
        assert_eq!(PathBuf::from("/loop1"), canon(&root, "/loop1", false).unwrap());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn missing_and_non_directory_components() {
        let root = rootfs("canon-missing");
        assert_eq!(PathBuf::from("/dir/new"), canon(&root, "/dir/new", true).unwrap());
        assert_eq!(Err(Errno::ENOENT), canon(&root, "/nothing/new", true));
        assert_eq!(Err(Errno::ENOTDIR), canon(&root, "/dir/file/x", true));
        assert_eq!(Err(Errno::ENOTDIR), canon(&root, "/dir/file/", true));
        assert_eq!(PathBuf::from("/dir/newdir/"), canon(&root, "/dir/newdir/", true).unwrap());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn relative_paths_start_at_base() {
        let root = rootfs("canon-relative");
        let bindings = Bindings::new(root.clone(), vec![]);
        let mut resolver = BindingsResolver {
            bindings: &bindings,
        };
        let result = canonicalize(&mut resolver, Path::new("/dir"), Path::new("sub/.."), true, 0);
        assert_eq!(PathBuf::from("/dir/"), result.unwrap());
        let result = canonicalize(&mut resolver, Path::new("dir"), Path::new("x"), true, 0);
        assert_eq!(Err(Errno::EINVAL), result);
        let result = canonicalize(&mut resolver, Path::new("/"), Path::new(""), true, 0);
        assert_eq!(Err(Errno::EINVAL), result);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn idempotent() {
        let root = rootfs("canon-idempotent");
        for p in &["/link/../file", "/escape/passwd", "/dir/sub/", "/rel", "/dir/new"] {
            let once = canon(&root, p, true).unwrap();
            let twice = canon(&root, once.to_str().unwrap(), true).unwrap();
            assert_eq!(once, twice);
        }
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn length_limits() {
        let root = rootfs("canon-limits");
        let long_name = format!("/{}", "n".repeat(NAME_MAX));
        assert_eq!(Err(Errno::ENAMETOOLONG), canon(&root, &long_name, true));
        let long_path = "/a".repeat(PATH_MAX / 2);
        assert_eq!(Err(Errno::ENAMETOOLONG), canon(&root, &long_path, true));
        fs::remove_dir_all(&root).unwrap();
    }
}
