use std::{
    ffi::OsString,
    os::unix::ffi::OsStrExt,
    path::{Component, Path, PathBuf},
};

/// Which end of a binding a path is expressed in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Side {
    Guest,
    Host,
}

/// A host directory (or file) made visible at `guest` inside the tracee's
/// view of the filesystem. The root binding has `guest == "/"`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Binding {
    pub host: PathBuf,
    pub guest: PathBuf,
}

impl Binding {
    pub fn new<H: Into<PathBuf>, G: Into<PathBuf>>(host: H, guest: G) -> Binding {
        Binding {
            host: host.into(),
            guest: guest.into(),
        }
    }

    /// Symmetric bindings ("-b /dev") need no path rewriting.
    pub fn need_substitution(&self) -> bool {
        self.host != self.guest
    }

    fn side(&self, side: Side) -> &Path {
        match side {
            Side::Guest => &self.guest,
            Side::Host => &self.host,
        }
    }
}

/// Every binding of a tracee, in command-line order. Immutable once built;
/// tracees share it through `Rc`.
#[derive(Clone, Debug)]
pub struct Bindings {
    list: Vec<Binding>,
    root: PathBuf,
}

impl Bindings {
    /// `root` is the host directory presented as `/`. It becomes the first
    /// binding so that a later `-b HOST:/` overrides it.
    pub fn new(root: PathBuf, bindings: Vec<Binding>) -> Bindings {
        let mut list = vec![Binding::new(root.clone(), "/")];
        list.extend(bindings);
        Bindings { list, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.list.iter()
    }

    /// The binding whose `side` path most specifically contains `path`:
    /// the deepest one, and among equally deep ones the last given.
    pub fn get_binding(&self, side: Side, path: &Path) -> Option<&Binding> {
        self.list
            .iter()
            .filter(|binding| path.starts_with(binding.side(side)))
            .max_by_key(|binding| binding.side(side).components().count())
    }

    /// Host location of a canonical guest path. Every guest path is
    /// covered, at worst by the root binding.
    pub fn guest_to_host(&self, guest: &Path) -> PathBuf {
        match self.get_binding(Side::Guest, guest) {
            Some(binding) => substitute(guest, &binding.guest, &binding.host),
            None => guest.to_path_buf(),
        }
    }

    /// Guest view of a host path, or `None` when the path needs no change:
    /// a symmetric binding, or a path that no binding covers.
    pub fn host_to_guest(&self, host: &Path) -> Option<PathBuf> {
        // With a real rootfs, anything below it belongs to the rootfs even
        // if an asymmetric binding happens to contain the rootfs itself.
        if self.root != Path::new("/") && host.starts_with(&self.root) {
            return Some(substitute(host, &self.root, Path::new("/")));
        }
        let binding = self.get_binding(Side::Host, host)?;
        if !binding.need_substitution() {
            return None;
        }
        Some(substitute(host, &binding.host, &binding.guest))
    }

    /// True if `host` lies inside the rootfs rather than in a binding.
    pub fn belongs_to_guestfs(&self, host: &Path) -> bool {
        host.starts_with(&self.root)
    }
}

/// Replace the leading `from` of `path` with `to`. A trailing slash on
/// `path` is kept.
pub fn substitute(path: &Path, from: &Path, to: &Path) -> PathBuf {
    let rest = path.strip_prefix(from).unwrap_or(path);
    let mut result = if rest.as_os_str().is_empty() {
        to.to_path_buf()
    } else {
        to.join(rest)
    };
    if has_trailing_slash(path) && result != Path::new("/") {
        result = with_trailing_slash(result);
    }
    result
}

pub fn has_trailing_slash(path: &Path) -> bool {
    let bytes = path.as_os_str().as_bytes();
    bytes.len() > 1 && bytes.ends_with(b"/")
}

pub fn with_trailing_slash(path: PathBuf) -> PathBuf {
    if path.as_os_str().as_bytes().ends_with(b"/") {
        return path;
    }
    let mut s: OsString = path.into_os_string();
    s.push("/");
    PathBuf::from(s)
}

/// Lexical clean-up of an absolute guest location given on the command
/// line: `.` and repeated slashes vanish, `..` pops.
pub fn normalize_guest(path: &Path) -> PathBuf {
    let mut result = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(c) => result.push(c),
            Component::ParentDir => {
                result.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => (),
        }
    }
    result
}
