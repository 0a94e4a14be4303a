use crate::path::binding::Bindings;
use std::{cell::RefCell, path::PathBuf, rc::Rc};

/// Filesystem view of a tracee: its guest working directory and the
/// bindings it resolves paths through.
#[derive(Clone, Debug)]
pub struct FileSystem {
    /// Canonical guest path, never with a trailing slash except for `/`.
    pub cwd: PathBuf,
    pub bindings: Rc<Bindings>,
}

pub type SharedFileSystem = Rc<RefCell<FileSystem>>;

impl FileSystem {
    pub fn new(cwd: PathBuf, bindings: Rc<Bindings>) -> SharedFileSystem {
        Rc::new(RefCell::new(FileSystem { cwd, bindings }))
    }
}

/// Filesystem info of a new child. `CLONE_FS` children share their
/// parent's, so a `chdir` in one is seen by the other. Everybody else gets
/// a private copy (the bindings themselves are immutable and stay shared).
pub fn inherit(parent: &SharedFileSystem, clone_fs: bool) -> SharedFileSystem {
    if clone_fs {
        Rc::clone(parent)
    } else {
        Rc::new(RefCell::new(parent.borrow().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent() -> SharedFileSystem {
        let bindings = Rc::new(Bindings::new(PathBuf::from("/"), vec![]));
        FileSystem::new(PathBuf::from("/home"), bindings)
    }

    #[test]
    fn clone_fs_shares_cwd() {
        let parent = parent();
        let child = inherit(&parent, true);
        child.borrow_mut().cwd = PathBuf::from("/tmp");
        assert_eq!(PathBuf::from("/tmp"), parent.borrow().cwd);
    }

    #[test]
    fn fork_gets_private_cwd() {
        let parent = parent();
        let child = inherit(&parent, false);
        child.borrow_mut().cwd = PathBuf::from("/tmp");
        assert_eq!(PathBuf::from("/home"), parent.borrow().cwd);
        assert!(Rc::ptr_eq(&parent.borrow().bindings, &child.borrow().bindings));
    }
}
