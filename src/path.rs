//! Everything about the guest's view of the filesystem: bindings,
//! canonicalization, and the host <-> guest translation built on them.

pub mod binding;
pub mod canon;
pub mod proc;
pub mod translate;
