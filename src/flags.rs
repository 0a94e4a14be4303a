use crate::{
    commands::vroot_options::{recommended_bindings, VrootOptions},
    path::binding::Binding,
};
use std::{ffi::OsString, path::PathBuf};
use structopt::StructOpt;

lazy_static! {
    static ref FLAGS: Flags = init_flags();
}

#[derive(Clone, Debug)]
pub struct Flags {
    /// Host directory seen as `/` by the tracees.
    pub rootfs: PathBuf,
    /// In command line order; the deepest matching binding wins, the last
    /// one given among equally deep ones.
    pub bindings: Vec<Binding>,
    /// Guest path, checked before launch.
    pub cwd: Option<PathBuf>,
    pub command: Vec<OsString>,
    pub verbose: u32,
    pub kernel_release: Option<String>,
    /// Faked uid and gid.
    pub fake_id: Option<(u32, u32)>,
    pub link2symlink: bool,
    pub mmap_noexec: bool,
    pub cow: bool,
    pub no_seccomp: bool,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }

    pub fn from_options(options: VrootOptions) -> Flags {
        let mut bindings = Vec::new();
        let rootfs = match (options.rootfs, options.rootfs_recommended) {
            (_, Some(rootfs)) => {
                bindings.extend(recommended_bindings());
                rootfs
            }
            (Some(rootfs), None) => rootfs,
            (None, None) => PathBuf::from("/"),
        };
        // Explicit bindings come last so they override the recommended ones.
        bindings.extend(options.bindings);

        let fake_id = if options.root_id {
            Some((0, 0))
        } else {
            options.change_id
        };

        Flags {
            rootfs,
            bindings,
            cwd: options.cwd,
            command: options.command,
            verbose: options.verbose,
            kernel_release: options.kernel_release,
            fake_id,
            link2symlink: options.link2symlink,
            mmap_noexec: options.mmap_noexec,
            cow: options.cow,
            no_seccomp: options.no_seccomp,
        }
    }
}

pub fn init_flags() -> Flags {
    Flags::from_options(VrootOptions::from_args())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(args: &[&str]) -> Flags {
        let options =
            VrootOptions::from_iter_safe(std::iter::once("vroot").chain(args.iter().copied()))
                .unwrap();
        Flags::from_options(options)
    }

    #[test]
    fn defaults() {
        let flags = flags(&[]);
        assert_eq!(PathBuf::from("/"), flags.rootfs);
        assert!(flags.bindings.is_empty());
        assert!(flags.command.is_empty());
        assert_eq!(None, flags.fake_id);
        assert!(!flags.no_seccomp);
    }

    #[test]
    fn root_id_is_zero_zero() {
        assert_eq!(Some((0, 0)), flags(&["-0"]).fake_id);
        assert_eq!(Some((7, 8)), flags(&["-i", "7:8"]).fake_id);
    }

    #[test]
    fn recommended_bindings_come_first() {
        let flags = flags(&["-R", "/", "-b", "/:/mnt"]);
        assert_eq!(PathBuf::from("/"), flags.rootfs);
        assert_eq!(Some(&Binding::new("/", "/mnt")), flags.bindings.last());
    }
}
