use crate::{
    commands::VrootCommand,
    event_loop::{EventLoop, Launch},
    extension::extensions_from_flags,
    flags::Flags,
    log::{
        raise_default_level,
        LogLevel::{LogDebug, LogInfo},
    },
    path::{
        binding::Bindings,
        canon::{canonicalize, BindingsResolver},
        translate::detranslate_path,
    },
    tracee::fs::FileSystem,
    util::{host_kernel_release, kernel_version, parse_kernel_release},
};
use nix::errno::Errno;
use std::{
    env,
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    rc::Rc,
};

const DEFAULT_COMMAND: &str = "/bin/sh";

/// Runs the command line of `Flags` under the guest view.
pub struct RunCommand {
    flags: Flags,
}

impl RunCommand {
    pub fn new(flags: &Flags) -> RunCommand {
        RunCommand {
            flags: flags.clone(),
        }
    }

    fn launch(&self) -> nix::Result<EventLoop> {
        let bindings = Rc::new(Bindings::new(
            self.flags.rootfs.clone(),
            self.flags.bindings.clone(),
        ));
        for binding in bindings.iter() {
            log!(LogDebug, "binding {:?} -> {:?}", binding.host, binding.guest);
        }

        let cwd = match &self.flags.cwd {
            Some(cwd) => match guest_dir(&bindings, cwd) {
                Ok(cwd) => cwd,
                Err(err) => clean_fatal!("can't use {:?} as working directory: {}", cwd, err),
            },
            None => default_cwd(&bindings),
        };
        log!(LogInfo, "guest working directory: {:?}", cwd);

        let command = if self.flags.command.is_empty() {
            vec![OsString::from(DEFAULT_COMMAND)]
        } else {
            self.flags.command.clone()
        };

        EventLoop::launch(Launch {
            command: &command,
            fs: FileSystem::new(cwd, bindings),
            extensions: extensions_from_flags(&self.flags),
            use_seccomp: use_seccomp(&self.flags, parse_kernel_release(&host_kernel_release())),
        })
    }
}

impl VrootCommand for RunCommand {
    fn run(&mut self) -> io::Result<i32> {
        match self.flags.verbose {
            0 => (),
            1 => raise_default_level(LogInfo),
            _ => raise_default_level(LogDebug),
        }
        let mut event_loop = match self.launch() {
            Ok(event_loop) => event_loop,
            Err(err) => clean_fatal!("can't launch {:?}: {}", self.flags.command, err),
        };
        Ok(event_loop.run())
    }
}

/// Seccomp traps come before the syscall-enter stop only since 4.8; on
/// older kernels the event loop would take that stop for the exit.
fn use_seccomp(flags: &Flags, host_version: u32) -> bool {
    if flags.no_seccomp || env::var_os("VROOT_NO_SECCOMP").is_some() {
        return false;
    }
    if host_version < kernel_version(4, 8, 0) {
        log!(LogInfo, "seccomp acceleration needs Linux 4.8 or newer, using plain ptrace");
        return false;
    }
    true
}

/// Canonical guest form of `dir`, which has to be a directory of the
/// guest. No trailing slash.
fn guest_dir(bindings: &Bindings, dir: &Path) -> nix::Result<PathBuf> {
    let mut resolver = BindingsResolver { bindings };
    let guest = canonicalize(&mut resolver, Path::new("/"), dir, true, 0)?;
    let guest: PathBuf = guest.components().collect();
    if !bindings.guest_to_host(&guest).is_dir() {
        return Err(Errno::ENOTDIR);
    }
    Ok(guest)
}

/// The host working directory when the guest can see it, `/` otherwise.
fn default_cwd(bindings: &Bindings) -> PathBuf {
    env::current_dir()
        .ok()
        .and_then(|host| {
            let guest = detranslate_path(bindings, &host, None).unwrap_or(host);
            guest_dir(bindings, &guest).ok()
        })
        .unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        commands::vroot_options::VrootOptions, path::binding::Binding, util::scratch_dir,
    };
    use std::fs;
    use structopt::StructOpt;

    #[test]
    fn guest_dir_resolves_in_rootfs() {
        let root = scratch_dir("run-cwd").canonicalize().unwrap();
        fs::create_dir_all(root.join("home/user")).unwrap();
        fs::write(root.join("file"), b"").unwrap();
        let bindings = Bindings::new(root.clone(), vec![]);

        assert_eq!(
            PathBuf::from("/home/user"),
            guest_dir(&bindings, Path::new("/home/./user/")).unwrap()
        );
        assert_eq!(PathBuf::from("/"), guest_dir(&bindings, Path::new("/..")).unwrap());
        assert_eq!(Err(Errno::ENOTDIR), guest_dir(&bindings, Path::new("/file")));
        assert_eq!(Err(Errno::ENOTDIR), guest_dir(&bindings, Path::new("/missing")));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn guest_dir_through_binding() {
        let root = scratch_dir("run-cwd-root").canonicalize().unwrap();
        let data = scratch_dir("run-cwd-data").canonicalize().unwrap();
        fs::create_dir_all(data.join("sub")).unwrap();
        let bindings = Bindings::new(root.clone(), vec![Binding::new(data.clone(), "/data")]);
        assert_eq!(
            PathBuf::from("/data/sub"),
            guest_dir(&bindings, Path::new("/data/sub")).unwrap()
        );
        fs::remove_dir_all(&root).unwrap();
        fs::remove_dir_all(&data).unwrap();
    }

    #[test]
    fn seccomp_can_be_turned_off() {
        let options = VrootOptions::from_iter_safe(&["vroot"]).unwrap();
        let mut flags = Flags::from_options(options);
        let recent = kernel_version(5, 10, 0);
        assert_eq!(env::var_os("VROOT_NO_SECCOMP").is_none(), use_seccomp(&flags, recent));
        flags.no_seccomp = true;
        assert!(!use_seccomp(&flags, recent));
    }

    #[test]
    fn seccomp_needs_trap_before_syscall_enter() {
        let options = VrootOptions::from_iter_safe(&["vroot"]).unwrap();
        let flags = Flags::from_options(options);
        assert!(!use_seccomp(&flags, kernel_version(4, 7, 10)));
        assert!(!use_seccomp(&flags, kernel_version(3, 4, 0)));
        assert_eq!(
            env::var_os("VROOT_NO_SECCOMP").is_none(),
            use_seccomp(&flags, kernel_version(4, 8, 0))
        );
    }
}
