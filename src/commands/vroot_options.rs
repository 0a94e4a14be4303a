use crate::path::binding::{normalize_guest, Binding};
use regex::Regex;
use std::{
    error::Error,
    ffi::{OsStr, OsString},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};
use structopt::{clap, clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "vroot",
    about = "Run a program with an arbitrary directory as its root filesystem",
    after_help = "Use VROOT_LOG to control logging; e.g. VROOT_LOG=all:warn,canon:debug\n\
                  Set VROOT_NO_SECCOMP to trace every syscall instead of filtered ones."
)]
#[structopt(global_settings = &[AppSettings::UnifiedHelpMessage, AppSettings::TrailingVarArg])]
pub struct VrootOptions {
    /// Use <rootfs> as the root filesystem.
    #[structopt(
        short = "r",
        long,
        parse(try_from_os_str = parse_dir),
        conflicts_with = "rootfs-recommended"
    )]
    pub rootfs: Option<PathBuf>,

    /// Like -r, with the bindings needed by most programs (/dev, /proc,
    /// /etc/resolv.conf, $HOME...).
    #[structopt(short = "R", long, name = "rootfs-recommended", parse(try_from_os_str = parse_dir))]
    pub rootfs_recommended: Option<PathBuf>,

    /// Make the host path <host> visible at <guest> (default: same path).
    #[structopt(
        short = "b",
        long = "bind",
        value_name = "host[:guest]",
        number_of_values = 1,
        parse(try_from_os_str = parse_binding)
    )]
    pub bindings: Vec<Binding>,

    /// Initial working directory, a guest path.
    #[structopt(short = "w", long, parse(from_os_str))]
    pub cwd: Option<PathBuf>,

    /// Verbosity: 1 for info, 2 and more for debug messages.
    #[structopt(short = "v", long, default_value = "0")]
    pub verbose: u32,

    /// Report <release> as the kernel release and emulate the syscalls
    /// missing from the running kernel.
    #[structopt(short = "k", long, parse(try_from_str = parse_kernel_release))]
    pub kernel_release: Option<String>,

    /// Fake root privileges, same as `-i 0:0`.
    #[structopt(short = "0", long, conflicts_with = "change-id")]
    pub root_id: bool,

    /// Fake the user and group ids.
    #[structopt(
        short = "i",
        long,
        name = "change-id",
        value_name = "uid:gid",
        parse(try_from_str = parse_ids)
    )]
    pub change_id: Option<(u32, u32)>,

    /// Replace hard links with symbolic links.
    #[structopt(short = "l", long)]
    pub link2symlink: bool,

    /// Copy file contents into anonymous memory instead of mapping files
    /// executable.
    #[structopt(long)]
    pub mmap_noexec: bool,

    /// Break hard links before a file is opened for writing.
    #[structopt(long)]
    pub cow: bool,

    /// Trace every syscall instead of those the seccomp filter selects.
    #[structopt(long)]
    pub no_seccomp: bool,

    /// Program to run, default /bin/sh.
    #[structopt(parse(from_os_str))]
    pub command: Vec<OsString>,
}

/// Host paths bound by -R, when they exist.
pub fn recommended_bindings() -> Vec<Binding> {
    let mut paths: Vec<PathBuf> = [
        "/etc/host.conf",
        "/etc/hosts",
        "/etc/nsswitch.conf",
        "/etc/resolv.conf",
        "/dev",
        "/sys",
        "/proc",
        "/tmp",
        "/run",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home));
    }
    paths
        .into_iter()
        .filter_map(|path| path.canonicalize().ok())
        .map(|host| Binding::new(host.clone(), host))
        .collect()
}

fn parse_dir(dir: &OsStr) -> Result<PathBuf, OsString> {
    match PathBuf::from(dir).canonicalize() {
        Err(e) => Err(OsString::from(format!("{:?}: {}", dir, e))),
        Ok(canonicalized) if canonicalized.is_dir() => Ok(canonicalized),
        Ok(canonicalized) => Err(OsString::from(format!(
            "{:?} is not a directory",
            canonicalized
        ))),
    }
}

/// `host[:guest]`. The host side has to exist; the guest side is an
/// absolute path, created in the guest view if needed.
fn parse_binding(spec: &OsStr) -> Result<Binding, OsString> {
    let bytes = spec.as_bytes();
    let (host, guest) = match bytes.iter().rposition(|&b| b == b':') {
        Some(colon) => (&bytes[..colon], Some(&bytes[colon + 1..])),
        None => (bytes, None),
    };
    let host = Path::new(OsStr::from_bytes(host));
    let host = host
        .canonicalize()
        .map_err(|e| OsString::from(format!("{:?}: {}", host, e)))?;
    let guest = match guest {
        Some(guest) if !guest.is_empty() => {
            let guest = Path::new(OsStr::from_bytes(guest));
            if !guest.is_absolute() {
                return Err(OsString::from(format!("{:?}: guest path must be absolute", guest)));
            }
            normalize_guest(guest)
        }
        _ => host.clone(),
    };
    Ok(Binding::new(host, guest))
}

fn parse_ids(ids: &str) -> Result<(u32, u32), Box<dyn Error>> {
    let mut parts = ids.splitn(2, ':');
    match (parts.next(), parts.next()) {
        (Some(uid), Some(gid)) => Ok((uid.trim().parse::<u32>()?, gid.trim().parse::<u32>()?)),
        _ => Err(Box::new(clap::Error::with_description(
            "Expected <uid>:<gid>",
            clap::ErrorKind::InvalidValue,
        ))),
    }
}

fn parse_kernel_release(release: &str) -> Result<String, Box<dyn Error>> {
    lazy_static! {
        static ref RELEASE: Regex = Regex::new(r"^\d+(\.\d+){0,2}").unwrap();
    }
    if RELEASE.is_match(release) {
        Ok(release.to_owned())
    } else {
        Err(Box::new(clap::Error::with_description(
            "Expected a release like 2.6.32 or 5.10.0-8-amd64",
            clap::ErrorKind::InvalidValue,
        )))
    }
}
