#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;
#[macro_use]
extern crate memoffset;

#[macro_use]
mod log;
mod arch;
mod commands;
mod event_loop;
mod extension;
mod flags;
mod kernel_metadata;
mod path;
mod ptrace;
mod registers;
mod remote_ptr;
mod scoped_fd;
mod seccomp_bpf;
mod syscall;
mod tracee;
mod util;
mod wait_status;

use crate::{
    commands::{run_command::RunCommand, VrootCommand},
    flags::Flags,
    util::{host_kernel_release, kernel_version, parse_kernel_release},
};
use std::io;

pub fn assert_prerequisites() {
    let release = host_kernel_release();
    if parse_kernel_release(&release) < kernel_version(3, 4, 0) {
        clean_fatal!(
            "Kernel {} doesn't support the necessary ptrace functionality; need 3.4.0 or better.",
            release
        );
    }
}

fn main() -> io::Result<()> {
    assert_prerequisites();
    let code = RunCommand::new(Flags::get()).run()?;
    std::process::exit(code)
}
