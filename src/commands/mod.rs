use std::io;

pub mod run_command;
pub mod vroot_options;

pub trait VrootCommand {
    /// Returns the exit code of the process.
    fn run(&mut self) -> io::Result<i32>;
}
