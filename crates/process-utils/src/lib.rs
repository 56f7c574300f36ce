//! Small process-related helpers shared across the workspace.
//!
//! Commands handed to the pipeline are opaque shell strings, so everything here
//! is about turning such a string into a child process and, later, asking that
//! child to go away.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Program and leading arguments used to hand a command line to the platform shell.
pub fn shell_program() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    }
}

/// Create a `tokio::process::Command` that runs `command_line` through the platform shell.
#[cfg(feature = "tokio")]
pub fn shell_command(command_line: impl AsRef<OsStr>) -> tokio::process::Command {
    let (program, flag) = shell_program();
    let mut cmd = tokio_command(program);
    cmd.arg(flag).arg(command_line);
    cmd
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Quote a single argument for inclusion in a shell command line.
///
/// Unix uses single quotes (embedded quotes become `'\''`); Windows uses
/// double quotes with embedded quotes doubled.
pub fn quote_arg(arg: &str) -> String {
    if cfg!(windows) {
        format!("\"{}\"", arg.replace('"', "\"\""))
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Create a shell command whose child leads its own process group.
///
/// Signals sent through [`request_terminate`] and [`force_kill`] then reach
/// everything the shell started, not only the shell itself.
#[cfg(feature = "tokio")]
pub fn grouped_shell_command(command_line: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = shell_command(command_line);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

#[cfg(unix)]
fn signal_tree(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 }
}

/// Ask a running process (and its process group, if it leads one) to terminate gracefully.
///
/// Sends `SIGTERM` on unix. Windows has no graceful equivalent for console
/// children, so this returns `false` and the caller is expected to kill.
/// Returns `true` when the request was delivered.
pub fn request_terminate(pid: u32) -> bool {
    #[cfg(unix)]
    {
        signal_tree(pid, libc::SIGTERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Kill a process and its process group without giving it a chance to clean up.
///
/// Unix only; elsewhere returns `false` and the caller falls back to
/// killing the child handle.
pub fn force_kill(pid: u32) -> bool {
    #[cfg(unix)]
    {
        signal_tree(pid, libc::SIGKILL)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Kill whatever is left in the process group led by `pgid`.
///
/// Unlike [`force_kill`] this never signals `pgid` as a single process, so it
/// is safe to call after the group leader has been reaped.
pub fn kill_group(pgid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pgid) = libc::pid_t::try_from(pgid) else {
            return false;
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe { libc::kill(-pgid, libc::SIGKILL) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
        false
    }
}
