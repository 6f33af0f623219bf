//! Pools handed down by a parent process.
//!
//! Follows the systemd `LISTEN_FDS` convention: descriptors are numbered from 3, their names are
//! listed colon separated in `LISTEN_FDNAMES`, and `LISTEN_PID`, when set, must be our own pid.
use std::ffi::OsStr;
use std::fs::File;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;

use crate::OpenError;

const FD_BASE: RawFd = 3;

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ListenFds {
    count: RawFd,
    names: Vec<String>,
}

// https://github.com/systemd/systemd/blob/414ae39821f0c103b076fc5f7432f827e0e79765/src/libsystemd/sd-daemon/sd-daemon.c#L92-L129
impl ListenFds {
    pub(crate) fn from_env() -> Result<Option<Self>, OpenError> {
        let count = std::env::var_os("LISTEN_FDS");
        let pid = std::env::var_os("LISTEN_PID");
        let names = std::env::var_os("LISTEN_FDNAMES");
        let own_pid = unsafe { libc::getpid() };

        Self::parse(count.as_deref(), pid.as_deref(), names.as_deref(), own_pid)
    }

    pub(crate) fn parse(
        count: Option<&OsStr>,
        pid: Option<&OsStr>,
        names: Option<&OsStr>,
        own_pid: libc::pid_t,
    ) -> Result<Option<Self>, OpenError> {
        let Some(count) = count else {
            return Ok(None);
        };

        if let Some(pid) = pid {
            let pid: libc::pid_t = pid
                .to_str()
                .and_then(|pid| pid.parse().ok())
                .ok_or(OpenError::Environment("LISTEN_PID is not a pid"))?;

            // Addressed to some other process, e.g. a parent that did not clean up.
            if pid != own_pid {
                return Ok(None);
            }
        }

        let count: RawFd = count
            .to_str()
            .and_then(|count| count.parse().ok())
            .filter(|&count| count >= 0)
            .ok_or(OpenError::Environment("LISTEN_FDS is not a descriptor count"))?;

        let names = match names {
            None => Vec::new(),
            Some(names) => names
                .to_str()
                .ok_or(OpenError::Environment("LISTEN_FDNAMES is not valid UTF-8"))?
                .split(':')
                .map(String::from)
                .collect(),
        };

        Ok(Some(ListenFds { count, names }))
    }

    /// The descriptor number announced under `name`.
    pub(crate) fn named(&self, name: &str) -> Option<RawFd> {
        let index = self.names.iter().position(|n| n == name)?;
        let index = RawFd::try_from(index).ok().filter(|&idx| idx < self.count)?;
        Some(FD_BASE + index)
    }
}

/// Open our own duplicate of the inherited descriptor called `name`.
///
/// The announced descriptor itself stays open, so repeated opens of the same name each get an
/// independent handle.
pub(crate) fn inherited(name: &str) -> Result<Option<File>, OpenError> {
    let Some(fd) = ListenFds::from_env()?.and_then(|listen| listen.named(name)) else {
        return Ok(None);
    };

    let duped = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if duped == -1 {
        return Err(OpenError::Io(std::io::Error::last_os_error()));
    }

    // Safety: a fresh duplicate, owned by nothing else.
    Ok(Some(unsafe { File::from_raw_fd(duped) }))
}

/// Make `fd` the first announced descriptor, named `name`, of the process spawned from `cmd`.
///
/// # Safety
///
/// `fd` must stay open until the command has been spawned.
pub(crate) unsafe fn share(cmd: &mut Command, name: &str, fd: RawFd) {
    cmd.env("LISTEN_FDS", "1");
    cmd.env("LISTEN_FDNAMES", name);
    cmd.env_remove("LISTEN_PID");

    cmd.pre_exec(move || {
        if fd == FD_BASE {
            // `dup2` onto itself would keep close-on-exec, clear the flag instead.
            if -1 == libc::fcntl(fd, libc::F_SETFD, 0) {
                return Err(std::io::Error::last_os_error());
            }
        } else if -1 == libc::dup2(fd, FD_BASE) {
            return Err(std::io::Error::last_os_error());
        }

        Ok(())
    });
}
