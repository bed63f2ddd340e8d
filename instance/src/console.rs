//! Raw console attachment to the hypervisor's serial/monitor socket.
//!
//! Puts the caller's terminal into raw mode and pumps bytes both ways
//! between it and the serial socket. No framing, no authentication: this
//! is the low-level escape hatch that works even when the guest has no
//! usable network stack. Ctrl-] detaches.

use crate::error::InstanceError;
use std::fs::File;
use std::io::{Read, Write};
use std::mem::ManuallyDrop;
use std::os::unix::io::{AsFd, AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Byte that detaches the console (Ctrl-]).
const DETACH: u8 = 0x1d;

/// RAII guard for raw terminal mode. Restores the original settings on
/// drop, whatever path gets us out of the pump loop.
struct RawTerminal {
    original: libc::termios,
}

impl RawTerminal {
    fn set() -> Result<RawTerminal, InstanceError> {
        let fd = std::io::stdin().as_raw_fd();
        let mut original: libc::termios = unsafe { std::mem::zeroed() };

        if unsafe { libc::tcgetattr(fd, &mut original) } != 0 {
            return Err(InstanceError::Io(std::io::Error::last_os_error()));
        }

        let mut raw = original;
        raw.c_iflag &= !(libc::IGNBRK
            | libc::BRKINT
            | libc::PARMRK
            | libc::ISTRIP
            | libc::INLCR
            | libc::IGNCR
            | libc::ICRNL
            | libc::IXON);
        raw.c_oflag &= !libc::OPOST;
        raw.c_lflag &= !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::ISIG | libc::IEXTEN);
        raw.c_cflag &= !(libc::CSIZE | libc::PARENB);
        raw.c_cflag |= libc::CS8;
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;

        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } != 0 {
            return Err(InstanceError::Io(std::io::Error::last_os_error()));
        }

        Ok(RawTerminal { original })
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        let fd = std::io::stdin().as_raw_fd();
        unsafe {
            libc::tcsetattr(fd, libc::TCSADRAIN, &self.original);
        }
    }
}

/// Attach the caller's terminal to the serial socket until the guest
/// closes it, the caller presses Ctrl-], or the run is cancelled.
///
/// Blocking; callers run this on a blocking task.
pub fn attach(serial_socket: &Path, cancel: &CancellationToken) -> Result<(), InstanceError> {
    let mut remote = UnixStream::connect(serial_socket)?;
    remote.set_nonblocking(true)?;

    let mut stdin = ManuallyDrop::new(unsafe { File::from_raw_fd(0) });
    let mut stdout = ManuallyDrop::new(unsafe { File::from_raw_fd(1) });
    set_nonblocking(stdin.as_raw_fd())?;

    eprintln!("connected to serial console, press Ctrl-] to detach");
    let _raw = RawTerminal::set()?;

    let result = pump(&mut remote, &mut stdin, &mut stdout, cancel);

    // Leave stdin the way we found it.
    clear_nonblocking(stdin.as_raw_fd())?;
    result
}

fn pump(
    remote: &mut UnixStream,
    stdin: &mut File,
    stdout: &mut File,
    cancel: &CancellationToken,
) -> Result<(), InstanceError> {
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

    let mut buf = [0u8; 4096];

    loop {
        if cancel.is_cancelled() {
            return Err(InstanceError::Cancelled);
        }

        let (remote_ready, remote_hup, stdin_ready) = {
            let mut fds = [
                PollFd::new(remote.as_fd(), PollFlags::POLLIN),
                PollFd::new(stdin.as_fd(), PollFlags::POLLIN),
            ];

            match poll(&mut fds, PollTimeout::from(100u16)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(InstanceError::Io(e.into())),
            }

            let remote_events = fds[0].revents();
            let stdin_events = fds[1].revents();

            (
                remote_events
                    .map(|r| r.contains(PollFlags::POLLIN))
                    .unwrap_or(false),
                remote_events
                    .map(|r| r.contains(PollFlags::POLLHUP) || r.contains(PollFlags::POLLERR))
                    .unwrap_or(false),
                stdin_events
                    .map(|r| r.contains(PollFlags::POLLIN))
                    .unwrap_or(false),
            )
        };

        if remote_ready {
            match remote.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    stdout.write_all(&buf[..n])?;
                    stdout.flush().ok();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }

        if remote_hup {
            return Ok(());
        }

        if stdin_ready {
            match stdin.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    let chunk = &buf[..n];
                    if let Some(at) = find_detach(chunk) {
                        remote.write_all(&chunk[..at]).ok();
                        return Ok(());
                    }
                    remote.write_all(chunk)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => {}
            }
        }
    }
}

fn find_detach(chunk: &[u8]) -> Option<usize> {
    chunk.iter().position(|b| *b == DETACH)
}

fn set_nonblocking(fd: i32) -> Result<(), InstanceError> {
    fcntl_flags(fd, |flags| flags | libc::O_NONBLOCK)
}

fn clear_nonblocking(fd: i32) -> Result<(), InstanceError> {
    fcntl_flags(fd, |flags| flags & !libc::O_NONBLOCK)
}

fn fcntl_flags(fd: i32, f: impl Fn(i32) -> i32) -> Result<(), InstanceError> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(InstanceError::Io(std::io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, f(flags)) < 0 {
            return Err(InstanceError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_byte_is_found_mid_stream() {
        assert_eq!(find_detach(b"ls -la\x1d"), Some(6));
        assert_eq!(find_detach(b"\x1d"), Some(0));
        assert_eq!(find_detach(b"plain text"), None);
    }

    #[test]
    fn attach_to_missing_socket_fails_cleanly() {
        let cancel = CancellationToken::new();
        let err = attach(Path::new("/nonexistent/serial.sock"), &cancel).unwrap_err();
        assert!(matches!(err, InstanceError::Io(_)));
    }
}
