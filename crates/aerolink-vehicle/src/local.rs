//! Local plumbing for the daemon: the Unix datagram control socket, the
//! encoder input and the `poll(2)` wait that multiplexes them.

use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aerolink_transport::ipc::MessageChannel;
use aerolink_transport::runtime::{EventSource, Readiness};
use anyhow::Context;
use bytes::Bytes;

// ─── Control Socket ─────────────────────────────────────────────────────────

/// Control channel over a Unix datagram socket. One datagram per message.
pub struct UnixControl {
    socket: UnixDatagram,
    path: PathBuf,
    peer: Option<PathBuf>,
    buf: Vec<u8>,
}

impl UnixControl {
    pub fn bind(path: &Path, peer: Option<PathBuf>) -> anyhow::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("remove stale socket {}", path.display()))?;
        }
        let socket = UnixDatagram::bind(path)
            .with_context(|| format!("bind control socket {}", path.display()))?;
        socket.set_nonblocking(true)?;
        tracing::info!(path = %path.display(), peer = ?peer, "control socket bound");
        Ok(UnixControl {
            socket,
            path: path.to_path_buf(),
            peer,
            buf: vec![0u8; u16::MAX as usize],
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl MessageChannel for UnixControl {
    fn send(&mut self, msg: &[u8]) -> anyhow::Result<()> {
        let Some(peer) = &self.peer else {
            tracing::debug!(len = msg.len(), "no control peer, message dropped");
            return Ok(());
        };
        self.socket
            .send_to(msg, peer)
            .with_context(|| format!("send to {}", peer.display()))?;
        Ok(())
    }

    fn try_recv(&mut self) -> anyhow::Result<Option<Bytes>> {
        match self.socket.recv(&mut self.buf) {
            Ok(n) => Ok(Some(Bytes::copy_from_slice(&self.buf[..n]))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("control socket receive"),
        }
    }
}

impl Drop for UnixControl {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ─── Encoder Input ──────────────────────────────────────────────────────────

/// Nonblocking encoder output: a file or FIFO, or stdin for `-`.
pub enum EncoderInput {
    Stdin(io::Stdin),
    File(File),
}

impl EncoderInput {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        if path == "-" {
            set_nonblocking(libc::STDIN_FILENO)?;
            return Ok(EncoderInput::Stdin(io::stdin()));
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("open input {path}"))?;
        Ok(EncoderInput::File(file))
    }

    pub fn raw_fd(&self) -> RawFd {
        match self {
            EncoderInput::Stdin(_) => libc::STDIN_FILENO,
            EncoderInput::File(f) => f.as_raw_fd(),
        }
    }
}

impl Read for EncoderInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            EncoderInput::Stdin(s) => s.read(buf),
            EncoderInput::File(f) => f.read(buf),
        }
    }
}

fn set_nonblocking(fd: RawFd) -> anyhow::Result<()> {
    // SAFETY: fcntl on a descriptor we own for the life of the process.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error()).context("fcntl F_GETFL");
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error()).context("fcntl F_SETFL");
    }
    Ok(())
}

// ─── Poll ───────────────────────────────────────────────────────────────────

/// Waits on the encoder input and, when present, the control socket.
pub struct PollEvents {
    stream_fd: RawFd,
    control_fd: Option<RawFd>,
}

impl PollEvents {
    pub fn new(stream_fd: RawFd, control_fd: Option<RawFd>) -> Self {
        PollEvents {
            stream_fd,
            control_fd,
        }
    }
}

impl EventSource for PollEvents {
    fn wait(&mut self, timeout: Duration) -> anyhow::Result<Readiness> {
        let mut fds = [
            libc::pollfd {
                fd: self.stream_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                // Negative descriptors are skipped by poll.
                fd: self.control_fd.unwrap_or(-1),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        // SAFETY: `fds` is a valid array of pollfd for the duration of the call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(Readiness::default());
            }
            return Err(err).context("poll");
        }
        let ready = |p: &libc::pollfd| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0;
        Ok(Readiness {
            stream: ready(&fds[0]),
            control: ready(&fds[1]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("aerolink-{}-{tag}.sock", std::process::id()))
    }

    #[test]
    fn control_socket_round_trip() {
        let ours = socket_path("ours");
        let theirs = socket_path("theirs");
        let mut a = UnixControl::bind(&ours, Some(theirs.clone())).unwrap();
        let mut b = UnixControl::bind(&theirs, Some(ours.clone())).unwrap();

        assert!(a.try_recv().unwrap().is_none());
        b.send(b"keyframe").unwrap();
        let got = a.try_recv().unwrap().unwrap();
        assert_eq!(&got[..], b"keyframe");

        let mut events = PollEvents::new(-1, Some(b.raw_fd()));
        a.send(b"x").unwrap();
        let ready = events.wait(Duration::from_millis(100)).unwrap();
        assert!(ready.control);
        assert!(!ready.stream);
    }

    #[test]
    fn send_without_peer_is_dropped() {
        let path = socket_path("lonely");
        let mut sock = UnixControl::bind(&path, None).unwrap();
        sock.send(b"nobody").unwrap();
        drop(sock);
        assert!(!path.exists());
    }
}
