//! Framed worker⇄proxy channel over a socketpair.
//!
//! Every message is one length-prefixed frame whose first payload byte is
//! the channel command tag. `DATA_EXT` additionally carries exactly one
//! file descriptor as `SCM_RIGHTS` ancillary data, sent as a separate
//! one-byte message right after the frame — the framing explicitly
//! separates "data" from "data with one FD".
//!
//! ```text
//! +---------------+-----+------------------+   (+ optional ancillary
//! | len (u32, BE) | tag | payload          |      1-byte msg with FD)
//! +---------------+-----+------------------+
//! ```

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use sid_core::buffer::MAX_FRAME_SIZE;
use thiserror::Error;
use tokio::io::unix::AsyncFd;

/// Channel command tag, the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelCmd {
    /// No-op.
    Noop = 0,
    /// The worker offers itself for reuse.
    Yield = 1,
    /// Payload only.
    Data = 2,
    /// Payload plus one ancillary file descriptor.
    DataExt = 3,
}

impl ChannelCmd {
    /// Decode a command tag byte.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Noop),
            1 => Some(Self::Yield),
            2 => Some(Self::Data),
            3 => Some(Self::DataExt),
            _ => None,
        }
    }
}

/// Channel failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// A frame exceeded the channel frame limit.
    #[error("channel frame of {size} bytes exceeds limit of {MAX_FRAME_SIZE} bytes")]
    FrameTooLarge {
        /// Claimed frame size.
        size: usize,
    },

    /// A frame without the mandatory command tag, or an unknown tag.
    #[error("malformed channel frame: {reason}")]
    Malformed {
        /// What was wrong.
        reason: &'static str,
    },

    /// Socket failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One received channel message.
#[derive(Debug)]
pub struct ChannelMsg {
    /// Command tag.
    pub cmd: ChannelCmd,
    /// Frame payload after the tag.
    pub payload: Vec<u8>,
    /// Ancillary file descriptor, present for `DATA_EXT`.
    pub fd: Option<OwnedFd>,
}

/// One endpoint of a worker⇄proxy channel.
#[derive(Debug)]
pub struct Channel {
    inner: AsyncFd<UnixStream>,
}

impl Channel {
    /// Create a connected channel pair. The first half is ready for async
    /// use by this process; the second is the raw stream to hand to the
    /// spawned worker.
    ///
    /// # Errors
    ///
    /// Returns the socketpair failure.
    pub fn pair() -> io::Result<(Self, UnixStream)> {
        let (ours, theirs) = UnixStream::pair()?;
        Ok((Self::from_std(ours)?, theirs))
    }

    /// Wrap an existing stream.
    ///
    /// # Errors
    ///
    /// Returns the nonblocking/registration failure.
    pub fn from_std(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            inner: AsyncFd::new(stream)?,
        })
    }

    /// Rebuild the channel from an inherited file descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be a valid socketpair descriptor owned by the caller and
    /// not used elsewhere afterwards.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        // SAFETY: ownership is transferred by the caller's contract.
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        Self::from_std(stream)
    }

    /// Send one message; `fd` is required for and restricted to
    /// [`ChannelCmd::DataExt`].
    ///
    /// # Errors
    ///
    /// Frame size violations or socket failures.
    pub async fn send(
        &self,
        cmd: ChannelCmd,
        payload: &[u8],
        fd: Option<RawFd>,
    ) -> Result<(), ChannelError> {
        let body_len = payload.len() + 1;
        if body_len > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge { size: body_len });
        }
        if (cmd == ChannelCmd::DataExt) != fd.is_some() {
            return Err(ChannelError::Malformed {
                reason: "ancillary FD is carried by DATA_EXT and nothing else",
            });
        }

        let mut frame = Vec::with_capacity(4 + body_len);
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE
        frame.extend_from_slice(&(body_len as u32).to_be_bytes());
        frame.push(cmd as u8);
        frame.extend_from_slice(payload);
        self.write_all(&frame).await?;

        if let Some(fd) = fd {
            self.send_fd(fd).await?;
        }
        Ok(())
    }

    /// Receive one message, or `None` on a clean EOF.
    ///
    /// # Errors
    ///
    /// Malformed frames or socket failures. EOF in the middle of a frame
    /// is an error, not a clean close.
    pub async fn recv(&self) -> Result<Option<ChannelMsg>, ChannelError> {
        let mut header = [0u8; 4];
        if !self.read_exact_or_eof(&mut header).await? {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes(header) as usize;
        if body_len > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge { size: body_len });
        }
        if body_len == 0 {
            return Err(ChannelError::Malformed {
                reason: "frame without command tag",
            });
        }

        let mut body = vec![0u8; body_len];
        if !self.read_exact_or_eof(&mut body).await? {
            return Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed channel mid-frame",
            )));
        }

        let cmd = ChannelCmd::from_u8(body[0]).ok_or(ChannelError::Malformed {
            reason: "unknown channel command tag",
        })?;
        let payload = body.split_off(1);

        let fd = if cmd == ChannelCmd::DataExt {
            Some(self.recv_fd().await?)
        } else {
            None
        };

        Ok(Some(ChannelMsg { cmd, payload, fd }))
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| {
                let mut stream = inner.get_ref();
                stream.write(&buf[written..])
            }) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
        Ok(())
    }

    /// Fill `buf` completely. Returns `false` on EOF before the first
    /// byte.
    async fn read_exact_or_eof(&self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                let mut stream = inner.get_ref();
                stream.read(&mut buf[filled..])
            }) {
                Ok(Ok(0)) => {
                    if filled == 0 {
                        return Ok(false);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed channel mid-read",
                    ));
                }
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
        Ok(true)
    }

    /// Ship one FD with a one-byte marker message.
    async fn send_fd(&self, fd: RawFd) -> io::Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            let result = guard.try_io(|inner| {
                let marker = [0xFFu8];
                let iov = [IoSlice::new(&marker)];
                let fds = [fd];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<()>(inner.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                    .map_err(io::Error::from)
            });
            match result {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
    }

    /// Receive the FD counterpart of [`Channel::send_fd`].
    async fn recv_fd(&self) -> io::Result<OwnedFd> {
        loop {
            let mut guard = self.inner.readable().await?;
            let result = guard.try_io(|inner| {
                let mut marker = [0u8; 1];
                let mut iov = [IoSliceMut::new(&mut marker)];
                let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
                let msg = recvmsg::<()>(
                    inner.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_space),
                    MsgFlags::empty(),
                )
                .map_err(io::Error::from)?;
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        if let Some(&fd) = fds.first() {
                            // SAFETY: the kernel installed a fresh descriptor
                            // for this process; we are its sole owner.
                            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                }
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected SCM_RIGHTS ancillary message",
                ))
            });
            match result {
                Ok(Ok(fd)) => return Ok(fd),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Seek, SeekFrom};

    #[tokio::test]
    async fn data_roundtrip() {
        let (a, b_raw) = Channel::pair().unwrap();
        let b = Channel::from_std(b_raw).unwrap();

        a.send(ChannelCmd::Data, b"payload", None).await.unwrap();
        let msg = b.recv().await.unwrap().unwrap();
        assert_eq!(msg.cmd, ChannelCmd::Data);
        assert_eq!(msg.payload, b"payload");
        assert!(msg.fd.is_none());
    }

    #[tokio::test]
    async fn yield_has_empty_payload() {
        let (a, b_raw) = Channel::pair().unwrap();
        let b = Channel::from_std(b_raw).unwrap();

        a.send(ChannelCmd::Yield, &[], None).await.unwrap();
        let msg = b.recv().await.unwrap().unwrap();
        assert_eq!(msg.cmd, ChannelCmd::Yield);
        assert!(msg.payload.is_empty());
    }

    #[tokio::test]
    async fn data_ext_passes_a_file_descriptor() {
        let (a, b_raw) = Channel::pair().unwrap();
        let b = Channel::from_std(b_raw).unwrap();

        let mut file = tempfile::tempfile().unwrap();
        use std::io::Write as _;
        file.write_all(b"through the channel").unwrap();

        a.send(ChannelCmd::DataExt, b"meta", Some(file.as_raw_fd()))
            .await
            .unwrap();

        let msg = b.recv().await.unwrap().unwrap();
        assert_eq!(msg.cmd, ChannelCmd::DataExt);
        assert_eq!(msg.payload, b"meta");

        let mut received = File::from(msg.fd.unwrap());
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut content = String::new();
        received.read_to_string(&mut content).unwrap();
        assert_eq!(content, "through the channel");
    }

    #[tokio::test]
    async fn eof_reports_clean_close() {
        let (a, b_raw) = Channel::pair().unwrap();
        let b = Channel::from_std(b_raw).unwrap();
        drop(a);
        assert!(b.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fd_without_data_ext_is_refused() {
        let (a, _b) = Channel::pair().unwrap();
        let err = a.send(ChannelCmd::Data, b"x", Some(0)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Malformed { .. }));
    }

    #[tokio::test]
    async fn messages_are_fifo() {
        let (a, b_raw) = Channel::pair().unwrap();
        let b = Channel::from_std(b_raw).unwrap();

        a.send(ChannelCmd::Data, b"first", None).await.unwrap();
        a.send(ChannelCmd::Data, b"second", None).await.unwrap();
        a.send(ChannelCmd::Yield, &[], None).await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap().payload, b"first");
        assert_eq!(b.recv().await.unwrap().unwrap().payload, b"second");
        assert_eq!(b.recv().await.unwrap().unwrap().cmd, ChannelCmd::Yield);
    }
}
