//! Framed byte buffers: the length-prefixed frame codec used on every
//! socket, and the file-backed export buffer used to ship KV records
//! between processes.
//!
//! # Wire format
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! The frame length is validated against the maximum frame size BEFORE any
//! allocation happens, so a hostile peer cannot make the daemon allocate
//! from a forged length prefix. Empty frames are valid.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size accepted on any framed wire (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Width of the big-endian length prefix in front of every frame.
const LEN_FIELD: usize = 4;

/// Length of the export buffer's size prefix (u64, little-endian).
pub const SIZE_PREFIX_LEN: usize = 8;

/// Errors raised by the frame codec.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FrameError {
    /// A frame exceeded the configured maximum size.
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Claimed or actual frame size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Length-prefixed frame codec for [`tokio_util::codec::Framed`] wires.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// New codec with the default maximum frame size.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// New codec with a custom maximum frame size.
    ///
    /// # Panics
    ///
    /// Panics if the cap exceeds [`MAX_FRAME_SIZE`].
    #[must_use]
    pub fn with_max_size(cap: usize) -> Self {
        assert!(
            cap <= MAX_FRAME_SIZE,
            "frame size cap {cap} above the {MAX_FRAME_SIZE}-byte wire limit"
        );
        Self { max_frame_size: cap }
    }

    /// The maximum frame size of this codec.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Reject a payload length over the cap. Called on the claimed
    /// length of an incoming frame before anything is allocated for it,
    /// and on outgoing payloads before they hit the wire.
    fn check_cap(&self, payload_len: usize) -> Result<(), FrameError> {
        if payload_len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Prefix one payload as a frame into `dst`. Shared by every encoder
    /// shape the codec accepts.
    fn put_frame(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        self.check_cap(payload.len())?;
        dst.reserve(LEN_FIELD + payload.len());
        #[allow(clippy::cast_possible_truncation)] // capped at MAX_FRAME_SIZE
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
        Ok(())
    }
}

/// The payload length claimed by the prefix at the front of `src`, if a
/// whole prefix has arrived.
fn claimed_payload_len(src: &BytesMut) -> Option<usize> {
    let prefix: [u8; LEN_FIELD] = src.get(..LEN_FIELD)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let Some(payload_len) = claimed_payload_len(src) else {
            return Ok(None);
        };
        self.check_cap(payload_len)?;

        let wanted = LEN_FIELD + payload_len;
        if let Some(missing) = wanted.checked_sub(src.len()).filter(|&m| m > 0) {
            src.reserve(missing);
            return Ok(None);
        }

        src.advance(LEN_FIELD);
        Ok(Some(src.split_to(payload_len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        self.put_frame(&item, dst)
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        self.put_frame(item, dst)
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), FrameError> {
        self.put_frame(&item, dst)
    }
}

/// A linear, size-prefixed buffer backed by an anonymous memfd or a
/// regular file.
///
/// The first [`SIZE_PREFIX_LEN`] bytes hold the total stream length
/// (prefix included), patched in by [`ExportBuffer::finish`]. The backing
/// file descriptor can be handed to another process over an ancillary
/// message; the receiver replays the stream with [`read_size_prefixed`].
#[derive(Debug)]
pub struct ExportBuffer {
    file: File,
    payload_len: u64,
}

impl ExportBuffer {
    /// New buffer backed by an anonymous memfd.
    ///
    /// # Errors
    ///
    /// Returns the `memfd_create` failure.
    pub fn memfd(name: &str) -> io::Result<Self> {
        let cname = std::ffi::CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in memfd name"))?;
        let fd = nix::sys::memfd::memfd_create(
            cname.as_c_str(),
            nix::sys::memfd::MemFdCreateFlag::MFD_CLOEXEC,
        )
        .map_err(io::Error::from)?;
        Self::with_file(File::from(fd))
    }

    /// New buffer backed by a regular file at `path`, truncating any
    /// previous content.
    ///
    /// # Errors
    ///
    /// Returns the open failure.
    pub fn file(path: &Path) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::with_file(file)
    }

    fn with_file(mut file: File) -> io::Result<Self> {
        file.write_all(&[0u8; SIZE_PREFIX_LEN])?;
        Ok(Self {
            file,
            payload_len: 0,
        })
    }

    /// Append bytes to the stream.
    ///
    /// # Errors
    ///
    /// Returns the write failure.
    pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)?;
        self.payload_len += bytes.len() as u64;
        Ok(())
    }

    /// Bytes appended so far, not counting the size prefix.
    #[must_use]
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// Whether nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload_len == 0
    }

    /// Patch the total length into the prefix and flush.
    ///
    /// # Errors
    ///
    /// Returns the seek/write failure.
    pub fn finish(&mut self) -> io::Result<()> {
        let total = self.payload_len + SIZE_PREFIX_LEN as u64;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&total.to_le_bytes())?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.flush()
    }

    /// The backing file descriptor.
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Consume the buffer, yielding the backing file.
    #[must_use]
    pub fn into_file(self) -> File {
        self.file
    }
}

/// Read a finished size-prefixed stream from the start of `file`,
/// returning the payload without the prefix.
///
/// # Errors
///
/// Returns an error when the prefix is malformed or the stream is shorter
/// than the prefix claims.
pub fn read_size_prefixed(file: &mut File) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(0))?;
    let mut prefix = [0u8; SIZE_PREFIX_LEN];
    file.read_exact(&mut prefix)?;
    let total = u64::from_le_bytes(prefix);
    if total < SIZE_PREFIX_LEN as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "export stream size prefix shorter than the prefix itself",
        ));
    }
    let payload_len = usize::try_from(total - SIZE_PREFIX_LEN as u64)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "export stream too large"))?;
    let mut payload = vec![0u8; payload_len];
    file.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let payload = Bytes::from_static(b"hello world");

        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 11]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, 1, 2, 3][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn oversized_frame_rejected_before_allocation() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(20 * 1024 * 1024);
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn oversized_encode_rejected() {
        let mut codec = FrameCodec::with_max_size(8);
        let mut buf = BytesMut::new();
        let result: Result<(), _> = codec.encode(&[0u8; 9][..], &mut buf);
        assert!(matches!(result, Err(FrameError::FrameTooLarge { size: 9, max: 8 })));
    }

    #[test]
    fn empty_frame_is_valid() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn multiple_frames_decode_in_order() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&b"first"[..], &mut buf).unwrap();
        codec.encode(&b"second"[..], &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "first");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn export_buffer_memfd_roundtrip() {
        let mut buf = ExportBuffer::memfd("sid-test-exp").unwrap();
        buf.write_all(b"abc").unwrap();
        buf.write_all(b"def").unwrap();
        assert_eq!(buf.payload_len(), 6);
        buf.finish().unwrap();

        let mut file = buf.into_file();
        let payload = read_size_prefixed(&mut file).unwrap();
        assert_eq!(payload, b"abcdef");
    }

    #[test]
    fn export_buffer_file_backing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sid.db");

        let mut buf = ExportBuffer::file(&path).unwrap();
        buf.write_all(b"snapshot").unwrap();
        buf.finish().unwrap();
        drop(buf);

        let mut file = File::open(&path).unwrap();
        let payload = read_size_prefixed(&mut file).unwrap();
        assert_eq!(payload, b"snapshot");
    }

    #[test]
    fn empty_export_buffer() {
        let mut buf = ExportBuffer::memfd("sid-test-empty").unwrap();
        assert!(buf.is_empty());
        buf.finish().unwrap();

        let mut file = buf.into_file();
        assert!(read_size_prefixed(&mut file).unwrap().is_empty());
    }
}
