//! SCM_RIGHTS descriptor passing over the control socket.
//!
//! tokio has no ancillary-data API, so reads and writes go through
//! `nix::sys::socket::{sendmsg, recvmsg}` driven by the stream's readiness
//! via [`tokio::net::UnixStream::try_io`]. A descriptor is attached to the
//! first byte of its frame, so on the receive side every descriptor is
//! already queued by the time its frame becomes decodable; pairing them
//! FIFO is therefore exact.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use bytes::BytesMut;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use serde::de::DeserializeOwned;
use tokio::io::Interest;
use tokio::net::UnixStream;

const READ_CHUNK: usize = 8 * 1024;

/// Write a complete frame, attaching `fd` to its first byte when given.
///
/// The descriptor is duplicated into the peer by the kernel; the caller still
/// owns (and should close) its copy after this returns.
pub async fn send_frame(stream: &UnixStream, frame: &[u8], fd: Option<RawFd>) -> io::Result<()> {
    let mut sent = 0;
    let mut pending_fd = fd;

    while sent < frame.len() {
        stream.writable().await?;

        let result = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&frame[sent..])];
            let fds;
            let scm;
            let cmsgs: &[ControlMessage<'_>] = match pending_fd {
                Some(raw) => {
                    fds = [raw];
                    scm = [ControlMessage::ScmRights(&fds)];
                    &scm
                }
                None => &[],
            };
            // MSG_NOSIGNAL: a worker that died mid-send must surface as EPIPE,
            // not kill the master.
            sendmsg::<()>(stream.as_raw_fd(), &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None)
                .map_err(io::Error::from)
        });

        match result {
            Ok(n) => {
                sent += n;
                if n > 0 {
                    // The kernel delivered the ancillary data with this chunk.
                    pending_fd = None;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Buffered frame reader that keeps received descriptors alongside the byte
/// stream.
pub struct FrameReader {
    stream: Arc<UnixStream>,
    buf: BytesMut,
    fds: VecDeque<OwnedFd>,
}

impl FrameReader {
    pub fn new(stream: Arc<UnixStream>) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            fds: VecDeque::new(),
        }
    }

    /// Read the next frame, together with its descriptor if one was attached.
    ///
    /// Returns `Ok(None)` when the peer closed the stream at a frame boundary.
    pub async fn next_frame<T: DeserializeOwned>(
        &mut self,
    ) -> io::Result<Option<(T, Option<OwnedFd>)>> {
        loop {
            if let Some(msg) = super::codec::decode::<T>(&mut self.buf)? {
                return Ok(Some((msg, self.fds.pop_front())));
            }

            let n = self.fill().await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "control socket closed mid-frame",
                ));
            }
        }
    }

    /// One `recvmsg`, appending bytes to the buffer and descriptors to the
    /// queue. Returns the byte count (0 on EOF).
    async fn fill(&mut self) -> io::Result<usize> {
        loop {
            self.stream.readable().await?;

            let mut chunk = [0u8; READ_CHUNK];
            let result = self.stream.try_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(&mut chunk)];
                let mut cmsg_space = nix::cmsg_space!([RawFd; 4]);
                let msg = recvmsg::<()>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_space),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(io::Error::from)?;

                let mut received = Vec::new();
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        received.extend(fds);
                    }
                }
                Ok((msg.bytes, received))
            });

            match result {
                Ok((n, received)) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    for raw in received {
                        // recvmsg transferred ownership of these descriptors
                        // to this process.
                        self.fds.push_back(unsafe { OwnedFd::from_raw_fd(raw) });
                    }
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec;
    use crate::bridge::protocol::{MasterMessage, WorkerMessage};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn frame_without_fd_roundtrips() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut reader = FrameReader::new(Arc::new(b));

        let frame = codec::encode(&WorkerMessage::Close).unwrap();
        send_frame(&a, &frame, None).await.unwrap();

        let (msg, fd) = reader.next_frame::<WorkerMessage>().await.unwrap().unwrap();
        assert_eq!(msg, WorkerMessage::Close);
        assert!(fd.is_none());
    }

    #[tokio::test]
    async fn frame_with_fd_delivers_a_usable_socket() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut reader = FrameReader::new(Arc::new(b));

        // A real TCP connection pair; the client writes before the handoff so
        // the bytes must survive untouched.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let frame = codec::encode(&MasterMessage::Balancing).unwrap();
        send_frame(&a, &frame, Some(accepted.as_raw_fd())).await.unwrap();
        drop(accepted);

        let (msg, fd) = reader.next_frame::<MasterMessage>().await.unwrap().unwrap();
        assert_eq!(msg, MasterMessage::Balancing);

        let std_stream = std::net::TcpStream::from(fd.expect("descriptor must be attached"));
        std_stream.set_nonblocking(true).unwrap();
        let mut stream = tokio::net::TcpStream::from_std(std_stream).unwrap();

        let mut first = [0u8; 16];
        stream.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn eof_at_frame_boundary_is_none() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut reader = FrameReader::new(Arc::new(b));
        drop(a);

        let next = reader.next_frame::<WorkerMessage>().await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut reader = FrameReader::new(Arc::new(b));

        let frame = codec::encode(&WorkerMessage::Close).unwrap();
        send_frame(&a, &frame[..frame.len() - 1], None).await.unwrap();
        drop(a);

        let err = reader.next_frame::<WorkerMessage>().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn back_to_back_frames_keep_fd_pairing() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut reader = FrameReader::new(Arc::new(b));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _c1 = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (s1, _) = listener.accept().await.unwrap();
        let _c2 = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (s2, _) = listener.accept().await.unwrap();

        let frame = codec::encode(&MasterMessage::Balancing).unwrap();
        send_frame(&a, &frame, Some(s1.as_raw_fd())).await.unwrap();
        send_frame(&a, &frame, Some(s2.as_raw_fd())).await.unwrap();

        let (_, fd1) = reader.next_frame::<MasterMessage>().await.unwrap().unwrap();
        let (_, fd2) = reader.next_frame::<MasterMessage>().await.unwrap().unwrap();
        assert!(fd1.is_some());
        assert!(fd2.is_some());
    }
}
