use std::io;
use std::os::unix::io::RawFd;

use crate::error::TransportError;

/// Fixed frame size in bytes. The payload is the decimal ASCII
/// representation of a non-negative integer, NUL-padded to this length.
pub(crate) const FRAME_SIZE: usize = 1024;

fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n >= 0 { Ok(n as usize) } else { Err(io::Error::last_os_error()) }
}

fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n >= 0 { Ok(n as usize) } else { Err(io::Error::last_os_error()) }
}

/// Encodes `delay_ms` as a [`FRAME_SIZE`]-byte, NUL-padded decimal frame.
pub(crate) fn encode_delay(delay_ms: u64) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    let text = delay_ms.to_string();
    frame[..text.len()].copy_from_slice(text.as_bytes());
    frame
}

/// Decodes a frame back into its millisecond value. The first NUL byte
/// terminates the payload.
pub(crate) fn decode_delay(frame: &[u8; FRAME_SIZE]) -> Result<u64, TransportError> {
    let end = frame.iter().position(|&b| b == 0).unwrap_or(FRAME_SIZE);
    std::str::from_utf8(&frame[..end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(TransportError::MalformedFrame)
}

/// Reads exactly [`FRAME_SIZE`] bytes from `fd`, tolerating short reads.
///
/// The caller must have already confirmed readability via the multiplexed
/// wait; a `WouldBlock` mid-frame is reported as a transport failure rather
/// than retried, since this protocol never re-enters the wait mid-frame.
pub(crate) fn read_frame(fd: RawFd) -> Result<[u8; FRAME_SIZE], TransportError> {
    let mut frame = [0u8; FRAME_SIZE];
    let mut have = 0;
    while have < FRAME_SIZE {
        match raw_read(fd, &mut frame[have..]) {
            Ok(0) => return Err(TransportError::PeerClosed),
            Ok(n) => have += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
    Ok(frame)
}

/// Writes exactly [`FRAME_SIZE`] bytes to `fd`, tolerating short writes.
pub(crate) fn write_frame(fd: RawFd, frame: &[u8; FRAME_SIZE]) -> Result<(), TransportError> {
    let mut sent = 0;
    while sent < FRAME_SIZE {
        match raw_write(fd, &frame[sent..]) {
            Ok(0) => return Err(TransportError::PeerClosed),
            Ok(n) => sent += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_pads_with_nul() {
        let frame = encode_delay(42);
        assert_eq!(&frame[..2], b"42");
        assert!(frame[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_stops_at_first_nul() {
        let frame = encode_delay(12345);
        assert_eq!(decode_delay(&frame).unwrap(), 12345);
    }

    #[test]
    fn decode_zero_round_trips() {
        let frame = encode_delay(0);
        assert_eq!(decode_delay(&frame).unwrap(), 0);
    }

    #[test]
    fn decode_rejects_non_decimal_payload() {
        let mut frame = [0u8; FRAME_SIZE];
        frame[..3].copy_from_slice(b"abc");
        assert!(matches!(decode_delay(&frame), Err(TransportError::MalformedFrame)));
    }

    #[test]
    fn round_trip_over_a_socketpair() {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let (a, b) = (fds[0], fds[1]);

        write_frame(a, &encode_delay(999)).unwrap();
        let got = read_frame(b).unwrap();
        assert_eq!(decode_delay(&got).unwrap(), 999);

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn read_reports_peer_closed() {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let (a, b) = (fds[0], fds[1]);
        unsafe { libc::close(a) };

        assert!(matches!(read_frame(b), Err(TransportError::PeerClosed)));
        unsafe { libc::close(b) };
    }
}
