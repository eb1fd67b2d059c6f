//! The fixed-size unit carried by device queues.

use crate::ipc::shmem::SharedMemorySafe;

/// Largest message a device carries, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 2048;

/// One message slot in a device queue.
///
/// `seq` numbers frames per direction starting at 1, so an acknowledgement
/// counter of 0 means "nothing acknowledged yet".
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Frame {
    pub seq: u64,
    /// Bytes used inside `payload`.
    pub len: u16,
    pub payload: [u8; MAX_MESSAGE_SIZE],
}

unsafe impl SharedMemorySafe for Frame {}

impl Frame {
    /// Builds a frame from `bytes`, keeping at most [`MAX_MESSAGE_SIZE`] of
    /// them.
    #[must_use]
    pub fn new(seq: u64, bytes: &[u8]) -> Self {
        let len = bytes.len().min(MAX_MESSAGE_SIZE);
        let mut payload = [0u8; MAX_MESSAGE_SIZE];
        payload[..len].copy_from_slice(&bytes[..len]);
        Self {
            seq,
            len: len as u16,
            payload,
        }
    }

    /// The bytes the sender wrote.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.payload[..usize::from(self.len).min(MAX_MESSAGE_SIZE)]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies as much of the payload as fits into `buf`, returning the count.
    pub fn copy_into(&self, buf: &mut [u8]) -> usize {
        let bytes = self.bytes();
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        n
    }
}

/// The text part of a C-style message: everything before the first NUL.
#[must_use]
pub fn until_nul(bytes: &[u8]) -> &[u8] {
    bytes
        .iter()
        .position(|&b| b == 0)
        .map_or(bytes, |end| &bytes[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_input_is_cut_to_capacity() {
        let big = vec![b'x'; MAX_MESSAGE_SIZE + 10];
        let frame = Frame::new(1, &big);
        assert_eq!(frame.len(), MAX_MESSAGE_SIZE);
    }

    #[test]
    fn copy_into_never_writes_past_buffer() {
        let frame = Frame::new(1, b"0123456789");
        let mut buf = [0xAAu8; 8];
        let n = frame.copy_into(&mut buf[..4]);
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"0123");
        assert_eq!(&buf[4..], &[0xAA; 4]);
    }

    #[test]
    fn text_stops_at_first_nul() {
        assert_eq!(until_nul(b"42\0junk"), b"42");
        assert_eq!(until_nul(b"That's it."), b"That's it.");
        assert_eq!(until_nul(b"\0"), b"");
    }
}
