use byteorder::{BigEndian, ByteOrder};

/// Position/limit cursor view over an owned byte region, in the style of a
/// NIO buffer. The frame codec accumulates split headers and payloads
/// through this type; reads are relative and big-endian.
///
/// Invariant: `position <= limit <= capacity`.
#[derive(Debug)]
pub struct ByteBuffer {
    data: Box<[u8]>,
    position: usize,
    limit: usize,
}

impl ByteBuffer {
    /// An empty buffer ready to be filled: position 0, limit = capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            limit: capacity,
        }
    }

    /// A buffer holding a copy of `src`, positioned for reading.
    pub fn wrap(src: &[u8]) -> Self {
        Self {
            data: src.to_vec().into_boxed_slice(),
            position: 0,
            limit: src.len(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// The next `n` bytes, advancing the position past them.
    pub fn get_bytes(&mut self, n: usize) -> &[u8] {
        assert!(n <= self.remaining(), "read past limit");
        let start = self.position;
        self.position += n;
        &self.data[start..start + n]
    }

    /// Big-endian u16 at the current position, advancing by 2.
    pub fn get_u16(&mut self) -> u16 {
        BigEndian::read_u16(self.get_bytes(2))
    }

    /// Big-endian u32 at the current position, advancing by 4.
    pub fn get_u32(&mut self) -> u32 {
        BigEndian::read_u32(self.get_bytes(4))
    }

    /// Copy `min(src.remaining(), self.remaining())` bytes from `src` into
    /// this buffer, advancing both positions. Never fails; partial
    /// accumulation across chunk boundaries is the intended use.
    pub fn fill(&mut self, src: &mut ByteBuffer) {
        let n = src.remaining().min(self.remaining());
        self.data[self.position..self.position + n]
            .copy_from_slice(&src.data[src.position..src.position + n]);
        self.position += n;
        src.position += n;
    }

    /// Switch from filling to reading: limit becomes the current position,
    /// position rewinds to 0.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// The unread window, position..limit.
    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_start_open() {
        let buf = ByteBuffer::new(8);
        assert_eq!(buf.remaining(), 8);
        assert!(buf.has_remaining());

        let wrapped = ByteBuffer::wrap(&[1, 2, 3]);
        assert_eq!(wrapped.remaining(), 3);
        assert_eq!(wrapped.remaining_slice(), &[1, 2, 3]);
    }

    #[test]
    fn relative_reads_advance() {
        let mut buf = ByteBuffer::wrap(&[0xAA, 0xBB, 0x01, 0x02, 0x00, 0x00, 0x23, 0x28]);
        assert_eq!(buf.get_bytes(2), &[0xAA, 0xBB]);
        assert_eq!(buf.get_u16(), 0x0102);
        assert_eq!(buf.get_u32(), 9000);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn fill_copies_min_and_advances_both() {
        let mut src = ByteBuffer::wrap(&[1, 2, 3, 4, 5]);
        let mut dst = ByteBuffer::new(3);
        dst.fill(&mut src);
        assert_eq!(dst.remaining(), 0);
        assert_eq!(src.remaining(), 2);

        // Source smaller than destination space: everything is taken.
        let mut dst2 = ByteBuffer::new(8);
        dst2.fill(&mut src);
        assert_eq!(src.remaining(), 0);
        assert_eq!(dst2.remaining(), 6);
    }

    #[test]
    fn flip_bounds_the_filled_window() {
        let mut src = ByteBuffer::wrap(&[9, 8, 7]);
        let mut buf = ByteBuffer::new(16);
        buf.fill(&mut src);
        buf.flip();
        assert_eq!(buf.remaining(), 3);
        assert_eq!(buf.remaining_slice(), &[9, 8, 7]);
    }

    #[test]
    #[should_panic(expected = "read past limit")]
    fn reading_past_limit_panics() {
        let mut buf = ByteBuffer::wrap(&[1]);
        buf.get_u16();
    }
}
