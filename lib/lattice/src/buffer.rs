use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

// Buffers are sized in whole mirrored pages.
const BUF_SIZE_INCREMENT: usize = 65536;

/// FIFO byte queue backing one direction of a connection. Data is committed
/// at the tail and consumed from the head; both regions are exposed as
/// contiguous slices.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    pub fn new(size: usize) -> Buffer {
        if size % BUF_SIZE_INCREMENT != 0 {
            panic!("Buffer size must be divisible by {}, got {}", BUF_SIZE_INCREMENT, size);
        }

        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// Number of queued bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Queued bytes, oldest first.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Writable region past the queued bytes. Written data becomes visible
    /// only after `commit`.
    #[inline]
    pub fn spare(&mut self) -> &mut [u8] {
        unsafe { self.data.tail_head_slice() }
    }

    /// Discards `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Publishes `count` bytes previously written into `spare`.
    #[inline]
    pub fn commit(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        self.consume(len);
    }

    /// Reads from `reader` until the buffer is full or the reader has no more
    /// data. Returns the number of bytes read; an end-of-stream reader yields
    /// `UnexpectedEof` so a closed peer is never mistaken for an idle one.
    pub fn fill_from<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total = 0;

        loop {
            let free = self.free_capacity();
            if free == 0 {
                break;
            }

            let count = match reader.read(&mut self.spare()[..free]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(count) => count,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(err) => return Err(err),
            };

            self.commit(count);
            total += count;
        }

        Ok(total)
    }

    /// Writes queued bytes to `writer` until the buffer drains or the writer
    /// stops accepting data. Returns the number of bytes written.
    pub fn drain_to<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0;

        while !self.is_empty() {
            let count = match writer.write(self.data()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => count,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(err) => return Err(err),
            };

            self.consume(count);
            total += count;
        }

        Ok(total)
    }

    /// Mutable view of the queued bytes. Test support.
    #[allow(dead_code)]
    #[inline]
    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }
}
