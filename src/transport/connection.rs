use super::{RING_CAPACITY, RawIo, Wire};
use bytes::{Buf, BufMut, BytesMut};
use log::trace;
use std::time::Duration;

/// Abstracts the low-level reading and writing semantics.
///
/// Bytes flow from the raw source into a bounded ring, and from the ring
/// into lines. One byte of push-back survives between calls so a line
/// truncated at the buffer limit does not eat the first byte of the
/// next one.
#[derive(Debug)]
pub(crate) struct Connection<B: RawIo> {
    io: B,
    ring: BytesMut,
    pushed_back: Option<u8>,
}

impl<B: RawIo> Connection<B> {
    pub(crate) fn new(io: B) -> Self {
        Self {
            io,
            ring: BytesMut::with_capacity(RING_CAPACITY),
            pushed_back: None,
        }
    }

    /// Opportunistically tops the ring up from the raw source without
    /// blocking.
    fn fill_ring(&mut self) -> std::io::Result<()> {
        let free = RING_CAPACITY - self.ring.len();
        if free == 0 {
            return Ok(());
        }
        let mut chunk = [0u8; RING_CAPACITY];
        let n = self.io.recv_nonblocking(&mut chunk[..free])?;
        if n > 0 {
            self.ring.put_slice(&chunk[..n]);
        }
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> std::io::Result<Option<u8>> {
        if let Some(ch) = self.pushed_back.take() {
            return Ok(Some(ch));
        }
        if self.ring.is_empty() {
            self.fill_ring()?;
        }
        if !self.ring.is_empty() {
            let ch = self.ring[0];
            self.ring.advance(1);
            return Ok(Some(ch));
        }
        let mut one = [0u8; 1];
        match self.io.recv_timeout(&mut one, timeout)? {
            0 => Ok(None),
            _ => Ok(Some(one[0])),
        }
    }
}

impl<B: RawIo> Wire for Connection<B> {
    fn send(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.io.send(data)
    }

    fn read_line(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::io::Result<Option<usize>> {
        if buf.is_empty() {
            return Ok(Some(0));
        }
        let mut filled = 0;
        loop {
            if filled >= buf.len() {
                // Out of room: hand the last byte to the next call and
                // return the line truncated.
                filled -= 1;
                self.pushed_back = Some(buf[filled]);
                break;
            }
            match self.read_byte(timeout)? {
                None if filled == 0 => return Ok(None),
                None => break,
                Some(b'\n') | Some(b'\r') => break,
                Some(ch) => {
                    buf[filled] = ch;
                    filled += 1;
                }
            }
        }
        trace!("rx:{}:{}", filled, String::from_utf8_lossy(&buf[..filled]));
        Ok(Some(filled))
    }

    fn set_baudrate(&mut self, baudrate: u32) -> std::io::Result<()> {
        self.ring.clear();
        self.pushed_back = None;
        self.io.set_baudrate(baudrate)
    }
}
