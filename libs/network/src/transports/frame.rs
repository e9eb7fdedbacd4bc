//! TCP Frame Reassembly
//!
//! Frames are an 8-byte big-endian length header followed by that many
//! payload bytes. [`FrameBuffer`] accumulates partial reads for one
//! connection and yields every complete frame, however the stream was
//! chunked by the kernel.
//!
//! Layout: `buf[lastptr..freeptr]` holds bytes received but not yet
//! consumed. Once the consumed prefix passes half the buffer the leftover is
//! moved back to the start; a frame larger than the buffer grows it.

use crate::{Result, TransportError};
use bytes::Bytes;
use tracing::debug;

/// Length header size
pub const HEADER_SIZE: usize = 8;

/// Encode the length header for a payload.
pub fn frame_header(len: usize) -> [u8; HEADER_SIZE] {
    (len as u64).to_be_bytes()
}

/// Per-connection receive buffer
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    lastptr: usize,
    freeptr: usize,
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Buffer sized for two messages of `message_size` bytes.
    pub fn new(message_size: usize, max_frame_size: usize) -> Self {
        Self {
            buf: vec![0; (message_size * 2).max(HEADER_SIZE * 2)],
            lastptr: 0,
            freeptr: 0,
            max_frame_size,
        }
    }

    /// Free space to read into. Never empty.
    pub fn writable(&mut self) -> &mut [u8] {
        if self.freeptr == self.buf.len() {
            if self.lastptr > 0 {
                self.compact();
            } else {
                let len = self.buf.len();
                self.buf.resize(len * 2, 0);
            }
        }
        &mut self.buf[self.freeptr..]
    }

    /// Account for `n` bytes read into [`writable`](Self::writable) and
    /// return every frame completed by them, in order.
    ///
    /// Zero-length frames are skipped. A header announcing more than the
    /// configured maximum is an error; the connection cannot be resynced.
    pub fn commit(&mut self, n: usize) -> Result<Vec<Bytes>> {
        let datalen = self.freeptr + n;
        let mut fptr = self.lastptr;
        let mut frames = Vec::new();

        while datalen - fptr >= HEADER_SIZE {
            let pstart = fptr + HEADER_SIZE;
            let mut header = [0u8; HEADER_SIZE];
            header.copy_from_slice(&self.buf[fptr..pstart]);
            let psize = u64::from_be_bytes(header) as usize;

            if psize > self.max_frame_size {
                return Err(TransportError::PacketSizeExceeded {
                    size: psize,
                    limit: self.max_frame_size,
                });
            }
            if psize == 0 {
                debug!("skipping zero-length frame");
                fptr = pstart;
                continue;
            }
            let pend = pstart + psize;
            if pend > datalen {
                break;
            }
            frames.push(Bytes::copy_from_slice(&self.buf[pstart..pend]));
            fptr = pend;
        }

        if fptr == datalen {
            self.lastptr = 0;
            self.freeptr = 0;
        } else {
            self.lastptr = fptr;
            self.freeptr = datalen;
            if fptr > self.buf.len() / 2 {
                self.compact();
            }
            self.reserve_pending();
        }
        Ok(frames)
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.freeptr - self.lastptr
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn compact(&mut self) {
        self.buf.copy_within(self.lastptr..self.freeptr, 0);
        self.freeptr -= self.lastptr;
        self.lastptr = 0;
    }

    /// Make room for the whole of a partially received frame.
    fn reserve_pending(&mut self) {
        if self.pending() < HEADER_SIZE {
            return;
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&self.buf[self.lastptr..self.lastptr + HEADER_SIZE]);
        let needed = HEADER_SIZE + u64::from_be_bytes(header) as usize;
        if self.lastptr + needed > self.buf.len() {
            self.compact();
            if needed > self.buf.len() {
                self.buf.resize(needed.next_power_of_two(), 0);
            }
        }
    }
}
