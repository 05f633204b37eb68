//! Bounded output-buffer pool
//!
//! A fixed ring of byte buffers rotated through the audio queue. Exactly
//! one buffer (the fill buffer) accepts writes at a time; buffers are
//! rented to the queue between submit and buffer-complete and must not be
//! touched during that window. Pure logic, no I/O.

use crate::config::pool::MAX_PACKET_DESCS;
use crate::parse::PacketDescription;

/// Fixed-size pool of output buffers with an in-use set and a fill cursor.
///
/// Maintained invariants:
/// - `buffers_used` equals the number of set `inuse` flags
/// - the fill buffer is never in use while accepting writes
/// - `bytes_filled <= capacity` and `packets_filled <= MAX_PACKET_DESCS`
pub struct BufferPool {
    buffers: Vec<Vec<u8>>,
    inuse: Vec<bool>,
    fill_index: usize,
    packet_descs: Vec<PacketDescription>,
    buffers_used: usize,
    capacity: usize,
}

impl BufferPool {
    /// Allocate `count` buffers of `capacity` bytes each.
    pub fn new(count: usize, capacity: usize) -> Self {
        assert!(count > 0 && capacity > 0);
        Self {
            buffers: (0..count).map(|_| Vec::with_capacity(capacity)).collect(),
            inuse: vec![false; count],
            fill_index: 0,
            packet_descs: Vec::with_capacity(MAX_PACKET_DESCS),
            buffers_used: 0,
            capacity,
        }
    }

    pub fn count(&self) -> usize {
        self.buffers.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fill_index(&self) -> usize {
        self.fill_index
    }

    pub fn buffers_used(&self) -> usize {
        self.buffers_used
    }

    pub fn bytes_filled(&self) -> usize {
        self.buffers[self.fill_index].len()
    }

    pub fn packets_filled(&self) -> usize {
        self.packet_descs.len()
    }

    /// Whether the current fill buffer is rented out (pool exhausted)
    pub fn fill_in_use(&self) -> bool {
        self.inuse[self.fill_index]
    }

    pub fn is_in_use(&self, index: usize) -> bool {
        self.inuse[index]
    }

    /// Room left in the fill buffer for `size` more bytes
    pub fn has_room(&self, size: usize) -> bool {
        self.bytes_filled() + size <= self.capacity
    }

    /// Descriptor slots left in the fill buffer
    pub fn descs_full(&self) -> bool {
        self.packet_descs.len() >= MAX_PACKET_DESCS
    }

    /// Append one packet's bytes to the fill buffer, recording a descriptor
    /// when `variable_frames` is provided (VBR).
    pub fn write_packet(&mut self, data: &[u8], variable_frames: Option<u32>) {
        debug_assert!(!self.inuse[self.fill_index], "write into rented buffer");
        debug_assert!(self.has_room(data.len()), "write past buffer capacity");

        if let Some(frames) = variable_frames {
            debug_assert!(!self.descs_full(), "descriptor overflow");
            self.packet_descs.push(PacketDescription {
                start_offset: self.bytes_filled() as i64,
                byte_size: data.len() as u32,
                variable_frames: frames,
            });
        }
        self.buffers[self.fill_index].extend_from_slice(data);
    }

    /// The fill buffer's staged contents, for submission to the queue.
    pub fn staged(&self) -> (usize, &[u8], &[PacketDescription]) {
        (
            self.fill_index,
            &self.buffers[self.fill_index],
            &self.packet_descs,
        )
    }

    /// Enqueue-protocol step 1: rent the fill buffer out.
    pub fn mark_fill_in_use(&mut self) {
        debug_assert!(!self.inuse[self.fill_index], "double rent of fill buffer");
        self.inuse[self.fill_index] = true;
        self.buffers_used += 1;
        debug_assert!(self.buffers_used <= self.buffers.len());
    }

    /// Enqueue-protocol step 4: advance the fill cursor and reset it.
    /// A still-rented next buffer is left untouched; it is cleared when
    /// the queue returns it.
    pub fn advance(&mut self) {
        self.fill_index = (self.fill_index + 1) % self.buffers.len();
        if !self.inuse[self.fill_index] {
            self.buffers[self.fill_index].clear();
        }
        self.packet_descs.clear();
    }

    /// Buffer-complete: return a rented buffer to the pool.
    pub fn complete(&mut self, index: usize) {
        debug_assert!(self.inuse[index], "complete of idle buffer");
        self.inuse[index] = false;
        self.buffers_used -= 1;
        if index == self.fill_index {
            self.buffers[index].clear();
        }
    }

    /// Release everything (stop / sniffer reset).
    pub fn reset(&mut self) {
        for flag in &mut self.inuse {
            *flag = false;
        }
        for buf in &mut self.buffers {
            buf.clear();
        }
        self.packet_descs.clear();
        self.buffers_used = 0;
        self.fill_index = 0;
    }

    #[cfg(test)]
    fn inuse_count(&self) -> usize {
        self.inuse.iter().filter(|&&b| b).count()
    }
}
