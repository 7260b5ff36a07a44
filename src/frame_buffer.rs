use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::{VolumeError, VolumeResult};

/// Scalar storage of a volume: one zeroed allocation split into equally sized
/// frame slots.
///
/// Every slot owns a disjoint range of the allocation and has its own lock, so
/// frames are written concurrently without locking the whole buffer. Access
/// is always by frame index; there is no way to address bytes across a frame
/// boundary.
pub struct FrameBuffer {
    slots: Vec<Mutex<BytesMut>>,
    frame_len: usize,
}

impl FrameBuffer {
    pub fn zeroed(frame_len: usize, frame_count: usize) -> Self {
        let mut whole = BytesMut::zeroed(frame_len * frame_count);
        let slots = (0..frame_count)
            .map(|_| Mutex::new(whole.split_to(frame_len)))
            .collect();
        Self { slots, frame_len }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn frame_count(&self) -> usize {
        self.slots.len()
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.slots.iter().map(|slot| slot.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() || self.frame_len == 0
    }

    fn slot(&self, frame_index: usize) -> VolumeResult<&Mutex<BytesMut>> {
        self.slots
            .get(frame_index)
            .ok_or(VolumeError::FrameOutOfRange {
                frame_index,
                frame_count: self.slots.len(),
            })
    }

    /// Overwrite one frame. `bytes` must be exactly one frame long.
    pub fn write(&self, frame_index: usize, bytes: &[u8]) -> VolumeResult<()> {
        let slot = self.slot(frame_index)?;
        if bytes.len() != self.frame_len {
            return Err(VolumeError::InvalidFrameLength {
                frame_index,
                expected: self.frame_len,
                actual: bytes.len(),
            });
        }
        slot.lock().copy_from_slice(bytes);
        Ok(())
    }

    pub fn with_frame<R>(&self, frame_index: usize, f: impl FnOnce(&[u8]) -> R) -> VolumeResult<R> {
        let slot = self.slot(frame_index)?;
        let guard = slot.lock();
        Ok(f(&guard))
    }

    /// Copy every frame, in index order, into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.frame_len * self.slots.len());
        for slot in &self.slots {
            out.extend_from_slice(&slot.lock());
        }
        out
    }
}
