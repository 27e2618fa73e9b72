//! Recycled frame buffers.
//!
//! Frames are filed by size class so a request for a small control frame
//! does not pin a 64 KiB buffer, and a large inbound frame does not have to
//! regrow a small one. Each class keeps at most `per_class` idle frames;
//! anything beyond that is dropped.

use parking_lot::Mutex;

use crate::frame::{Frame, FrameType, RstStatus, Setting};

/// Buffer sizes of the pool's classes, ascending.
pub const SIZE_CLASSES: [usize; 5] = [1024, 4 * 1024, 16 * 1024, 64 * 1024, 256 * 1024];

/// Free-list of frames, one list per size class.
#[derive(Debug)]
pub struct FramePool {
    classes: Vec<Mutex<Vec<Frame>>>,
    per_class: usize,
}

impl FramePool {
    pub fn new(per_class: usize) -> Self {
        Self {
            classes: SIZE_CLASSES.iter().map(|_| Mutex::new(Vec::new())).collect(),
            per_class,
        }
    }

    /// A reset frame whose buffer holds at least `capacity` bytes.
    pub fn get(&self, capacity: usize) -> Frame {
        match SIZE_CLASSES.iter().position(|&size| size >= capacity) {
            Some(class) => self.classes[class]
                .lock()
                .pop()
                .unwrap_or_else(|| Frame::with_capacity(SIZE_CLASSES[class])),
            None => Frame::with_capacity(capacity),
        }
    }

    /// A reset control frame of the given type.
    pub fn control(&self, frame_type: FrameType) -> Frame {
        let mut frame = self.get(SIZE_CLASSES[0]);
        frame.set_type(frame_type);
        frame
    }

    /// PING carrying `id`, built in a pooled frame.
    pub fn ping(&self, id: u32) -> Frame {
        let mut frame = self.control(FrameType::Ping);
        frame.write_ping(id);
        frame
    }

    /// RST_STREAM for `stream_id`, built in a pooled frame.
    pub fn rst_stream(&self, stream_id: u32, status: RstStatus) -> Frame {
        let mut frame = self.control(FrameType::RstStream);
        frame.write_rst_stream(stream_id, status);
        frame
    }

    /// GOAWAY naming `last_stream_id`, built in a pooled frame.
    pub fn goaway(&self, last_stream_id: u32) -> Frame {
        let mut frame = self.control(FrameType::GoAway);
        frame.write_goaway(last_stream_id);
        frame
    }

    /// SETTINGS with the given entries, built in a pooled frame.
    pub fn settings(&self, settings: &[Setting]) -> Frame {
        let mut frame = self.control(FrameType::Settings);
        frame.write_settings(settings);
        frame
    }

    /// Return a frame for reuse.
    pub fn recycle(&self, mut frame: Frame) {
        let capacity = frame.capacity();
        let Some(class) = SIZE_CLASSES.iter().rposition(|&size| size <= capacity) else {
            return;
        };
        frame.recycle();
        let mut free = self.classes[class].lock();
        if free.len() < self.per_class {
            free.push(frame);
        }
    }

    /// Idle frames currently held.
    pub fn idle(&self) -> usize {
        self.classes.iter().map(|class| class.lock().len()).sum()
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(64)
    }
}
