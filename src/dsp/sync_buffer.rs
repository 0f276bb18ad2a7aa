//! Sliding PCM window between the decoder and the audio device.
//!
//! The buffer holds recent history (already delivered, kept for pitch
//! search and concealment) plus a pending region that has been produced
//! but not yet handed to the device. `end_timestamp` tracks the RTP time
//! just past the last produced sample; the pending length is the
//! end-minus-cur distance of the classic implementation.

/// Fixed-capacity PCM window.
pub struct SyncBuffer {
    buf: Vec<i16>,
    /// Valid samples in `buf[..fill]`, newest at the end.
    fill: usize,
    /// Trailing samples not yet delivered; `pending <= fill`.
    pending: usize,
    end_timestamp: u32,
}

impl SyncBuffer {
    pub fn new(capacity: usize) -> Self {
        SyncBuffer {
            buf: vec![0i16; capacity],
            fill: 0,
            pending: 0,
            end_timestamp: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Samples produced but not yet delivered.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// All valid samples, oldest first. The last `pending()` of these are
    /// still owed to the device.
    pub fn history(&self) -> &[i16] {
        &self.buf[..self.fill]
    }

    /// Timestamp one past the last produced sample.
    pub fn end_timestamp(&self) -> u32 {
        self.end_timestamp
    }

    pub fn set_end_timestamp(&mut self, ts: u32) {
        self.end_timestamp = ts;
    }

    pub fn advance_timestamp(&mut self, samples: u32) {
        self.end_timestamp = self.end_timestamp.wrapping_add(samples);
    }

    /// Timestamp of the next sample the device will receive.
    pub fn playout_timestamp(&self) -> u32 {
        self.end_timestamp.wrapping_sub(self.pending as u32)
    }

    /// Append produced samples, sliding out the oldest history as needed.
    /// The pending region is never slid out; if `samples` alone exceeds
    /// what can coexist with it, only the newest part is kept.
    pub fn append(&mut self, samples: &[i16]) {
        let room_for_input = self.buf.len() - self.pending;
        let samples = if samples.len() > room_for_input {
            &samples[samples.len() - room_for_input..]
        } else {
            samples
        };

        let needed = self.fill + samples.len();
        if needed > self.buf.len() {
            let shift = (needed - self.buf.len()).min(self.fill - self.pending);
            self.buf.copy_within(shift..self.fill, 0);
            self.fill -= shift;
        }
        self.buf[self.fill..self.fill + samples.len()].copy_from_slice(samples);
        self.fill += samples.len();
        self.pending += samples.len();
    }

    /// Deliver up to `out.len()` pending samples; returns the count.
    pub fn read(&mut self, out: &mut [i16]) -> usize {
        let n = out.len().min(self.pending);
        let start = self.fill - self.pending;
        out[..n].copy_from_slice(&self.buf[start..start + n]);
        self.pending -= n;
        n
    }

    pub fn flush(&mut self) {
        self.fill = 0;
        self.pending = 0;
    }
}
