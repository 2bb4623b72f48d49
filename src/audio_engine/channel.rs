// src/audio_engine/channel.rs

use std::sync::Arc;

use crate::audio_engine::sample_tree::SampleTree;

/// One recorded loop: its sample tree plus the loop geometry, in frames.
/// The tree sits behind an `Arc` so a sticky channel can be carried into a
/// new section without copying audio; both sections then play the same
/// buffers.
pub struct Channel {
    tree: Arc<SampleTree>,

    /// Whether the channel participates in playback.
    pub enabled: bool,

    /// Carried into the matching slot of a newly created section.
    pub sticky: bool,

    /// Total length of the loop; 0 until recording of this channel closes.
    pub end: usize,

    /// Span-relative loop start. Positions below it wrap by `end` on
    /// lookup, which is how a short loop recorded late in the span plays.
    pub loop_pos: usize,

    /// Section position at which the current recording started. Only
    /// meaningful during the active record and at loop-close.
    pub start_pos: usize,

    /// Read-side shift added to the section position before lookup.
    pub offset: usize,
}

impl Channel {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(SampleTree::new()),
            enabled: true,
            sticky: false,
            end: 0,
            loop_pos: 0,
            start_pos: 0,
            offset: 0,
        }
    }

    pub fn has_audio(&self) -> bool {
        self.end != 0
    }

    /// Maps a section position to this channel's loop and fetches the
    /// buffer there, `None` where nothing was recorded (silence).
    pub fn read_buffer(&self, pos: usize) -> Option<&[f32]> {
        let mut p = if self.end == 0 { pos } else { pos % self.end } + self.offset;
        if p < self.loop_pos {
            p += self.end;
        }
        self.tree.get(p * 2)
    }

    /// Returns the write buffer at `pos`, creating it if needed. The
    /// position is not adjusted by `offset` or `end`.
    pub fn write_buffer(&mut self, pos: usize, samples_per_buffer: usize) -> &mut [f32] {
        if Arc::get_mut(&mut self.tree).is_none() {
            // The tree is aliased by a sticky copy in another section.
            // Recording starts over on a fresh tree; the other section
            // keeps playing the old audio untouched.
            self.tree = Arc::new(SampleTree::new());
        }
        let tree = Arc::get_mut(&mut self.tree).unwrap();
        tree.get_or_create(pos * 2, samples_per_buffer)
    }

    /// Shallow copy for sticky section inheritance: geometry and flags are
    /// carried, the audio is aliased.
    pub fn sticky_clone(&self) -> Channel {
        Channel {
            tree: Arc::clone(&self.tree),
            enabled: self.enabled,
            sticky: self.sticky,
            end: self.end,
            loop_pos: self.loop_pos,
            start_pos: self.start_pos,
            offset: self.offset,
        }
    }

    pub fn shares_audio_with(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree)
    }

    /// Encodes `[offset, offset + end)` as big-endian i16 samples for the
    /// project file; buffers never recorded come out as zeroes.
    pub fn encode_wave_data(&self, samples_per_buffer: usize) -> Vec<u8> {
        let frames_per_buffer = samples_per_buffer / 2;
        let mut data = Vec::new();
        if self.end == 0 || frames_per_buffer == 0 {
            return data;
        }

        let mut i = self.offset;
        while i < self.end + self.offset {
            match self.tree.get(i * 2) {
                Some(buf) => {
                    for &sample in buf.iter() {
                        let val = (sample * 32768.0).round() as i32;
                        data.push((val >> 8) as u8);
                        data.push((val & 0xff) as u8);
                    }
                }
                None => data.extend(std::iter::repeat(0u8).take(samples_per_buffer * 2)),
            }
            i += frames_per_buffer;
        }
        data
    }

    /// Inverse of `encode_wave_data`; geometry must already be set.
    pub fn decode_wave_data(&mut self, data: &[u8], samples_per_buffer: usize) {
        let frames_per_buffer = samples_per_buffer / 2;
        if self.end == 0 || frames_per_buffer == 0 {
            return;
        }

        let mut i = self.offset;
        while i < self.end + self.offset {
            let base = (i - self.offset) * 4;
            let buf = self.write_buffer(i, samples_per_buffer);
            for j in 0..samples_per_buffer {
                let index = base + j * 2;
                if index + 1 < data.len() {
                    let val = i16::from_be_bytes([data[index], data[index + 1]]);
                    buf[j] = val as f32 / 32768.0;
                }
            }
            i += frames_per_buffer;
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPB: usize = 16; // 8 frames per buffer
    const FPB: usize = SPB / 2;

    fn recorded_channel(frames: usize) -> Channel {
        let mut channel = Channel::new();
        let mut pos = 0;
        while pos < frames {
            let buf = channel.write_buffer(pos, SPB);
            for (i, sample) in buf.iter_mut().enumerate() {
                *sample = (pos * 2 + i) as f32;
            }
            pos += FPB;
        }
        channel.end = frames;
        channel
    }

    #[test]
    fn playback_is_periodic_in_end() {
        let channel = recorded_channel(FPB * 4);
        for pos in [0, FPB, FPB * 2] {
            let a = channel.read_buffer(pos).unwrap().to_vec();
            let b = channel.read_buffer(pos + channel.end).unwrap().to_vec();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn loop_pos_wraps_early_positions() {
        // A straddle loop: recorded from frame 2*FPB across the span end at
        // 4*FPB, so the tree holds [2*FPB, 5*FPB).
        let mut channel = Channel::new();
        let mut pos = FPB * 2;
        while pos < FPB * 5 {
            channel.write_buffer(pos, SPB)[0] = pos as f32;
            pos += FPB;
        }
        channel.end = FPB * 4;
        channel.loop_pos = FPB * 2;

        // Positions below loop_pos are shifted up by end before lookup:
        // pos 0 resolves to the buffer recorded past the span end.
        assert_eq!(channel.read_buffer(0).unwrap()[0], (FPB * 4) as f32);
        // Positions at or past loop_pos resolve directly.
        assert_eq!(channel.read_buffer(FPB * 2).unwrap()[0], (FPB * 2) as f32);
        // In between lies silence: shifted past the recorded range.
        assert!(channel.read_buffer(FPB).is_none());
    }

    #[test]
    fn missing_buffers_read_as_none() {
        let mut channel = Channel::new();
        channel.write_buffer(0, SPB);
        channel.end = FPB * 4;
        assert!(channel.read_buffer(FPB).is_none());
    }

    #[test]
    fn sticky_clone_aliases_audio() {
        let channel = recorded_channel(FPB * 2);
        let copy = channel.sticky_clone();
        assert!(copy.shares_audio_with(&channel));
        assert_eq!(copy.end, channel.end);
        assert_eq!(
            copy.read_buffer(0).unwrap(),
            channel.read_buffer(0).unwrap()
        );
    }

    #[test]
    fn writing_over_an_aliased_tree_detaches() {
        let mut channel = recorded_channel(FPB * 2);
        let copy = channel.sticky_clone();

        channel.write_buffer(0, SPB)[0] = 42.0;
        assert!(!channel.shares_audio_with(&copy));
        // The copy still sees the original audio.
        assert_eq!(copy.read_buffer(0).unwrap()[0], 0.0);
    }

    #[test]
    fn wave_data_round_trips() {
        let mut channel = Channel::new();
        let buf = channel.write_buffer(0, SPB);
        for (i, sample) in buf.iter_mut().enumerate() {
            *sample = (i as f32 - 8.0) / 16.0;
        }
        channel.end = FPB;

        let data = channel.encode_wave_data(SPB);
        assert_eq!(data.len(), SPB * 2);

        let mut restored = Channel::new();
        restored.end = channel.end;
        restored.decode_wave_data(&data, SPB);

        let original = channel.read_buffer(0).unwrap();
        let loaded = restored.read_buffer(0).unwrap();
        for (a, b) in original.iter().zip(loaded.iter()) {
            assert!((a - b).abs() < 1.0 / 32768.0 + 1e-6);
        }
    }

    #[test]
    fn missing_buffers_encode_as_zeroes() {
        let mut channel = Channel::new();
        channel.write_buffer(0, SPB);
        channel.end = FPB * 2;
        let data = channel.encode_wave_data(SPB);
        assert_eq!(data.len(), SPB * 2 * 2);
        assert!(data[SPB * 2..].iter().all(|&b| b == 0));
    }
}
