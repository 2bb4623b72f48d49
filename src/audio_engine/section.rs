// src/audio_engine/section.rs

use crate::audio_engine::channel::Channel;
use crate::control::DEFAULT_CHANNELS;

/// An ordered set of channels looping against one span length.
pub struct Section {
    pub channels: Vec<Channel>,

    /// Span length in frames; 0 until the first channel closes. Set by the
    /// first loop-close, possibly quantized upward later by expand or
    /// span-relative recordings.
    pub end: usize,
}

impl Section {
    pub fn new() -> Self {
        Self {
            channels: (0..DEFAULT_CHANNELS).map(|_| Channel::new()).collect(),
            end: 0,
        }
    }

    /// A fresh section inheriting the sticky channels of `prior`: sticky
    /// slots are shallow-copied (audio aliased), the rest start empty.
    pub fn inherit(prior: &Section) -> Self {
        Self {
            channels: prior
                .channels
                .iter()
                .map(|c| if c.sticky { c.sticky_clone() } else { Channel::new() })
                .collect(),
            end: 0,
        }
    }

    /// Grows the channel vector so `index` is addressable.
    pub fn ensure_channel(&mut self, index: usize) {
        while self.channels.len() <= index {
            self.channels.push(Channel::new());
        }
    }
}

impl Default for Section {
    fn default() -> Self {
        Self::new()
    }
}

/// All sections of a running project plus the current selection.
pub struct Project {
    pub sections: Vec<Section>,
    pub section_index: usize,
}

impl Project {
    pub fn new() -> Self {
        Self {
            sections: vec![Section::new()],
            section_index: 0,
        }
    }

    pub fn current(&self) -> &Section {
        &self.sections[self.section_index]
    }

    pub fn current_mut(&mut self) -> &mut Section {
        &mut self.sections[self.section_index]
    }

    pub fn new_section(&mut self) {
        let section = Section::inherit(self.current());
        self.sections.push(section);
        self.section_index = self.sections.len() - 1;
    }

    pub fn next_section(&mut self) {
        self.section_index = (self.section_index + 1) % self.sections.len();
    }

    pub fn prev_section(&mut self) {
        let n = self.sections.len();
        self.section_index = (self.section_index + n - 1) % n;
    }
}

impl Default for Project {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_start_with_the_default_channel_count() {
        let section = Section::new();
        assert_eq!(section.channels.len(), DEFAULT_CHANNELS);
        assert_eq!(section.end, 0);
    }

    #[test]
    fn inherit_carries_sticky_slots_only() {
        let mut prior = Section::new();
        prior.end = 4096;
        prior.channels[0].sticky = true;
        prior.channels[0].end = 4096;
        prior.channels[2].end = 4096; // recorded but not sticky

        let next = Section::inherit(&prior);
        assert_eq!(next.end, 0);
        assert!(next.channels[0].sticky);
        assert_eq!(next.channels[0].end, 4096);
        assert!(next.channels[0].shares_audio_with(&prior.channels[0]));
        assert!(!next.channels[2].has_audio());
    }

    #[test]
    fn prev_section_wraps_without_going_negative() {
        let mut project = Project::new();
        project.sections.push(Section::new());
        project.sections.push(Section::new());
        assert_eq!(project.section_index, 0);

        project.prev_section();
        assert_eq!(project.section_index, 2);
        project.next_section();
        assert_eq!(project.section_index, 0);
    }
}
