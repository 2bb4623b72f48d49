// src/control.rs

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

pub const DEFAULT_CHANNELS: usize = 8;

/// Sentinel for "no channel is being recorded".
pub const NO_RECORD: i32 = -1;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordMode {
    Wrap,
    Expand,
    SpanRelative,
}

impl From<u8> for RecordMode {
    fn from(val: u8) -> Self {
        match val {
            0 => RecordMode::Wrap,
            1 => RecordMode::Expand,
            _ => RecordMode::SpanRelative,
        }
    }
}

impl RecordMode {
    pub fn next(self) -> RecordMode {
        match self {
            RecordMode::Wrap => RecordMode::Expand,
            RecordMode::Expand => RecordMode::SpanRelative,
            RecordMode::SpanRelative => RecordMode::Wrap,
        }
    }
}

/// Edge-triggered commands for the audio callback. Encoded into a single
/// atomic word: the command kind in the high bits, a small parameter (the
/// channel index for the per-channel commands) in the low byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Clear,
    NewSection,
    NextSection,
    PrevSection,
    SetChannelSticky(usize),
    ClearChannelSticky(usize),
    EnableChannel(usize),
    DisableChannel(usize),
}

const CMD_NOOP: u32 = 0;
const CMD_CLEAR: u32 = 1;
const CMD_NEW_SECTION: u32 = 2;
const CMD_NEXT_SECTION: u32 = 3;
const CMD_PREV_SECTION: u32 = 4;
const CMD_SET_STICKY: u32 = 5;
const CMD_CLEAR_STICKY: u32 = 6;
const CMD_ENABLE: u32 = 7;
const CMD_DISABLE: u32 = 8;

impl Command {
    pub fn encode(self) -> u32 {
        match self {
            Command::Clear => CMD_CLEAR << 8,
            Command::NewSection => CMD_NEW_SECTION << 8,
            Command::NextSection => CMD_NEXT_SECTION << 8,
            Command::PrevSection => CMD_PREV_SECTION << 8,
            Command::SetChannelSticky(ch) => CMD_SET_STICKY << 8 | (ch as u32 & 0xff),
            Command::ClearChannelSticky(ch) => CMD_CLEAR_STICKY << 8 | (ch as u32 & 0xff),
            Command::EnableChannel(ch) => CMD_ENABLE << 8 | (ch as u32 & 0xff),
            Command::DisableChannel(ch) => CMD_DISABLE << 8 | (ch as u32 & 0xff),
        }
    }

    /// Decodes a command word. `None` for a word the engine does not know,
    /// which the callback treats as a fatal programmer error.
    pub fn decode(word: u32) -> Option<Option<Command>> {
        let param = (word & 0xff) as usize;
        match word >> 8 {
            CMD_NOOP => Some(None),
            CMD_CLEAR => Some(Some(Command::Clear)),
            CMD_NEW_SECTION => Some(Some(Command::NewSection)),
            CMD_NEXT_SECTION => Some(Some(Command::NextSection)),
            CMD_PREV_SECTION => Some(Some(Command::PrevSection)),
            CMD_SET_STICKY => Some(Some(Command::SetChannelSticky(param))),
            CMD_CLEAR_STICKY => Some(Some(Command::ClearChannelSticky(param))),
            CMD_ENABLE => Some(Some(Command::EnableChannel(param))),
            CMD_DISABLE => Some(Some(Command::DisableChannel(param))),
            _ => None,
        }
    }
}

/// State shared between the control threads (RPC, terminal, pedal) and the
/// audio callback. Everything here is lock-free; the callback reads each
/// cell exactly once per period. Commands are a single slot, not a queue: a
/// second command published before the callback consumes the first wins.
#[derive(Clone)]
pub struct ControlSurface {
    command: Arc<AtomicU32>,
    record_channel: Arc<AtomicI32>,
    playing: Arc<AtomicBool>,
    record_mode: Arc<AtomicU8>,
}

impl ControlSurface {
    pub fn new() -> Self {
        Self {
            command: Arc::new(AtomicU32::new(CMD_NOOP)),
            record_channel: Arc::new(AtomicI32::new(NO_RECORD)),
            playing: Arc::new(AtomicBool::new(false)),
            record_mode: Arc::new(AtomicU8::new(RecordMode::SpanRelative as u8)),
        }
    }

    pub fn send(&self, command: Command) {
        self.command.store(command.encode(), Ordering::Release);
    }

    /// Consumes the command slot, resetting it to noop. Audio thread only.
    /// The AcqRel swap pairs with `send` so the parameter byte is observed
    /// consistently with the command kind.
    pub fn take_command(&self) -> Option<Option<Command>> {
        Command::decode(self.command.swap(CMD_NOOP, Ordering::AcqRel))
    }

    pub fn start_record(&self, channel: usize) {
        self.record_channel.store(channel as i32, Ordering::Relaxed);
    }

    pub fn end_record(&self) {
        self.record_channel.store(NO_RECORD, Ordering::Relaxed);
    }

    pub fn record_channel(&self) -> i32 {
        self.record_channel.load(Ordering::Relaxed)
    }

    pub fn is_recording(&self) -> bool {
        self.record_channel() != NO_RECORD
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Relaxed);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    pub fn set_record_mode(&self, mode: RecordMode) {
        self.record_mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn record_mode(&self) -> RecordMode {
        self.record_mode.load(Ordering::Relaxed).into()
    }
}

impl Default for ControlSurface {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine state published back toward the UI threads: the audio callback
/// stores these once per period, the terminal meter reads them whenever it
/// redraws.
#[derive(Clone)]
pub struct EngineStatus {
    pos: Arc<AtomicU32>,
    section_end: Arc<AtomicU32>,
    section_index: Arc<AtomicU32>,
    section_count: Arc<AtomicU32>,
}

impl EngineStatus {
    pub fn new() -> Self {
        Self {
            pos: Arc::new(AtomicU32::new(0)),
            section_end: Arc::new(AtomicU32::new(0)),
            section_index: Arc::new(AtomicU32::new(0)),
            section_count: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Audio thread only.
    pub fn publish(&self, pos: usize, section_end: usize, section_index: usize, sections: usize) {
        self.pos.store(pos as u32, Ordering::Relaxed);
        self.section_end.store(section_end as u32, Ordering::Relaxed);
        self.section_index.store(section_index as u32, Ordering::Relaxed);
        self.section_count.store(sections as u32, Ordering::Relaxed);
    }

    pub fn pos(&self) -> usize {
        self.pos.load(Ordering::Relaxed) as usize
    }

    pub fn section_end(&self) -> usize {
        self.section_end.load(Ordering::Relaxed) as usize
    }

    pub fn section(&self) -> (usize, usize) {
        (
            self.section_index.load(Ordering::Relaxed) as usize,
            self.section_count.load(Ordering::Relaxed) as usize,
        )
    }
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_words_round_trip() {
        for cmd in [
            Command::Clear,
            Command::NewSection,
            Command::NextSection,
            Command::PrevSection,
            Command::SetChannelSticky(7),
            Command::ClearChannelSticky(3),
            Command::EnableChannel(5),
            Command::DisableChannel(0),
        ] {
            assert_eq!(Command::decode(cmd.encode()), Some(Some(cmd)));
        }
        assert_eq!(Command::decode(CMD_NOOP), Some(None));
        assert_eq!(Command::decode(0xff00), None);
    }

    #[test]
    fn take_command_resets_slot() {
        let surface = ControlSurface::new();
        surface.send(Command::SetChannelSticky(2));
        assert_eq!(
            surface.take_command(),
            Some(Some(Command::SetChannelSticky(2)))
        );
        assert_eq!(surface.take_command(), Some(None));
    }

    #[test]
    fn second_publish_overwrites_first() {
        let surface = ControlSurface::new();
        surface.send(Command::NewSection);
        surface.send(Command::NextSection);
        assert_eq!(surface.take_command(), Some(Some(Command::NextSection)));
    }
}
