// src/event.rs

use std::fmt;

/// A timestamped MIDI event. Times are ticks since the start of the
/// section the event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MidiEvent {
    pub time: u32,
    pub kind: EventKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    ProgramChange { channel: u8, program: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    PitchWheel { channel: u8, value: u16 },
}

impl EventKind {
    pub fn channel(&self) -> u8 {
        match *self {
            EventKind::NoteOn { channel, .. }
            | EventKind::NoteOff { channel, .. }
            | EventKind::ProgramChange { channel, .. }
            | EventKind::ControlChange { channel, .. }
            | EventKind::PitchWheel { channel, .. } => channel,
        }
    }

    pub fn set_channel(&mut self, new: u8) {
        match self {
            EventKind::NoteOn { channel, .. }
            | EventKind::NoteOff { channel, .. }
            | EventKind::ProgramChange { channel, .. }
            | EventKind::ControlChange { channel, .. }
            | EventKind::PitchWheel { channel, .. } => *channel = new,
        }
    }

    /// The wire status byte for this event.
    pub fn status(&self) -> u8 {
        match *self {
            EventKind::NoteOn { channel, .. } => 0x90 | channel,
            EventKind::NoteOff { channel, .. } => 0x80 | channel,
            EventKind::ProgramChange { channel, .. } => 0xc0 | channel,
            EventKind::ControlChange { channel, .. } => 0xb0 | channel,
            EventKind::PitchWheel { channel, .. } => 0xe0 | channel,
        }
    }

    /// The event as plain status + data bytes, no running-status
    /// compression. This is what the output ports are fed.
    pub fn to_raw(&self) -> Vec<u8> {
        match *self {
            EventKind::NoteOn { note, velocity, .. } => vec![self.status(), note, velocity],
            EventKind::NoteOff { note, velocity, .. } => vec![self.status(), note, velocity],
            EventKind::ProgramChange { program, .. } => vec![self.status(), program],
            EventKind::ControlChange {
                controller, value, ..
            } => vec![self.status(), controller, value],
            EventKind::PitchWheel { value, .. } => {
                vec![self.status(), (value & 0x7f) as u8, (value >> 7) as u8]
            }
        }
    }
}

impl fmt::Display for MidiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EventKind::NoteOn {
                channel,
                note,
                velocity,
            } => write!(
                f,
                "NoteOn(t={}, ch={}, n={}, v={})",
                self.time, channel, note, velocity
            ),
            EventKind::NoteOff { channel, note, .. } => {
                write!(f, "NoteOff(t={}, ch={}, n={})", self.time, channel, note)
            }
            EventKind::ProgramChange { channel, program } => write!(
                f,
                "ProgramChange(t={}, ch={}, p={})",
                self.time, channel, program
            ),
            EventKind::ControlChange {
                channel,
                controller,
                value,
            } => write!(
                f,
                "ControlChange(t={}, ch={}, c={}, v={})",
                self.time, channel, controller, value
            ),
            EventKind::PitchWheel { channel, value } => {
                write!(f, "PitchWheel(t={}, ch={}, v={})", self.time, channel, value)
            }
        }
    }
}

/// An ordered sequence of MIDI events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Track {
    events: Vec<MidiEvent>,
}

impl Track {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event. The event must not be earlier than the last
    /// event already on the track; a violation is a producer bug.
    pub fn add(&mut self, event: MidiEvent) {
        if let Some(last) = self.events.last() {
            if event.time < last.time {
                panic!(
                    "adding event {} which is earlier than the last event on the track ({})",
                    event, last
                );
            }
        }
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MidiEvent> {
        self.events.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MidiEvent> {
        self.events.iter()
    }

    /// Index of the first event with `time > t`; this is where playback
    /// resumes after a seek.
    pub fn seek(&self, t: u32) -> usize {
        self.events.partition_point(|e| e.time <= t)
    }
}

impl<'a> IntoIterator for &'a Track {
    type Item = &'a MidiEvent;
    type IntoIter = std::slice::Iter<'a, MidiEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// A recoverable failure while decoding a MIDI byte stream.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The stream ended in the middle of an event or delta time.
    UnexpectedEnd,
    /// A status byte the decoder has no event kind for.
    UnknownStatus(u8),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnexpectedEnd => write!(f, "unexpected end of MIDI data"),
            ParseError::UnknownStatus(status) => write!(f, "unknown status byte {:#04x}", status),
        }
    }
}

impl std::error::Error for ParseError {}

/// Encodes a track as a MIDI event stream: variable-length delta times
/// interleaved with running-status-compressed events.
pub fn serialize_track(track: &Track) -> Vec<u8> {
    let mut out = Vec::new();
    let mut status: u8 = 0;
    let mut last_time: u32 = 0;

    for event in track {
        write_varlen(&mut out, event.time - last_time);
        last_time = event.time;
        status = write_event(&mut out, status, &event.kind);
    }
    out
}

fn write_varlen(out: &mut Vec<u8>, mut value: u32) {
    let mut stack = [0u8; 5];
    let mut n = 0;
    stack[n] = (value & 0x7f) as u8;
    n += 1;
    value >>= 7;
    while value != 0 {
        stack[n] = (value & 0x7f) as u8 | 0x80;
        n += 1;
        value >>= 7;
    }
    while n > 0 {
        n -= 1;
        out.push(stack[n]);
    }
}

/// Writes one event under running status; returns the new running status.
fn write_event(out: &mut Vec<u8>, status: u8, kind: &EventKind) -> u8 {
    match *kind {
        EventKind::NoteOn {
            channel,
            note,
            velocity,
        } => {
            let own = 0x90 | channel;
            if status != own {
                out.push(own);
            }
            out.push(note);
            out.push(velocity);
            own
        }
        EventKind::NoteOff {
            channel,
            note,
            velocity,
        } => {
            // Under a NoteOn running status a NoteOff travels as NoteOn
            // with velocity zero, saving the status byte.
            if status == 0x80 | channel {
                out.push(note);
                out.push(velocity);
                status
            } else if status == 0x90 | channel && velocity == 0 {
                out.push(note);
                out.push(0);
                status
            } else {
                let own = 0x80 | channel;
                out.push(own);
                out.push(note);
                out.push(velocity);
                own
            }
        }
        EventKind::ProgramChange { channel, program } => {
            // Always sent with its status byte.
            let own = 0xc0 | channel;
            out.push(own);
            out.push(program);
            own
        }
        EventKind::ControlChange {
            channel,
            controller,
            value,
        } => {
            let own = 0xb0 | channel;
            if status != own {
                out.push(own);
            }
            out.push(controller);
            out.push(value);
            own
        }
        EventKind::PitchWheel { channel, value } => {
            let own = 0xe0 | channel;
            if status != own {
                out.push(own);
            }
            out.push((value & 0x7f) as u8);
            out.push((value >> 7) as u8);
            own
        }
    }
}

/// Decodes a MIDI event stream back into a track. Delta times are summed
/// into absolute times; unknown meta and sys-ex events are skipped with a
/// warning; truncation is a recoverable error and discards the partial
/// track.
pub fn parse_track(data: &[u8]) -> Result<Track, ParseError> {
    let mut parser = TrackParser {
        data,
        cur: 0,
        status: 0,
    };
    let mut track = Track::new();
    let mut time: u32 = 0;

    while parser.cur < parser.data.len() {
        time += parser.read_varlen()?;
        match parser.read_event()? {
            Parsed::Event(kind) => track.add(MidiEvent { time, kind }),
            Parsed::Skipped => {}
            Parsed::EndOfTrack => break,
        }
    }
    Ok(track)
}

enum Parsed {
    Event(EventKind),
    Skipped,
    EndOfTrack,
}

struct TrackParser<'a> {
    data: &'a [u8],
    cur: usize,
    status: u8,
}

impl TrackParser<'_> {
    fn read_byte(&mut self) -> Result<u8, ParseError> {
        let byte = *self.data.get(self.cur).ok_or(ParseError::UnexpectedEnd)?;
        self.cur += 1;
        Ok(byte)
    }

    fn read_varlen(&mut self) -> Result<u32, ParseError> {
        let mut value: u32 = 0;
        let mut byte = self.read_byte()?;
        while byte & 0x80 != 0 {
            value = value << 7 | (byte & 0x7f) as u32;
            byte = self.read_byte()?;
        }
        Ok(value << 7 | byte as u32)
    }

    fn read_event(&mut self) -> Result<Parsed, ParseError> {
        let mut first = self.read_byte()?;

        // A set high bit is a new status byte; otherwise the running
        // status applies and the byte is data.
        if first & 0x80 != 0 {
            self.status = first;
            if self.status == 0xf0 {
                // Sys-ex: length-prefixed payload we have no use for.
                let len = self.read_varlen()? as usize;
                self.skip(len)?;
                log::warn!("skipping sys-ex event of {} bytes", len);
                return Ok(Parsed::Skipped);
            }
            if self.status == 0xff {
                return self.read_meta_event();
            }
            first = self.read_byte()?;
        }

        let channel = self.status & 0x0f;
        match self.status & 0xf0 {
            0x90 => {
                let velocity = self.read_byte()?;
                Ok(Parsed::Event(if velocity != 0 {
                    EventKind::NoteOn {
                        channel,
                        note: first,
                        velocity,
                    }
                } else {
                    EventKind::NoteOff {
                        channel,
                        note: first,
                        velocity: 0,
                    }
                }))
            }
            0x80 => Ok(Parsed::Event(EventKind::NoteOff {
                channel,
                note: first,
                velocity: self.read_byte()?,
            })),
            0xc0 => Ok(Parsed::Event(EventKind::ProgramChange {
                channel,
                program: first,
            })),
            0xb0 => Ok(Parsed::Event(EventKind::ControlChange {
                channel,
                controller: first,
                value: self.read_byte()?,
            })),
            0xe0 => {
                let high = self.read_byte()?;
                Ok(Parsed::Event(EventKind::PitchWheel {
                    channel,
                    value: (high as u16) << 7 | first as u16,
                }))
            }
            _ => Err(ParseError::UnknownStatus(self.status)),
        }
    }

    fn read_meta_event(&mut self) -> Result<Parsed, ParseError> {
        let action = self.read_byte()?;
        if action == 0x2f {
            self.read_byte()?; // zero-length payload
            return Ok(Parsed::EndOfTrack);
        }
        let len = self.read_varlen()? as usize;
        self.skip(len)?;
        log::warn!("skipping unknown meta event {:#04x} of {} bytes", action, len);
        Ok(Parsed::Skipped)
    }

    fn skip(&mut self, len: usize) -> Result<(), ParseError> {
        if self.cur + len > self.data.len() {
            return Err(ParseError::UnexpectedEnd);
        }
        self.cur += len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on(time: u32, channel: u8, note: u8, velocity: u8) -> MidiEvent {
        MidiEvent {
            time,
            kind: EventKind::NoteOn {
                channel,
                note,
                velocity,
            },
        }
    }

    fn note_off(time: u32, channel: u8, note: u8) -> MidiEvent {
        MidiEvent {
            time,
            kind: EventKind::NoteOff {
                channel,
                note,
                velocity: 0,
            },
        }
    }

    #[test]
    #[should_panic(expected = "earlier than the last event")]
    fn out_of_order_add_is_fatal() {
        let mut track = Track::new();
        track.add(note_on(10, 0, 60, 100));
        track.add(note_on(5, 0, 62, 100));
    }

    #[test]
    fn varlen_boundaries() {
        for (value, expected) in [
            (0u32, vec![0x00]),
            (0x7f, vec![0x7f]),
            (0x80, vec![0x81, 0x00]),
            (0x3fff, vec![0xff, 0x7f]),
            (0x4000, vec![0x81, 0x80, 0x00]),
        ] {
            let mut out = Vec::new();
            write_varlen(&mut out, value);
            assert_eq!(out, expected, "encoding {}", value);

            let mut parser = TrackParser {
                data: &out,
                cur: 0,
                status: 0,
            };
            assert_eq!(parser.read_varlen().unwrap(), value);
        }
    }

    #[test]
    fn round_trip_with_running_status_note_off() {
        let mut track = Track::new();
        track.add(note_on(0, 3, 60, 100));
        track.add(note_on(5, 3, 62, 100));
        track.add(note_off(10, 3, 60));

        let bytes = serialize_track(&track);
        // The NoteOff rides the NoteOn running status as velocity zero:
        // one status byte for the whole stream.
        assert_eq!(bytes.iter().filter(|&&b| b == 0x93).count(), 1);
        assert!(!bytes.contains(&0x83));

        assert_eq!(parse_track(&bytes).unwrap(), track);
    }

    #[test]
    fn round_trip_mixed_kinds() {
        let mut track = Track::new();
        track.add(MidiEvent {
            time: 0,
            kind: EventKind::ProgramChange {
                channel: 2,
                program: 30,
            },
        });
        track.add(MidiEvent {
            time: 4,
            kind: EventKind::ControlChange {
                channel: 2,
                controller: 7,
                value: 99,
            },
        });
        track.add(MidiEvent {
            time: 4,
            kind: EventKind::PitchWheel {
                channel: 2,
                value: 0x2345,
            },
        });
        track.add(note_on(200, 0, 40, 80));
        track.add(note_off(500, 0, 40));

        assert_eq!(parse_track(&serialize_track(&track)).unwrap(), track);
    }

    #[test]
    fn truncated_stream_is_a_recoverable_error() {
        let mut track = Track::new();
        track.add(note_on(0, 0, 60, 100));
        let mut bytes = serialize_track(&track);
        bytes.pop();
        assert_eq!(parse_track(&bytes), Err(ParseError::UnexpectedEnd));
    }

    #[test]
    fn unknown_meta_events_are_skipped() {
        // delta 0, set-tempo meta (length 3), then a note on.
        let bytes = [
            0x00, 0xff, 0x51, 0x03, 0x07, 0xa1, 0x20, //
            0x00, 0x90, 0x3c, 0x64,
        ];
        let track = parse_track(&bytes).unwrap();
        assert_eq!(track.len(), 1);
        assert_eq!(*track.get(0).unwrap(), note_on(0, 0, 60, 100));
    }

    #[test]
    fn end_of_track_stops_the_parse() {
        let bytes = [
            0x00, 0x90, 0x3c, 0x64, //
            0x00, 0xff, 0x2f, 0x00, //
            0x00, 0x3d, 0x64, // unreachable data after the end marker
        ];
        let track = parse_track(&bytes).unwrap();
        assert_eq!(track.len(), 1);
    }

    #[test]
    fn seek_finds_the_first_later_event() {
        let mut track = Track::new();
        track.add(note_on(0, 0, 60, 100));
        track.add(note_on(10, 0, 62, 100));
        track.add(note_on(10, 0, 64, 100));
        track.add(note_on(20, 0, 65, 100));

        assert_eq!(track.seek(0), 1);
        assert_eq!(track.seek(9), 1);
        assert_eq!(track.seek(10), 3);
        assert_eq!(track.seek(25), 4);
    }
}
