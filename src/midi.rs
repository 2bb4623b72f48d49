// src/midi.rs

use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;
use log::{info, warn};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};

use crate::event::{EventKind, MidiEvent};
use crate::sequencer::EventDispatcher;

const CLIENT_NAME: &str = "spanloop";

/// All sound off / all notes off controller numbers.
const CC_ALL_SOUND_OFF: u8 = 120;
const CC_ALL_NOTES_OFF: u8 = 123;

/// Opens the named input port (substring match, first port when unnamed)
/// and feeds decoded events into the reactor's channel. The returned
/// connection must stay alive for as long as input should flow.
pub fn connect_input(
    port_name: Option<&str>,
    tx: Sender<EventKind>,
) -> Result<MidiInputConnection<()>> {
    let mut midi_in = MidiInput::new(CLIENT_NAME)?;
    midi_in.ignore(Ignore::None);

    let ports = midi_in.ports();
    let port = match port_name {
        Some(name) => ports
            .iter()
            .find(|p| {
                midi_in
                    .port_name(p)
                    .map(|n| n.contains(name))
                    .unwrap_or(false)
            })
            .cloned()
            .ok_or_else(|| anyhow!("MIDI input port not found: {}", name))?,
        None => ports
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("no MIDI input ports available"))?,
    };
    info!("Opening MIDI input: {}", midi_in.port_name(&port)?);

    let conn = midi_in
        .connect(
            &port,
            "spanloop-in",
            move |_stamp, message, _| {
                if let Some(kind) = decode_message(message) {
                    // The reactor stamps the event with the current tick.
                    let _ = tx.send(kind);
                }
            },
            (),
        )
        .map_err(|err| anyhow!("failed to connect to MIDI input: {}", err))?;
    Ok(conn)
}

/// Decodes one raw port message into an event, `None` for anything the
/// sequencer has no use for (clock, active sensing, truncated data).
fn decode_message(message: &[u8]) -> Option<EventKind> {
    if message.is_empty() {
        return None;
    }
    let channel = message[0] & 0x0f;
    match message[0] & 0xf0 {
        0x90 if message.len() >= 3 => Some(if message[2] > 0 {
            EventKind::NoteOn {
                channel,
                note: message[1],
                velocity: message[2],
            }
        } else {
            EventKind::NoteOff {
                channel,
                note: message[1],
                velocity: 0,
            }
        }),
        0x80 if message.len() >= 3 => Some(EventKind::NoteOff {
            channel,
            note: message[1],
            velocity: message[2],
        }),
        0xb0 if message.len() >= 3 => Some(EventKind::ControlChange {
            channel,
            controller: message[1],
            value: message[2],
        }),
        0xc0 if message.len() >= 2 => Some(EventKind::ProgramChange {
            channel,
            program: message[1],
        }),
        0xe0 if message.len() >= 3 => Some(EventKind::PitchWheel {
            channel,
            value: (message[2] as u16) << 7 | message[1] as u16,
        }),
        _ => None,
    }
}

/// An opaque MIDI byte sink behind a midir output connection. Covers both
/// the soft-synth and hardware instrument cases; the daemon just names a
/// different port.
pub struct PortDispatcher {
    conn: MidiOutputConnection,
    name: String,
}

impl PortDispatcher {
    /// Connects to the named output port (substring match, first port when
    /// unnamed).
    pub fn connect(port_name: Option<&str>) -> Result<Self> {
        let midi_out = MidiOutput::new(CLIENT_NAME)?;
        let ports = midi_out.ports();
        let port = match port_name {
            Some(name) => ports
                .iter()
                .find(|p| {
                    midi_out
                        .port_name(p)
                        .map(|n| n.contains(name))
                        .unwrap_or(false)
                })
                .cloned()
                .ok_or_else(|| anyhow!("MIDI output port not found: {}", name))?,
            None => ports
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("no MIDI output ports available"))?,
        };
        let name = midi_out.port_name(&port)?;
        info!("Opening MIDI output: {}", name);

        let conn = midi_out
            .connect(&port, "spanloop-out")
            .map_err(|err| anyhow!("failed to connect to MIDI output: {}", err))?;
        Ok(Self { conn, name })
    }
}

impl EventDispatcher for PortDispatcher {
    fn on_event(&mut self, event: &MidiEvent) {
        if let Err(err) = self.conn.send(&event.kind.to_raw()) {
            warn!("sending to {}: {}", self.name, err);
        }
    }

    fn on_idle(&mut self) {
        for channel in 0..16u8 {
            let _ = self.conn.send(&[0xb0 | channel, CC_ALL_SOUND_OFF, 0]);
            let _ = self.conn.send(&[0xb0 | channel, CC_ALL_NOTES_OFF, 0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_on_with_zero_velocity_decodes_as_note_off() {
        assert_eq!(
            decode_message(&[0x93, 60, 0]),
            Some(EventKind::NoteOff {
                channel: 3,
                note: 60,
                velocity: 0
            })
        );
        assert_eq!(
            decode_message(&[0x93, 60, 100]),
            Some(EventKind::NoteOn {
                channel: 3,
                note: 60,
                velocity: 100
            })
        );
    }

    #[test]
    fn system_and_truncated_messages_are_ignored() {
        assert_eq!(decode_message(&[0xf8]), None); // clock
        assert_eq!(decode_message(&[0xfe]), None); // active sensing
        assert_eq!(decode_message(&[0x90, 60]), None);
        assert_eq!(decode_message(&[]), None);
    }

    #[test]
    fn pitch_wheel_reassembles_fourteen_bits() {
        assert_eq!(
            decode_message(&[0xe2, 0x45, 0x23]),
            Some(EventKind::PitchWheel {
                channel: 2,
                value: 0x23 << 7 | 0x45
            })
        );
    }
}
