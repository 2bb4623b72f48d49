// src/midi_file.rs

use anyhow::{bail, Context, Result};
use log::warn;
use std::fs;
use std::path::Path;

use crate::event::{parse_track, serialize_track, MidiEvent, Track};

/// One track read from or written to a standard MIDI file.
pub struct FileTrack {
    pub name: Option<String>,
    pub track: Track,
}

const HEADER_CHUNK: &[u8; 4] = b"MThd";
const TRACK_CHUNK: &[u8; 4] = b"MTrk";
const END_OF_TRACK: [u8; 4] = [0x00, 0xff, 0x2f, 0x00];

/// Reads a format 0 or 1 standard MIDI file, rescaling event times from
/// the file's division to `ppb` ticks per beat. Tempo events are skipped:
/// wall-clock pacing belongs to the time master, not the file.
pub fn read_file(path: &Path, ppb: u32) -> Result<Vec<FileTrack>> {
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_file(&data, ppb)
}

pub fn parse_file(data: &[u8], ppb: u32) -> Result<Vec<FileTrack>> {
    let (kind, header, mut rest) = read_chunk(data)?;
    if kind != *HEADER_CHUNK {
        bail!("not a MIDI file: missing MThd header");
    }
    if header.len() < 6 {
        bail!("truncated MThd header");
    }
    let format = u16::from_be_bytes([header[0], header[1]]);
    let ntracks = u16::from_be_bytes([header[2], header[3]]);
    let division = u16::from_be_bytes([header[4], header[5]]);
    if format > 1 {
        bail!("unsupported MIDI file format {}", format);
    }
    if division & 0x8000 != 0 {
        bail!("SMPTE time division is not supported");
    }
    if division == 0 {
        bail!("zero time division");
    }

    let mut tracks = Vec::with_capacity(ntracks as usize);
    while !rest.is_empty() {
        let (kind, chunk, remaining) = read_chunk(rest)?;
        rest = remaining;
        if kind != *TRACK_CHUNK {
            // Alien chunks are legal; readers skip them.
            warn!("skipping unknown chunk {:?}", String::from_utf8_lossy(&kind));
            continue;
        }
        tracks.push(parse_track_chunk(chunk, division as u32, ppb)?);
    }
    if tracks.len() != ntracks as usize {
        warn!(
            "MIDI file announced {} tracks but contained {}",
            ntracks,
            tracks.len()
        );
    }
    Ok(tracks)
}

/// Writes a format 1 file with `ppb` as the division, so event times land
/// on disk unscaled.
pub fn write_file(path: &Path, tracks: &[FileTrack], ppb: u32) -> Result<()> {
    let mut out = Vec::new();
    out.extend_from_slice(HEADER_CHUNK);
    out.extend_from_slice(&6u32.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
    out.extend_from_slice(&(ppb as u16).to_be_bytes());

    for file_track in tracks {
        let mut body = Vec::new();
        if let Some(name) = &file_track.name {
            encode_track_name(&mut body, name);
        }
        body.extend_from_slice(&serialize_track(&file_track.track));
        body.extend_from_slice(&END_OF_TRACK);

        out.extend_from_slice(TRACK_CHUNK);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
    }

    fs::write(path, out).with_context(|| format!("writing {}", path.display()))
}

fn read_chunk(data: &[u8]) -> Result<([u8; 4], &[u8], &[u8])> {
    if data.len() < 8 {
        bail!("truncated chunk header");
    }
    let kind = [data[0], data[1], data[2], data[3]];
    let len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    if data.len() < 8 + len {
        bail!("chunk body shorter than its declared length");
    }
    Ok((kind, &data[8..8 + len], &data[8 + len..]))
}

fn parse_track_chunk(chunk: &[u8], division: u32, ppb: u32) -> Result<FileTrack> {
    let (name, body) = strip_track_name(chunk);
    let raw = parse_track(body).context("parsing MIDI file track")?;

    // Rescale from file ticks to sequencer ticks.
    let mut track = Track::new();
    for event in &raw {
        track.add(MidiEvent {
            time: (event.time as u64 * ppb as u64 / division as u64) as u32,
            kind: event.kind,
        });
    }
    Ok(FileTrack { name, track })
}

/// Peels off a leading track-name meta event (delta 0, FF 03, length,
/// bytes) if one is present, returning the name and the rest of the body.
fn strip_track_name(chunk: &[u8]) -> (Option<String>, &[u8]) {
    if chunk.len() >= 4 && chunk[0] == 0x00 && chunk[1] == 0xff && chunk[2] == 0x03 {
        // The original files this codebase trades in keep names under 128
        // bytes, so a single-byte length is enough here.
        let len = chunk[3] as usize;
        if chunk[3] & 0x80 == 0 && chunk.len() >= 4 + len {
            let name = String::from_utf8_lossy(&chunk[4..4 + len]).into_owned();
            return (Some(name), &chunk[4 + len..]);
        }
    }
    (None, chunk)
}

fn encode_track_name(out: &mut Vec<u8>, name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(0x7f);
    out.push(0x00);
    out.push(0xff);
    out.push(0x03);
    out.push(len as u8);
    out.extend_from_slice(&bytes[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn note(time: u32, note: u8, velocity: u8) -> MidiEvent {
        MidiEvent {
            time,
            kind: EventKind::NoteOn {
                channel: 0,
                note,
                velocity,
            },
        }
    }

    fn sample_track() -> Track {
        let mut track = Track::new();
        track.add(note(0, 60, 100));
        track.add(MidiEvent {
            time: 96,
            kind: EventKind::NoteOff {
                channel: 0,
                note: 60,
                velocity: 0,
            },
        });
        track.add(note(192, 64, 90));
        track
    }

    #[test]
    fn file_round_trips_tracks_and_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("riff.mid");

        let tracks = vec![
            FileTrack {
                name: Some("lead".into()),
                track: sample_track(),
            },
            FileTrack {
                name: None,
                track: sample_track(),
            },
        ];
        write_file(&path, &tracks, 96).unwrap();

        let read = read_file(&path, 96).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].name.as_deref(), Some("lead"));
        assert_eq!(read[0].track, sample_track());
        assert_eq!(read[1].name, None);
        assert_eq!(read[1].track, sample_track());
    }

    #[test]
    fn times_rescale_from_the_file_division() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("riff.mid");

        let tracks = vec![FileTrack {
            name: None,
            track: sample_track(),
        }];
        // Written at 48 ticks per beat, read back at 96: times double.
        write_file(&path, &tracks, 48).unwrap();
        let read = read_file(&path, 96).unwrap();

        let times: Vec<u32> = read[0].track.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![0, 192, 384]);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_file(b"RIFFnope", 96).is_err());
        assert!(parse_file(b"MThd\x00\x00\x00\x06\x00", 96).is_err());
    }

    #[test]
    fn smpte_division_is_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(b"MThd");
        data.extend_from_slice(&6u32.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0x8050u16.to_be_bytes());
        assert!(parse_file(&data, 96).is_err());
    }
}
