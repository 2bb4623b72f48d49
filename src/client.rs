// src/client.rs

use anyhow::{anyhow, bail, Context, Result};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use crate::event::serialize_track;
use crate::midi_file;
use crate::rpc::{LoopStateChange, Op, RecordModeArg, Response, Rpc};
use crate::sequencer::SeqState;

const USAGE: &str = "\
usage: spanloop client [--addr HOST:PORT] COMMAND [ARGS]

commands:
  echo TEXT                      round-trip a message through the daemon
  play | idle                    loop engine transport
  record CHANNEL                 start recording on a loop channel
  record-mode wrap|expand|span   how a closing loop aligns with the span
  clear                          drop all sections
  next | prev | new-section      section changes (latched)
  sticky CHANNEL on|off          carry a channel into new sections
  enable CHANNEL on|off          include a channel in the playback mix
  save PATH | load PATH          audio project persistence
  export DIR                     write wav stems of the current section
  seq idle|play|record|latched   sequencer state
  set-ticks N                    reposition the sequencer clock
  input-channel N|off            rewrite incoming events to channel N
  add-track FILE.mid [DISPATCHER]  queue every track of a MIDI file
  init-state DISPATCHER FILE.mid   replay a setup track into a dispatcher
  seq-save PATH | seq-load PATH  sequencer persistence
  shutdown                       stop the daemon";

/// One-shot RPC client: builds a batch from the command line, sends it in
/// a single frame, and waits for the daemon's response.
pub fn run(args: &[String], default_port: u16, ppb: u32) -> Result<()> {
    let mut addr = format!("127.0.0.1:{}", default_port);
    let mut rest: &[String] = args;
    if rest.first().map(String::as_str) == Some("--addr") {
        addr = rest
            .get(1)
            .ok_or_else(|| anyhow!("--addr needs HOST:PORT\n{}", USAGE))?
            .clone();
        rest = &rest[2..];
    }
    let ops = build_ops(rest, ppb)?;

    let mut stream =
        TcpStream::connect(&addr).with_context(|| format!("connecting to {}", addr))?;
    let payload = bincode::serialize(&Rpc {
        msg_id: Some(1),
        ops,
    })?;
    stream.write_all(&(payload.len() as u32).to_le_bytes())?;
    stream.write_all(&payload)?;

    let mut size_buf = [0u8; 4];
    stream.read_exact(&mut size_buf)?;
    let mut response = vec![0u8; u32::from_le_bytes(size_buf) as usize];
    stream.read_exact(&mut response)?;
    let response: Response = bincode::deserialize(&response)?;

    match response.error {
        Some(error) => bail!("daemon reported: {}", error),
        None => {
            println!("ok");
            Ok(())
        }
    }
}

fn build_ops(args: &[String], ppb: u32) -> Result<Vec<Op>> {
    let Some(command) = args.first() else {
        bail!("{}", USAGE);
    };
    let arg = |index: usize| -> Result<&String> {
        args.get(index)
            .ok_or_else(|| anyhow!("missing argument for '{}'\n{}", command, USAGE))
    };

    let ops = match command.as_str() {
        "echo" => vec![Op::Echo(arg(1)?.clone())],
        "play" => vec![Op::ChangeLoopState {
            state: LoopStateChange::Play,
            channel: 0,
        }],
        "idle" => vec![Op::ChangeLoopState {
            state: LoopStateChange::Idle,
            channel: 0,
        }],
        "record" => vec![Op::ChangeLoopState {
            state: LoopStateChange::Record,
            channel: arg(1)?.parse().context("channel must be a number")?,
        }],
        "record-mode" => {
            let mode = match arg(1)?.as_str() {
                "wrap" => RecordModeArg::Wrap,
                "expand" => RecordModeArg::Expand,
                "span" | "span-relative" => RecordModeArg::SpanRelative,
                other => bail!("unknown record mode '{}'", other),
            };
            vec![Op::SetRecordMode(mode)]
        }
        "clear" => vec![Op::ClearState],
        "next" => vec![Op::ChangeSection(1)],
        "prev" => vec![Op::ChangeSection(-1)],
        "new-section" => vec![Op::NewSection],
        "sticky" => vec![Op::ChangeChannelAttrs {
            channel: arg(1)?.parse().context("channel must be a number")?,
            sticky: Some(parse_switch(arg(2)?)?),
            enabled: None,
        }],
        "enable" => vec![Op::ChangeChannelAttrs {
            channel: arg(1)?.parse().context("channel must be a number")?,
            sticky: None,
            enabled: Some(parse_switch(arg(2)?)?),
        }],
        "save" => vec![Op::SaveState(PathBuf::from(arg(1)?))],
        "load" => vec![Op::LoadState(PathBuf::from(arg(1)?))],
        "export" => vec![Op::ExportAudio(PathBuf::from(arg(1)?))],
        "seq" => {
            let state = match arg(1)?.as_str() {
                "idle" => SeqState::Idle,
                "play" => SeqState::Play,
                "record" => SeqState::Record,
                "latched" => SeqState::LatchedRecord,
                other => bail!("unknown sequencer state '{}'", other),
            };
            vec![Op::ChangeSequencerState(state)]
        }
        "set-ticks" => vec![Op::SetTicks(arg(1)?.parse().context("ticks must be a number")?)],
        "input-channel" => {
            let output_channel = match arg(1)?.as_str() {
                "off" => None,
                n => Some(n.parse().context("channel must be a number or 'off'")?),
            };
            vec![Op::SetInputParams { output_channel }]
        }
        "add-track" => {
            let dispatcher = args.get(2).cloned();
            midi_tracks_as_ops(Path::new(arg(1)?), ppb)?
                .into_iter()
                .map(|events| Op::AddTrack {
                    events,
                    dispatcher: dispatcher.clone(),
                })
                .collect()
        }
        "init-state" => {
            let tracks = midi_tracks_as_ops(Path::new(arg(2)?), ppb)?;
            let events = tracks
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("MIDI file has no tracks"))?;
            vec![Op::SetInitialState {
                dispatcher: arg(1)?.clone(),
                events,
            }]
        }
        "seq-save" => vec![Op::SaveSequencerState(PathBuf::from(arg(1)?))],
        "seq-load" => vec![Op::LoadSequencerState(PathBuf::from(arg(1)?))],
        "shutdown" => vec![Op::Shutdown],
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    };
    Ok(ops)
}

fn parse_switch(value: &str) -> Result<bool> {
    match value {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => bail!("expected on/off, got '{}'", other),
    }
}

fn midi_tracks_as_ops(path: &Path, ppb: u32) -> Result<Vec<Vec<u8>>> {
    Ok(midi_file::read_file(path, ppb)?
        .iter()
        .filter(|file_track| !file_track.track.is_empty())
        .map(|file_track| serialize_track(&file_track.track))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn record_command_builds_a_loop_state_op() {
        let ops = build_ops(&strings(&["record", "3"]), 96).unwrap();
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            Op::ChangeLoopState { state, channel } => {
                assert_eq!(*state, LoopStateChange::Record);
                assert_eq!(*channel, 3);
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn switch_arguments_are_strict() {
        assert!(build_ops(&strings(&["sticky", "2", "on"]), 96).is_ok());
        assert!(build_ops(&strings(&["sticky", "2", "sideways"]), 96).is_err());
        assert!(build_ops(&strings(&["sticky", "2"]), 96).is_err());
    }

    #[test]
    fn unknown_commands_mention_usage() {
        let err = build_ops(&strings(&["frobnicate"]), 96).unwrap_err();
        assert!(err.to_string().contains("usage:"));
    }
}
