// src/audio_engine.rs

pub mod channel;
pub mod sample_tree;
pub mod section;

use anyhow::{anyhow, bail, Result};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::audio_engine::section::Project;
use crate::control::{Command, ControlSurface, EngineStatus, RecordMode, NO_RECORD};
use crate::project_io;

/// Denominator of the fraction of a second treated as human error when
/// aligning loop boundaries: 4 is a quarter second.
const ERROR_MARGIN: usize = 4;

/// Engine state the control threads may inspect while the engine is
/// paused. The audio callback takes the lock with `try_lock` and falls
/// back to plain pass-through when a save or load holds it.
pub struct EngineState {
    pub project: Project,

    /// Interleaved samples per tree buffer, `nframes * 2`. Pinned by the
    /// first callback; 0 until then.
    pub samples_per_buffer: usize,

    /// Queried device rate, used by the quantization math.
    pub frames_per_second: usize,
}

/// The realtime loop engine. Owned by the audio output callback; control
/// threads reach it only through the `ControlSurface` atomics and the
/// shared `EngineState` mutex.
pub struct LoopEngine {
    surface: ControlSurface,
    status: EngineStatus,
    state: Arc<Mutex<EngineState>>,

    /// Current position in the section span, in frames.
    pos: usize,

    /// True while we are processing buffers in record state; tracks the
    /// transition out of recording so loop-close runs exactly once.
    recording: bool,
    last_record_channel: usize,

    /// A requested section change, deferred until the section loops or
    /// recording begins.
    latched: Option<Command>,
}

impl LoopEngine {
    pub fn new(surface: ControlSurface, sample_rate: u32) -> (LoopEngine, EngineHandle) {
        let state = Arc::new(Mutex::new(EngineState {
            project: Project::new(),
            samples_per_buffer: 0,
            frames_per_second: sample_rate as usize,
        }));
        let status = EngineStatus::new();
        let handle = EngineHandle {
            surface: surface.clone(),
            status: status.clone(),
            state: state.clone(),
        };
        let engine = LoopEngine {
            surface,
            status,
            state,
            pos: 0,
            recording: false,
            last_record_channel: 0,
            latched: None,
        };
        (engine, handle)
    }

    /// One audio period. Every output sample is written exactly once:
    /// pass-through (or the recorded copy of the input) first, then the
    /// playback mix of all enabled channels is added on top.
    pub fn process(&mut self, in_l: &[f32], in_r: &[f32], out_l: &mut [f32], out_r: &mut [f32]) {
        let nframes = in_l.len();
        debug_assert!(in_r.len() == nframes && out_l.len() == nframes && out_r.len() == nframes);

        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(_) => {
                // A control thread is re-homing the project (save/load
                // while paused). Keep the monitor path alive.
                out_l.copy_from_slice(in_l);
                out_r.copy_from_slice(in_r);
                return;
            }
        };

        if state.samples_per_buffer == 0 {
            state.samples_per_buffer = nframes * 2;
        } else if state.samples_per_buffer != nframes * 2 {
            panic!(
                "audio period changed from {} to {} frames",
                state.samples_per_buffer / 2,
                nframes
            );
        }

        match self.surface.take_command() {
            Some(None) => {}
            Some(Some(Command::Clear)) => {
                state.project = Project::new();
                self.pos = 0;
                self.latched = None;
                self.surface.set_playing(true);
            }
            Some(Some(cmd @ Command::NewSection))
            | Some(Some(cmd @ Command::NextSection))
            | Some(Some(cmd @ Command::PrevSection)) => {
                self.latched = Some(cmd);
            }
            Some(Some(Command::SetChannelSticky(ch))) => {
                if let Some(channel) = state.project.current_mut().channels.get_mut(ch) {
                    channel.sticky = true;
                }
            }
            Some(Some(Command::ClearChannelSticky(ch))) => {
                if let Some(channel) = state.project.current_mut().channels.get_mut(ch) {
                    channel.sticky = false;
                }
            }
            Some(Some(Command::EnableChannel(ch))) => {
                if let Some(channel) = state.project.current_mut().channels.get_mut(ch) {
                    channel.enabled = true;
                }
            }
            Some(Some(Command::DisableChannel(ch))) => {
                if let Some(channel) = state.project.current_mut().channels.get_mut(ch) {
                    channel.enabled = false;
                }
            }
            None => panic!("unknown command word in the control slot"),
        }

        let record_channel = self.surface.record_channel();
        let playing = self.surface.is_playing();
        let record_mode = self.surface.record_mode();

        if record_channel != NO_RECORD {
            let channel_index = record_channel as usize;

            // Retargeted mid-record: close the old loop, then treat this
            // as a fresh record start.
            if self.recording && channel_index != self.last_record_channel {
                Self::close_loop(&mut self.pos, self.last_record_channel, &mut state, record_mode);
                self.recording = false;
            }

            let mut started = false;
            if !self.recording {
                if self.latched.is_some() {
                    Self::change_sections(&mut self.latched, &mut state);
                }
                if state.project.current().end == 0 {
                    self.pos = 0;
                }
                self.recording = true;
                self.last_record_channel = channel_index;
                started = true;
            }

            let spb = state.samples_per_buffer;
            let pos = self.pos;
            let section = state.project.current_mut();
            section.ensure_channel(channel_index);
            let channel = &mut section.channels[channel_index];
            if started {
                channel.start_pos = pos;
            }

            let buf = channel.write_buffer(pos, spb);
            for (i, frame) in buf.chunks_exact_mut(2).enumerate().take(nframes) {
                frame[0] = in_l[i];
                frame[1] = in_r[i];
                out_l[i] = in_l[i];
                out_r[i] = in_r[i];
            }
        } else {
            out_l.copy_from_slice(in_l);
            out_r.copy_from_slice(in_r);

            if self.recording {
                self.recording = false;
                Self::close_loop(&mut self.pos, self.last_record_channel, &mut state, record_mode);
            }
        }

        if playing {
            let section = state.project.current();
            for (index, channel) in section.channels.iter().enumerate() {
                if !channel.enabled || !channel.has_audio() || record_channel == index as i32 {
                    continue;
                }
                if let Some(buf) = channel.read_buffer(self.pos) {
                    for (i, frame) in buf.chunks_exact(2).enumerate().take(nframes) {
                        out_l[i] += frame[0];
                        out_r[i] += frame[1];
                    }
                }
            }
        }

        let section_end = state.project.current().end;
        if playing || record_channel != NO_RECORD {
            if record_channel == NO_RECORD || record_mode == RecordMode::Wrap {
                let old_pos = self.pos;
                self.pos = if section_end != 0 {
                    (old_pos + nframes) % section_end
                } else {
                    old_pos + nframes
                };

                // A latched section change applies at the span boundary.
                if self.latched.is_some() && old_pos + nframes >= section_end {
                    Self::change_sections(&mut self.latched, &mut state);
                }
            } else {
                // Recording in one of the growing modes: no wrap.
                self.pos += nframes;
            }
        }

        self.status.publish(
            self.pos,
            state.project.current().end,
            state.project.section_index,
            state.project.sections.len(),
        );
    }

    /// Finalizes the geometry of the channel whose recording just ended,
    /// quantizing the section span according to the record mode.
    fn close_loop(
        pos: &mut usize,
        last_record_channel: usize,
        state: &mut EngineState,
        mode: RecordMode,
    ) {
        let fps = state.frames_per_second;
        let margin = fps / ERROR_MARGIN;
        let pos_val = *pos;

        let section = state.project.current_mut();
        let end = section.end;
        let Some(channel) = section.channels.get_mut(last_record_channel) else {
            return;
        };
        let mut new_end = end;

        if mode == RecordMode::Expand && end != 0 {
            // A record begun very shortly before the end of the span is
            // taken to mean "line up with the start of the next span".
            channel.offset = if end.saturating_sub(channel.start_pos) < fps / 10 {
                end
            } else {
                0
            };

            // Overrunning the span by more than the error margin grows the
            // span to the nearest multiple that covers the recording.
            if pos_val.saturating_sub(channel.offset) > end + margin {
                let local_pos = pos_val - channel.offset;
                let mut multiple = local_pos / end;
                if local_pos - end * multiple > margin {
                    multiple += 1;
                }
                new_end = end * multiple;
            }
        } else if mode == RecordMode::SpanRelative && end != 0 {
            // Length relative to where the record started, trimmed of
            // anything that looks like human error.
            let mut rel = pos_val.saturating_sub(channel.start_pos);
            if rel % end < margin {
                rel = (rel / end) * end;
                // The pathological case: the whole riff fits inside the
                // margin. Stretch it to one span.
                if rel == 0 {
                    rel = end;
                }
            }

            if rel > end {
                // Quantize the span up to cover the recording.
                new_end = (rel / end + usize::from(rel % end != 0)) * end;
                channel.loop_pos = channel.start_pos;
            } else if channel.start_pos < end && pos_val < end {
                // Entirely inside the span: behaves like wrap mode.
                channel.loop_pos = 0;
            } else {
                // Straddles the span end: loop from the start position.
                channel.loop_pos = channel.start_pos;
            }
        }

        // The first loop of a section establishes the span.
        if new_end == 0 {
            new_end = pos_val;
            *pos = 0;
        }
        if channel.end == 0 {
            channel.end = new_end;
        }
        section.end = new_end;
    }

    fn change_sections(latched: &mut Option<Command>, state: &mut EngineState) {
        match latched.take() {
            Some(Command::NewSection) => state.project.new_section(),
            Some(Command::NextSection) => state.project.next_section(),
            Some(Command::PrevSection) => state.project.prev_section(),
            _ => {}
        }
    }
}

/// Control-thread face of the engine: publishes state through the control
/// surface and re-homes the project for save/load while the engine is
/// paused.
#[derive(Clone)]
pub struct EngineHandle {
    surface: ControlSurface,
    status: EngineStatus,
    state: Arc<Mutex<EngineState>>,
}

impl EngineHandle {
    pub fn surface(&self) -> &ControlSurface {
        &self.surface
    }

    pub fn status(&self) -> &EngineStatus {
        &self.status
    }

    /// Starts recording on `channel`, or stops the active record if one is
    /// running. The terminal and pedal both speak in this toggle.
    pub fn toggle_record(&self, channel: usize) -> Option<usize> {
        let current = self.surface.record_channel();
        if current == NO_RECORD {
            self.surface.start_record(channel);
            Some(channel)
        } else {
            self.surface.end_record();
            None
        }
    }

    pub fn start_record(&self, channel: usize) {
        self.surface.start_record(channel);
    }

    pub fn end_record(&self) {
        self.surface.end_record();
    }

    pub fn start_play(&self) {
        self.surface.set_playing(true);
    }

    pub fn end_play(&self) {
        self.surface.set_playing(false);
    }

    pub fn toggle_play(&self) -> bool {
        let playing = !self.surface.is_playing();
        self.surface.set_playing(playing);
        playing
    }

    pub fn is_playing(&self) -> bool {
        self.surface.is_playing()
    }

    pub fn clear(&self) {
        self.surface.send(Command::Clear);
    }

    pub fn new_section(&self) {
        self.surface.send(Command::NewSection);
    }

    pub fn next_section(&self) {
        self.surface.send(Command::NextSection);
    }

    pub fn prev_section(&self) {
        self.surface.send(Command::PrevSection);
    }

    pub fn set_sticky(&self, channel: usize, sticky: bool) {
        self.surface.send(if sticky {
            Command::SetChannelSticky(channel)
        } else {
            Command::ClearChannelSticky(channel)
        });
    }

    pub fn set_enabled(&self, channel: usize, enabled: bool) {
        self.surface.send(if enabled {
            Command::EnableChannel(channel)
        } else {
            Command::DisableChannel(channel)
        });
    }

    pub fn set_record_mode(&self, mode: RecordMode) {
        self.surface.set_record_mode(mode);
    }

    pub fn record_mode(&self) -> RecordMode {
        self.surface.record_mode()
    }

    fn checked_state(&self) -> Result<MutexGuard<'_, EngineState>> {
        if self.surface.is_playing() || self.surface.is_recording() {
            bail!("can't save or load while playing or recording (hit pause)");
        }
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("engine state poisoned"))?;
        if state.samples_per_buffer == 0 {
            bail!("no audio period established yet");
        }
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.checked_state()?;
        project_io::save_project(path, &state.project, state.samples_per_buffer)
    }

    pub fn load(&self, path: &Path) -> Result<()> {
        let mut state = self.checked_state()?;
        let spb = state.samples_per_buffer;
        state.project = project_io::load_project(path, spb)?;
        Ok(())
    }

    /// Writes one wav stem per recorded channel of the current section.
    pub fn export_stems(&self, dir: &Path) -> Result<usize> {
        let state = self.checked_state()?;
        let fps = state.frames_per_second;
        let spb = state.samples_per_buffer;
        project_io::export_stems(dir, state.project.current(), spb, fps as u32)
    }
}
