// src/sequencer.rs

use anyhow::{bail, Context, Result};
use crossbeam_channel::{after, never, select, Receiver};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::event::{parse_track, serialize_track, EventKind, MidiEvent, Track};

const MILLION: u64 = 1_000_000;

/// Wall-clock to musical-time conversion. Ticks only advance when enough
/// wall time has passed to produce at least one, so sub-tick slivers
/// accumulate instead of being dropped.
pub struct TimeMaster {
    last_abs: Instant,
    last_ticks: u32,
    bpm: u32,
    /// Pulses per beat. Fixed for the project run.
    ppb: u32,
}

impl TimeMaster {
    pub fn new(bpm: u32, ppb: u32) -> Self {
        Self {
            last_abs: Instant::now(),
            last_ticks: 0,
            bpm,
            ppb,
        }
    }

    pub fn ticks(&mut self) -> u32 {
        self.ticks_at(Instant::now())
    }

    fn ticks_at(&mut self, now: Instant) -> u32 {
        let delta_us = now.saturating_duration_since(self.last_abs).as_micros() as u64;
        let ticks_delta = delta_us * self.bpm as u64 * self.ppb as u64 / (60 * MILLION);
        if ticks_delta > 0 {
            self.last_abs = now;
            self.last_ticks = self.last_ticks.wrapping_add(ticks_delta as u32);
        }
        self.last_ticks
    }

    /// Wall-clock duration of `ticks` ticks at the current tempo.
    pub fn ticks_as_delta(&self, ticks: u32) -> Duration {
        Duration::from_micros(ticks as u64 * 60 * MILLION / (self.bpm as u64 * self.ppb as u64))
    }

    pub fn set_ticks(&mut self, ticks: u32) {
        self.last_ticks = ticks;
        self.last_abs = Instant::now();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeqState {
    Idle,
    Play,
    Record,
    LatchedRecord,
}

/// The capability an event sink offers the sequencer. Implementations are
/// the debug sink, the midir port sinks, and test collectors.
pub trait EventDispatcher: Send {
    fn on_event(&mut self, event: &MidiEvent);

    /// The sequencer went idle; silence anything still sounding.
    fn on_idle(&mut self) {}

    fn send_events(&mut self, track: &Track) {
        for event in track {
            self.on_event(event);
        }
    }
}

/// Sink of last resort: logs what it is handed.
pub struct DebugDispatcher;

impl EventDispatcher for DebugDispatcher {
    fn on_event(&mut self, event: &MidiEvent) {
        info!("Got event {}", event);
    }

    fn on_idle(&mut self) {
        info!("Set to idle");
    }
}

struct DispatcherEntry {
    dispatcher: Box<dyn EventDispatcher>,
    /// MIDI byte string replayed into the dispatcher when a project is
    /// restored (program selects, controller setup).
    initial_state: Vec<u8>,
}

/// Stamps incoming events with the current tick, records them while a
/// record buffer is armed, and names the consumer they forward to.
pub struct InputDispatcher {
    record_track: Option<Track>,
    consumer: Option<String>,
    output_channel: Option<u8>,
}

impl InputDispatcher {
    pub fn new(consumer: Option<String>) -> Self {
        Self {
            record_track: None,
            consumer,
            output_channel: None,
        }
    }

    fn begin_recording(&mut self) {
        self.record_track = Some(Track::new());
    }

    fn release_track(&mut self) -> Option<Track> {
        self.record_track.take()
    }
}

struct TrackInfo {
    track: Track,
    dispatcher: Option<String>,
    /// Index of the next event to play.
    next: usize,
}

#[derive(Serialize, Deserialize)]
struct TrackFile {
    events: Vec<u8>,
    dispatcher: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct DispatcherFile {
    name: String,
    initial_state: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SequencerFile {
    tracks: Vec<TrackFile>,
    dispatchers: Vec<DispatcherFile>,
}

/// The MIDI side of the daemon: plays tracks of timestamped events
/// through their bound dispatchers, records input onto per-input tracks,
/// and drives the idle/play/record state machine. Lives entirely on the
/// reactor thread.
pub struct SequencerController {
    state: SeqState,
    tracks: Vec<TrackInfo>,
    inputs: Vec<InputDispatcher>,
    dispatchers: BTreeMap<String, DispatcherEntry>,
    time_master: TimeMaster,
}

impl SequencerController {
    pub fn new(time_master: TimeMaster) -> Self {
        Self {
            state: SeqState::Idle,
            tracks: Vec::new(),
            inputs: Vec::new(),
            dispatchers: BTreeMap::new(),
            time_master,
        }
    }

    pub fn state(&self) -> SeqState {
        self.state
    }

    pub fn set_dispatcher(&mut self, name: &str, dispatcher: Box<dyn EventDispatcher>) {
        self.dispatchers.insert(
            name.to_string(),
            DispatcherEntry {
                dispatcher,
                initial_state: Vec::new(),
            },
        );
    }

    pub fn add_input(&mut self, input: InputDispatcher) {
        self.inputs.push(input);
    }

    pub fn set_state(&mut self, new: SeqState) {
        if self.state == SeqState::Record {
            self.store_input_tracks();
        }

        match new {
            SeqState::Idle => {
                for entry in self.dispatchers.values_mut() {
                    entry.dispatcher.on_idle();
                }
                self.state = SeqState::Idle;
            }
            SeqState::Record => {
                self.begin_recording();
                self.state = new;
                self.run_once();
            }
            SeqState::Play | SeqState::LatchedRecord => {
                self.state = new;
                self.run_once();
            }
        }
    }

    /// Moves each input's recording buffer onto the playable track list,
    /// bound to that input's consumer.
    fn store_input_tracks(&mut self) {
        for i in 0..self.inputs.len() {
            let consumer = self.inputs[i].consumer.clone();
            if let Some(track) = self.inputs[i].release_track() {
                if !track.is_empty() {
                    self.tracks.push(TrackInfo {
                        track,
                        dispatcher: consumer,
                        next: 0,
                    });
                }
            }
        }
    }

    fn begin_recording(&mut self) {
        for input in &mut self.inputs {
            input.begin_recording();
        }
    }

    /// Parses a serialized MIDI track and appends it, bound to the named
    /// dispatcher, or to the first input's consumer when unnamed.
    pub fn add_track(&mut self, events: &[u8], dispatcher: Option<String>) -> Result<()> {
        let track = parse_track(events).context("parsing track events")?;
        let dispatcher =
            dispatcher.or_else(|| self.inputs.first().and_then(|i| i.consumer.clone()));
        self.tracks.push(TrackInfo {
            track,
            dispatcher,
            next: 0,
        });
        Ok(())
    }

    pub fn set_ticks(&mut self, ticks: u32) {
        self.time_master.set_ticks(ticks);
        for info in &mut self.tracks {
            info.next = info.track.seek(ticks);
        }
    }

    pub fn set_input_output_channel(&mut self, channel: Option<u8>) {
        for input in &mut self.inputs {
            input.output_channel = channel;
        }
    }

    /// Replays `events` into the named dispatcher and remembers them as
    /// its initial state for project saves.
    pub fn set_initial_state(&mut self, name: &str, events: Vec<u8>) -> Result<()> {
        let track = parse_track(&events).context("parsing initial state")?;
        let Some(entry) = self.dispatchers.get_mut(name) else {
            bail!("invalid dispatcher: {}", name);
        };
        entry.initial_state = events;
        entry.dispatcher.send_events(&track);
        Ok(())
    }

    /// An event arrived from the input port: stamp it with the current
    /// tick, apply the channel override, record it if a record buffer is
    /// armed, and forward it to the input's consumer.
    pub fn handle_input(&mut self, input_index: usize, mut kind: EventKind) {
        let time = self.time_master.ticks();
        let Some(input) = self.inputs.get_mut(input_index) else {
            warn!("event from unknown input {}", input_index);
            return;
        };
        if let Some(channel) = input.output_channel {
            kind.set_channel(channel);
        }
        let event = MidiEvent { time, kind };
        if let Some(track) = &mut input.record_track {
            track.add(event);
        }
        let consumer = input.consumer.clone();
        self.dispatch(consumer.as_deref(), &event);
    }

    fn dispatch(&mut self, name: Option<&str>, event: &MidiEvent) {
        match name.and_then(|n| self.dispatchers.get_mut(n)) {
            Some(entry) => entry.dispatcher.on_event(event),
            None => debug!("no dispatcher bound for event {}", event),
        }
    }

    /// One scheduling pass: dispatch everything due, then report how long
    /// until the next event. `None` means nothing is scheduled; a play
    /// state with nothing left falls back to idle.
    pub fn run_once(&mut self) -> Option<Duration> {
        if self.state == SeqState::Idle {
            return None;
        }

        let now = self.time_master.ticks();
        let mut next_time: Option<u32> = None;

        for i in 0..self.tracks.len() {
            loop {
                let Some(event) = self.tracks[i].track.get(self.tracks[i].next).copied() else {
                    break;
                };
                if event.time > now {
                    next_time = Some(match next_time {
                        Some(t) => t.min(event.time),
                        None => event.time,
                    });
                    break;
                }
                debug!("playing event {}", event);
                self.tracks[i].next += 1;
                let name = self.tracks[i].dispatcher.clone();
                self.dispatch(name.as_deref(), &event);
            }
        }

        match next_time {
            Some(t) => Some(self.time_master.ticks_as_delta(t - now)),
            None => {
                if self.state == SeqState::Play {
                    self.state = SeqState::Idle;
                }
                None
            }
        }
    }

    pub fn save_state(&self, path: &Path) -> Result<()> {
        let file = SequencerFile {
            tracks: self
                .tracks
                .iter()
                .map(|info| TrackFile {
                    events: serialize_track(&info.track),
                    dispatcher: info.dispatcher.clone(),
                })
                .collect(),
            dispatchers: self
                .dispatchers
                .iter()
                .filter(|(_, entry)| !entry.initial_state.is_empty())
                .map(|(name, entry)| DispatcherFile {
                    name: name.clone(),
                    initial_state: entry.initial_state.clone(),
                })
                .collect(),
        };
        let out = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        bincode::serialize_into(BufWriter::new(out), &file)?;
        info!("saved sequencer state to {}", path.display());
        Ok(())
    }

    pub fn load_state(&mut self, path: &Path) -> Result<()> {
        let input = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let file: SequencerFile = bincode::deserialize_from(BufReader::new(input))?;

        for track in &file.tracks {
            self.add_track(&track.events, track.dispatcher.clone())?;
        }
        for dispatcher in file.dispatchers {
            if let Err(err) = self.set_initial_state(&dispatcher.name, dispatcher.initial_state) {
                warn!("restoring dispatcher state: {}", err);
            }
        }
        info!("loaded sequencer state from {}", path.display());
        Ok(())
    }
}

/// Operations other threads hand to the reactor.
pub enum ReactorOp {
    SetTicks(u32),
    SetState(SeqState),
    SetInitialState { dispatcher: String, events: Vec<u8> },
    SetInputParams { output_channel: Option<u8> },
    AddTrack { events: Vec<u8>, dispatcher: Option<String> },
    SaveState(PathBuf),
    LoadState(PathBuf),
    /// Acknowledged once everything queued before it has run.
    Sync(crossbeam_channel::Sender<()>),
    Quit,
}

/// The reactor loop: a single thread multiplexing control operations,
/// MIDI input, and the sequencer timer. Owns all MIDI state.
pub fn run_reactor(
    mut controller: SequencerController,
    ops: Receiver<ReactorOp>,
    midi_in: Receiver<EventKind>,
) {
    let mut midi_in = midi_in;
    let mut next_delay: Option<Duration> = None;

    loop {
        let timer = match next_delay {
            Some(delay) => after(delay),
            None => never(),
        };

        let mut midi_gone = false;
        select! {
            recv(ops) -> op => match op {
                Ok(ReactorOp::Quit) | Err(_) => break,
                Ok(op) => handle_op(&mut controller, op),
            },
            recv(midi_in) -> event => match event {
                Ok(kind) => controller.handle_input(0, kind),
                Err(_) => midi_gone = true,
            },
            recv(timer) -> _ => {}
        }
        if midi_gone {
            // The input connection went away; stop polling it.
            midi_in = never();
        }

        next_delay = controller.run_once();
    }
    info!("reactor stopped");
}

fn handle_op(controller: &mut SequencerController, op: ReactorOp) {
    match op {
        ReactorOp::SetTicks(ticks) => controller.set_ticks(ticks),
        ReactorOp::SetState(state) => controller.set_state(state),
        ReactorOp::SetInitialState { dispatcher, events } => {
            if let Err(err) = controller.set_initial_state(&dispatcher, events) {
                warn!("set_initial_state: {}", err);
            }
        }
        ReactorOp::SetInputParams { output_channel } => {
            controller.set_input_output_channel(output_channel);
        }
        ReactorOp::AddTrack { events, dispatcher } => {
            if let Err(err) = controller.add_track(&events, dispatcher) {
                warn!("add_track: {}", err);
            }
        }
        ReactorOp::SaveState(path) => {
            if let Err(err) = controller.save_state(&path) {
                warn!("save_state: {}", err);
            }
        }
        ReactorOp::LoadState(path) => {
            if let Err(err) = controller.load_state(&path) {
                warn!("load_state: {}", err);
            }
        }
        ReactorOp::Sync(ack) => {
            let _ = ack.send(());
        }
        ReactorOp::Quit => unreachable!("handled by the loop"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[derive(Clone, Default)]
    struct Collector {
        events: Arc<Mutex<Vec<MidiEvent>>>,
        idled: Arc<Mutex<bool>>,
    }

    impl EventDispatcher for Collector {
        fn on_event(&mut self, event: &MidiEvent) {
            self.events.lock().unwrap().push(*event);
        }

        fn on_idle(&mut self) {
            *self.idled.lock().unwrap() = true;
        }
    }

    fn note(time: u32, note: u8) -> MidiEvent {
        MidiEvent {
            time,
            kind: EventKind::NoteOn {
                channel: 0,
                note,
                velocity: 100,
            },
        }
    }

    #[test]
    fn tick_math_is_inverse_of_delta_math() {
        // 120 bpm at 96 ppb: one tick is 60e6 / (120 * 96) ~ 5208 us.
        let mut tm = TimeMaster::new(120, 96);
        let start = Instant::now();
        tm.last_abs = start;
        tm.last_ticks = 100;

        let delta = tm.ticks_as_delta(50);
        let ticks = tm.ticks_at(start + delta);
        assert!((149..=151).contains(&ticks), "got {}", ticks);
    }

    #[test]
    fn sub_tick_slivers_accumulate() {
        // 125 bpm at 96 ppb: one tick is exactly 5000 us.
        let mut tm = TimeMaster::new(125, 96);
        let start = Instant::now();
        tm.last_abs = start;

        // Half a tick of wall time does not advance the counter, and does
        // not consume the elapsed time either.
        let half = tm.ticks_as_delta(1) / 2;
        assert_eq!(tm.ticks_at(start + half), 0);
        assert_eq!(tm.last_abs, start);
        // The second half completes the tick.
        assert_eq!(tm.ticks_at(start + half * 2), 1);
    }

    #[test]
    fn set_ticks_rewinds_every_track() {
        let collector = Collector::default();
        let mut controller = SequencerController::new(TimeMaster::new(120, 96));
        controller.set_dispatcher("debug", Box::new(collector));

        let mut track = Track::new();
        track.add(note(0, 60));
        track.add(note(10, 62));
        track.add(note(20, 64));
        controller.tracks.push(TrackInfo {
            track,
            dispatcher: Some("debug".into()),
            next: 3,
        });

        controller.set_ticks(10);
        assert_eq!(controller.tracks[0].next, 2);
        controller.set_ticks(0);
        assert_eq!(controller.tracks[0].next, 1);
    }

    #[test]
    fn play_dispatches_in_order_then_goes_idle() {
        let collector = Collector::default();
        let events = collector.events.clone();

        let mut controller = SequencerController::new(TimeMaster::new(240, 96));
        controller.set_dispatcher("sink", Box::new(collector));

        let mut track = Track::new();
        for (t, n) in [(0, 60), (2, 62), (4, 64)] {
            track.add(note(t, n));
        }
        let bytes = serialize_track(&track);
        controller.add_track(&bytes, Some("sink".into())).unwrap();

        controller.set_ticks(0);
        controller.set_state(SeqState::Play);

        // Drive the scheduler the way the reactor would.
        while let Some(delay) = controller.run_once() {
            thread::sleep(delay);
        }

        assert_eq!(controller.state(), SeqState::Idle);
        let played = events.lock().unwrap();
        assert_eq!(played.len(), 3);
        assert!(played.windows(2).all(|w| w[0].time <= w[1].time));
    }

    #[test]
    fn leaving_record_moves_input_tracks_into_play() {
        let collector = Collector::default();
        let events = collector.events.clone();
        let idled = collector.idled.clone();

        let mut controller = SequencerController::new(TimeMaster::new(120, 96));
        controller.set_dispatcher("synth", Box::new(collector));
        controller.add_input(InputDispatcher::new(Some("synth".into())));

        controller.set_state(SeqState::Record);
        controller.handle_input(
            0,
            EventKind::NoteOn {
                channel: 0,
                note: 60,
                velocity: 90,
            },
        );
        controller.handle_input(
            0,
            EventKind::NoteOff {
                channel: 0,
                note: 60,
                velocity: 0,
            },
        );
        // Input events are forwarded to the consumer as they arrive.
        assert_eq!(events.lock().unwrap().len(), 2);

        controller.set_state(SeqState::Idle);
        assert!(*idled.lock().unwrap());
        assert_eq!(controller.tracks.len(), 1);
        assert_eq!(controller.tracks[0].track.len(), 2);
        assert_eq!(controller.tracks[0].dispatcher.as_deref(), Some("synth"));
    }

    #[test]
    fn input_channel_override_rewrites_events() {
        let collector = Collector::default();
        let events = collector.events.clone();

        let mut controller = SequencerController::new(TimeMaster::new(120, 96));
        controller.set_dispatcher("synth", Box::new(collector));
        controller.add_input(InputDispatcher::new(Some("synth".into())));
        controller.set_input_output_channel(Some(9));

        controller.handle_input(
            0,
            EventKind::NoteOn {
                channel: 2,
                note: 36,
                velocity: 120,
            },
        );
        assert_eq!(events.lock().unwrap()[0].kind.channel(), 9);
    }

    #[test]
    fn sequencer_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq.sloop");

        let mut controller = SequencerController::new(TimeMaster::new(120, 96));
        controller.set_dispatcher("synth", Box::new(DebugDispatcher));
        let mut track = Track::new();
        track.add(note(0, 60));
        track.add(note(12, 64));
        controller
            .add_track(&serialize_track(&track), Some("synth".into()))
            .unwrap();
        controller
            .set_initial_state("synth", vec![0x00, 0xc0, 0x1e])
            .unwrap();
        controller.save_state(&path).unwrap();

        let mut restored = SequencerController::new(TimeMaster::new(120, 96));
        restored.set_dispatcher("synth", Box::new(DebugDispatcher));
        restored.load_state(&path).unwrap();

        assert_eq!(restored.tracks.len(), 1);
        assert_eq!(restored.tracks[0].track, track);
        assert_eq!(restored.tracks[0].dispatcher.as_deref(), Some("synth"));
        assert_eq!(
            restored.dispatchers["synth"].initial_state,
            vec![0x00, 0xc0, 0x1e]
        );
    }
}
