// src/app.rs

use anyhow::Result;
use crossbeam_channel::unbounded;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::control::ControlSurface;
use crate::rpc::{self, RpcContext};
use crate::sequencer::{
    run_reactor, DebugDispatcher, InputDispatcher, ReactorOp, SequencerController, TimeMaster,
};
use crate::settings::{self, AppSettings};
use crate::{audio_io, midi, pedal, terminal};

/// Builds every piece of the daemon, runs until quit, and tears down in
/// the safe order: the audio streams go first so the callback is
/// deactivated before anything it references unwinds.
pub fn run(settings: AppSettings, enable_pedal: bool) -> Result<()> {
    let surface = ControlSurface::new();
    let (streams, engine) = audio_io::init_and_run_streams(
        settings.host_name.as_deref(),
        settings.input_device.as_deref(),
        settings.output_device.as_deref(),
        settings.sample_rate,
        settings.buffer_size,
        surface,
    )?;

    info!("engine running at {} Hz", streams.sample_rate);

    let running = Arc::new(AtomicBool::new(true));

    // MIDI side, all owned by the reactor thread. The input chain is
    // port -> stamp/record -> "synth" sink; a missing port degrades to a
    // debug sink so the rest of the daemon still works.
    let mut controller = SequencerController::new(TimeMaster::new(settings.bpm, settings.ppb));
    match midi::PortDispatcher::connect(settings.synth_port.as_deref()) {
        Ok(dispatcher) => controller.set_dispatcher("synth", Box::new(dispatcher)),
        Err(err) => {
            warn!("synth output unavailable ({}), using the debug sink", err);
            controller.set_dispatcher("synth", Box::new(DebugDispatcher));
        }
    }
    if let Some(hardware_port) = settings.hardware_port.as_deref() {
        match midi::PortDispatcher::connect(Some(hardware_port)) {
            Ok(dispatcher) => controller.set_dispatcher("midi", Box::new(dispatcher)),
            Err(err) => warn!("hardware MIDI output unavailable: {}", err),
        }
    }
    controller.add_input(InputDispatcher::new(Some("synth".into())));

    let (ops_tx, ops_rx) = unbounded();
    let (midi_tx, midi_rx) = unbounded();
    let _midi_input = match midi::connect_input(settings.midi_input_port.as_deref(), midi_tx) {
        Ok(conn) => Some(conn),
        Err(err) => {
            warn!("MIDI input unavailable: {}", err);
            None
        }
    };

    let reactor = thread::Builder::new()
        .name("reactor".into())
        .spawn(move || run_reactor(controller, ops_rx, midi_rx))?;

    let _rpc = rpc::spawn_listener(
        settings.rpc_port,
        RpcContext {
            engine: engine.clone(),
            reactor: ops_tx.clone(),
            running: running.clone(),
        },
    )?;

    let _pedal = if enable_pedal {
        let device = settings
            .pedal_device
            .clone()
            .unwrap_or_else(|| "/dev/ttyACM0".to_string());
        match pedal::spawn_reader(&device, engine.clone(), running.clone()) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("pedal unavailable: {:#}", err);
                None
            }
        }
    } else {
        None
    };

    engine.start_play();
    info!("spanloop daemon started");

    if terminal::is_tty() {
        info!("Starting terminal interface...");
        terminal::run(
            engine.clone(),
            ops_tx.clone(),
            running.clone(),
            settings::session_dir(&settings),
        )?;
    } else {
        while running.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(200));
        }
    }

    running.store(false, Ordering::Relaxed);
    let _ = ops_tx.send(ReactorOp::Quit);
    let _ = reactor.join();
    drop(streams);
    info!("shut down");
    Ok(())
}
