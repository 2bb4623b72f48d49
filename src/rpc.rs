// src/rpc.rs

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Sender};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio_engine::EngineHandle;
use crate::control::RecordMode;
use crate::sequencer::{ReactorOp, SeqState};

/// Upper bound on a single RPC frame; anything larger is a broken or
/// hostile client and closes the connection.
const MAX_FRAME: u32 = 64 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug)]
pub struct Rpc {
    /// When present, a `Response` carrying this id is sent back once the
    /// whole batch has been applied.
    pub msg_id: Option<u32>,
    pub ops: Vec<Op>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStateChange {
    Idle,
    Play,
    Record,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum Op {
    Echo(String),
    SetTicks(u32),
    SetInitialState {
        dispatcher: String,
        events: Vec<u8>,
    },
    SetInputParams {
        output_channel: Option<u8>,
    },
    SaveState(PathBuf),
    LoadState(PathBuf),
    SaveSequencerState(PathBuf),
    LoadSequencerState(PathBuf),
    ExportAudio(PathBuf),
    AddTrack {
        events: Vec<u8>,
        dispatcher: Option<String>,
    },
    ChangeSequencerState(SeqState),
    ChangeLoopState {
        state: LoopStateChange,
        channel: u32,
    },
    SetRecordMode(RecordModeArg),
    ClearState,
    Shutdown,
    /// -1 for the previous section, anything else for the next.
    ChangeSection(i32),
    NewSection,
    ChangeChannelAttrs {
        channel: u32,
        sticky: Option<bool>,
        enabled: Option<bool>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordModeArg {
    Wrap,
    Expand,
    SpanRelative,
}

impl From<RecordModeArg> for RecordMode {
    fn from(arg: RecordModeArg) -> Self {
        match arg {
            RecordModeArg::Wrap => RecordMode::Wrap,
            RecordModeArg::Expand => RecordMode::Expand,
            RecordModeArg::SpanRelative => RecordMode::SpanRelative,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Response {
    pub msg_id: u32,
    pub error: Option<String>,
}

/// Everything a connection needs to apply operations.
#[derive(Clone)]
pub struct RpcContext {
    pub engine: EngineHandle,
    pub reactor: Sender<ReactorOp>,
    pub running: Arc<AtomicBool>,
}

/// Binds the listener and serves connections, one thread each, until the
/// daemon shuts down.
pub fn spawn_listener(port: u16, ctx: RpcContext) -> Result<thread::JoinHandle<()>> {
    let listener =
        TcpListener::bind(("127.0.0.1", port)).with_context(|| format!("binding RPC port {}", port))?;
    listener.set_nonblocking(true)?;
    info!("RPC listening on port {}", port);

    let handle = thread::Builder::new()
        .name("rpc-listener".into())
        .spawn(move || {
            while ctx.running.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        info!("RPC connection from {}", peer);
                        let ctx = ctx.clone();
                        let _ = thread::Builder::new()
                            .name("rpc-conn".into())
                            .spawn(move || {
                                if let Err(err) = serve_connection(stream, &ctx) {
                                    info!("RPC connection closed: {}", err);
                                }
                            });
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(100));
                    }
                    Err(err) => {
                        warn!("RPC accept failed: {}", err);
                        break;
                    }
                }
            }
        })?;
    Ok(handle)
}

/// Reads length-prefixed frames off one connection until it closes: a
/// 4-byte little-endian size followed by a bincode `Rpc` record.
fn serve_connection(mut stream: TcpStream, ctx: &RpcContext) -> Result<()> {
    stream.set_nodelay(true).ok();
    loop {
        let mut size_buf = [0u8; 4];
        if let Err(err) = stream.read_exact(&mut size_buf) {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(());
            }
            return Err(err.into());
        }
        let size = u32::from_le_bytes(size_buf);
        if size > MAX_FRAME {
            anyhow::bail!("oversized frame: {} bytes", size);
        }

        let mut payload = vec![0u8; size as usize];
        stream.read_exact(&mut payload)?;

        let rpc: Rpc = match bincode::deserialize(&payload) {
            Ok(rpc) => rpc,
            Err(err) => {
                // A bad frame is a client bug, not a daemon failure.
                warn!("undecodable RPC frame: {}", err);
                continue;
            }
        };

        let error = apply_batch(&rpc.ops, ctx);
        if let Some(msg_id) = rpc.msg_id {
            let response = Response { msg_id, error };
            let bytes = bincode::serialize(&response)?;
            stream.write_all(&(bytes.len() as u32).to_le_bytes())?;
            stream.write_all(&bytes)?;
        }

        if !ctx.running.load(Ordering::Relaxed) {
            return Ok(());
        }
    }
}

/// Applies a batch in order. Engine operations run synchronously here;
/// sequencer operations are handed to the reactor and fenced with a sync
/// before the response goes out. Returns the first error, if any.
fn apply_batch(ops: &[Op], ctx: &RpcContext) -> Option<String> {
    let mut error: Option<String> = None;
    let mut record = |result: Result<()>| {
        if let Err(err) = result {
            warn!("RPC op failed: {:#}", err);
            if error.is_none() {
                error = Some(format!("{:#}", err));
            }
        }
    };

    let mut touched_reactor = false;
    for op in ops {
        match op {
            Op::Echo(message) => info!("Echo: {}", message),
            Op::SetTicks(ticks) => {
                touched_reactor = true;
                let _ = ctx.reactor.send(ReactorOp::SetTicks(*ticks));
            }
            Op::SetInitialState { dispatcher, events } => {
                touched_reactor = true;
                let _ = ctx.reactor.send(ReactorOp::SetInitialState {
                    dispatcher: dispatcher.clone(),
                    events: events.clone(),
                });
            }
            Op::SetInputParams { output_channel } => {
                touched_reactor = true;
                let _ = ctx.reactor.send(ReactorOp::SetInputParams {
                    output_channel: *output_channel,
                });
            }
            Op::SaveState(path) => record(ctx.engine.save(path)),
            Op::LoadState(path) => record(ctx.engine.load(path)),
            Op::SaveSequencerState(path) => {
                touched_reactor = true;
                let _ = ctx.reactor.send(ReactorOp::SaveState(path.clone()));
            }
            Op::LoadSequencerState(path) => {
                touched_reactor = true;
                let _ = ctx.reactor.send(ReactorOp::LoadState(path.clone()));
            }
            Op::ExportAudio(dir) => record(ctx.engine.export_stems(dir).map(|_| ())),
            Op::AddTrack { events, dispatcher } => {
                touched_reactor = true;
                let _ = ctx.reactor.send(ReactorOp::AddTrack {
                    events: events.clone(),
                    dispatcher: dispatcher.clone(),
                });
            }
            Op::ChangeSequencerState(state) => {
                touched_reactor = true;
                let _ = ctx.reactor.send(ReactorOp::SetState(*state));
            }
            Op::ChangeLoopState { state, channel } => match state {
                LoopStateChange::Idle => {
                    ctx.engine.end_record();
                    ctx.engine.end_play();
                }
                LoopStateChange::Record => ctx.engine.start_record(*channel as usize),
                LoopStateChange::Play => {
                    ctx.engine.end_record();
                    ctx.engine.start_play();
                }
            },
            Op::SetRecordMode(mode) => ctx.engine.set_record_mode((*mode).into()),
            Op::ClearState => ctx.engine.clear(),
            Op::Shutdown => {
                info!("shutdown requested over RPC");
                ctx.running.store(false, Ordering::Relaxed);
                let _ = ctx.reactor.send(ReactorOp::Quit);
            }
            Op::ChangeSection(delta) => {
                if *delta == -1 {
                    ctx.engine.prev_section();
                } else {
                    ctx.engine.next_section();
                }
            }
            Op::NewSection => ctx.engine.new_section(),
            Op::ChangeChannelAttrs {
                channel,
                sticky,
                enabled,
            } => {
                if let Some(sticky) = sticky {
                    ctx.engine.set_sticky(*channel as usize, *sticky);
                }
                if let Some(enabled) = enabled {
                    ctx.engine.set_enabled(*channel as usize, *enabled);
                }
            }
        }
    }

    // Fence: wait until the reactor has drained everything we queued so a
    // response means "done", not "enqueued".
    if touched_reactor {
        let (ack_tx, ack_rx) = bounded(1);
        if ctx.reactor.send(ReactorOp::Sync(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(Duration::from_secs(5));
        }
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_frames_round_trip_through_bincode() {
        let rpc = Rpc {
            msg_id: Some(7),
            ops: vec![
                Op::Echo("hello".into()),
                Op::ChangeLoopState {
                    state: LoopStateChange::Record,
                    channel: 3,
                },
                Op::ChangeChannelAttrs {
                    channel: 1,
                    sticky: Some(true),
                    enabled: None,
                },
            ],
        };
        let bytes = bincode::serialize(&rpc).unwrap();
        let back: Rpc = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.msg_id, Some(7));
        assert_eq!(back.ops.len(), 3);
        match &back.ops[1] {
            Op::ChangeLoopState { state, channel } => {
                assert_eq!(*state, LoopStateChange::Record);
                assert_eq!(*channel, 3);
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn record_mode_argument_maps_onto_the_engine_enum() {
        assert_eq!(RecordMode::from(RecordModeArg::Wrap), RecordMode::Wrap);
        assert_eq!(
            RecordMode::from(RecordModeArg::SpanRelative),
            RecordMode::SpanRelative
        );
    }

    #[test]
    fn a_connection_applies_ops_and_answers_with_the_msg_id() {
        use crate::audio_engine::LoopEngine;
        use crate::control::ControlSurface;
        use crate::sequencer::{run_reactor, SequencerController, TimeMaster};
        use crossbeam_channel::unbounded;
        use std::net::TcpListener;

        let (_engine, handle) = LoopEngine::new(ControlSurface::new(), 44100);
        let (ops_tx, ops_rx) = unbounded();
        let (_midi_tx, midi_rx) = unbounded();
        let controller = SequencerController::new(TimeMaster::new(120, 96));
        let reactor = thread::spawn(move || run_reactor(controller, ops_rx, midi_rx));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = RpcContext {
            engine: handle.clone(),
            reactor: ops_tx.clone(),
            running: Arc::new(AtomicBool::new(true)),
        };
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve_connection(stream, &ctx).unwrap();
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let payload = bincode::serialize(&Rpc {
            msg_id: Some(42),
            ops: vec![
                Op::Echo("integration".into()),
                Op::SetTicks(5),
                Op::ChangeLoopState {
                    state: LoopStateChange::Record,
                    channel: 2,
                },
            ],
        })
        .unwrap();
        client
            .write_all(&(payload.len() as u32).to_le_bytes())
            .unwrap();
        client.write_all(&payload).unwrap();

        let mut size_buf = [0u8; 4];
        client.read_exact(&mut size_buf).unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(size_buf) as usize];
        client.read_exact(&mut body).unwrap();
        let response: Response = bincode::deserialize(&body).unwrap();
        assert_eq!(response.msg_id, 42);
        assert_eq!(response.error, None);

        // The loop-state op landed on the control surface.
        assert_eq!(handle.surface().record_channel(), 2);

        drop(client);
        server.join().unwrap();
        ops_tx.send(crate::sequencer::ReactorOp::Quit).unwrap();
        reactor.join().unwrap();
    }
}
