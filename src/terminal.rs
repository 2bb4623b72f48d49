// src/terminal.rs

use anyhow::Result;
use chrono::Local;
use crossbeam_channel::Sender;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use crossterm::tty::IsTty;
use log::{info, warn};
use std::io::{stdin, stdout, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio_engine::EngineHandle;
use crate::sequencer::ReactorOp;

pub fn is_tty() -> bool {
    stdin().is_tty()
}

/// Raw-mode key loop on the calling thread. Returns when the daemon stops,
/// whether from a key here or a shutdown elsewhere.
pub fn run(
    engine: EngineHandle,
    reactor: Sender<ReactorOp>,
    running: Arc<AtomicBool>,
    session_dir: PathBuf,
) -> Result<()> {
    terminal::enable_raw_mode()?;
    let result = key_loop(&engine, &reactor, &running, &session_dir);
    terminal::disable_raw_mode()?;
    result
}

fn key_loop(
    engine: &EngineHandle,
    reactor: &Sender<ReactorOp>,
    running: &Arc<AtomicBool>,
    session_dir: &PathBuf,
) -> Result<()> {
    while running.load(Ordering::Relaxed) {
        if !event::poll(Duration::from_millis(100))? {
            draw_meter(engine);
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind == KeyEventKind::Release {
            continue;
        }

        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                quit(running, reactor);
            }
            KeyCode::Char(ch @ '0'..='9') => {
                let channel = ch as usize - '0' as usize;
                match engine.toggle_record(channel) {
                    Some(channel) => info!("Recording on channel {}", channel),
                    None => info!("Finished recording"),
                }
            }
            KeyCode::Char(' ') => {
                if engine.toggle_play() {
                    info!("Playing");
                } else {
                    info!("Paused");
                }
            }
            KeyCode::Char('K') => {
                engine.clear();
                info!("Deleted");
            }
            KeyCode::Char('q') => quit(running, reactor),
            KeyCode::Char('s') => {
                if let Some(path) = prompt_path("Save to", Some(default_session(session_dir)))? {
                    if let Err(err) = engine.save(&path) {
                        warn!("save failed: {:#}", err);
                    }
                }
            }
            KeyCode::Char('l') => {
                if let Some(path) = prompt_path("Load from", None)? {
                    if let Err(err) = engine.load(&path) {
                        warn!("load failed: {:#}", err);
                    }
                }
            }
            KeyCode::Char(',') => engine.prev_section(),
            KeyCode::Char('.') => engine.next_section(),
            KeyCode::Char('n') => engine.new_section(),
            KeyCode::Char('m') => {
                let mode = engine.record_mode().next();
                engine.set_record_mode(mode);
                info!("Record mode: {:?}", mode);
            }
            _ => {}
        }
    }
    Ok(())
}

const METER_WIDTH: usize = 40;

/// One status line, redrawn in place: a bar of the span position plus the
/// current section. Only drawn while the span is established and playing.
fn draw_meter(engine: &EngineHandle) {
    let status = engine.status();
    let end = status.section_end();
    if end == 0 || !engine.is_playing() {
        return;
    }
    let pos = status.pos();
    // While a growing record runs past the end, meter against the next
    // whole multiple of the span.
    let total = if pos > end { (pos / end + 1) * end } else { end };
    let filled = (METER_WIDTH * pos / total).min(METER_WIDTH);
    let (index, count) = status.section();
    print!(
        "\r[{}{}] {}/{} section {}/{}\x1b[K",
        "#".repeat(filled),
        " ".repeat(METER_WIDTH - filled),
        pos,
        end,
        index + 1,
        count
    );
    let _ = stdout().flush();
}

fn quit(running: &Arc<AtomicBool>, reactor: &Sender<ReactorOp>) {
    running.store(false, Ordering::Relaxed);
    let _ = reactor.send(ReactorOp::Quit);
}

fn default_session(session_dir: &PathBuf) -> PathBuf {
    session_dir.join(format!(
        "session-{}.sloop",
        Local::now().format("%Y%m%d-%H%M%S")
    ))
}

/// Drops back to cooked mode for one line of input. Empty input takes the
/// default; a bare newline with no default cancels.
fn prompt_path(label: &str, default: Option<PathBuf>) -> Result<Option<PathBuf>> {
    terminal::disable_raw_mode()?;
    match &default {
        Some(path) => print!("{} [{}]: ", label, path.display()),
        None => print!("{}: ", label),
    }
    stdout().flush()?;

    let mut line = String::new();
    stdin().lock().read_line(&mut line)?;
    terminal::enable_raw_mode()?;

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(default);
    }
    Ok(Some(PathBuf::from(trimmed)))
}
