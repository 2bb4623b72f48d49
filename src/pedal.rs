// src/pedal.rs

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serialport::{DataBits, Parity, StopBits};
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio_engine::EngineHandle;

/// Byte protocol of the foot pedal, one byte per press:
/// bit 7 set ends the running record, bit 7 clear starts recording on the
/// byte's value as the channel, 0x08 steps to the previous section, 0x09
/// to the next (creating one past the last).
const PREV_SECTION: u8 = 0x08;
const NEXT_SECTION: u8 = 0x09;

pub fn spawn_reader(
    device: &str,
    engine: EngineHandle,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let mut port = serialport::new(device, 115_200)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .timeout(Duration::from_millis(200))
        .open()
        .with_context(|| format!("opening pedal device {}", device))?;
    info!("Pedal interface on {}", device);

    let handle = thread::Builder::new().name("pedal".into()).spawn(move || {
        // The pedal steps through sections blind; mirror the count here so
        // "next" past the end becomes "new".
        let mut section_count: usize = 1;
        let mut section_index: usize = 0;

        let mut buffer = [0u8; 64];
        while running.load(Ordering::Relaxed) {
            let read = match port.read(&mut buffer) {
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::TimedOut => continue,
                Err(err) => {
                    warn!("pedal read failed: {}", err);
                    break;
                }
            };

            for &byte in &buffer[..read] {
                debug!("pedal byte {:#04x}", byte);
                match byte {
                    NEXT_SECTION => {
                        if section_index + 1 == section_count {
                            engine.new_section();
                            section_count += 1;
                        } else {
                            engine.next_section();
                        }
                        section_index += 1;
                    }
                    PREV_SECTION => {
                        engine.prev_section();
                        section_index = (section_index + section_count - 1) % section_count;
                    }
                    byte if byte & 0x80 != 0 => engine.end_record(),
                    byte => engine.start_record(byte as usize),
                }
            }
        }
    })?;
    Ok(handle)
}
