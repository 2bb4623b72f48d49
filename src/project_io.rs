// src/project_io.rs

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::audio_engine::channel::Channel;
use crate::audio_engine::section::{Project, Section};
use crate::control::DEFAULT_CHANNELS;

/// One channel's loop as stored on disk. `data` covers
/// `[offset, offset + end)` in buffer-aligned chunks of big-endian i16
/// samples; buffers never recorded are stored as zeroes.
#[derive(Serialize, Deserialize)]
struct WaveFile {
    enabled: bool,
    end: u32,
    loop_pos: u32,
    offset: u32,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SectionFile {
    end: u32,
    waves: Vec<WaveFile>,
}

#[derive(Serialize, Deserialize)]
struct ProjectFile {
    section_index: u32,
    sections: Vec<SectionFile>,
}

pub fn save_project(path: &Path, project: &Project, samples_per_buffer: usize) -> Result<()> {
    let file = ProjectFile {
        section_index: project.section_index as u32,
        sections: project
            .sections
            .iter()
            .map(|section| SectionFile {
                end: section.end as u32,
                waves: section
                    .channels
                    .iter()
                    .map(|channel| WaveFile {
                        enabled: channel.enabled,
                        end: channel.end as u32,
                        loop_pos: channel.loop_pos as u32,
                        offset: channel.offset as u32,
                        data: channel.encode_wave_data(samples_per_buffer),
                    })
                    .collect(),
            })
            .collect(),
    };

    let out = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    bincode::serialize_into(BufWriter::new(out), &file)?;
    info!("saved project to {}", path.display());
    Ok(())
}

pub fn load_project(path: &Path, samples_per_buffer: usize) -> Result<Project> {
    let input = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let file: ProjectFile = bincode::deserialize_from(BufReader::new(input))?;

    let mut sections = Vec::with_capacity(file.sections.len());
    for section_file in &file.sections {
        let mut section = Section {
            channels: Vec::with_capacity(DEFAULT_CHANNELS),
            end: section_file.end as usize,
        };
        for wave in &section_file.waves {
            let mut channel = Channel::new();
            channel.enabled = wave.enabled;
            channel.end = wave.end as usize;
            channel.loop_pos = wave.loop_pos as usize;
            channel.offset = wave.offset as usize;
            channel.decode_wave_data(&wave.data, samples_per_buffer);
            section.channels.push(channel);
        }
        section.ensure_channel(DEFAULT_CHANNELS - 1);
        sections.push(section);
    }
    if sections.is_empty() {
        sections.push(Section::new());
    }
    let section_index = (file.section_index as usize).min(sections.len() - 1);

    info!("loaded project from {}", path.display());
    Ok(Project {
        sections,
        section_index,
    })
}

/// Writes one stereo 16-bit wav per recorded channel of `section`,
/// rendering each loop the way playback would (offset and loop position
/// applied). Returns the number of stems written.
pub fn export_stems(
    dir: &Path,
    section: &Section,
    samples_per_buffer: usize,
    sample_rate: u32,
) -> Result<usize> {
    let frames_per_buffer = samples_per_buffer / 2;
    std::fs::create_dir_all(dir)?;

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut written = 0;
    for (index, channel) in section.channels.iter().enumerate() {
        if !channel.has_audio() {
            continue;
        }
        let path = dir.join(format!("channel_{index}.wav"));
        let mut writer = hound::WavWriter::create(&path, spec)?;

        let mut pos = 0;
        while pos < channel.end {
            match channel.read_buffer(pos) {
                Some(buf) => {
                    for &sample in buf.iter() {
                        writer.write_sample((sample * i16::MAX as f32) as i16)?;
                    }
                }
                None => {
                    for _ in 0..samples_per_buffer {
                        writer.write_sample(0i16)?;
                    }
                }
            }
            pos += frames_per_buffer;
        }
        writer.finalize()?;
        written += 1;
    }
    info!("exported {} stems to {}", written, dir.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPB: usize = 16;
    const FPB: usize = SPB / 2;

    fn project_with_audio() -> Project {
        let mut project = Project::new();
        {
            let section = project.current_mut();
            section.end = FPB * 2;
            let channel = &mut section.channels[3];
            let buf = channel.write_buffer(0, SPB);
            for (i, sample) in buf.iter_mut().enumerate() {
                *sample = i as f32 / 64.0;
            }
            channel.end = FPB * 2;
        }
        project
    }

    #[test]
    fn project_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.sloop");

        let project = project_with_audio();
        save_project(&path, &project, SPB).unwrap();
        let loaded = load_project(&path, SPB).unwrap();

        assert_eq!(loaded.sections.len(), 1);
        assert_eq!(loaded.section_index, 0);
        let section = loaded.current();
        assert_eq!(section.end, FPB * 2);
        assert_eq!(section.channels.len(), DEFAULT_CHANNELS);
        assert_eq!(section.channels[3].end, FPB * 2);

        let original = project.current().channels[3].read_buffer(0).unwrap();
        let restored = section.channels[3].read_buffer(0).unwrap();
        for (a, b) in original.iter().zip(restored.iter()) {
            assert!((a - b).abs() < 1.0 / 32768.0 + 1e-6);
        }
    }

    #[test]
    fn loading_clamps_a_stale_section_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.sloop");

        let mut project = project_with_audio();
        project.section_index = 0;
        save_project(&path, &project, SPB).unwrap();

        // Corrupt-ish: index beyond the section list falls back in range.
        let input = std::fs::read(&path).unwrap();
        let mut file: ProjectFile = bincode::deserialize(&input).unwrap();
        file.section_index = 99;
        std::fs::write(&path, bincode::serialize(&file).unwrap()).unwrap();

        let loaded = load_project(&path, SPB).unwrap();
        assert_eq!(loaded.section_index, 0);
    }

    #[test]
    fn stems_cover_only_recorded_channels() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_with_audio();
        let written = export_stems(dir.path(), project.current(), SPB, 44100).unwrap();
        assert_eq!(written, 1);
        assert!(dir.path().join("channel_3.wav").exists());
        assert!(!dir.path().join("channel_0.wav").exists());
    }
}
