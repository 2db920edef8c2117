//! Acknowledgement clips played when a conversation starts

use std::path::Path;

use rand::seq::SliceRandom;

use crate::protocol::AudioFrame;
use crate::{Error, Result};

/// Short PCM clips in the link's audio format
#[derive(Debug, Default)]
pub struct SoundBank {
    clips: Vec<(String, AudioFrame)>,
}

impl SoundBank {
    /// Load every `.raw` and `.wav` file in `dir`
    ///
    /// `.raw` files are taken as-is. WAV files must be 16-bit mono at
    /// `sample_rate`; others are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns error if the directory can't be read
    pub fn load(dir: &Path, sample_rate: u32) -> Result<Self> {
        let mut clips = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let clip = match path.extension().and_then(|ext| ext.to_str()) {
                Some("raw") => AudioFrame(std::fs::read(&path)?),
                Some("wav") => match read_wav(&path, sample_rate) {
                    Ok(clip) => clip,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping clip");
                        continue;
                    }
                },
                _ => continue,
            };

            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            tracing::debug!(clip = %name, bytes = clip.len(), "loaded acknowledgement clip");
            clips.push((name, clip));
        }

        clips.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self { clips })
    }

    /// Number of clips loaded
    #[must_use]
    pub fn len(&self) -> usize {
        self.clips.len()
    }

    /// Whether no clips are loaded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    /// Clip by file stem (e.g. "yes" for `yes.raw`)
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AudioFrame> {
        self.clips.iter().find(|(n, _)| n == name).map(|(_, clip)| clip)
    }

    /// A randomly chosen clip
    #[must_use]
    pub fn random(&self) -> Option<&AudioFrame> {
        self.clips
            .choose(&mut rand::thread_rng())
            .map(|(_, clip)| clip)
    }
}

/// Decode a 16-bit mono WAV clip
fn read_wav(path: &Path, sample_rate: u32) -> Result<AudioFrame> {
    let reader = hound::WavReader::open(path).map_err(|e| Error::Audio(e.to_string()))?;
    let wav = reader.spec();

    if wav.channels != 1
        || wav.bits_per_sample != 16
        || wav.sample_format != hound::SampleFormat::Int
        || wav.sample_rate != sample_rate
    {
        return Err(Error::Audio(format!(
            "expected 16-bit mono at {sample_rate} Hz, got {}-bit {}ch at {} Hz",
            wav.bits_per_sample, wav.channels, wav.sample_rate
        )));
    }

    let samples = reader
        .into_samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Audio(e.to_string()))?;
    Ok(AudioFrame::from_samples(&samples))
}
