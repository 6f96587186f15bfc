use crate::error::VoiceError;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Sample rate of Piper's medium voices and of `espeak-ng --stdout`.
const DEFAULT_SAMPLE_RATE: u32 = 22_050;

/// Raw s16le mono PCM produced by a synthesizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

impl SynthesizedAudio {
    /// Base64 body for the provider's "play audio" command.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.pcm)
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, text: &str, lang: &str) -> Result<SynthesizedAudio, VoiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesizerKind {
    #[default]
    Piper,
    System,
}

fn default_piper_binary() -> PathBuf {
    PathBuf::from("piper")
}

fn default_voices_dir() -> PathBuf {
    PathBuf::from("assets/voices")
}

fn default_synthesis_timeout_secs() -> u64 {
    20
}

fn default_playback_stall_timeout_secs() -> u64 {
    30
}

/// The `[voice]` configuration section.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceSettings {
    #[serde(default)]
    pub synthesizer: SynthesizerKind,
    #[serde(default = "default_piper_binary")]
    pub piper_binary: PathBuf,
    #[serde(default = "default_voices_dir")]
    pub voices_dir: PathBuf,
    /// Piper model per language code, e.g. `en = "en_US-lessac-medium.onnx"`.
    #[serde(default)]
    pub voices: HashMap<String, String>,
    #[serde(default = "default_synthesis_timeout_secs")]
    pub synthesis_timeout_secs: u64,
    /// How long a playback may go without its end event before the leg is
    /// released.
    #[serde(default = "default_playback_stall_timeout_secs")]
    pub playback_stall_timeout_secs: u64,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            synthesizer: SynthesizerKind::default(),
            piper_binary: default_piper_binary(),
            voices_dir: default_voices_dir(),
            voices: HashMap::new(),
            synthesis_timeout_secs: default_synthesis_timeout_secs(),
            playback_stall_timeout_secs: default_playback_stall_timeout_secs(),
        }
    }
}

pub fn build_synthesizer(settings: &VoiceSettings) -> Arc<dyn SpeechSynthesizer> {
    let timeout = Duration::from_secs(settings.synthesis_timeout_secs);
    match settings.synthesizer {
        SynthesizerKind::Piper => Arc::new(PiperSynthesizer::new(
            &settings.voices_dir,
            &settings.piper_binary,
            settings.voices.clone(),
            timeout,
        )),
        SynthesizerKind::System => Arc::new(EspeakSynthesizer::new(timeout)),
    }
}

fn check_input(text: &str) -> Result<(), VoiceError> {
    if text.len() > MAX_TTS_INPUT_BYTES {
        return Err(VoiceError::Tts(format!(
            "text exceeds maximum size: {} bytes (limit: {} bytes)",
            text.len(),
            MAX_TTS_INPUT_BYTES
        )));
    }
    Ok(())
}

/// Runs a TTS process to completion, optionally feeding `stdin_text`, and
/// returns its stdout.
async fn run_tts_process(
    mut command: Command,
    label: &str,
    stdin_text: Option<&str>,
    timeout: Duration,
) -> Result<Vec<u8>, VoiceError> {
    command
        .stdin(if stdin_text.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| VoiceError::Tts(format!("Failed to spawn {label}: {e}")))?;

    // Write stdin from a separate task so a full stdout pipe cannot deadlock.
    let write_task = match stdin_text {
        Some(text) => {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| VoiceError::Tts("Failed to open stdin".to_string()))?;
            let text_owned = text.to_string();
            Some(tokio::spawn(async move {
                stdin.write_all(text_owned.as_bytes()).await
            }))
        }
        None => None,
    };

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            VoiceError::Tts(format!(
                "{label} timed out after {} seconds",
                timeout.as_secs()
            ))
        })?
        .map_err(|e| VoiceError::Tts(format!("Failed to wait for {label}: {e}")))?;

    if let Some(task) = write_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(VoiceError::Tts(format!(
                    "Failed to write to {label} stdin: {e}"
                )))
            }
            Err(e) => return Err(VoiceError::Tts(format!("Stdin task failed: {e}"))),
        }
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VoiceError::Tts(format!("{label} failed: {stderr}")));
    }
    Ok(output.stdout)
}

/// Local neural TTS through the `piper` binary, one ONNX voice per language.
#[derive(Debug, Clone)]
pub struct PiperSynthesizer {
    voices_dir: PathBuf,
    piper_binary: PathBuf,
    voices: HashMap<String, String>,
    timeout: Duration,
}

impl PiperSynthesizer {
    pub fn new(
        voices_dir: impl AsRef<Path>,
        piper_binary: impl AsRef<Path>,
        voices: HashMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            voices_dir: voices_dir.as_ref().to_path_buf(),
            piper_binary: piper_binary.as_ref().to_path_buf(),
            voices,
            timeout,
        }
    }

    /// Resolves the model for `lang`, falling back from `pt-BR` to `pt`.
    fn model_path(&self, lang: &str) -> Result<PathBuf, VoiceError> {
        let primary = lang.split('-').next().unwrap_or(lang);
        let model = self
            .voices
            .get(lang)
            .or_else(|| self.voices.get(primary))
            .ok_or_else(|| VoiceError::UnsupportedLanguage(lang.to_string()))?;
        Ok(if Path::new(model).is_absolute() {
            PathBuf::from(model)
        } else {
            self.voices_dir.join(model)
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for PiperSynthesizer {
    fn name(&self) -> &str {
        "piper"
    }

    async fn synthesize(&self, text: &str, lang: &str) -> Result<SynthesizedAudio, VoiceError> {
        check_input(text)?;
        let model_path = self.model_path(lang)?;
        if !model_path.exists() {
            return Err(VoiceError::Tts(format!(
                "Model file not found: {:?}",
                model_path
            )));
        }

        let mut command = Command::new(&self.piper_binary);
        command.arg("--model").arg(model_path).arg("--output_raw");

        let pcm = run_tts_process(command, "piper", Some(text), self.timeout).await?;
        Ok(SynthesizedAudio {
            pcm,
            sample_rate: DEFAULT_SAMPLE_RATE,
        })
    }
}

/// The system `espeak-ng` engine.
#[derive(Debug, Clone)]
pub struct EspeakSynthesizer {
    binary: PathBuf,
    timeout: Duration,
}

impl EspeakSynthesizer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: PathBuf::from("espeak-ng"),
            timeout,
        }
    }
}

/// Strips the RIFF header, returning the samples of the `data` chunk.
///
/// Falls back to the canonical 44-byte header when no `data` chunk is found.
fn strip_wav_header(wav: &[u8]) -> &[u8] {
    if wav.len() >= 12 && &wav[0..4] == b"RIFF" && &wav[8..12] == b"WAVE" {
        let mut pos = 12;
        while pos + 8 <= wav.len() {
            let id = &wav[pos..pos + 4];
            let size = u32::from_le_bytes([wav[pos + 4], wav[pos + 5], wav[pos + 6], wav[pos + 7]])
                as usize;
            if id == b"data" {
                // espeak-ng writes a placeholder size when streaming to stdout.
                let start = pos + 8;
                let end = start.saturating_add(size).min(wav.len());
                return if size == 0 || size == u32::MAX as usize {
                    &wav[start..]
                } else {
                    &wav[start..end]
                };
            }
            pos = pos.saturating_add(8).saturating_add(size);
        }
    }
    if wav.len() > 44 {
        &wav[44..]
    } else {
        wav
    }
}

#[async_trait]
impl SpeechSynthesizer for EspeakSynthesizer {
    fn name(&self) -> &str {
        "espeak-ng"
    }

    async fn synthesize(&self, text: &str, lang: &str) -> Result<SynthesizedAudio, VoiceError> {
        check_input(text)?;
        let mut command = Command::new(&self.binary);
        command.arg("--stdout").arg("-v").arg(lang).arg(text);

        let wav = run_tts_process(command, "espeak-ng", None, self.timeout).await?;
        Ok(SynthesizedAudio {
            pcm: strip_wav_header(&wav).to_vec(),
            sample_rate: DEFAULT_SAMPLE_RATE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_with_data(samples: &[u8]) -> Vec<u8> {
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&0u32.to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&[0u8; 16]);
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&(samples.len() as u32).to_le_bytes());
        wav.extend_from_slice(samples);
        wav
    }

    #[test]
    fn wav_header_is_stripped_to_data_chunk() {
        let wav = wav_with_data(&[1, 2, 3, 4]);
        assert_eq!(strip_wav_header(&wav), &[1, 2, 3, 4]);
    }

    #[test]
    fn streaming_wav_with_placeholder_size_keeps_all_samples() {
        let mut wav = wav_with_data(&[]);
        let len = wav.len();
        wav[len - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
        wav.extend_from_slice(&[9, 9]);
        assert_eq!(strip_wav_header(&wav), &[9, 9]);
    }

    #[test]
    fn piper_resolves_voice_by_primary_tag() {
        let mut voices = HashMap::new();
        voices.insert("pt".to_string(), "pt_PT-tugao-medium.onnx".to_string());
        let piper = PiperSynthesizer::new("/voices", "piper", voices, Duration::from_secs(1));
        assert_eq!(
            piper.model_path("pt-BR").unwrap(),
            PathBuf::from("/voices/pt_PT-tugao-medium.onnx")
        );
        assert!(matches!(
            piper.model_path("ja"),
            Err(VoiceError::UnsupportedLanguage(_))
        ));
    }

    #[tokio::test]
    async fn piper_reports_missing_model_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut voices = HashMap::new();
        voices.insert("en".to_string(), "missing.onnx".to_string());
        let piper = PiperSynthesizer::new(dir.path(), "piper", voices, Duration::from_secs(1));
        let err = piper.synthesize("hello", "en").await.unwrap_err();
        assert!(err.to_string().contains("Model file not found"));
    }

    #[tokio::test]
    async fn oversized_text_is_rejected_before_spawning() {
        let espeak = EspeakSynthesizer::new(Duration::from_secs(1));
        let text = "a".repeat(MAX_TTS_INPUT_BYTES + 1);
        let err = espeak.synthesize(&text, "en").await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum size"));
    }

    #[test]
    fn audio_encodes_as_base64() {
        let audio = SynthesizedAudio {
            pcm: vec![0, 1, 2],
            sample_rate: DEFAULT_SAMPLE_RATE,
        };
        assert_eq!(audio.to_base64(), "AAEC");
    }
}
