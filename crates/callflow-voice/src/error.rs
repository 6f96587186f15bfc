use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("TTS error: {0}")]
    Tts(String),

    #[error("No voice configured for language: {0}")]
    UnsupportedLanguage(String),
}
