//! Speech synthesis and per-leg playback scheduling.
//!
//! Translated text is turned into raw PCM by a [`SpeechSynthesizer`]
//! (Piper voices or the system `espeak-ng`) and queued on the target leg's
//! [`PlaybackScheduler`] slot. A leg plays one clip at a time: the next clip
//! is released only when the provider reports the previous playback ended,
//! or when the in-flight clip stalls past its timeout.

mod error;
mod playback;
mod synth;

pub use error::VoiceError;
pub use playback::{PlaybackScheduler, QueuedClip};
pub use synth::{
    build_synthesizer, EspeakSynthesizer, PiperSynthesizer, SpeechSynthesizer, SynthesizedAudio,
    SynthesizerKind, VoiceSettings,
};
