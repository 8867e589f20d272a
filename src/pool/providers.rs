//! Provider capability interfaces.
//!
//! The pipeline providers (VAD, ASR, LLM, TTS) are external collaborators;
//! the core consumes them only through these traits and the pool. The
//! `null` providers keep a deployment runnable with no upstream configured
//! and stand in for real providers in tests.

use crate::pool::manager::PoolManager;
use async_trait::async_trait;

/// Resource-type tags used as the first half of every pool key.
pub mod resource {
    pub const VAD: &str = "vad";
    pub const ASR: &str = "asr";
    pub const LLM: &str = "llm";
    pub const TTS: &str = "tts";
}

pub trait ProviderBase: Send {
    /// Liveness of the underlying handle (connection, engine, …).
    fn is_valid(&self) -> bool {
        true
    }

    fn close_provider(&mut self) {}

    /// Clear per-utterance state before reuse.
    fn reset_provider(&mut self) {}
}

pub trait VadProvider: ProviderBase {
    /// Feed normalized samples; true when speech is present.
    fn detect(&mut self, samples: &[f32]) -> anyhow::Result<bool>;
}

pub trait AsrProvider: ProviderBase {
    fn feed(&mut self, samples: &[f32]) -> anyhow::Result<()>;

    /// Finish the utterance and return the transcript.
    fn finalize(&mut self) -> anyhow::Result<String>;
}

#[async_trait]
pub trait LlmProvider: ProviderBase {
    async fn complete(&mut self, prompt: &str) -> anyhow::Result<String>;
}

#[async_trait]
pub trait TtsProvider: ProviderBase {
    /// Synthesize text into opus frames.
    async fn synthesize(&mut self, text: &str) -> anyhow::Result<Vec<Vec<u8>>>;
}

pub type BoxedVad = Box<dyn VadProvider + Send>;
pub type BoxedAsr = Box<dyn AsrProvider + Send>;
pub type BoxedLlm = Box<dyn LlmProvider + Send>;
pub type BoxedTts = Box<dyn TtsProvider + Send>;

// --- null providers -------------------------------------------------------

#[derive(Default)]
pub struct NullVad;

impl ProviderBase for NullVad {}

impl VadProvider for NullVad {
    fn detect(&mut self, _samples: &[f32]) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[derive(Default)]
pub struct NullAsr {
    fed_samples: usize,
}

impl ProviderBase for NullAsr {
    fn reset_provider(&mut self) {
        self.fed_samples = 0;
    }
}

impl AsrProvider for NullAsr {
    fn feed(&mut self, samples: &[f32]) -> anyhow::Result<()> {
        self.fed_samples += samples.len();
        Ok(())
    }

    fn finalize(&mut self) -> anyhow::Result<String> {
        self.fed_samples = 0;
        Ok(String::new())
    }
}

#[derive(Default)]
pub struct NullLlm;

impl ProviderBase for NullLlm {}

#[async_trait]
impl LlmProvider for NullLlm {
    async fn complete(&mut self, prompt: &str) -> anyhow::Result<String> {
        Ok(prompt.to_string())
    }
}

#[derive(Default)]
pub struct NullTts;

impl ProviderBase for NullTts {}

/// A single DTX silence packet; enough for the device to hear "nothing".
pub const SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

#[async_trait]
impl TtsProvider for NullTts {
    async fn synthesize(&mut self, _text: &str) -> anyhow::Result<Vec<Vec<u8>>> {
        Ok(vec![SILENCE_FRAME.to_vec()])
    }
}

// --- registration ---------------------------------------------------------

fn provider_name(config: &serde_json::Value, fallback: &str) -> String {
    config
        .get("provider")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Register the four builtin resource types with their lifecycle callbacks.
/// Real providers plug in by name; unknown names fail the creator, which
/// surfaces as an acquire error on the pipeline step.
pub fn register_builtin_types(manager: &PoolManager) -> anyhow::Result<()> {
    manager.register_type::<BoxedVad>(
        resource::VAD,
        |provider, config| match provider_name(config, provider).as_str() {
            "" | "null" => Ok(Box::<NullVad>::default() as BoxedVad),
            other => anyhow::bail!("unknown vad provider: {other}"),
        },
        |p| p.is_valid(),
        |p| p.close_provider(),
        |p| {
            p.reset_provider();
            Ok(())
        },
    )?;

    manager.register_type::<BoxedAsr>(
        resource::ASR,
        |provider, config| match provider_name(config, provider).as_str() {
            "" | "null" => Ok(Box::<NullAsr>::default() as BoxedAsr),
            other => anyhow::bail!("unknown asr provider: {other}"),
        },
        |p| p.is_valid(),
        |p| p.close_provider(),
        |p| {
            p.reset_provider();
            Ok(())
        },
    )?;

    manager.register_type::<BoxedLlm>(
        resource::LLM,
        |provider, config| match provider_name(config, provider).as_str() {
            "" | "null" => Ok(Box::<NullLlm>::default() as BoxedLlm),
            other => anyhow::bail!("unknown llm provider: {other}"),
        },
        |p| p.is_valid(),
        |p| p.close_provider(),
        |p| {
            p.reset_provider();
            Ok(())
        },
    )?;

    manager.register_type::<BoxedTts>(
        resource::TTS,
        |provider, config| match provider_name(config, provider).as_str() {
            "" | "null" => Ok(Box::<NullTts>::default() as BoxedTts),
            other => anyhow::bail!("unknown tts provider: {other}"),
        },
        |p| p.is_valid(),
        |p| p.close_provider(),
        |p| {
            p.reset_provider();
            Ok(())
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_providers_behave() {
        let mut vad = NullVad;
        assert!(!vad.detect(&[0.1, 0.2]).unwrap());

        let mut asr = NullAsr::default();
        asr.feed(&[0.0; 160]).unwrap();
        assert_eq!(asr.finalize().unwrap(), "");

        let mut llm = NullLlm;
        assert_eq!(llm.complete("hi").await.unwrap(), "hi");

        let mut tts = NullTts;
        let frames = tts.synthesize("hello").await.unwrap();
        assert_eq!(frames, vec![SILENCE_FRAME.to_vec()]);
    }

    #[test]
    fn provider_name_prefers_config_field() {
        let config = serde_json::json!({ "provider": "null" });
        assert_eq!(provider_name(&config, "fallback"), "null");
        assert_eq!(provider_name(&serde_json::json!({}), "fallback"), "fallback");
    }
}
