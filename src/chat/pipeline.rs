//! Provider plumbing for one utterance.
//!
//! Every step borrows its provider from the pool and releases it on every
//! exit path. A step that cannot acquire or errors records the failure and
//! degrades: the device hears the canned fallback instead of the session
//! dying.

use crate::core::config::Config;
use crate::pool::{
    resource_types, BoxedAsr, BoxedLlm, BoxedTts, BoxedVad, PoolManager, SILENCE_FRAME,
};

/// Spoken when a pipeline step failed and there is nothing better to say.
pub const FALLBACK_PHRASE: &str = "Sorry, something went wrong. Please try again.";

#[derive(Debug, Clone)]
pub struct Selection {
    pub provider: String,
    pub config: serde_json::Value,
}

impl Selection {
    fn from_section(section: &serde_json::Value) -> Self {
        let provider = section
            .get("provider")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("null")
            .to_string();
        Self {
            provider,
            config: section.clone(),
        }
    }
}

/// Which provider serves each pipeline step for a session.
#[derive(Debug, Clone)]
pub struct ProviderSelection {
    pub vad: Selection,
    pub asr: Selection,
    pub llm: Selection,
    pub tts: Selection,
}

impl ProviderSelection {
    pub fn from_config(config: &Config) -> Self {
        Self {
            vad: Selection::from_section(&config.vad),
            asr: Selection::from_section(&config.asr),
            llm: Selection::from_section(&config.llm),
            tts: Selection::from_section(&config.tts),
        }
    }
}

fn fallback_frames() -> Vec<Vec<u8>> {
    vec![SILENCE_FRAME.to_vec()]
}

/// Voice-activity check over one frame of normalized samples.
pub async fn detect_speech(
    pools: &PoolManager,
    selection: &ProviderSelection,
    samples: &[f32],
) -> bool {
    let mut vad = match pools
        .acquire::<BoxedVad>(resource_types::VAD, &selection.vad.provider, &selection.vad.config)
        .await
    {
        Ok(handle) => handle,
        Err(err) => {
            tracing::warn!("vad acquire failed: {err}");
            return false;
        }
    };
    let speech = match vad.detect(samples) {
        Ok(speech) => speech,
        Err(err) => {
            tracing::warn!("vad detect failed: {err}");
            false
        }
    };
    if let Err(err) = pools.release(vad) {
        tracing::warn!("vad release failed: {err}");
    }
    speech
}

/// Run the utterance's samples through ASR. `None` means the step failed
/// and the caller should fall back.
pub async fn transcribe(
    pools: &PoolManager,
    selection: &ProviderSelection,
    samples: &[f32],
) -> Option<String> {
    let mut asr = match pools
        .acquire::<BoxedAsr>(resource_types::ASR, &selection.asr.provider, &selection.asr.config)
        .await
    {
        Ok(handle) => handle,
        Err(err) => {
            tracing::warn!("asr acquire failed: {err}");
            return None;
        }
    };
    let transcript = (|| {
        asr.feed(samples)?;
        asr.finalize()
    })();
    if let Err(err) = pools.release(asr) {
        tracing::warn!("asr release failed: {err}");
    }
    match transcript {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::warn!("asr failed: {err}");
            None
        }
    }
}

/// LLM + TTS for one user utterance. Never fails: provider errors degrade
/// to the fallback phrase, and a TTS failure degrades to silence frames.
pub async fn respond(
    pools: &PoolManager,
    selection: &ProviderSelection,
    text: &str,
    skip_llm: bool,
) -> Vec<Vec<u8>> {
    let reply = if skip_llm {
        text.to_string()
    } else {
        let mut llm = match pools
            .acquire::<BoxedLlm>(resource_types::LLM, &selection.llm.provider, &selection.llm.config)
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!("llm acquire failed: {err}");
                return synthesize(pools, selection, FALLBACK_PHRASE).await;
            }
        };
        let completion = llm.complete(text).await;
        if let Err(err) = pools.release(llm) {
            tracing::warn!("llm release failed: {err}");
        }
        match completion {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!("llm completion failed: {err}");
                FALLBACK_PHRASE.to_string()
            }
        }
    };
    synthesize(pools, selection, &reply).await
}

async fn synthesize(pools: &PoolManager, selection: &ProviderSelection, text: &str) -> Vec<Vec<u8>> {
    let mut tts = match pools
        .acquire::<BoxedTts>(resource_types::TTS, &selection.tts.provider, &selection.tts.config)
        .await
    {
        Ok(handle) => handle,
        Err(err) => {
            tracing::warn!("tts acquire failed: {err}");
            return fallback_frames();
        }
    };
    let frames = tts.synthesize(text).await;
    if let Err(err) = pools.release(tts) {
        tracing::warn!("tts release failed: {err}");
    }
    match frames {
        Ok(frames) => frames,
        Err(err) => {
            tracing::warn!("tts failed: {err}");
            fallback_frames()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PoolSettings;
    use crate::pool::register_builtin_types;
    use std::sync::Arc;

    fn pools() -> Arc<PoolManager> {
        let manager = Arc::new(PoolManager::new(&PoolSettings::default()));
        register_builtin_types(&manager).unwrap();
        manager
    }

    fn null_selection() -> ProviderSelection {
        let config = Config::default();
        ProviderSelection::from_config(&config)
    }

    #[tokio::test]
    async fn respond_round_trips_through_null_providers() {
        let pools = pools();
        let frames = respond(&pools, &null_selection(), "hello", false).await;
        assert_eq!(frames, vec![SILENCE_FRAME.to_vec()]);
    }

    #[tokio::test]
    async fn unknown_provider_degrades_not_dies() {
        let pools = pools();
        let mut selection = null_selection();
        selection.llm.provider = "no-such-llm".to_string();
        // LLM acquire fails; the fallback still synthesizes via TTS.
        let frames = respond(&pools, &selection, "hello", false).await;
        assert_eq!(frames, vec![SILENCE_FRAME.to_vec()]);
    }

    #[tokio::test]
    async fn transcribe_with_null_asr_is_empty() {
        let pools = pools();
        let text = transcribe(&pools, &null_selection(), &[0.0f32; 320]).await;
        assert_eq!(text.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn detect_speech_null_is_quiet() {
        let pools = pools();
        assert!(!detect_speech(&pools, &null_selection(), &[0.5; 160]).await);
    }
}
