use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::{ProviderError, Result};

/// One queued synthesis request. `voice_ref` ties the result back to its trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceJob {
    pub voice_ref: String,
    pub script_ref: String,
    pub text: String,
    pub voice_type: String,
}

#[async_trait]
pub trait VoiceSynthesizer: Send + Sync {
    /// Returns a reference to the produced audio.
    async fn synthesize(&self, job: &VoiceJob) -> std::result::Result<String, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct SynthesisResponse {
    #[serde(alias = "audioUrl", alias = "audio_url")]
    audio_ref: String,
}

pub struct HttpVoiceSynthesizer {
    client: reqwest::Client,
    url: String,
}

impl HttpVoiceSynthesizer {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl VoiceSynthesizer for HttpVoiceSynthesizer {
    async fn synthesize(&self, job: &VoiceJob) -> std::result::Result<String, ProviderError> {
        let resp = self.client.post(&self.url).json(job).send().await?;
        if !resp.status().is_success() {
            return Err(ProviderError::Request(format!("voice API returned {}", resp.status())));
        }
        let body: SynthesisResponse = resp.json().await?;
        debug!(voice_ref = %job.voice_ref, audio_ref = %body.audio_ref, "Voice synthesized");
        Ok(body.audio_ref)
    }
}

/// Names the audio file after the script without calling anything.
pub struct LocalVoiceSynthesizer;

#[async_trait]
impl VoiceSynthesizer for LocalVoiceSynthesizer {
    async fn synthesize(&self, job: &VoiceJob) -> std::result::Result<String, ProviderError> {
        Ok(format!("audio/{}.mp3", job.script_ref))
    }
}

/// FIFO between trigger cycles (many producers) and the voice worker (one consumer).
pub struct VoiceQueue {
    tx: mpsc::UnboundedSender<VoiceJob>,
    rx: Mutex<mpsc::UnboundedReceiver<VoiceJob>>,
    len: AtomicUsize,
}

impl VoiceQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Mutex::new(rx), len: AtomicUsize::new(0) }
    }

    /// Never waits on synthesis.
    pub fn enqueue(&self, job: VoiceJob) {
        // Counted before the send so a concurrent drain never sees an uncounted job.
        self.len.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(job).is_err() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Everything queued right now, oldest first.
    pub async fn drain(&self) -> Vec<VoiceJob> {
        let mut rx = self.rx.lock().await;
        let mut jobs = Vec::new();
        while let Ok(job) = rx.try_recv() {
            jobs.push(job);
        }
        let _ = self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(jobs.len())));
        jobs
    }
}

impl Default for VoiceQueue {
    fn default() -> Self {
        Self::new()
    }
}
