use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::health::HealthState;
use crate::config::{service_names, worker_names};
use crate::db::{PersistEvent, PersistHandle};
use crate::dispatch::{VoiceJob, VoiceQueue, VoiceSynthesizer};
use crate::error::Result;
use crate::state::Repository;
use crate::types::VoiceStatus;
use crate::workers::{CycleHealth, CycleWorker};

/// Single consumer of the voice queue. Each poll drains whatever is queued.
pub struct VoiceWorker {
    queue: Arc<VoiceQueue>,
    synthesizer: Arc<dyn VoiceSynthesizer>,
    repo: Arc<dyn Repository>,
    health: Arc<HealthState>,
    persist: PersistHandle,
}

impl VoiceWorker {
    pub fn new(
        queue: Arc<VoiceQueue>,
        synthesizer: Arc<dyn VoiceSynthesizer>,
        repo: Arc<dyn Repository>,
        health: Arc<HealthState>,
        persist: PersistHandle,
    ) -> Self {
        Self { queue, synthesizer, repo, health, persist }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    async fn complete(&self, job: &VoiceJob, status: VoiceStatus, audio_ref: Option<String>) -> Result<()> {
        let trigger = self
            .repo
            .update_voice_status(&job.voice_ref, status, audio_ref.clone())
            .await?;
        self.persist.send(PersistEvent::TriggerVoice { trigger_id: trigger.id, status, audio_ref });
        Ok(())
    }
}

#[async_trait]
impl CycleWorker for VoiceWorker {
    fn name(&self) -> &'static str {
        worker_names::VOICE_SYNTHESIS
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleHealth> {
        let mut jobs = self.queue.drain().await.into_iter();
        let mut failures = 0usize;
        let mut done = 0usize;

        while let Some(job) = jobs.next() {
            if cancel.is_cancelled() {
                // Requeue so nothing is lost across a stop.
                self.queue.enqueue(job);
                for rest in jobs.by_ref() {
                    self.queue.enqueue(rest);
                }
                break;
            }

            let started = Instant::now();
            let (status, audio_ref) = match self.synthesizer.synthesize(&job).await {
                Ok(audio) => {
                    self.health.record_success(service_names::VOICE_API, started.elapsed());
                    (VoiceStatus::Completed, Some(audio))
                }
                Err(e) => {
                    warn!(voice_ref = %job.voice_ref, "Voice synthesis failed: {e}");
                    self.health.record_failure(service_names::VOICE_API, &e, started.elapsed());
                    failures += 1;
                    (VoiceStatus::Failed, None)
                }
            };

            if let Err(e) = self.complete(&job, status, audio_ref).await {
                warn!(voice_ref = %job.voice_ref, "Could not record voice status: {e}");
                failures += 1;
            }
            done += 1;
        }

        if done > 0 {
            info!(processed = done, failures, "Voice queue drained");
        }
        if failures > 0 {
            Ok(CycleHealth::Degraded(format!("{failures} of {done} voice jobs failed")))
        } else {
            Ok(CycleHealth::Healthy)
        }
    }
}
