pub mod ingestion;
pub mod scheduler;
pub mod voice_worker;

pub use ingestion::DataIngestion;
pub use scheduler::{CycleHealth, CycleWorker, Schedule, SchedulerStatus, WorkerIntervals, WorkerScheduler};
pub use voice_worker::VoiceWorker;
