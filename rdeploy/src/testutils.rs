use std::sync::Mutex;

use common::progress::{ProgressSink, TransferProgress};
use transfer::{Transfer, TransferError, TransferFailure, TransferJob, TransferOutcome};

/// Records every job; hosts in `failing` end with rsync exit code 12
#[derive(Default)]
pub struct FakeTransfer {
    pub jobs: Mutex<Vec<TransferJob>>,
    pub failing: Vec<String>,
}

impl FakeTransfer {
    pub fn failing(hosts: &[&str]) -> Self {
        Self {
            failing: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .map(|job| job.host.clone())
            .collect();
        hosts.sort();
        hosts
    }
}

impl Transfer for FakeTransfer {
    async fn run(
        &self,
        job: TransferJob,
        progress: &dyn ProgressSink,
    ) -> Result<TransferOutcome, TransferError> {
        self.jobs.lock().unwrap().push(job.clone());
        for processed in 1..=20 {
            progress.update(TransferProgress {
                processed,
                expected: Some(20),
            });
            tokio::task::yield_now().await;
        }
        if self.failing.contains(&job.host) {
            return Ok(TransferOutcome {
                raw_exit_code: 12,
                attempts: 1,
                failure: Some(TransferFailure::ExitCode(12)),
                ..Default::default()
            });
        }
        Ok(TransferOutcome {
            success: true,
            files_transferred: 20,
            attempts: 1,
            ..Default::default()
        })
    }
}
