//! Post-Success Recorder. The only place a key gets recorded, and only after the processing
//! pipeline committed the message's effect.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::Error;
use crate::Result;
use crate::message::DedupKey;
use crate::primary::WindowStore;
use crate::witness::{WitnessHandle, WitnessRecord};

#[derive(Clone)]
pub struct PostSuccessRecorder<P> {
    primary: P,
    witness: WitnessHandle,
    primary_timeout: Duration,
}

impl<P: WindowStore> PostSuccessRecorder<P> {
    pub fn new(primary: P, witness: WitnessHandle, primary_timeout: Duration) -> Self {
        Self {
            primary,
            witness,
            primary_timeout,
        }
    }

    /// Records `key` in the primary store, then hands it to the witness without waiting. A primary
    /// failure is returned as [Error::PrimaryStoreUnavailable] and nothing is witnessed.
    pub async fn on_success(&self, key: &DedupKey, recorded_at: DateTime<Utc>) -> Result<()> {
        match tokio::time::timeout(self.primary_timeout, self.primary.record(key, recorded_at)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(Error::PrimaryStoreUnavailable(format!(
                    "record({key}) failed: {e}"
                )));
            }
            Err(_) => {
                return Err(Error::PrimaryStoreUnavailable(format!(
                    "record({key}) did not complete within {:?}",
                    self.primary_timeout
                )));
            }
        }

        debug!(%key, %recorded_at, "Recorded key");
        self.witness.enqueue(WitnessRecord {
            key: key.clone(),
            recorded_at,
        });
        Ok(())
    }
}
