use std::sync::{Arc, Mutex};

use tokio::task::AbortHandle;

use super::{compute_meter, EvalContext, MeterConfiguration, MetricResult};
use crate::error::{Error, Result};
use crate::store::AggregationClient;

#[derive(Default)]
struct SessionState {
    generation: u64,
    in_flight: Option<AbortHandle>,
}

/// Evaluates one meter at a time: starting a new evaluation aborts the one
/// in flight, whose caller receives [`Error::Superseded`].
#[derive(Clone)]
pub struct MeterSession {
    client: AggregationClient,
    state: Arc<Mutex<SessionState>>,
}

impl MeterSession {
    pub fn new(client: AggregationClient) -> Self {
        Self {
            client,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub async fn evaluate(
        &self,
        config: MeterConfiguration,
        ctx: EvalContext,
    ) -> Result<MetricResult> {
        let (generation, handle) = {
            let mut state = self.lock()?;
            state.generation += 1;
            if let Some(previous) = state.in_flight.take() {
                log::warn!("superseding in-flight {} meter evaluation", config.mode());
                previous.abort();
            }
            let client = self.client.clone();
            let handle = tokio::spawn(async move { compute_meter(&client, &config, &ctx).await });
            state.in_flight = Some(handle.abort_handle());
            (state.generation, handle)
        };

        let outcome = handle.await;

        let mut state = self.lock()?;
        if state.generation != generation {
            return Err(Error::Superseded);
        }
        state.in_flight = None;
        match outcome {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Superseded),
            Err(e) => Err(Error::Other(format!("meter evaluation task failed: {e}"))),
        }
    }

    /// Abort the in-flight evaluation, if any.
    pub fn cancel(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.generation += 1;
        if let Some(handle) = state.in_flight.take() {
            handle.abort();
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| Error::Other("meter session lock poisoned".into()))
    }
}
