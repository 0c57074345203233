//! An in-process transport which connects coordinators running on the same runtime.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{PeerTransport, TransportError};
use crate::{
    common::{PredictRequest, PredictResponse, TrainRequest, TrainResponse, ValidateRequest},
    coordinator::CoordinatorHandle,
};

/// Routes peer requests to the handles of registered coordinators, keyed by their address.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    parties: Arc<RwLock<HashMap<String, CoordinatorHandle>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a coordinator reachable under its address.
    pub async fn register(&self, handle: CoordinatorHandle) {
        debug!("{} joined the network", handle.address());
        self.parties
            .write()
            .await
            .insert(handle.address().to_string(), handle);
    }

    /// Makes a coordinator unreachable. Requests to it fail from now on.
    pub async fn disconnect(&self, host: &str) {
        if self.parties.write().await.remove(host).is_some() {
            debug!("{} left the network", host);
        }
    }

    async fn party(&self, host: &str) -> Result<CoordinatorHandle, TransportError> {
        self.parties
            .read()
            .await
            .get(host)
            .cloned()
            .ok_or_else(|| anyhow!("host {} is unreachable", host))
    }
}

#[async_trait]
impl PeerTransport for LocalNetwork {
    async fn train(&self, host: &str, req: TrainRequest) -> Result<TrainResponse, TransportError> {
        let party = self.party(host).await?;
        party
            .train(req)
            .await
            .with_context(|| format!("{} refused the training round", host))
    }

    async fn predict(
        &self,
        host: &str,
        req: PredictRequest,
    ) -> Result<PredictResponse, TransportError> {
        let party = self.party(host).await?;
        party
            .predict(req)
            .await
            .with_context(|| format!("{} refused the prediction round", host))
    }

    async fn validate(&self, host: &str, req: ValidateRequest) -> Result<(), TransportError> {
        let party = self.party(host).await?;
        party
            .validate(req)
            .await
            .with_context(|| format!("{} refused the evaluation report", host))
    }
}
