//! Channel reconciliation: records newly listed remote videos as `new`.
//!
//! Known videos are never touched, and videos that vanish from the remote
//! listing are kept.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::model::{Channel, ChannelId, RemoteVideo};
use crate::service::ServiceRegistry;
use crate::store::RecordStore;

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<RecordStore>,
    services: Arc<ServiceRegistry>,
}

impl Reconciler {
    pub fn new(store: Arc<RecordStore>, services: Arc<ServiceRegistry>) -> Self {
        Self { store, services }
    }

    pub async fn reconcile_by_id(&self, channel_id: ChannelId) -> CoreResult<usize> {
        let channel = self
            .store
            .get_channel(channel_id)
            .await?
            .ok_or_else(|| CoreError::channel_not_found(channel_id))?;
        self.reconcile(&channel).await
    }

    /// Returns the number of videos created. An adapter failure aborts before
    /// anything is written; a store failure midway keeps the rows already
    /// inserted.
    pub async fn reconcile(&self, channel: &Channel) -> CoreResult<usize> {
        let adapter = self.services.require(&channel.service)?;
        let listing = match adapter.list_videos(&channel.chanid).await {
            Ok(listing) => listing,
            Err(err) => {
                tracing::warn!(
                    channel_id = channel.id,
                    chanid = %channel.chanid,
                    service = %channel.service,
                    error = %err,
                    "channel listing failed"
                );
                return Err(err.into());
            }
        };

        let created = match self.record_new(channel.id, &listing).await {
            Ok(created) => created,
            Err(err) => {
                tracing::error!(
                    channel_id = channel.id,
                    chanid = %channel.chanid,
                    error = %err,
                    "recording listed videos failed"
                );
                return Err(err.into());
            }
        };

        tracing::info!(
            channel_id = channel.id,
            chanid = %channel.chanid,
            listed = listing.len(),
            created,
            "channel reconciled"
        );
        Ok(created)
    }

    async fn record_new(
        &self,
        channel: ChannelId,
        listing: &[RemoteVideo],
    ) -> anyhow::Result<usize> {
        let mut known: HashSet<String> = self.store.external_ids(channel).await?;
        let mut created = 0;
        for remote in listing {
            if !known.insert(remote.external_id.clone()) {
                continue;
            }
            // A concurrent refresh of the same channel may have inserted it
            // since `known` was read.
            if self
                .store
                .insert_video_if_absent(channel, remote)
                .await?
                .is_some()
            {
                created += 1;
            }
        }
        Ok(created)
    }
}
