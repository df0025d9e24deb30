//! Reconciler (C7): syncs local WireGuard peer state from the CRDT
//! registry, as a one-shot pass or a long-lived watcher.

use std::{sync::Arc, time::Duration};

use ployz_shared::{config::NetworkConfig, error::Error};
use tokio::sync::watch;

use crate::{
    adapter::PlatformAdapter,
    registry::{MachineEvent, RegistryClient},
    state::{PeerRecord, State, StateStore},
};

/// Debounce window for coalescing bursts of subscription events before
/// re-running the full reconcile pass.
const DEBOUNCE: Duration = Duration::from_millis(200);

pub struct Reconciler {
    store: Arc<StateStore>,
    registry: RegistryClient,
    adapter: Arc<dyn PlatformAdapter>,
}

impl Reconciler {
    pub fn new(store: Arc<StateStore>, registry: RegistryClient, adapter: Arc<dyn PlatformAdapter>) -> Self {
        Self { store, registry, adapter }
    }

    /// Runs one reconcile pass for `cfg.network` and returns the number of
    /// peers applied.
    pub async fn reconcile(&self, cfg: &NetworkConfig) -> Result<usize, Error> {
        let mut state = self
            .store
            .load_state(&cfg.network)?
            .ok_or_else(|| Error::Precondition(format!("network {:?} not initialized", cfg.network)))?;

        self.registry.ensure_tables().await?;
        self.registry
            .ensure_network_cidr(Some(state.cidr), None, state.cidr)
            .await?;

        self.registry
            .upsert_machine(
                &state.wg_public.to_base64(),
                &state.wg_public.to_base64(),
                state.subnet,
                state.management,
                state.advertise.as_deref(),
                0,
            )
            .await?;

        let peers = self.peers_from_registry(&state).await?;
        state.peers = peers;
        self.store.save_state(&state)?;

        self.adapter.configure_wireguard(&state, &state.peers).await?;
        Ok(state.peers.len())
    }

    async fn peers_from_registry(&self, state: &State) -> Result<Vec<PeerRecord>, Error> {
        let rows = self.registry.list_machines().await?;
        let self_id = state.wg_public.to_base64();

        Ok(rows
            .into_iter()
            .filter(|row| row.public_key != self_id)
            .map(|row| {
                let management = ployz_shared::identity::derive_management_ip(&row_public_key(&row));
                PeerRecord {
                    public_key: row.public_key,
                    subnet: row.subnet,
                    management,
                    endpoint: row.endpoint,
                }
            })
            .collect())
    }

    /// Runs `reconcile` once, then subscribes to registry changes and
    /// re-runs it on every coalesced burst until `cancel` fires.
    pub async fn watch(&self, cfg: &NetworkConfig, cancel: watch::Receiver<bool>) -> Result<(), Error> {
        self.reconcile(cfg).await?;

        loop {
            if *cancel.borrow() {
                return Ok(());
            }

            let (_, mut events) = self.registry.subscribe_machines(cancel.clone()).await?;

            loop {
                let Some(first) = events.recv().await else { break };
                if matches!(first, MachineEvent::Resync) && *cancel.borrow() {
                    return Ok(());
                }

                tokio::time::sleep(DEBOUNCE).await;
                while events.try_recv().is_ok() {}

                if let Err(e) = self.reconcile(cfg).await {
                    log::warn!("reconcile for {:?} failed: {e}", cfg.network);
                }

                if *cancel.borrow() {
                    return Ok(());
                }
            }

            if *cancel.borrow() {
                return Ok(());
            }
            log::warn!("registry subscription for {:?} closed, re-subscribing", cfg.network);
        }
    }
}

fn row_public_key(row: &crate::registry::MachineRow) -> wireguard_control::Key {
    wireguard_control::Key::from_base64(&row.public_key).unwrap_or_else(|_| wireguard_control::Key::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_window_is_approximately_200ms() {
        assert_eq!(DEBOUNCE, Duration::from_millis(200));
    }
}
