//! Wires configured portals, bridge registration and tunnel listeners together.

use anyhow::{Context, Result};
use h2_tunnel_common::ListenAddr;
use h2_tunnel_common::constants::PORTAL_BACKLOG;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::HubConfig;
use crate::connection::ConnHandler;
use crate::listener::{Listener, TransportMode, listen};
use crate::lock::{FileLock, FileLocker};
use crate::reverse::{DynamicPicker, Portal, PortalHandler, Registrar, TcpInbound, inbound_channel};

/// A running hub
pub struct Hub {
    listeners: Vec<Listener>,
    portals: Vec<Portal>,
    registrars: HashMap<String, Registrar>,
    pickers: HashMap<String, Arc<DynamicPicker>>,
    sweepers: CancellationToken,
}

impl Hub {
    /// Bind everything in `config`; any bind failure aborts startup.
    pub async fn start(config: &HubConfig) -> Result<Self> {
        config.validate()?;

        let sweepers = CancellationToken::new();
        // stops sweepers already spawned if startup fails part way
        let startup = sweepers.clone().drop_guard();
        let mut hub = Self {
            listeners: Vec::new(),
            portals: Vec::new(),
            registrars: HashMap::new(),
            pickers: HashMap::new(),
            sweepers: sweepers.clone(),
        };
        let mut handlers: HashMap<String, PortalHandler> = HashMap::new();

        for entry in &config.portals {
            let picker = Arc::new(DynamicPicker::new(entry.worker_idle_timeout()));
            tokio::spawn(
                picker
                    .clone()
                    .run_sweeper(entry.sweep_interval(), sweepers.child_token()),
            );

            let registrar = Registrar::bind(
                entry.registration,
                picker.clone(),
                entry.max_streams_per_worker,
            )
            .await
            .with_context(|| format!("portal {}: failed to bind registration", entry.tag))?;

            let (handler, inbound) = inbound_channel(entry.tag.clone(), PORTAL_BACKLOG);
            hub.portals
                .push(Portal::start(entry.tag.clone(), inbound, picker.clone()));
            handlers.insert(entry.tag.clone(), handler);

            if let Some(addr) = entry.inbound {
                let tcp = TcpInbound::bind(addr)
                    .await
                    .with_context(|| format!("portal {}: failed to bind inbound {addr}", entry.tag))?;
                info!(portal = %entry.tag, addr = %tcp.local_addr()?, "accepting plain TCP inbound");
                hub.portals
                    .push(Portal::start(entry.tag.clone(), tcp, picker.clone()));
            }

            hub.registrars.insert(entry.tag.clone(), registrar);
            hub.pickers.insert(entry.tag.clone(), picker);
        }

        for entry in &config.listeners {
            let handler = handlers
                .get(&entry.portal)
                .cloned()
                .with_context(|| format!("unknown portal {}", entry.portal))?;
            let mode = TransportMode::from_settings(&entry.settings)
                .with_context(|| format!("listener {}: invalid TLS settings", entry.listen))?;

            let locker = match &entry.listen {
                ListenAddr::Unix(path) => {
                    let lock = FileLock::acquire(path)
                        .with_context(|| format!("socket {} is locked by another process", path.display()))?;
                    Some(Box::new(lock) as Box<dyn FileLocker>)
                }
                ListenAddr::Tcp(_) => None,
            };

            let listener = listen(
                entry.listen.clone(),
                entry.settings.clone(),
                mode,
                Arc::new(handler) as Arc<dyn ConnHandler>,
                locker,
            )
            .await
            .with_context(|| format!("failed to start listener {}", entry.listen))?;
            hub.listeners.push(listener);
        }

        startup.disarm();
        info!(
            portals = config.portals.len(),
            listeners = hub.listeners.len(),
            "hub started"
        );
        Ok(hub)
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn registration_addr(&self, tag: &str) -> Option<SocketAddr> {
        self.registrars.get(tag).map(Registrar::local_addr)
    }

    pub fn picker(&self, tag: &str) -> Option<&Arc<DynamicPicker>> {
        self.pickers.get(tag)
    }

    /// Stop listeners and registration first, drain workers while portals
    /// finish their relays, then close every worker.
    pub async fn shutdown(self) {
        for listener in &self.listeners {
            if let Err(e) = listener.close() {
                warn!(addr = %listener.addr(), error = %e, "failed to release listener lock");
            }
        }
        for registrar in self.registrars.values() {
            registrar.close();
        }
        for picker in self.pickers.values() {
            picker.drain_all();
        }
        for portal in &self.portals {
            portal.close().await;
        }
        self.sweepers.cancel();
        for picker in self.pickers.values() {
            picker.close_all();
        }
        info!("hub stopped");
    }
}
