//! One running node: listeners, network and coordinator wired together.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use loft_core::{Deflate, PayloadCompressor, PeerId, TransferCoordinator};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::store::{DirStore, LogSink};
use crate::transport::Network;

pub struct Node {
    pub network: Arc<Network>,
    pub coordinator: Arc<TransferCoordinator>,
    pub control_addr: SocketAddr,
}

impl Node {
    /// Bind listeners and start accepting. Serves from and installs into `data_dir`.
    pub async fn start(cfg: &Config) -> anyhow::Result<Node> {
        let control = TcpListener::bind((cfg.bind_addr, cfg.control_port))
            .await
            .with_context(|| format!("binding control port {}", cfg.control_port))?;
        let streams = if cfg.streams {
            let listener = TcpListener::bind((cfg.bind_addr, cfg.stream_port))
                .await
                .with_context(|| format!("binding stream port {}", cfg.stream_port))?;
            Some(listener)
        } else {
            None
        };
        let stream_port = match &streams {
            Some(listener) => Some(listener.local_addr()?.port()),
            None => None,
        };

        let network = Arc::new(Network::new(PeerId::generate(), stream_port));
        let store = Arc::new(DirStore::new(cfg.data_dir.clone()));
        let compressor = PayloadCompressor::new(
            store.clone(),
            Arc::new(Deflate::default()),
            cfg.transfer.compress,
        );
        let mut coordinator = TransferCoordinator::new(cfg.transfer.clone(), network.clone())
            .with_compressor(Arc::new(compressor))
            .with_install_sink(store)
            .with_progress_sink(Arc::new(LogSink));
        if stream_port.is_some() {
            coordinator = coordinator.with_streams(network.clone());
        }
        let coordinator = Arc::new(coordinator);
        network.attach_coordinator(&coordinator);

        let control_addr = control.local_addr()?;
        tokio::spawn(network.clone().run_control_listener(control));
        if let Some(listener) = streams {
            tokio::spawn(network.clone().run_stream_listener(listener));
        }
        info!(
            node = %network.node_id(),
            %control_addr,
            stream_port = ?stream_port,
            data_dir = %cfg.data_dir.display(),
            "node started"
        );
        Ok(Node {
            network,
            coordinator,
            control_addr,
        })
    }

    /// Cancel every active session, waiting up to the configured ack timeout for each.
    pub async fn cancel_all(&self) {
        let timeout = self.coordinator.config().cancel_ack_timeout();
        for session in self.coordinator.sessions() {
            self.coordinator
                .cancel(session.key.peer, session.key.id, timeout)
                .await;
        }
    }
}
