//! Shared harness: loopback hub, peer network and per-user services

#![allow(dead_code)]

use huddle_core::loopback::{
    LoopbackChannel, LoopbackHub, LoopbackPeerNetwork, LoopbackTransport, SyntheticDevices,
};
use huddle_core::{CallConfig, CallEvent, CallService, Participant, PeerEvent, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything shared between clients
pub struct TestNet {
    pub hub: LoopbackHub,
    pub network: LoopbackPeerNetwork,
}

/// One signed-in user
pub struct TestClient {
    pub user: Participant,
    pub service: CallService<LoopbackChannel>,
    pub channel: Arc<LoopbackChannel>,
    pub devices: Arc<SyntheticDevices>,
    pub events: broadcast::Receiver<CallEvent>,
    pub peer_events: broadcast::Receiver<PeerEvent>,
}

/// Route crate logs to the test output; `RUST_LOG` overrides the default
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("huddle_core=warn")),
        )
        .with_test_writer()
        .try_init();
}

impl TestNet {
    pub fn new() -> Self {
        init_tracing();
        Self {
            hub: LoopbackHub::new(),
            network: LoopbackPeerNetwork::new(),
        }
    }

    pub async fn client(&self, id: &str, name: &str) -> TestClient {
        self.client_with(id, name, CallConfig::default(), self.network.transport())
            .await
    }

    pub async fn client_with_config(&self, id: &str, name: &str, config: CallConfig) -> TestClient {
        self.client_with(id, name, config, self.network.transport())
            .await
    }

    pub async fn client_with(
        &self,
        id: &str,
        name: &str,
        config: CallConfig,
        transport: LoopbackTransport,
    ) -> TestClient {
        let user = Participant::new(id, name);
        let channel = Arc::new(self.hub.channel());
        let devices = Arc::new(SyntheticDevices::new());
        let service = CallService::builder(user.clone())
            .with_channel(Arc::clone(&channel))
            .with_transport(Arc::new(transport))
            .with_devices(devices.clone())
            .with_config(config)
            .build()
            .unwrap();
        let events = service.subscribe_events();
        let peer_events = service.subscribe_peer_events();
        service.start().await.unwrap();

        TestClient {
            user,
            service,
            channel,
            devices,
            events,
            peer_events,
        }
    }
}

impl TestClient {
    pub fn id(&self) -> UserId {
        self.user.id.clone()
    }

    /// Wait for the first event matching `pred`, skipping others
    pub async fn expect(&mut self, pred: impl Fn(&CallEvent) -> bool) -> CallEvent {
        let events = &mut self.events;
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for call event")
    }

    /// Wait for the first peer event matching `pred`
    pub async fn expect_peer(&mut self, pred: impl Fn(&PeerEvent) -> bool) -> PeerEvent {
        let events = &mut self.peer_events;
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("peer event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for peer event")
    }
}

/// Poll `cond` until it holds
pub async fn wait_for(cond: impl Fn() -> bool) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Place a call from `caller` to `callee`, answer it and wait until both
/// sides have the other's media
pub async fn connect_pair(caller: &mut TestClient, callee: &mut TestClient, is_video: bool) {
    caller
        .service
        .call(callee.user.clone(), is_video, None)
        .await
        .unwrap();
    callee
        .expect(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    callee.service.answer().await.unwrap();

    caller
        .expect(|e| matches!(e, CallEvent::CallConnected { .. }))
        .await;
    caller
        .expect_peer(|e| matches!(e, PeerEvent::StreamReceived { .. }))
        .await;
    callee
        .expect_peer(|e| matches!(e, PeerEvent::StreamReceived { .. }))
        .await;
}
