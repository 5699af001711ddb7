use crate::types::NodeId;

/// Network abstraction for the runtime.
///
/// The concrete transport — a QUIC/WebRTC byte pipe, a bootstrap signaling
/// relay, anything capable of moving opaque bytes between node IDs — lives
/// entirely outside this crate. The runtime only depends on this trait, so
/// swapping transports (or driving the whole protocol against an in-memory
/// mock in tests) never touches protocol logic.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to a target node.
    async fn send_raw(&self, target: NodeId, data: &[u8]) -> Result<(), String>;

    /// Receive the next raw frame delivered to this node.
    async fn recv_raw(&self) -> Result<(NodeId, Vec<u8>), String>;

    /// List peers currently reachable through this transport.
    async fn connected_peers(&self) -> Vec<NodeId>;
}

/// In-memory `Transport` — the crate's own test suite runs entirely against
/// this implementation, with no real socket anywhere in the loop.
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::sync::mpsc;

    pub struct MockTransport {
        sent: Arc<Mutex<Vec<(NodeId, Vec<u8>)>>>,
        peers: Arc<Mutex<Vec<NodeId>>>,
        fail_sends: Arc<Mutex<bool>>,
        inbound_tx: mpsc::UnboundedSender<(NodeId, Vec<u8>)>,
        inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<(NodeId, Vec<u8>)>>,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockTransport {
        pub fn new() -> Self {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
                peers: Arc::new(Mutex::new(Vec::new())),
                fail_sends: Arc::new(Mutex::new(false)),
                inbound_tx,
                inbound_rx: AsyncMutex::new(inbound_rx),
            }
        }

        pub fn sent(&self) -> Vec<(NodeId, Vec<u8>)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn set_peers(&self, peers: Vec<NodeId>) {
            *self.peers.lock().unwrap() = peers;
        }

        pub fn set_fail_sends(&self, fail: bool) {
            *self.fail_sends.lock().unwrap() = fail;
        }

        pub fn clear_sent(&self) {
            self.sent.lock().unwrap().clear();
        }

        /// Feed a raw inbound frame as if it had arrived from `from`.
        pub fn inject_inbound(&self, from: NodeId, data: Vec<u8>) {
            let _ = self.inbound_tx.send((from, data));
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn send_raw(&self, target: NodeId, data: &[u8]) -> Result<(), String> {
            if *self.fail_sends.lock().unwrap() {
                return Err("mock: send failed".to_string());
            }
            self.sent.lock().unwrap().push((target, data.to_vec()));
            Ok(())
        }

        async fn recv_raw(&self) -> Result<(NodeId, Vec<u8>), String> {
            self.inbound_rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| "mock: channel closed".to_string())
        }

        async fn connected_peers(&self) -> Vec<NodeId> {
            self.peers.lock().unwrap().clone()
        }
    }
}
