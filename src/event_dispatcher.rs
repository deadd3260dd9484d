use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;


/// Callbacks through which the endpoint surfaces transfer lifecycle events to
///  application code. Wire-level trouble never shows up here - only the three
///  outcomes a transfer can have.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventDispatcher: Send + Sync + 'static {
    /// One complete transfer was received and reassembled.
    async fn on_message(&self, payload: Vec<u8>, from: SocketAddr, transfer_id: u32);

    /// A sent transfer was acknowledged by the peer.
    async fn on_drain(&self, transfer_id: u32, peer: SocketAddr);

    /// A sent transfer was abandoned after repeated silent waits.
    async fn on_timeout(&self, transfer_id: u32, peer: SocketAddr);
}
