use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{CloseStatus, SubProtocol};
use crate::security::SecurityContext;

// One accepted WebSocket as seen by the subscription core. Implemented by the
// transport that accepted the upgrade.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    // Sub-protocol agreed during the handshake
    fn protocol(&self) -> SubProtocol;

    fn security_context(&self) -> &SecurityContext;

    // Writes one text frame
    async fn send_message(&self, text: String) -> Result<()>;

    // Sends a close frame and ends the connection
    async fn close(&self, status: CloseStatus) -> Result<()>;
}
