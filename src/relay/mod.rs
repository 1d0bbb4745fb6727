//! Stream and datagram relay over an established connection.

mod datagram;
mod stream;

pub use datagram::{AssociationTable, PacketSender, UdpAssociation};
pub use stream::{Lease, StreamConn};

use tokio::io::AsyncWriteExt;

use crate::core::{QuicConnection, Result};
use crate::protocol::Command;

/// Send `command` on its own unidirectional stream and finish the stream.
pub(crate) async fn send_uni<C: QuicConnection>(conn: &C, command: &Command) -> Result<()> {
    let bytes = command.to_bytes()?;
    let mut stream = conn.open_uni().await?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;
    Ok(())
}
