//! In-process transport that wires two engines to each other.
//!
//! Each side's [`WireCommand`]s are delivered to the other side as the
//! matching [`WireEvent`]s, which is enough to move a torrent between two
//! engines without sockets. The link lives until one of the engines closes
//! the peer or is destroyed.
use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{
    engine::EngineHandle,
    error::Error,
    peer::{PeerLink, WireCommand, WireEvent},
};

/// Connect `a`, reachable at `addr_a`, with `b`, reachable at `addr_b`.
pub async fn connect(
    a: &EngineHandle,
    addr_a: SocketAddr,
    b: &EngineHandle,
    addr_b: SocketAddr,
) -> Result<(), Error> {
    // b as seen by a, and a as seen by b
    let (b_in_a, from_a) = a.connect_peer(addr_b, true).await?;
    let (a_in_b, from_b) = match b.connect_peer(addr_a, true).await {
        Ok(link) => link,
        Err(e) => {
            let _ = b_in_a.send(WireEvent::Close).await;
            return Err(e);
        }
    };

    tokio::spawn(pump(from_a, a_in_b.clone(), b_in_a.clone()));
    tokio::spawn(pump(from_b, b_in_a, a_in_b));
    Ok(())
}

/// Deliver the commands of one engine to the other. `remote` is how the
/// other engine sees us, `local` is how our engine sees the other.
async fn pump(
    mut commands: mpsc::UnboundedReceiver<WireCommand>,
    remote: PeerLink,
    local: PeerLink,
) {
    while let Some(cmd) = commands.recv().await {
        let event = match cmd {
            WireCommand::Request { block, reply } => {
                WireEvent::Request { block, reply }
            }
            WireCommand::Have(index) => WireEvent::Have(index),
            WireCommand::Bitfield(bitfield) => WireEvent::Bitfield(bitfield),
            WireCommand::Choke => WireEvent::Choke,
            WireCommand::Unchoke => WireEvent::Unchoke,
            WireCommand::Interested => WireEvent::Interested,
            WireCommand::NotInterested => WireEvent::NotInterested,
            WireCommand::Port(port) => WireEvent::Port(port),
            WireCommand::FetchMetadata => {
                let (otx, orx) = oneshot::channel();
                if remote.send(WireEvent::MetadataRequest(otx)).await.is_err() {
                    break;
                }
                // the answer is for our own engine
                if let Ok(Some(metadata)) = orx.await {
                    let _ = local.send(WireEvent::Metadata(metadata)).await;
                }
                continue;
            }
            // the peer on the other side answers immediately, there is
            // nothing in flight to cancel
            WireCommand::Cancel(_)
            | WireCommand::SetRequestTimeout(_)
            | WireCommand::SetKeepAlive(_) => continue,
            WireCommand::Close => break,
        };
        if remote.send(event).await.is_err() {
            break;
        }
    }

    debug!("loopback {} -> {} closed", local.addr, remote.addr);
    let _ = remote.send(WireEvent::Close).await;
    let _ = local.send(WireEvent::Close).await;
}
