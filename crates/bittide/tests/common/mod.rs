//! Module to share setup code for integration tests.
//!
//! Engines are created exactly like a client would create them, and wired
//! either to each other with [`bittide::loopback`] or to a fake peer driven
//! by the test through [`EngineHandle::connect_peer`].
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Once, time::Duration};

use bittide::{
    config::Config,
    descriptor::ContentDescriptor,
    engine::{ContentSource, DownloadEngine, EngineEvent, EngineHandle},
    error::Error,
    peer::WireCommand,
    storage::BLOCK_LEN,
};
use bytes::Bytes;
use tokio::{
    sync::{broadcast, mpsc},
    time::timeout,
};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Two blocks per piece.
pub const PIECE_LEN: u32 = 2 * BLOCK_LEN;

/// Two full pieces and a short last one.
pub const CONTENT_LEN: usize = 2 * PIECE_LEN as usize + 1000;

const WAIT: Duration = Duration::from_secs(10);

static TRACING: Once = Once::new();

pub fn setup_tracing() {
    TRACING.call_once(|| {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .with_test_writer()
            .without_time()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

pub struct TestContent {
    pub descriptor: ContentDescriptor,
    pub metadata: Bytes,
    pub data: Bytes,
}

impl TestContent {
    pub fn new(len: usize) -> Result<Self, Error> {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        let descriptor =
            ContentDescriptor::single_file("bittide.bin", PIECE_LEN, &data);
        let metadata = Bytes::from(descriptor.to_metadata()?);
        Ok(Self { descriptor, metadata, data: Bytes::from(data) })
    }

    pub fn seed(&self) -> ContentSource {
        ContentSource::Seed {
            metadata: self.metadata.clone(),
            data: self.data.clone(),
        }
    }

    pub fn metadata(&self) -> ContentSource {
        ContentSource::Metadata(self.metadata.clone())
    }
}

/// Short timers, so the tests don't wait on them.
pub fn config() -> Config {
    Config {
        heartbeat_ms: 50,
        rechoke_interval_secs: 1,
        piece_timeout_secs: 2,
        ..Config::default()
    }
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Spawn an engine, subscribing before it runs so no event is missed.
pub fn spawn(
    config: Config,
    source: ContentSource,
) -> Result<(EngineHandle, broadcast::Receiver<EngineEvent>), Error> {
    let (engine, handle) = DownloadEngine::new(config, source)?;
    let rx = handle.subscribe();
    tokio::spawn(engine.run());
    Ok((handle, rx))
}

/// Wait for the first event matching `pred`, skipping the others.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<EngineEvent>,
    mut pred: impl FnMut(&EngineEvent) -> bool,
) -> EngineEvent {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("the engine is gone")
                }
            }
        }
    };
    timeout(WAIT, wait).await.expect("timed out waiting for an event")
}

/// Wait for the first command matching `pred` given to a fake peer.
pub async fn wait_for_cmd(
    rx: &mut mpsc::UnboundedReceiver<WireCommand>,
    mut pred: impl FnMut(&WireCommand) -> bool,
) -> WireCommand {
    let wait = async {
        loop {
            match rx.recv().await {
                Some(cmd) if pred(&cmd) => return cmd,
                Some(_) => continue,
                None => panic!("the engine closed the peer"),
            }
        }
    };
    timeout(WAIT, wait).await.expect("timed out waiting for a command")
}
