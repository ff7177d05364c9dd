use std::net::{IpAddr, Ipv4Addr};

use bittide::{
    blocklist::BlockRange,
    config::Config,
    descriptor::InfoHash,
    engine::{ContentSource, EngineEvent, MAX_UNKNOWN_PIECES},
    error::Error,
    peer::{BlockInfo, WireCommand, WireEvent},
    storage::{BLOCK_LEN, MAX_BLOCK_LEN},
};
use tokio::sync::oneshot;

mod common;
use common::{addr, TestContent, CONTENT_LEN};

#[tokio::test]
async fn blocked_peers_are_refused() -> Result<(), Error> {
    common::setup_tracing();
    let content = TestContent::new(CONTENT_LEN)?;
    let config = Config {
        blocklist: vec![BlockRange::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 255)),
            "test range",
        )],
        ..common::config()
    };
    let (engine, mut rx) = common::spawn(config, content.metadata())?;

    let blocked = "10.0.0.7:6881".parse().expect("valid address");
    let r = engine.add_peer(blocked).await;
    assert!(matches!(r, Err(Error::PeerBlocked { .. })));
    let event = common::wait_for(&mut rx, |e| {
        matches!(e, EngineEvent::BlockedPeer { .. })
    })
    .await;
    assert_eq!(
        event,
        EngineEvent::BlockedPeer { addr: blocked, reason: "test range".into() }
    );
    assert!(matches!(
        engine.connect_peer(blocked, false).await,
        Err(Error::PeerBlocked { .. })
    ));

    // allowed addresses wait in the queue until dialed
    engine.add_peer(addr(7000)).await?;
    engine.add_peer(addr(7000)).await?;
    assert_eq!(engine.queued_peers().await?, [addr(7000)]);
    common::wait_for(&mut rx, |e| {
        *e == EngineEvent::PeerQueued(addr(7000))
    })
    .await;

    engine.peer_dialing(addr(7000)).await?;
    assert!(engine.queued_peers().await?.is_empty());
    engine.peer_dial_failed(addr(7000)).await?;

    let (_link, _cmds) = engine.connect_peer(addr(7000), false).await?;
    assert_eq!(engine.stats().await?.peers, 1);

    engine.destroy(false).await?;
    // the engine is gone, or going
    assert!(engine.stats().await.is_err());
    Ok(())
}

/// A peer gets blocks only once unchoked, and only reasonable ones.
#[tokio::test]
async fn serving_requests() -> Result<(), Error> {
    common::setup_tracing();
    let content = TestContent::new(CONTENT_LEN)?;
    let (seeder, mut rx) = common::spawn(common::config(), content.seed())?;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Ready).await;

    let (link, mut cmds) = seeder.connect_peer(addr(7000), true).await?;

    // a new peer is told what we have
    let cmd = common::wait_for_cmd(&mut cmds, |c| {
        matches!(c, WireCommand::Bitfield(_))
    })
    .await;
    let WireCommand::Bitfield(bitfield) = cmd else { unreachable!() };
    assert_eq!(bitfield.count_ones(), 3);

    let block = BlockInfo::new(0, 0, BLOCK_LEN);
    let (otx, orx) = oneshot::channel();
    link.send(WireEvent::Request { block, reply: otx }).await?;
    assert!(matches!(orx.await?, Err(Error::PeerChoked)));

    link.send(WireEvent::Interested).await?;
    common::wait_for_cmd(&mut cmds, |c| {
        matches!(c, WireCommand::Unchoke)
    })
    .await;

    let (otx, orx) = oneshot::channel();
    link.send(WireEvent::Request { block, reply: otx }).await?;
    assert_eq!(orx.await??, content.data.slice(..BLOCK_LEN as usize));
    assert_eq!(seeder.stats().await?.uploaded, BLOCK_LEN as u64);

    link.send(WireEvent::Port(6999)).await?;
    let event = common::wait_for(&mut rx, |e| {
        matches!(e, EngineEvent::DhtPort { .. })
    })
    .await;
    assert_eq!(event, EngineEvent::DhtPort { addr: addr(7000), port: 6999 });

    let (otx, orx) = oneshot::channel();
    link.send(WireEvent::MetadataRequest(otx)).await?;
    assert_eq!(orx.await?, Some(content.metadata.clone()));

    // asking too much gets the peer disconnected
    let (otx, orx) = oneshot::channel();
    let huge = BlockInfo::new(0, 0, MAX_BLOCK_LEN + 1);
    link.send(WireEvent::Request { block: huge, reply: otx }).await?;
    assert!(matches!(orx.await?, Err(Error::InvalidBlockSize { .. })));
    common::wait_for_cmd(&mut cmds, |c| matches!(c, WireCommand::Close)).await;
    assert_eq!(seeder.stats().await?.peers, 0);

    seeder.destroy(false).await?;
    Ok(())
}

#[tokio::test]
async fn interest_follows_selections() -> Result<(), Error> {
    common::setup_tracing();
    let content = TestContent::new(CONTENT_LEN)?;
    let (engine, mut rx) = common::spawn(
        Config { auto_select: false, ..common::config() },
        content.metadata(),
    )?;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Ready).await;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Idle).await;

    let (_link, mut cmds) = engine.connect_peer(addr(7000), false).await?;

    engine.select(0, 1, 0, None).await?;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Interested).await;

    // selections that don't exist change nothing
    assert!(!engine.deselect(0, 1, 5).await?);
    assert!(engine.deselect(0, 1, 0).await?);
    common::wait_for(&mut rx, |e| *e == EngineEvent::Uninterested).await;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Idle).await;
    common::wait_for_cmd(&mut cmds, |c| {
        matches!(c, WireCommand::NotInterested)
    })
    .await;

    assert!(matches!(
        engine.select(0, 3, 0, None).await,
        Err(Error::InvalidRange { .. })
    ));
    assert!(matches!(
        engine.select_file(1, 0).await,
        Err(Error::InvalidFile(1))
    ));

    engine.select_file(0, 0).await?;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Interested).await;
    assert!(engine.deselect_file(0, 0).await?);

    engine.destroy(false).await?;
    Ok(())
}

#[tokio::test]
async fn nothing_to_select_without_metadata() -> Result<(), Error> {
    common::setup_tracing();
    let content = TestContent::new(CONTENT_LEN)?;
    let info_hash = InfoHash::from_metadata(&content.metadata);
    let (engine, mut rx) =
        common::spawn(common::config(), ContentSource::InfoHash(info_hash))?;

    let r = engine.select(0, 0, 0, None).await;
    assert!(matches!(r, Err(Error::NoMetadata)));
    assert!(matches!(engine.files().await, Err(Error::NoMetadata)));
    assert!(matches!(engine.read_file(0, None).await, Err(Error::NoMetadata)));

    // a peer is asked for the metadata as soon as it connects
    let (link, mut cmds) = engine.connect_peer(addr(7000), false).await?;
    common::wait_for_cmd(&mut cmds, |c| {
        matches!(c, WireCommand::FetchMetadata)
    })
    .await;

    // metadata of another torrent is refused
    let other = TestContent::new(100)?;
    link.send(WireEvent::Metadata(other.metadata.clone())).await?;
    common::wait_for(&mut rx, |e| matches!(e, EngineEvent::Warning(_))).await;
    assert!(engine.bitfield().await?.is_none());

    link.send(WireEvent::Metadata(content.metadata.clone())).await?;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Metadata).await;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Ready).await;
    assert_eq!(engine.files().await?.len(), 1);

    engine.destroy(false).await?;
    Ok(())
}

/// Haves that can't be checked yet are bounded, and kept once they make
/// sense.
#[tokio::test]
async fn haves_before_metadata() -> Result<(), Error> {
    common::setup_tracing();
    let content = TestContent::new(CONTENT_LEN)?;
    let info_hash = InfoHash::from_metadata(&content.metadata);
    let (engine, mut rx) =
        common::spawn(common::config(), ContentSource::InfoHash(info_hash))?;

    let (link, mut cmds) = engine.connect_peer(addr(7000), false).await?;
    link.send(WireEvent::Have(usize::MAX)).await?;
    link.send(WireEvent::Have(MAX_UNKNOWN_PIECES)).await?;
    link.send(WireEvent::Have(1)).await?;
    link.send(WireEvent::Unchoke).await?;

    // still alive, still connected
    assert_eq!(engine.stats().await?.peers, 1);

    link.send(WireEvent::Metadata(content.metadata.clone())).await?;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Ready).await;

    // the only piece the peer has is the one asked
    let cmd = common::wait_for_cmd(&mut cmds, |c| {
        matches!(c, WireCommand::Request { .. })
    })
    .await;
    let WireCommand::Request { block, .. } = cmd else { unreachable!() };
    assert_eq!(block.index, 1);

    engine.destroy(false).await?;
    Ok(())
}
