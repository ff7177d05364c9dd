use std::{collections::HashSet, time::Duration};

use bittide::{
    bitfield::{Bitfield, BitfieldExt},
    config::Config,
    engine::{EngineEvent, EngineHandle},
    error::Error,
    peer::{BlockInfo, BlockReply, PeerLink, WireCommand, WireEvent},
    storage::BLOCK_LEN,
};
use bytes::Bytes;
use tokio::sync::mpsc;

mod common;
use common::{addr, TestContent, CONTENT_LEN, PIECE_LEN};

type Commands = mpsc::UnboundedReceiver<WireCommand>;

/// Requests never time out on their own here.
fn config() -> Config {
    Config { piece_timeout_secs: 30, ..common::config() }
}

/// Connect a fake peer that has every piece and unchokes us.
async fn seeder_peer(
    engine: &EngineHandle,
    port: u16,
) -> Result<(PeerLink, Commands), Error> {
    let (link, cmds) = engine.connect_peer(addr(port), false).await?;
    let mut bitfield = Bitfield::from_piece(3);
    bitfield.fill(true);
    link.send(WireEvent::Bitfield(bitfield)).await?;
    link.send(WireEvent::Unchoke).await?;
    Ok((link, cmds))
}

async fn next_request(cmds: &mut Commands) -> (BlockInfo, BlockReply) {
    let cmd =
        common::wait_for_cmd(cmds, |c| matches!(c, WireCommand::Request { .. }))
            .await;
    let WireCommand::Request { block, reply } = cmd else { unreachable!() };
    (block, reply)
}

/// Requests given to a peer so far. The engine handles messages in order,
/// so after any round trip to it they are all in the channel.
fn requests_so_far(cmds: &mut Commands) -> Vec<(BlockInfo, BlockReply)> {
    let mut requests = Vec::new();
    while let Ok(cmd) = cmds.try_recv() {
        if let WireCommand::Request { block, reply } = cmd {
            requests.push((block, reply));
        }
    }
    requests
}

fn bytes_of(content: &TestContent, block: &BlockInfo) -> Bytes {
    let begin = block.index * PIECE_LEN as usize + block.begin as usize;
    content.data.slice(begin..begin + block.len as usize)
}

/// A new peer gets a single request until it sends something back.
#[tokio::test]
async fn untested_peer_gets_one_request() -> Result<(), Error> {
    common::setup_tracing();
    let content = TestContent::new(CONTENT_LEN)?;
    let (engine, mut rx) = common::spawn(
        Config { endgame_threshold: 0, ..config() },
        content.metadata(),
    )?;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Ready).await;

    let (_link, mut cmds) = seeder_peer(&engine, 7000).await?;
    let (first, reply) = next_request(&mut cmds).await;
    assert_eq!(first, BlockInfo::new(0, 0, BLOCK_LEN));

    // a few heartbeats later, still the one
    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.stats().await?;
    assert!(requests_so_far(&mut cmds).is_empty());

    let _ = reply.send(Ok(bytes_of(&content, &first)));

    // the whole window opens once it delivered
    let mut blocks = Vec::new();
    let mut replies = Vec::new();
    for _ in 0..4 {
        let (block, reply) = next_request(&mut cmds).await;
        blocks.push(block);
        replies.push(reply);
    }
    blocks.sort();
    assert_eq!(
        blocks,
        [
            BlockInfo::new(0, BLOCK_LEN, BLOCK_LEN),
            BlockInfo::new(1, 0, BLOCK_LEN),
            BlockInfo::new(1, BLOCK_LEN, BLOCK_LEN),
            BlockInfo::new(2, 0, 1000),
        ]
    );

    engine.destroy(false).await?;
    Ok(())
}

/// Selections of the same high priority take turns on a full window.
#[tokio::test]
async fn equal_priorities_take_turns() -> Result<(), Error> {
    common::setup_tracing();
    let content = TestContent::new(CONTENT_LEN)?;
    let config = Config {
        auto_select: false,
        max_requests: 1,
        endgame_threshold: 0,
        ..config()
    };
    let (engine, mut rx) = common::spawn(config, content.metadata())?;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Ready).await;

    engine.select(0, 0, 1, None).await?;
    engine.select(1, 1, 1, None).await?;
    let (_link, mut cmds) = seeder_peer(&engine, 7000).await?;

    let mut asked = Vec::new();
    for _ in 0..4 {
        let (block, reply) = next_request(&mut cmds).await;
        asked.push((block.index, block.begin));
        let _ = reply.send(Ok(bytes_of(&content, &block)));
    }

    // the first one tests the peer on the last selection, then the two
    // selections alternate instead of piece 0 going first
    assert_eq!(asked, [(1, 0), (0, 0), (1, BLOCK_LEN), (0, BLOCK_LEN)]);

    // hashes may finish in any order
    let mut verified = HashSet::new();
    common::wait_for(&mut rx, |e| {
        if let EngineEvent::Piece(index) = e {
            verified.insert(*index);
        }
        verified.len() == 2
    })
    .await;
    engine.destroy(false).await?;
    Ok(())
}

/// Near the end a block may be asked from more than one peer, the first
/// answer wins and the other peers are told to forget it.
#[tokio::test]
async fn endgame_duplicates_requests() -> Result<(), Error> {
    common::setup_tracing();
    let content = TestContent::new(CONTENT_LEN)?;
    let (engine, mut rx) = common::spawn(
        Config { auto_select: false, ..config() },
        content.metadata(),
    )?;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Ready).await;
    engine.select(2, 2, 0, None).await?;

    let (_a, mut a_cmds) = seeder_peer(&engine, 7000).await?;
    let (block, _a_reply) = next_request(&mut a_cmds).await;
    assert_eq!(block, BlockInfo::new(2, 0, 1000));

    let (_b, mut b_cmds) = seeder_peer(&engine, 7001).await?;
    let (dup, b_reply) = next_request(&mut b_cmds).await;
    assert_eq!(dup, block);

    let _ = b_reply.send(Ok(bytes_of(&content, &dup)));
    let cancel = common::wait_for_cmd(&mut a_cmds, |c| {
        matches!(c, WireCommand::Cancel(_))
    })
    .await;
    assert!(matches!(cancel, WireCommand::Cancel(b) if b == block));

    common::wait_for(&mut rx, |e| *e == EngineEvent::Piece(2)).await;
    assert!(engine.piece_info(2).await?.verified);

    engine.destroy(false).await?;
    Ok(())
}

#[tokio::test]
async fn no_duplicates_before_endgame() -> Result<(), Error> {
    common::setup_tracing();
    let content = TestContent::new(CONTENT_LEN)?;
    let config =
        Config { auto_select: false, endgame_threshold: 0, ..config() };
    let (engine, mut rx) = common::spawn(config, content.metadata())?;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Ready).await;
    engine.select(2, 2, 0, None).await?;

    let (_a, mut a_cmds) = seeder_peer(&engine, 7000).await?;
    let (_, _a_reply) = next_request(&mut a_cmds).await;

    let (_b, mut b_cmds) = seeder_peer(&engine, 7001).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.stats().await?;
    assert!(requests_so_far(&mut b_cmds).is_empty());

    engine.destroy(false).await?;
    Ok(())
}

/// A fast peer with nothing left to reserve takes the blocks of a slow one.
#[tokio::test]
async fn fast_peer_takes_over_slow_peer() -> Result<(), Error> {
    common::setup_tracing();
    let content = TestContent::new(CONTENT_LEN)?;
    let config = Config {
        auto_select: false,
        endgame_threshold: 0,
        hotswap: true,
        hotswap_min_speed: 1.0,
        ..config()
    };
    let (engine, mut rx) = common::spawn(config, content.metadata())?;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Ready).await;
    engine.select(0, 0, 0, None).await?;

    // the slow peer never answers
    let (_slow, mut slow_cmds) = seeder_peer(&engine, 7000).await?;
    let (slow_block, _slow_reply) = next_request(&mut slow_cmds).await;
    assert_eq!(slow_block, BlockInfo::new(0, 0, BLOCK_LEN));

    let (_fast, mut fast_cmds) = seeder_peer(&engine, 7001).await?;
    let (block, reply) = next_request(&mut fast_cmds).await;
    assert_eq!(block, BlockInfo::new(0, BLOCK_LEN, BLOCK_LEN));
    let _ = reply.send(Ok(bytes_of(&content, &block)));

    // once its rate is known, the fast peer gets the slow one's block
    let event =
        common::wait_for(&mut rx, |e| matches!(e, EngineEvent::Hotswap { .. }))
            .await;
    assert_eq!(
        event,
        EngineEvent::Hotswap { from: addr(7000), to: addr(7001), index: 0 }
    );
    let cancel = common::wait_for_cmd(&mut slow_cmds, |c| {
        matches!(c, WireCommand::Cancel(_))
    })
    .await;
    assert!(matches!(cancel, WireCommand::Cancel(b) if b == slow_block));

    let (block, reply) = next_request(&mut fast_cmds).await;
    assert_eq!(block, slow_block);
    let _ = reply.send(Ok(bytes_of(&content, &block)));

    common::wait_for(&mut rx, |e| *e == EngineEvent::Piece(0)).await;
    assert!(engine.piece_info(0).await?.verified);

    engine.destroy(false).await?;
    Ok(())
}

/// A peer that keeps us choked is dropped only when other connections are
/// waiting for a slot.
#[tokio::test]
async fn choking_peer_is_dropped_under_pressure() -> Result<(), Error> {
    common::setup_tracing();
    let content = TestContent::new(CONTENT_LEN)?;
    let (engine, mut rx) = common::spawn(
        Config { choke_timeout_secs: 1, ..config() },
        content.metadata(),
    )?;
    common::wait_for(&mut rx, |e| *e == EngineEvent::Ready).await;

    let (_link, mut cmds) = engine.connect_peer(addr(7000), false).await?;

    // nobody is waiting, the peer gets more time
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(engine.stats().await?.peers, 1);

    engine.add_peer(addr(7001)).await?;
    common::wait_for_cmd(&mut cmds, |c| matches!(c, WireCommand::Close)).await;
    assert_eq!(engine.stats().await?.peers, 0);
    assert_eq!(engine.queued_peers().await?, [addr(7001)]);

    engine.destroy(false).await?;
    Ok(())
}
