//! Piece exchange core of a BitTorrent client.
//!
//! The crate is split in two halves that talk to each other constantly. The
//! [`storage`] half owns the bytes of the content and knows which blocks of
//! which pieces were reserved, written and verified. The [`engine`] half owns
//! the peers: it decides what to request from whom, who gets to download from
//! us, and when a slow peer should lose its work to a faster one.
//!
//! Everything that mutates that state runs inside a single
//! [`engine::DownloadEngine`] task. The outside world, be it a wire protocol
//! implementation, a tracker client or a user interface, talks to it through
//! an [`engine::EngineHandle`] and listens to [`engine::EngineEvent`]s.
pub mod bitfield;
pub mod blocklist;
pub mod config;
pub mod counter;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod peer;
pub mod rarity;
pub mod selection;
pub mod storage;
