use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::{blocklist::BlockRange, error::Error, storage::BLOCK_LEN};

/// How the engine chooses the next piece of a selection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Scan the selection in index order.
    #[default]
    Sequential,
    /// Pick the piece that the fewest connected peers have.
    Rarest,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where verified pieces are persisted. Content lives only in memory
    /// when this is `None`.
    pub download_dir: Option<PathBuf>,

    pub strategy: Strategy,

    /// Allow fast peers to take reservations away from slow ones.
    pub hotswap: bool,

    /// How many peers are unchoked by each rechoke pass, without counting
    /// the optimistic unchoke.
    pub upload_slots: usize,

    /// Maximum outstanding block requests per peer.
    pub max_requests: usize,

    /// Endgame starts when fewer than this many pieces are missing.
    pub endgame_threshold: usize,

    pub piece_timeout_secs: u64,
    pub choke_timeout_secs: u64,
    pub rechoke_interval_secs: u64,

    /// How many rechoke passes an optimistic unchoke lasts.
    pub optimistic_duration: u8,

    pub heartbeat_ms: u64,

    /// Download rate, in bytes per second, above which a peer is fast.
    pub fast_threshold: f64,

    /// Minimum download rate, in bytes per second, for a peer to hotswap.
    pub hotswap_min_speed: f64,

    /// How many pieces the speed filter may exclude in a single fill pass.
    pub speed_filter_tries: usize,

    /// Select the whole content at priority 0 once storage is ready.
    pub auto_select: bool,

    /// DHT port advertised to peers that support DHT.
    pub dht_port: Option<u16>,

    pub blocklist: Vec<BlockRange>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: None,
            strategy: Strategy::Sequential,
            hotswap: true,
            upload_slots: 10,
            max_requests: 5,
            endgame_threshold: 30,
            piece_timeout_secs: 10,
            choke_timeout_secs: 5,
            rechoke_interval_secs: 10,
            optimistic_duration: 2,
            heartbeat_ms: 1000,
            fast_threshold: 3.0 * BLOCK_LEN as f64,
            hotswap_min_speed: BLOCK_LEN as f64,
            speed_filter_tries: 10,
            auto_select: true,
            dht_port: None,
            blocklist: Vec::new(),
        }
    }
}

impl Config {
    pub fn piece_timeout(&self) -> Duration {
        Duration::from_secs(self.piece_timeout_secs)
    }

    pub fn choke_timeout(&self) -> Duration {
        Duration::from_secs(self.choke_timeout_secs)
    }

    pub fn rechoke_interval(&self) -> Duration {
        Duration::from_secs(self.rechoke_interval_secs.max(1))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(10))
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let config = toml::from_str::<Config>(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.max_requests == 0 {
            return Err(Error::ConfigError(
                "max_requests must be at least 1".into(),
            ));
        }
        for range in &self.blocklist {
            if range.start.is_ipv4() != range.end.is_ipv4() {
                return Err(Error::ConfigError(format!(
                    "blocklist range {}-{} mixes address families",
                    range.start, range.end
                )));
            }
        }
        Ok(())
    }

    /// Path of the configuration file in the user's config folder.
    pub fn config_path() -> Result<PathBuf, Error> {
        let dotfile =
            ProjectDirs::from("", "", "bittide").ok_or(Error::HomeInvalid)?;
        Ok(dotfile.config_dir().join("config.toml"))
    }

    /// Load the configuration file from the user's config folder.
    ///
    /// If the file does not exist, or is not valid toml, the default
    /// configuration is written to it and returned.
    pub async fn load() -> Result<Self, Error> {
        let path = Self::config_path()?;
        if let Some(dir) = path.parent() {
            create_dir_all(dir).await?;
        }
        Self::load_or_init(&path).await
    }

    /// Load the configuration at `path`, failing if it can't be parsed.
    pub async fn load_from(path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut file = OpenOptions::new().read(true).open(path.as_ref()).await?;
        let mut dst = String::new();
        file.read_to_string(&mut dst).await?;
        Self::from_toml(&dst)
    }

    async fn load_or_init(path: &Path) -> Result<Self, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;

        let mut dst = String::new();
        file.read_to_string(&mut dst).await?;

        if let Ok(config) = Self::from_toml(&dst) {
            return Ok(config);
        }

        let config = Config::default();
        let config_str = toml::to_string(&config)?;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        file.write_all(config_str.as_bytes()).await?;
        file.flush().await?;

        Ok(config)
    }
}
