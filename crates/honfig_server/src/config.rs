//! Manager configuration, persisted as `config/config.json`. Key names are
//! the upstream-compatible ones, camelCase warts included; unknown keys are
//! preserved-by-ignore so older configs keep loading.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Path to the game binary directory.
    pub hon_install_directory: PathBuf,
    /// Number of instances to pre-create at startup.
    pub svr_total: u32,
    /// Autoscaler maximum hint, per CPU core. Zero disables the hint.
    pub svr_total_per_core: u32,
    /// How many instances may sit in `Starting` at once.
    pub svr_max_start_at_once: usize,
    /// Seconds before a `Starting` instance is declared crashed.
    pub svr_startup_timeout: u64,
    #[serde(rename = "svr_starting_gamePort")]
    pub svr_starting_game_port: u16,
    #[serde(rename = "svr_starting_voicePort")]
    pub svr_starting_voice_port: u16,
    /// Port the game listener binds; children connect back to it.
    #[serde(rename = "svr_managerPort")]
    pub svr_manager_port: u16,
    /// Server id used in the chat handshake. The master-server login
    /// (outside this core) normally assigns it.
    pub svr_id: u32,
    pub svr_login: String,
    pub svr_password: String,
    #[serde(rename = "svr_masterServer")]
    pub svr_master_server: String,
    /// Chat server endpoint, `host:port`.
    #[serde(rename = "svr_chatServer")]
    pub svr_chat_server: String,
    /// Version string reported in the chat registration.
    pub man_version: String,
    pub svr_restart_between_games: bool,
    /// Proxy mode toggles. Parsed and persisted; the proxy itself lives
    /// outside this core.
    #[serde(rename = "man_enableProxy")]
    pub man_enable_proxy: bool,
    #[serde(rename = "svr_proxyPort")]
    pub svr_proxy_port: u16,
    pub svr_name: String,
    pub svr_location: String,
    pub svr_priority: String,
    #[serde(rename = "svr_noConsole")]
    pub svr_no_console: bool,
    /// Public address reported in the chat registration.
    pub svr_ip: String,
    /// Seconds a draining instance may wait for its lobby to close.
    pub drain_timeout: u64,
    pub replays_dir: PathBuf,
    pub autoscale: AutoscaleConfig,
    /// Background replay deletion policy. Parsed and persisted; the cleaner
    /// itself lives outside this core.
    pub replay_cleaner: ReplayCleanerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            hon_install_directory: PathBuf::from("."),
            svr_total: 1,
            svr_total_per_core: 0,
            svr_max_start_at_once: 5,
            svr_startup_timeout: 180,
            svr_starting_game_port: 10001,
            svr_starting_voice_port: 11001,
            svr_manager_port: 1134,
            svr_id: 0,
            svr_login: String::new(),
            svr_password: String::new(),
            svr_master_server: "api.kongor.online".to_owned(),
            svr_chat_server: "chat.kongor.online:11031".to_owned(),
            man_version: "4.10.1".to_owned(),
            svr_restart_between_games: false,
            man_enable_proxy: false,
            svr_proxy_port: 0,
            svr_name: "HoN Server".to_owned(),
            svr_location: "EU".to_owned(),
            svr_priority: "HIGH".to_owned(),
            svr_no_console: true,
            svr_ip: "127.0.0.1".to_owned(),
            drain_timeout: 900,
            replays_dir: PathBuf::from("replays"),
            autoscale: AutoscaleConfig::default(),
            replay_cleaner: ReplayCleanerConfig::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoscaleMode {
    #[default]
    Fixed,
    Target,
    DemandDriven,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub mode: AutoscaleMode,
    /// Fleet size maintained in `Fixed` mode.
    pub total_servers: u32,
    /// Empty `Ready` instances maintained in `Target` mode.
    pub target_ready_slots: u32,
    /// `DemandDriven`: idle instances kept around before removal kicks in.
    pub min_idle: u32,
    /// `DemandDriven`: hard ceiling on the fleet.
    pub max: u32,
    /// Seconds between policy evaluations.
    pub interval: u64,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            mode: AutoscaleMode::Fixed,
            total_servers: 1,
            target_ready_slots: 1,
            min_idle: 1,
            max: 10,
            interval: 30,
        }
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayCleanerConfig {
    pub active: bool,
    /// Seconds between sweeps.
    pub interval: u64,
    pub max_age_days: u32,
}

impl Default for ReplayCleanerConfig {
    fn default() -> Self {
        Self {
            active: false,
            interval: 3600,
            max_age_days: 30,
        }
    }
}

impl ManagerConfig {
    /// Reads and validates a config file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config back out, creating the parent directory if needed.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Config(format!("failed to create {}: {e}", parent.display())))?;
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;
        tokio::fs::write(path, raw)
            .await
            .map_err(|e| Error::Config(format!("failed to write {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.svr_total == 0 {
            return Err(Error::Config("svr_total must be at least 1".to_owned()));
        }
        if self.svr_max_start_at_once == 0 {
            return Err(Error::Config(
                "svr_max_start_at_once must be at least 1".to_owned(),
            ));
        }
        if self.svr_starting_game_port == 0 || self.svr_starting_voice_port == 0 {
            return Err(Error::Config("port bases must be nonzero".to_owned()));
        }

        // Instance i uses base + i - 1 on both ranges; they must not collide
        // for any instance the fleet could grow to.
        let span = self.max_servers();
        let game = u32::from(self.svr_starting_game_port);
        let voice = u32::from(self.svr_starting_voice_port);
        if game < voice + span && voice < game + span {
            return Err(Error::Config(format!(
                "svr_starting_gamePort and svr_starting_voicePort ranges overlap \
                 ({game}..{} vs {voice}..{})",
                game + span,
                voice + span
            )));
        }

        if self.man_enable_proxy && self.svr_proxy_port == 0 {
            return Err(Error::Config(
                "svr_proxyPort is required when man_enableProxy is set".to_owned(),
            ));
        }
        self.chat_endpoint()?;
        Ok(())
    }

    /// The hard ceiling on fleet size across every policy.
    pub fn max_servers(&self) -> u32 {
        self.svr_total.max(self.autoscale.max)
    }

    /// Splits `svr_chatServer` into host and port.
    pub fn chat_endpoint(&self) -> Result<(String, u16), Error> {
        let (host, port) = self
            .svr_chat_server
            .rsplit_once(':')
            .ok_or_else(|| Error::Config("svr_chatServer must be host:port".to_owned()))?;
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("svr_chatServer port {port:?} is not a number")))?;
        Ok((host.to_owned(), port))
    }
}
