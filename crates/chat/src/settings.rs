use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chatsync_transport::TransportConfig;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::rest::{AssistantId, TokenPair};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_WS_BASE_URL: &str = "ws://localhost:8000";
pub const SETTINGS_DIRECTORY_NAME: &str = "chatsync";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const CACHE_FILE_NAME: &str = "cache.sqlite3";
pub const ENV_PREFIX: &str = "CHATSYNC_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub assistant_id: Option<String>,
    /// Local cache database; `None` places it next to the settings file.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            ws_base_url: default_ws_base_url(),
            access_token: String::new(),
            refresh_token: String::new(),
            assistant_id: None,
            cache_path: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        self.api_base_url = normalized_url(&self.api_base_url, DEFAULT_API_BASE_URL);
        self.ws_base_url = normalized_url(&self.ws_base_url, DEFAULT_WS_BASE_URL);
        self.access_token = self.access_token.trim().to_string();
        self.refresh_token = self.refresh_token.trim().to_string();
        self.assistant_id = self
            .assistant_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        self.cache_path = self
            .cache_path
            .filter(|path| !path.as_os_str().is_empty());
        if self.handshake_timeout_ms == 0 {
            self.handshake_timeout_ms = default_handshake_timeout_ms();
        }
        if self.retry_initial_delay_ms == 0 {
            self.retry_initial_delay_ms = default_retry_initial_delay_ms();
        }
        self.retry_max_delay_ms = self.retry_max_delay_ms.max(self.retry_initial_delay_ms);
        self
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::new(&self.ws_base_url)
            .with_handshake_timeout(Duration::from_millis(self.handshake_timeout_ms))
            .with_retry_delays(
                Duration::from_millis(self.retry_initial_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
            )
    }

    pub fn token_pair(&self) -> TokenPair {
        TokenPair::new(&self.access_token, &self.refresh_token)
    }

    pub fn assistant(&self) -> Option<AssistantId> {
        self.assistant_id.as_deref().map(AssistantId::from)
    }
}

/// Live settings backed by a JSON file, overridable through `CHATSYNC_*` variables.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".chatsync"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    pub fn cache_path(&self) -> PathBuf {
        let settings = self.settings.load();
        settings.cache_path.clone().unwrap_or_else(|| {
            self.config_path
                .parent()
                .map(|parent| parent.join(CACHE_FILE_NAME))
                .unwrap_or_else(|| PathBuf::from(CACHE_FILE_NAME))
        })
    }

    pub fn update(&self, settings: ClientSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Re-reads the file and environment, keeping the current settings on failure.
    pub fn reload(&self) -> Result<(), SettingsError> {
        let settings = Self::extract(&self.config_path)?;
        self.settings.store(Arc::new(settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ClientSettings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }

        match Self::extract(path) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "failed to parse settings, using defaults");
                ClientSettings::default()
            }
        }
    }

    fn extract(path: &Path) -> Result<ClientSettings, SettingsError> {
        let figment = Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        figment
            .extract::<ClientSettings>()
            .map(ClientSettings::normalized)
            .map_err(Box::new)
            .context(ExtractSnafu {
                stage: "extract-settings",
                path: path.to_path_buf(),
            })
    }

    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to read settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        source: Box<figment::Error>,
    },
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn normalized_url(value: &str, fallback: &str) -> String {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_ws_base_url() -> String {
    DEFAULT_WS_BASE_URL.to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    chatsync_transport::DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64
}

fn default_retry_initial_delay_ms() -> u64 {
    chatsync_transport::DEFAULT_RETRY_INITIAL_DELAY.as_millis() as u64
}

fn default_retry_max_delay_ms() -> u64 {
    chatsync_transport::DEFAULT_RETRY_MAX_DELAY.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let store = SettingsStore::new(temp_dir.path().join("settings.json"));
        let settings = store.settings();

        assert_eq!(settings.handshake_timeout_ms, 5_000);
        assert_eq!(settings.retry_initial_delay_ms, 100);
        assert_eq!(settings.retry_max_delay_ms, 1_000);
        assert_eq!(store.cache_path(), temp_dir.path().join(CACHE_FILE_NAME));
    }

    #[test]
    fn file_values_override_defaults_and_are_normalized() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"ws_base_url": "wss://chat.example/ ", "assistant_id": "  ", "handshake_timeout_ms": 0, "access_token": " abc "}"#,
        )
        .expect("write settings");

        let settings = SettingsStore::new(path).settings();
        assert_eq!(settings.ws_base_url, "wss://chat.example");
        assert_eq!(settings.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(settings.assistant_id, None);
        assert_eq!(settings.handshake_timeout_ms, 5_000);
        assert_eq!(settings.token_pair(), TokenPair::new("abc", ""));
        assert_eq!(
            settings
                .transport_config()
                .endpoint_for(&chatsync_transport::ConversationId::from("4")),
            "wss://chat.example/ws/chats/4/"
        );
    }

    #[test]
    fn updates_persist_and_swap_live_settings() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone());
        let before = store.settings();

        store
            .update(ClientSettings {
                assistant_id: Some("7".to_string()),
                access_token: "token".to_string(),
                ..ClientSettings::default()
            })
            .expect("update");

        assert_eq!(before.assistant_id, None);
        assert_eq!(store.settings().assistant(), Some(AssistantId::from(7_u64)));
        let reopened = SettingsStore::new(path);
        assert_eq!(reopened.settings(), store.settings());
        reopened.reload().expect("reload");
        assert_eq!(reopened.settings().access_token, "token");
    }
}
