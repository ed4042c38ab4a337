//! Embedding control surface
//!
//! A thin API for host applications: initialize a state directory, start or
//! stop the proxy with new settings, and manage rules — all as plain calls
//! over strings and primitives. The running server is an owned, swappable
//! handle: the old server is stopped to completion before a new one binds,
//! so two servers never hold the same port.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::Settings;
use crate::proxy::{ProxyHandle, ProxyServer};
use crate::rules::{Mode, RuleTable};

const RULES_FILE: &str = "rules";
const SETTINGS_FILE: &str = "settings.toml";

/// Host-embedding entry point.
pub struct Control {
    data_dir: PathBuf,
    rules: Arc<RuleTable>,
    server: Mutex<Option<ProxyHandle>>,
}

impl Control {
    /// Create the state directory and load any existing rule file.
    pub fn init(data_dir: impl Into<PathBuf>) -> crate::Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let rules = Arc::new(RuleTable::new(Mode::Rule));
        let rules_path = data_dir.join(RULES_FILE);
        if rules_path.exists() {
            let count = rules.load(&rules_path)?;
            info!("loaded {count} rules");
        }

        Ok(Self {
            data_dir,
            rules,
            server: Mutex::new(None),
        })
    }

    fn rules_path(&self) -> PathBuf {
        self.data_dir.join(RULES_FILE)
    }

    /// Path of the persisted settings file.
    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    pub fn settings_exist(&self) -> bool {
        Settings::exists(&self.settings_path())
    }

    /// Read the persisted settings.
    pub fn settings(&self) -> crate::Result<Settings> {
        Ok(Settings::load(&self.settings_path())?)
    }

    /// Start (or restart) the proxy from the persisted settings.
    pub async fn start(&self) -> crate::Result<()> {
        let settings = self.settings()?;
        self.restart(settings).await
    }

    /// Persist new settings, then restart the proxy with them.
    pub async fn apply(&self, settings: Settings) -> crate::Result<()> {
        settings.save(&self.settings_path())?;
        self.restart(settings).await
    }

    /// Stop the running proxy, if any.
    pub async fn stop(&self) {
        if let Some(handle) = self.server.lock().await.take() {
            handle.stop().await;
        }
    }

    async fn restart(&self, settings: Settings) -> crate::Result<()> {
        let mut server = self.server.lock().await;
        if let Some(handle) = server.take() {
            handle.stop().await;
        }
        let bound = ProxyServer::bind(&settings, Arc::clone(&self.rules)).await?;
        *server = Some(bound.start());
        Ok(())
    }

    /// Add a rule and persist the table. The in-memory table keeps the rule
    /// even when persisting fails; the error is surfaced to the caller.
    pub fn add_rule(&self, text: &str) -> crate::Result<()> {
        self.rules.add(text)?;
        self.rules.persist(&self.rules_path())?;
        Ok(())
    }

    /// Delete a rule and persist the table.
    pub fn delete_rule(&self, text: &str) -> crate::Result<()> {
        self.rules.delete(text);
        self.rules.persist(&self.rules_path())?;
        Ok(())
    }

    /// All rules in text form, sorted by domain.
    pub fn list_rules(&self) -> Vec<String> {
        self.rules.sorted()
    }

    /// Change the global routing mode.
    pub fn set_mode(&self, mode: Mode) {
        self.rules.set_mode(mode);
    }

    /// The shared rule table.
    pub fn rules(&self) -> &Arc<RuleTable> {
        &self.rules
    }
}

impl Control {
    /// The state directory this instance was initialized with.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_control(tag: &str) -> (Control, PathBuf) {
        let dir = std::env::temp_dir().join(format!("detour-control-{tag}-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        (Control::init(&dir).unwrap(), dir)
    }

    #[test]
    fn test_rules_persist_through_reinit() {
        let (control, dir) = temp_control("reinit");
        control.add_rule("~example.com").unwrap();
        control.add_rule("!ads.example.net").unwrap();
        control.delete_rule("!ads.example.net").unwrap();

        let reopened = Control::init(&dir).unwrap();
        assert_eq!(reopened.list_rules(), vec!["~example.com"]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_apply_persists_settings_and_swaps_server() {
        let (control, dir) = temp_control("apply");
        let settings = Settings {
            remote: "http://127.0.0.1:9".to_string(),
            passkey: "passkey".to_string(),
            port: 0,
        };

        control.apply(settings.clone()).await.unwrap();
        assert!(control.settings_exist());
        assert_eq!(control.settings().unwrap(), settings);

        // replacing the server stops the old one first
        control.apply(settings).await.unwrap();
        control.stop().await;

        std::fs::remove_dir_all(&dir).ok();
    }
}
