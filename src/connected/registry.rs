//! Connection Registry
//!
//! CRUD over the connection profiles stored in the unified
//! `connectedMode.connections.servers` list, partitioned into self-hosted and
//! cloud connections. Tokens live in the secret store only; the settings
//! document never receives them.
//!
//! All mutating operations are serialized behind one async mutex. The
//! settings store itself has no transactions, so without it two concurrent
//! `add` calls could both load the list and one write would win.

use std::sync::Arc;
use tokio::sync::Mutex;

use super::classifier::ServerKindClassifier;
use super::error::ConnectionError;
use super::notify::{NoopNotifier, TokenUpdateNotifier, TokenUpdated};
use super::server_url::{clean_server_url, default_connection_id};
use super::vault::TokenVault;
use crate::config::{
    ConnectedModeOptions, ConnectionKind, ConnectionProfile, JsonSettingsStorage, Keychain,
    SettingsFile, SettingsStore, DEFAULT_CLOUD_URL,
};

/// Outcome of [`ConnectionRegistry::migrate_from_plaintext`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Plaintext tokens copied into the secret store
    pub migrated: usize,
    /// Plaintext tokens dropped because the secret store already had one
    pub stripped: usize,
    /// Plaintext tokens left in place because no storage key could be derived
    pub skipped: usize,
    /// Legacy entries moved into the unified list
    pub moved: usize,
    /// Legacy entries dropped because the id already exists in the unified list
    pub duplicates: usize,
    /// Whether the settings document was written
    pub saved: bool,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// True when any connection in `settings` resolves to `key`.
/// Callers pass the document after the changed entry was spliced or rewritten.
fn key_in_use(settings: &SettingsFile, key: &str) -> bool {
    settings
        .connections()
        .all()
        .any(|c| TokenVault::storage_key(c) == Some(key))
}

pub struct ConnectionRegistry {
    settings: Arc<dyn SettingsStore>,
    vault: TokenVault,
    classifier: ServerKindClassifier,
    notifier: Arc<dyn TokenUpdateNotifier>,
    op_lock: Mutex<()>,
}

impl ConnectionRegistry {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        vault: TokenVault,
        classifier: ServerKindClassifier,
        notifier: Arc<dyn TokenUpdateNotifier>,
    ) -> Self {
        Self {
            settings,
            vault,
            classifier,
            notifier,
            op_lock: Mutex::new(()),
        }
    }

    /// Registry over the default settings file and the system keychain
    pub fn open(options: &ConnectedModeOptions) -> Result<Self, ConnectionError> {
        let settings = Arc::new(JsonSettingsStorage::new()?);
        let vault = TokenVault::new(Arc::new(Keychain::with_service(
            options.keychain_service.clone(),
        )));
        let classifier = ServerKindClassifier::from_options(options)?;
        Ok(Self::new(settings, vault, classifier, Arc::new(NoopNotifier)))
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn TokenUpdateNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn vault(&self) -> &TokenVault {
        &self.vault
    }

    pub fn classifier(&self) -> &ServerKindClassifier {
        &self.classifier
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    /// Connections of one kind, as stored (no tokens)
    pub async fn list(&self, kind: ConnectionKind) -> Result<Vec<ConnectionProfile>, ConnectionError> {
        let settings = self.settings.load().await?;
        Ok(settings.connections().of_kind(kind).cloned().collect())
    }

    /// Connection with its token filled in from the secret store
    pub async fn load(
        &self,
        kind: ConnectionKind,
        connection_id: &str,
    ) -> Result<Option<ConnectionProfile>, ConnectionError> {
        let settings = self.settings.load().await?;
        let Some(mut profile) = settings.connections().find(kind, connection_id).cloned() else {
            return Ok(None);
        };
        profile.token = self.vault.retrieve_for(&profile).await?;
        Ok(Some(profile))
    }

    pub async fn find_cloud_by_organization(
        &self,
        organization_key: &str,
    ) -> Result<Option<ConnectionProfile>, ConnectionError> {
        let settings = self.settings.load().await?;
        let found = settings
            .connections()
            .of_kind(ConnectionKind::Cloud)
            .find(|c| c.organization_key.as_deref() == Some(organization_key))
            .cloned();
        Ok(found)
    }

    /// Token lookup by storage key (server URL or organization key), as
    /// requested by the analysis server
    pub async fn token_for_server(
        &self,
        server_url_or_organization: &str,
    ) -> Result<Option<String>, ConnectionError> {
        Ok(self.vault.retrieve(server_url_or_organization).await?)
    }

    /// Any profile still carrying a plaintext token the secret store lacks
    pub async fn has_unmigrated_connections(&self) -> Result<bool, ConnectionError> {
        let settings = self.settings.load().await?;
        let connections = settings.connections();

        // Legacy entries carry whether they came from the cloud list
        let legacy = connections
            .sonarqube
            .iter()
            .map(|c| (c, Some(false)))
            .chain(connections.sonarcloud.iter().map(|c| (c, Some(true))));
        let unified = connections.servers.iter().map(|c| (c, None));

        for (connection, legacy_cloud) in legacy.chain(unified) {
            if !connection.has_plaintext_token() {
                continue;
            }
            // Resolve the key the same way migration would
            let mut candidate = connection.clone();
            match legacy_cloud {
                Some(known_cloud) => self.normalize_legacy(&mut candidate, known_cloud).await,
                None if candidate.is_cloud_connection.is_none() => {
                    let is_cloud = self.classifier.is_cloud_profile(&candidate).await;
                    candidate.is_cloud_connection = Some(is_cloud);
                }
                None => {}
            }
            if !self.vault.has(&candidate).await {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mutations
    // ═══════════════════════════════════════════════════════════════════════

    /// Add a new connection. Returns the profile as persisted.
    ///
    /// The token is written before the settings; a failed settings write
    /// leaves the token in place and returns the error.
    pub async fn add(&self, profile: ConnectionProfile) -> Result<ConnectionProfile, ConnectionError> {
        let _guard = self.op_lock.lock().await;
        self.add_locked(profile).await
    }

    /// Update the connection with the same id.
    ///
    /// A missing id is a caller bug and fails with [`ConnectionError::NotFound`].
    pub async fn update(&self, profile: ConnectionProfile) -> Result<ConnectionProfile, ConnectionError> {
        let _guard = self.op_lock.lock().await;
        self.update_locked(profile).await
    }

    /// Add or update, as submitted from the connection form. A missing id is
    /// replaced by the default one.
    pub async fn save_connection(
        &self,
        mut profile: ConnectionProfile,
    ) -> Result<ConnectionProfile, ConnectionError> {
        let _guard = self.op_lock.lock().await;

        if let Some(url) = profile.server_url.as_deref() {
            profile.server_url = Some(clean_server_url(url));
        }
        if non_empty(profile.connection_id.as_deref()).is_none() {
            profile.connection_id = Some(default_connection_id(&profile));
        }

        let settings = self.settings.load().await?;
        let kind = profile.is_cloud_connection.map(ConnectionKind::from_flag);
        let exists = profile
            .id()
            .and_then(|id| settings.connections().position_any(kind, id))
            .is_some();

        if exists {
            self.update_locked(profile).await
        } else {
            self.add_locked(profile).await
        }
    }

    /// Remove a connection and its token.
    ///
    /// Returns `false` when no such connection exists, which means the
    /// settings file changed underneath the caller.
    pub async fn remove(
        &self,
        connection_id: &str,
        kind: ConnectionKind,
    ) -> Result<bool, ConnectionError> {
        let _guard = self.op_lock.lock().await;

        let mut settings = self.settings.load().await?;
        let Some(index) = settings.connections().position(kind, connection_id) else {
            tracing::warn!(
                "Cannot delete {} connection '{}': not found, the settings file may have been modified. \
                 Save the settings file and try again.",
                kind,
                connection_id
            );
            return Ok(false);
        };

        let removed = settings.connections_mut().servers.remove(index);
        if let Some(key) = TokenVault::storage_key(&removed) {
            if key_in_use(&settings, key) {
                tracing::debug!("Token for {} is shared with another connection, keeping it", key);
            } else {
                self.vault.delete_key(key).await?;
            }
        }

        self.settings.save(&settings).await?;
        tracing::info!("Removed {} connection '{}'", kind, connection_id);
        Ok(true)
    }

    /// Move plaintext tokens from the settings document into the secret
    /// store and fold the legacy `sonarqube`/`sonarcloud` lists into the
    /// unified list. Safe to run repeatedly.
    pub async fn migrate_from_plaintext(&self) -> Result<MigrationReport, ConnectionError> {
        let _guard = self.op_lock.lock().await;

        let mut settings = self.settings.load().await?;
        let mut report = MigrationReport::default();
        let connections = settings.connections_mut();
        let had_legacy = connections.has_legacy_entries();

        for entry in connections.sonarqube.iter_mut() {
            self.normalize_legacy(entry, false).await;
        }
        for entry in connections.sonarcloud.iter_mut() {
            self.normalize_legacy(entry, true).await;
        }

        for entry in connections
            .sonarqube
            .iter_mut()
            .chain(connections.sonarcloud.iter_mut())
            .chain(connections.servers.iter_mut())
        {
            self.migrate_token(entry, &mut report).await?;
        }

        let legacy: Vec<ConnectionProfile> = connections
            .sonarqube
            .drain(..)
            .chain(connections.sonarcloud.drain(..))
            .collect();
        for entry in legacy {
            let kind = entry.kind();
            let id = entry.id().unwrap_or_default().to_string();
            if connections.position(kind, &id).is_some() {
                tracing::debug!("Legacy {} connection '{}' already migrated", kind, id);
                report.duplicates += 1;
                continue;
            }
            connections.servers.push(entry);
            report.moved += 1;
        }

        let changed = had_legacy || report.migrated > 0 || report.stripped > 0;
        if !changed {
            return Ok(report);
        }
        // An empty list here would overwrite whatever another writer just saved
        if connections.servers.is_empty() {
            tracing::debug!("No connections left after migration, settings not written");
            return Ok(report);
        }

        self.settings.save(&settings).await?;
        report.saved = true;
        tracing::info!(
            "Migrated connection settings: {} tokens moved to secure storage, {} legacy connections moved",
            report.migrated,
            report.moved
        );
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internals (caller holds op_lock)
    // ═══════════════════════════════════════════════════════════════════════

    async fn add_locked(&self, mut profile: ConnectionProfile) -> Result<ConnectionProfile, ConnectionError> {
        let token = profile.take_token();
        let sanitized = self.sanitize(&profile).await?;
        let kind = sanitized.kind();
        let connection_id = sanitized.id().unwrap_or_default().to_string();

        let mut settings = self.settings.load().await?;
        if settings.connections().position(kind, &connection_id).is_some() {
            return Err(ConnectionError::AlreadyExists {
                kind,
                connection_id,
            });
        }

        self.vault.store(&sanitized, token.as_deref()).await?;
        settings.connections_mut().servers.push(sanitized.clone());
        self.settings.save(&settings).await?;

        tracing::info!("Added {} connection '{}'", kind, connection_id);
        Ok(sanitized)
    }

    async fn update_locked(&self, mut profile: ConnectionProfile) -> Result<ConnectionProfile, ConnectionError> {
        let token = profile.take_token();
        let connection_id = profile.id().unwrap_or_default().to_string();
        let requested_kind = profile.is_cloud_connection.map(ConnectionKind::from_flag);

        let mut settings = self.settings.load().await?;
        let index = settings
            .connections()
            .position_any(requested_kind, &connection_id)
            .ok_or_else(|| ConnectionError::NotFound(connection_id.clone()))?;
        let existing = settings.connections().servers[index].clone();

        let server_url = match non_empty(profile.server_url.as_deref()).map(clean_server_url) {
            Some(url) if !url.is_empty() => url,
            _ => existing
                .server_url
                .clone()
                .ok_or(ConnectionError::MissingServerUrl)?,
        };
        let organization_key = non_empty(profile.organization_key.as_deref())
            .map(str::to_owned)
            .or_else(|| existing.organization_key.clone());

        // Only a changed location warrants another probe
        let location_changed = existing.server_url.as_deref() != Some(server_url.as_str())
            || organization_key != existing.organization_key;
        let is_cloud = match (profile.is_cloud_connection, existing.is_cloud_connection) {
            (Some(flag), _) => flag,
            (None, Some(flag)) if !location_changed => flag,
            _ => self.classifier.is_cloud(Some(&server_url)).await,
        };
        if is_cloud && organization_key.is_none() {
            return Err(ConnectionError::MissingOrganizationKey(server_url));
        }

        let kind = ConnectionKind::from_flag(is_cloud);
        if kind != existing.kind() && settings.connections().position(kind, &connection_id).is_some() {
            return Err(ConnectionError::AlreadyExists {
                kind,
                connection_id,
            });
        }

        let updated = {
            let entry = &mut settings.connections_mut().servers[index];
            entry.server_url = Some(server_url);
            entry.organization_key = if is_cloud { organization_key } else { None };
            entry.is_cloud_connection = Some(is_cloud);
            entry.disable_notifications = profile.disable_notifications;
            entry.token = None;
            entry.clone()
        };

        let old_key = TokenVault::storage_key(&existing).map(str::to_owned);
        let new_key = TokenVault::storage_key(&updated).map(str::to_owned);
        let key_changed = old_key != new_key;

        // Without a new token the old one follows the connection to its new key
        let token = match token.filter(|t| !t.is_empty()) {
            Some(token) => Some(token),
            None if key_changed => match old_key.as_deref() {
                Some(key) => self.vault.retrieve(key).await?,
                None => None,
            },
            None => None,
        };
        self.vault.store(&updated, token.as_deref()).await?;

        self.notifier.token_updated(TokenUpdated {
            connection_id: connection_id.clone(),
            kind,
        });

        self.settings.save(&settings).await?;

        // Persisted settings still point at the old key until the save succeeds
        if key_changed {
            if let Some(old_key) = old_key.as_deref() {
                if !key_in_use(&settings, old_key) {
                    self.vault.delete_key(old_key).await?;
                }
            }
        }

        tracing::info!("Updated {} connection '{}'", kind, connection_id);
        Ok(updated)
    }

    /// Persistable copy of a user-submitted profile
    async fn sanitize(&self, profile: &ConnectionProfile) -> Result<ConnectionProfile, ConnectionError> {
        let server_url = non_empty(profile.server_url.as_deref())
            .map(clean_server_url)
            .filter(|url| !url.is_empty())
            .ok_or(ConnectionError::MissingServerUrl)?;

        let is_cloud = match profile.is_cloud_connection {
            Some(flag) => flag,
            None => self.classifier.is_cloud(Some(&server_url)).await,
        };

        let organization_key = if is_cloud {
            let org = non_empty(profile.organization_key.as_deref())
                .ok_or_else(|| ConnectionError::MissingOrganizationKey(server_url.clone()))?;
            Some(org.to_string())
        } else {
            None
        };

        let mut sanitized = ConnectionProfile {
            connection_id: non_empty(profile.connection_id.as_deref()).map(str::to_owned),
            server_url: Some(server_url),
            organization_key,
            is_cloud_connection: Some(is_cloud),
            disable_notifications: profile.disable_notifications,
            token: None,
        };
        if sanitized.connection_id.is_none() {
            sanitized.connection_id = Some(default_connection_id(&sanitized));
        }
        Ok(sanitized)
    }

    /// Bring a legacy entry into the unified shape, token left untouched
    async fn normalize_legacy(&self, entry: &mut ConnectionProfile, known_cloud: bool) {
        if known_cloud {
            entry.is_cloud_connection.get_or_insert(true);
            if non_empty(entry.server_url.as_deref()).is_none() {
                entry.server_url = Some(DEFAULT_CLOUD_URL.to_string());
            }
        }
        if let Some(url) = entry.server_url.as_deref() {
            entry.server_url = Some(clean_server_url(url));
        }
        if entry.is_cloud_connection.is_none() {
            let is_cloud = self.classifier.is_cloud_profile(entry).await;
            entry.is_cloud_connection = Some(is_cloud);
        }
        if entry.is_cloud() && non_empty(entry.organization_key.as_deref()).is_none() {
            tracing::warn!(
                "Legacy connection {:?} looks like a cloud server but has no organization key, keeping it self-hosted",
                entry.connection_id
            );
            entry.is_cloud_connection = Some(false);
        }
        if !entry.is_cloud() {
            entry.organization_key = None;
        }
        if non_empty(entry.connection_id.as_deref()).is_none() {
            entry.connection_id = Some(default_connection_id(entry));
        }
    }

    async fn migrate_token(
        &self,
        entry: &mut ConnectionProfile,
        report: &mut MigrationReport,
    ) -> Result<(), ConnectionError> {
        let Some(token) = entry.take_token() else {
            return Ok(());
        };
        if token.is_empty() {
            report.stripped += 1;
            return Ok(());
        }

        if entry.is_cloud_connection.is_none() {
            let is_cloud = self.classifier.is_cloud_profile(entry).await;
            entry.is_cloud_connection = Some(is_cloud);
        }

        let Some(key) = TokenVault::storage_key(entry).map(str::to_owned) else {
            tracing::warn!(
                "Cannot move token of connection {:?} to secure storage: no server URL or organization key",
                entry.connection_id
            );
            entry.token = Some(token);
            report.skipped += 1;
            return Ok(());
        };

        if self.vault.has_key(&key).await {
            report.stripped += 1;
        } else {
            self.vault.store_under(&key, &token).await?;
            report.migrated += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemorySecretStore, MemorySettingsStore, SecretStore, StorageError};
    use crate::connected::classifier::tests::StubProbe;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// Settings store whose writes can be switched off
    struct ReadOnlySettings {
        inner: MemorySettingsStore,
        fail_saves: AtomicBool,
    }

    #[async_trait::async_trait]
    impl SettingsStore for ReadOnlySettings {
        async fn load(&self) -> Result<SettingsFile, StorageError> {
            self.inner.load().await
        }

        async fn save(&self, settings: &SettingsFile) -> Result<(), StorageError> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "settings are read-only",
                )));
            }
            self.inner.save(settings).await
        }
    }

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        settings: Arc<MemorySettingsStore>,
        secrets: Arc<MemorySecretStore>,
        probe: Arc<StubProbe>,
        events: mpsc::UnboundedReceiver<TokenUpdated>,
    }

    fn harness_with(initial: SettingsFile, probe_up: bool) -> Harness {
        let settings = Arc::new(MemorySettingsStore::new(initial));
        let secrets = Arc::new(MemorySecretStore::new());
        let probe = StubProbe::new(probe_up);
        let (tx, events) = mpsc::unbounded_channel();

        let registry = ConnectionRegistry::new(
            settings.clone(),
            TokenVault::new(secrets.clone()),
            ServerKindClassifier::new(probe.clone()),
            Arc::new(tx),
        );

        Harness {
            registry: Arc::new(registry),
            settings,
            secrets,
            probe,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(SettingsFile::default(), false)
    }

    async fn secret(h: &Harness, key: &str) -> Option<String> {
        h.secrets.get(key).await.unwrap()
    }

    #[tokio::test]
    async fn test_add_self_hosted_defaults_id_to_clean_url() {
        let h = harness();

        let added = h
            .registry
            .add(ConnectionProfile::self_hosted("https://sonarqube.example/").with_token("abc"))
            .await
            .unwrap();
        assert_eq!(added.id(), Some("https://sonarqube.example"));

        let stored = h.settings.snapshot();
        let entry = &stored.connections().servers[0];
        assert_eq!(entry.connection_id.as_deref(), Some("https://sonarqube.example"));
        assert_eq!(entry.server_url.as_deref(), Some("https://sonarqube.example"));
        assert_eq!(entry.is_cloud_connection, Some(false));
        assert_eq!(entry.token, None);

        let json = serde_json::to_value(&stored).unwrap();
        assert!(json["connectedMode"]["connections"]["servers"][0].get("token").is_none());

        assert_eq!(secret(&h, "https://sonarqube.example").await.as_deref(), Some("abc"));
        assert_eq!(h.probe.call_count(), 1);
    }

    #[tokio::test]
    async fn test_add_cloud_uses_organization_key() {
        let h = harness();

        let added = h
            .registry
            .add(ConnectionProfile::cloud("https://app.codescan.io", "my-org").with_token("xyz"))
            .await
            .unwrap();

        assert_eq!(added.id(), Some("my-org"));
        assert_eq!(added.kind(), ConnectionKind::Cloud);
        assert_eq!(secret(&h, "my-org").await.as_deref(), Some("xyz"));
        assert_eq!(h.probe.call_count(), 0);
    }

    #[tokio::test]
    async fn test_add_self_hosted_drops_organization_key() {
        let h = harness();

        let added = h
            .registry
            .add(ConnectionProfile::cloud("https://sq.example", "ignored").with_connection_id("sq"))
            .await
            .unwrap();

        assert_eq!(added.organization_key, None);
        assert_eq!(added.kind(), ConnectionKind::SelfHosted);
    }

    #[tokio::test]
    async fn test_add_probed_cloud_requires_organization_key() {
        let h = harness_with(SettingsFile::default(), true);

        let err = h
            .registry
            .add(ConnectionProfile::self_hosted("https://scan.corp.example").with_token("t"))
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectionError::MissingOrganizationKey(_)));
        assert!(h.secrets.is_empty());
        assert_eq!(h.settings.save_count(), 0);
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_id_within_kind() {
        let h = harness();
        let profile = ConnectionProfile::self_hosted("https://sq.example").with_connection_id("shared");

        h.registry.add(profile.clone()).await.unwrap();
        let err = h.registry.add(profile).await.unwrap_err();
        assert!(matches!(err, ConnectionError::AlreadyExists { .. }));

        // Same id in the other partition is fine
        h.registry
            .add(ConnectionProfile::cloud("https://app.codescan.io", "org").with_connection_id("shared"))
            .await
            .unwrap();
        assert_eq!(h.registry.list(ConnectionKind::SelfHosted).await.unwrap().len(), 1);
        assert_eq!(h.registry.list(ConnectionKind::Cloud).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_then_load_returns_token() {
        let h = harness();
        h.registry
            .add(ConnectionProfile::cloud("https://app.codescan.io", "my-org").with_token("T"))
            .await
            .unwrap();

        let loaded = h
            .registry
            .load(ConnectionKind::Cloud, "my-org")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.token.as_deref(), Some("T"));

        let listed = h.registry.list(ConnectionKind::Cloud).await.unwrap();
        assert_eq!(listed[0].token, None);

        assert!(h.registry.load(ConnectionKind::SelfHosted, "my-org").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_connection_fails() {
        let h = harness();

        let err = h
            .registry
            .update(ConnectionProfile::self_hosted("https://sq.example").with_connection_id("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::NotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_update_organization_moves_token() {
        let mut h = harness();
        h.registry
            .add(ConnectionProfile::cloud("https://app.codescan.io", "org1").with_token("secret"))
            .await
            .unwrap();

        let updated = h
            .registry
            .update(
                ConnectionProfile::cloud("https://app.codescan.io", "org2")
                    .with_connection_id("org1")
                    .with_token("fresh"),
            )
            .await
            .unwrap();

        assert_eq!(updated.id(), Some("org1"));
        assert_eq!(updated.organization_key.as_deref(), Some("org2"));
        assert_eq!(secret(&h, "org2").await.as_deref(), Some("fresh"));

        let old = ConnectionProfile {
            organization_key: Some("org1".into()),
            is_cloud_connection: Some(true),
            ..Default::default()
        };
        assert!(!h.registry.vault().has(&old).await);

        let event = h.events.try_recv().unwrap();
        assert_eq!(event.connection_id, "org1");
        assert_eq!(event.kind, ConnectionKind::Cloud);
    }

    #[tokio::test]
    async fn test_update_keeps_old_token_when_settings_write_fails() {
        let settings = Arc::new(ReadOnlySettings {
            inner: MemorySettingsStore::new(SettingsFile::default()),
            fail_saves: AtomicBool::new(false),
        });
        let secrets = Arc::new(MemorySecretStore::new());
        let registry = ConnectionRegistry::new(
            settings.clone(),
            TokenVault::new(secrets.clone()),
            ServerKindClassifier::new(StubProbe::new(false)),
            Arc::new(NoopNotifier),
        );
        registry
            .add(ConnectionProfile::cloud("https://app.codescan.io", "org1").with_token("secret"))
            .await
            .unwrap();

        settings.fail_saves.store(true, Ordering::SeqCst);
        let result = registry
            .update(ConnectionProfile::cloud("https://app.codescan.io", "org2").with_connection_id("org1"))
            .await;
        assert!(matches!(result, Err(ConnectionError::Storage(_))));

        let persisted = registry
            .load(ConnectionKind::Cloud, "org1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.organization_key.as_deref(), Some("org1"));
        assert_eq!(persisted.token.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_update_key_change_without_token_carries_old_token() {
        let h = harness();
        h.registry
            .add(
                ConnectionProfile::self_hosted("https://old.example")
                    .with_connection_id("sq")
                    .with_token("keep-me"),
            )
            .await
            .unwrap();

        h.registry
            .update(ConnectionProfile::self_hosted("https://new.example/").with_connection_id("sq"))
            .await
            .unwrap();

        assert_eq!(secret(&h, "https://new.example").await.as_deref(), Some("keep-me"));
        assert_eq!(secret(&h, "https://old.example").await, None);
    }

    #[tokio::test]
    async fn test_update_same_location_does_not_reprobe() {
        let mut h = harness();
        h.registry
            .add(ConnectionProfile::self_hosted("https://sq.example").with_token("t1"))
            .await
            .unwrap();
        assert_eq!(h.probe.call_count(), 1);

        let updated = h
            .registry
            .update(
                ConnectionProfile::self_hosted("https://sq.example")
                    .with_connection_id("https://sq.example")
                    .with_notifications_disabled(true),
            )
            .await
            .unwrap();

        assert!(updated.disable_notifications);
        assert_eq!(h.probe.call_count(), 1);
        // Empty token leaves the stored one alone
        assert_eq!(secret(&h, "https://sq.example").await.as_deref(), Some("t1"));
        assert!(h.events.try_recv().is_ok());

        let stored = h.settings.snapshot();
        assert!(stored.connections().servers[0].disable_notifications);
    }

    #[tokio::test]
    async fn test_update_changed_url_reprobes() {
        let h = harness();
        h.registry
            .add(ConnectionProfile::self_hosted("https://a.example").with_connection_id("sq"))
            .await
            .unwrap();

        h.registry
            .update(ConnectionProfile::self_hosted("https://b.example").with_connection_id("sq"))
            .await
            .unwrap();

        assert_eq!(*h.probe.calls.lock(), vec!["https://a.example", "https://b.example"]);
    }

    #[tokio::test]
    async fn test_remove_missing_is_not_an_error() {
        let h = harness();
        h.registry
            .add(ConnectionProfile::self_hosted("https://sq.example").with_token("t"))
            .await
            .unwrap();
        let before = h.settings.snapshot();
        let saves = h.settings.save_count();

        let removed = h
            .registry
            .remove("does-not-exist", ConnectionKind::SelfHosted)
            .await
            .unwrap();

        assert!(!removed);
        assert_eq!(h.settings.snapshot(), before);
        assert_eq!(h.settings.save_count(), saves);
        assert_eq!(h.secrets.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_deletes_token_and_entry() {
        let h = harness();
        h.registry
            .add(ConnectionProfile::cloud("https://app.codescan.io", "my-org").with_token("t"))
            .await
            .unwrap();

        assert!(h.registry.remove("my-org", ConnectionKind::Cloud).await.unwrap());
        assert!(h.registry.list(ConnectionKind::Cloud).await.unwrap().is_empty());
        assert_eq!(secret(&h, "my-org").await, None);
    }

    #[tokio::test]
    async fn test_remove_keeps_token_shared_by_another_connection() {
        let h = harness();
        h.registry
            .add(
                ConnectionProfile::self_hosted("https://sq.example")
                    .with_connection_id("first")
                    .with_token("t"),
            )
            .await
            .unwrap();
        h.registry
            .add(ConnectionProfile::self_hosted("https://sq.example").with_connection_id("second"))
            .await
            .unwrap();

        assert!(h.registry.remove("first", ConnectionKind::SelfHosted).await.unwrap());
        assert_eq!(secret(&h, "https://sq.example").await.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn test_save_connection_adds_then_updates() {
        let mut h = harness();
        let form = ConnectionProfile::self_hosted(" https://sq.example/ ").with_token("first");

        let added = h.registry.save_connection(form.clone()).await.unwrap();
        assert_eq!(added.id(), Some("https://sq.example"));
        assert!(h.events.try_recv().is_err());

        h.registry
            .save_connection(form.with_token("second"))
            .await
            .unwrap();
        assert_eq!(h.registry.list(ConnectionKind::SelfHosted).await.unwrap().len(), 1);
        assert_eq!(secret(&h, "https://sq.example").await.as_deref(), Some("second"));
        assert!(h.events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_queries() {
        let h = harness();
        h.registry
            .add(ConnectionProfile::cloud("https://app.codescan.io", "my-org").with_token("t"))
            .await
            .unwrap();

        let found = h.registry.find_cloud_by_organization("my-org").await.unwrap();
        assert_eq!(found.and_then(|c| c.connection_id), Some("my-org".to_string()));
        assert!(h.registry.find_cloud_by_organization("other").await.unwrap().is_none());

        assert_eq!(h.registry.token_for_server("my-org").await.unwrap().as_deref(), Some("t"));
        assert_eq!(h.registry.token_for_server("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_adds_are_not_lost() {
        let h = harness();

        let first = {
            let registry = h.registry.clone();
            tokio::spawn(async move {
                registry
                    .add(ConnectionProfile::self_hosted("https://a.example").with_token("a"))
                    .await
            })
        };
        let second = {
            let registry = h.registry.clone();
            tokio::spawn(async move {
                registry
                    .add(ConnectionProfile::self_hosted("https://b.example").with_token("b"))
                    .await
            })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(h.registry.list(ConnectionKind::SelfHosted).await.unwrap().len(), 2);
    }

    fn plaintext_settings() -> SettingsFile {
        let mut settings = SettingsFile::default();
        let connections = settings.connections_mut();
        connections.sonarqube.push(
            ConnectionProfile::self_hosted("https://sq.example/")
                .with_connection_id("sq")
                .with_token("sq-token"),
        );
        connections.sonarcloud.push(ConnectionProfile {
            organization_key: Some("legacy-org".into()),
            token: Some("sc-token".into()),
            ..Default::default()
        });
        connections.servers.push(
            ConnectionProfile::cloud("https://app.codescan.io", "org")
                .with_connection_id("org")
                .with_cloud_flag(true)
                .with_token("srv-token"),
        );
        settings
    }

    #[tokio::test]
    async fn test_migrate_moves_tokens_and_legacy_lists() {
        let h = harness_with(plaintext_settings(), false);
        assert!(h.registry.has_unmigrated_connections().await.unwrap());

        let report = h.registry.migrate_from_plaintext().await.unwrap();
        assert_eq!(report.migrated, 3);
        assert_eq!(report.moved, 2);
        assert!(report.saved);

        assert_eq!(secret(&h, "https://sq.example").await.as_deref(), Some("sq-token"));
        assert_eq!(secret(&h, "legacy-org").await.as_deref(), Some("sc-token"));
        assert_eq!(secret(&h, "org").await.as_deref(), Some("srv-token"));

        let stored = h.settings.snapshot();
        let connections = stored.connections();
        assert!(!connections.has_legacy_entries());
        assert_eq!(connections.servers.len(), 3);
        assert!(connections.servers.iter().all(|c| c.token.is_none()));

        let legacy_cloud = connections.find(ConnectionKind::Cloud, "legacy-org").unwrap();
        assert_eq!(legacy_cloud.server_url.as_deref(), Some(DEFAULT_CLOUD_URL));
        assert!(connections.find(ConnectionKind::SelfHosted, "sq").is_some());

        assert!(!h.registry.has_unmigrated_connections().await.unwrap());
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let h = harness_with(plaintext_settings(), false);

        h.registry.migrate_from_plaintext().await.unwrap();
        let settings_once = h.settings.snapshot();
        let secrets_once = h.secrets.snapshot();
        let saves_once = h.settings.save_count();

        let report = h.registry.migrate_from_plaintext().await.unwrap();
        assert_eq!(report, MigrationReport::default());
        assert_eq!(h.settings.snapshot(), settings_once);
        assert_eq!(h.secrets.snapshot(), secrets_once);
        assert_eq!(h.settings.save_count(), saves_once);
    }

    #[tokio::test]
    async fn test_migrate_keeps_existing_secure_token() {
        let mut settings = SettingsFile::default();
        settings.connections_mut().servers.push(
            ConnectionProfile::self_hosted("https://sq.example")
                .with_connection_id("sq")
                .with_cloud_flag(false)
                .with_token("stale"),
        );
        let h = harness_with(settings, false);
        h.secrets.store("https://sq.example", "current").await.unwrap();
        assert!(!h.registry.has_unmigrated_connections().await.unwrap());

        let report = h.registry.migrate_from_plaintext().await.unwrap();
        assert_eq!(report.migrated, 0);
        assert_eq!(report.stripped, 1);

        assert_eq!(secret(&h, "https://sq.example").await.as_deref(), Some("current"));
        assert_eq!(h.settings.snapshot().connections().servers[0].token, None);
    }

    #[tokio::test]
    async fn test_legacy_url_with_trailing_slash_already_migrated() {
        let mut settings = SettingsFile::default();
        settings.connections_mut().sonarqube.push(
            ConnectionProfile::self_hosted("https://sq.example/")
                .with_connection_id("sq")
                .with_token("stale"),
        );
        let h = harness_with(settings, false);
        h.secrets.store("https://sq.example", "current").await.unwrap();

        assert!(!h.registry.has_unmigrated_connections().await.unwrap());
    }

    #[tokio::test]
    async fn test_migrate_does_not_write_empty_list() {
        let h = harness();

        let report = h.registry.migrate_from_plaintext().await.unwrap();
        assert!(!report.saved);
        assert_eq!(h.settings.save_count(), 0);
    }

    #[tokio::test]
    async fn test_migrate_drops_legacy_duplicates() {
        let mut settings = SettingsFile::default();
        let connections = settings.connections_mut();
        connections.servers.push(
            ConnectionProfile::self_hosted("https://sq.example")
                .with_connection_id("sq")
                .with_cloud_flag(false),
        );
        connections.sonarqube.push(
            ConnectionProfile::self_hosted("https://sq.example").with_connection_id("sq"),
        );
        let h = harness_with(settings, false);

        let report = h.registry.migrate_from_plaintext().await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.moved, 0);
        assert!(report.saved);

        let stored = h.settings.snapshot();
        assert_eq!(stored.connections().servers.len(), 1);
        assert!(stored.connections().sonarqube.is_empty());
    }
}
