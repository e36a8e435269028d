//! Bot token → chat id registrations.
//!
//! A registration is created the first time a token is seen; its chat id is
//! resolved lazily through a [`ChatLookup`] and cached on the registration.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    domain::{BotToken, ChatId},
    Result,
};

/// Finds the chat a bot should report to.
#[async_trait]
pub trait ChatLookup: Send + Sync {
    async fn lookup_chat_id(&self, token: &BotToken) -> Result<Option<ChatId>>;
}

/// Always answers with a configured chat id.
#[derive(Clone, Copy, Debug)]
pub struct StaticChatLookup(pub ChatId);

#[async_trait]
impl ChatLookup for StaticChatLookup {
    async fn lookup_chat_id(&self, _token: &BotToken) -> Result<Option<ChatId>> {
        Ok(Some(self.0))
    }
}

#[derive(Debug)]
pub struct BotRegistration {
    token: BotToken,
    chat_id: RwLock<Option<ChatId>>,
}

impl BotRegistration {
    pub fn new(token: BotToken, chat_id: Option<ChatId>) -> Self {
        Self {
            token,
            chat_id: RwLock::new(chat_id),
        }
    }

    pub fn token(&self) -> &BotToken {
        &self.token
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        *self.chat_id.read().unwrap_or_else(|e| e.into_inner())
    }

    fn cache_chat_id(&self, chat_id: ChatId) {
        *self.chat_id.write().unwrap_or_else(|e| e.into_inner()) = Some(chat_id);
    }
}

/// Owner of the registrations.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Returns the registration for `token`, and whether it was created by this call.
    async fn get_or_create(&self, token: &BotToken) -> Result<(Arc<BotRegistration>, bool)>;

    /// Looks up the chat id for `registration` and caches it there.
    ///
    /// A `None` lookup leaves any previously cached id alone.
    async fn resolve_chat_id(&self, registration: &BotRegistration) -> Result<Option<ChatId>>;
}

async fn lookup_and_cache(
    lookup: &dyn ChatLookup,
    registration: &BotRegistration,
) -> Result<Option<ChatId>> {
    let found = lookup.lookup_chat_id(registration.token()).await?;
    match found {
        Some(chat_id) => {
            debug!(bot_id = registration.token().bot_id(), chat_id = chat_id.0, "resolved chat id");
            registration.cache_chat_id(chat_id);
            Ok(Some(chat_id))
        }
        None => Ok(registration.chat_id()),
    }
}

/// Process-local registrations.
pub struct MemoryRegistrationStore {
    lookup: Arc<dyn ChatLookup>,
    entries: Mutex<HashMap<BotToken, Arc<BotRegistration>>>,
}

impl MemoryRegistrationStore {
    pub fn new(lookup: Arc<dyn ChatLookup>) -> Self {
        Self {
            lookup,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RegistrationStore for MemoryRegistrationStore {
    async fn get_or_create(&self, token: &BotToken) -> Result<(Arc<BotRegistration>, bool)> {
        let mut map = self.entries.lock().await;
        if let Some(existing) = map.get(token) {
            return Ok((existing.clone(), false));
        }
        let reg = Arc::new(BotRegistration::new(token.clone(), None));
        map.insert(token.clone(), reg.clone());
        Ok((reg, true))
    }

    async fn resolve_chat_id(&self, registration: &BotRegistration) -> Result<Option<ChatId>> {
        lookup_and_cache(self.lookup.as_ref(), registration).await
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    registrations: Vec<RegistryEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryEntry {
    bot_token: BotToken,
    chat_id: Option<ChatId>,
}

/// Registrations persisted to a JSON file, so a resolved chat id survives restarts.
pub struct JsonFileRegistrationStore {
    path: PathBuf,
    lookup: Arc<dyn ChatLookup>,
    entries: Mutex<HashMap<BotToken, Arc<BotRegistration>>>,
}

impl JsonFileRegistrationStore {
    /// Loads `path` if it exists; a missing file starts an empty registry.
    pub async fn open(path: impl Into<PathBuf>, lookup: Arc<dyn ChatLookup>) -> Result<Self> {
        let path = path.into();
        let file = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<RegistryFile>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryFile::default(),
            Err(e) => return Err(e.into()),
        };

        let entries = file
            .registrations
            .into_iter()
            .map(|e| {
                let reg = Arc::new(BotRegistration::new(e.bot_token.clone(), e.chat_id));
                (e.bot_token, reg)
            })
            .collect::<HashMap<_, _>>();
        info!(path = %path.display(), count = entries.len(), "loaded bot registrations");

        Ok(Self {
            path,
            lookup,
            entries: Mutex::new(entries),
        })
    }

    async fn save(&self, map: &HashMap<BotToken, Arc<BotRegistration>>) -> Result<()> {
        let mut registrations = map
            .values()
            .map(|r| RegistryEntry {
                bot_token: r.token().clone(),
                chat_id: r.chat_id(),
            })
            .collect::<Vec<_>>();
        registrations.sort_by(|a, b| a.bot_token.as_str().cmp(b.bot_token.as_str()));

        let json = serde_json::to_vec_pretty(&RegistryFile { registrations })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl RegistrationStore for JsonFileRegistrationStore {
    async fn get_or_create(&self, token: &BotToken) -> Result<(Arc<BotRegistration>, bool)> {
        let mut map = self.entries.lock().await;
        if let Some(existing) = map.get(token) {
            return Ok((existing.clone(), false));
        }
        let reg = Arc::new(BotRegistration::new(token.clone(), None));
        map.insert(token.clone(), reg.clone());
        self.save(&map).await?;
        Ok((reg, true))
    }

    async fn resolve_chat_id(&self, registration: &BotRegistration) -> Result<Option<ChatId>> {
        let before = registration.chat_id();
        let resolved = lookup_and_cache(self.lookup.as_ref(), registration).await?;
        if resolved != before {
            let map = self.entries.lock().await;
            self.save(&map).await?;
        }
        Ok(resolved)
    }
}
