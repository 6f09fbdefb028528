// Contact directory and roster retrieval
// The roster comes from a REST collaborator; presence is layered on top by the tracker

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::config::ChatConfig;
use crate::error::RosterFetchError;
use crate::models::{Contact, ContactStatus, Identity};

/// One roster row as returned by the backend. Accepts both the API's
/// `_id`/`name` shape and the plain `id`/`displayName` shape.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawRosterEntry")]
pub struct RosterEntry {
    pub id: String,
    pub display_name: String,
}

#[derive(Deserialize)]
struct RawRosterEntry {
    id: Option<String>,
    #[serde(rename = "_id")]
    object_id: Option<String>,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    name: Option<String>,
    username: Option<String>,
}

impl TryFrom<RawRosterEntry> for RosterEntry {
    type Error = String;

    fn try_from(raw: RawRosterEntry) -> Result<Self, Self::Error> {
        let id = raw
            .id
            .or(raw.object_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| "roster entry without id".to_string())?;
        let display_name = raw.display_name.or(raw.name).or(raw.username).unwrap_or_default();
        Ok(RosterEntry { id, display_name })
    }
}

impl RosterEntry {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        RosterEntry {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn fetch_roster(&self, identity: &Identity) -> Result<Vec<RosterEntry>, RosterFetchError>;
}

/// Fetches the roster over HTTP with the identity's bearer token.
pub struct HttpRosterSource {
    client: reqwest::Client,
    base_url: String,
    path_template: String,
}

impl HttpRosterSource {
    pub fn new(base_url: &str, path_template: &str, timeout: Duration) -> Result<Self, RosterFetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RosterFetchError::Request(e.to_string()))?;
        Ok(HttpRosterSource {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            path_template: path_template.to_string(),
        })
    }

    pub fn from_config(config: &ChatConfig) -> Result<Self, RosterFetchError> {
        Self::new(&config.api_base_url, &config.roster_path, config.request_timeout())
    }

    fn url_for(&self, identity: &Identity) -> String {
        format!("{}{}", self.base_url, self.path_template.replace("{id}", &identity.id))
    }
}

#[async_trait]
impl RosterSource for HttpRosterSource {
    async fn fetch_roster(&self, identity: &Identity) -> Result<Vec<RosterEntry>, RosterFetchError> {
        let url = self.url_for(identity);
        debug!("Requesting roster from {}", url);

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", identity.credential()))
            .send()
            .await
            .map_err(|e| RosterFetchError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RosterFetchError::Status(status.as_u16()));
        }

        let entries = response.json::<Vec<RosterEntry>>().await.map_err(|e| {
            if e.is_decode() {
                RosterFetchError::Malformed(e.to_string())
            } else {
                RosterFetchError::Request(e.to_string())
            }
        })?;
        info!("Fetched roster with {} entries", entries.len());
        Ok(entries)
    }
}

/// Reachable peers of the current identity, in server order.
#[derive(Debug, Default)]
pub struct ContactDirectory {
    contacts: Vec<Contact>,
    index: HashMap<String, usize>,
    loaded: bool,
    last_error: Option<RosterFetchError>,
}

impl ContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the collection with a fresh roster. Contacts that were already
    /// known keep their presence; new ones start offline. Returns the ids
    /// that disappeared.
    pub fn replace(&mut self, entries: Vec<RosterEntry>) -> Vec<String> {
        let previous: HashMap<String, ContactStatus> = self
            .contacts
            .iter()
            .map(|c| (c.id.clone(), c.status))
            .collect();

        let mut contacts = Vec::with_capacity(entries.len());
        let mut index = HashMap::with_capacity(entries.len());
        for entry in entries {
            if index.contains_key(&entry.id) {
                warn!("Duplicate roster entry for {}, keeping the first one", entry.id);
                continue;
            }
            let status = previous.get(&entry.id).copied().unwrap_or_default();
            let display_name = if entry.display_name.is_empty() {
                entry.id.clone()
            } else {
                entry.display_name
            };
            index.insert(entry.id.clone(), contacts.len());
            contacts.push(Contact {
                id: entry.id,
                display_name,
                status,
            });
        }

        let kept: HashSet<&String> = index.keys().collect();
        let removed: Vec<String> = self
            .contacts
            .iter()
            .filter(|c| !kept.contains(&c.id))
            .map(|c| c.id.clone())
            .collect();

        info!("Roster replaced: {} contacts ({} removed)", contacts.len(), removed.len());
        self.contacts = contacts;
        self.index = index;
        self.loaded = true;
        self.last_error = None;
        removed
    }

    /// Record a failed load. The current collection stays as it is.
    pub fn record_failure(&mut self, error: RosterFetchError) {
        warn!("Roster load failed, keeping {} known contacts: {}", self.contacts.len(), error);
        self.last_error = Some(error);
    }

    /// Set the presence of a known contact. Unknown ids are ignored.
    /// Returns true when the stored status changed.
    pub fn apply_presence(&mut self, contact_id: &str, status: ContactStatus) -> bool {
        match self.index.get(contact_id) {
            Some(&i) => {
                let contact = &mut self.contacts[i];
                if contact.status == status {
                    return false;
                }
                contact.status = status;
                true
            }
            None => false,
        }
    }

    /// Mark every contact offline. Returns the ids whose status changed.
    pub fn mark_all_offline(&mut self) -> Vec<String> {
        self.contacts
            .iter_mut()
            .filter(|c| c.status != ContactStatus::Offline)
            .map(|c| {
                c.status = ContactStatus::Offline;
                c.id.clone()
            })
            .collect()
    }

    pub fn contains(&self, contact_id: &str) -> bool {
        self.index.contains_key(contact_id)
    }

    pub fn get(&self, contact_id: &str) -> Option<&Contact> {
        self.index.get(contact_id).map(|&i| &self.contacts[i])
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn last_error(&self) -> Option<&RosterFetchError> {
        self.last_error.as_ref()
    }
}
