//! Saved contacts.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::directory::PeerDirectory;
use crate::models::{Address, Contact};
use crate::storage::ContactStore;
use crate::types::{ChatError, Result};

/// The contact list, backed by a [`ContactStore`].
///
/// Every saved contact's key also seeds the peer directory, so messaging a
/// contact never needs an identity lookup.
pub struct ContactBook {
    store: Arc<dyn ContactStore>,
    directory: Arc<PeerDirectory>,
    contacts: RwLock<Vec<Contact>>,
}

impl ContactBook {
    pub fn new(store: Arc<dyn ContactStore>, directory: Arc<PeerDirectory>) -> Self {
        Self {
            store,
            directory,
            contacts: RwLock::new(Vec::new()),
        }
    }

    /// Loads persisted contacts. Returns how many were loaded.
    pub async fn load(&self) -> Result<usize> {
        let loaded = self.store.load_all().await?;
        for contact in &loaded {
            self.directory
                .remember(&contact.address, contact.public_key)
                .await;
        }
        let count = loaded.len();
        *self.contacts.write().await = loaded;
        debug!(count, "contacts loaded");
        Ok(count)
    }

    /// Adds a contact after checking the address with the identity service.
    pub async fn add_contact(&self, address: &str, display_name: &str) -> Result<Contact> {
        let address = Address::new(address)?;
        if self.contains(&address).await {
            return Err(ChatError::ContactExists(address.to_string()));
        }

        if !self.directory.address_exists(&address).await? {
            return Err(ChatError::AddressNotFound(address.to_string()));
        }
        let public_key = self.directory.resolve_public_key(&address).await?;
        let contact = Contact::new(address, display_name, public_key);

        let mut contacts = self.contacts.write().await;
        if contacts.iter().any(|c| c.address == contact.address) {
            return Err(ChatError::ContactExists(contact.address.to_string()));
        }
        self.store.save(&contact).await?;
        contacts.push(contact.clone());

        info!(address = %contact.address, name = %contact.display_name, "contact added");
        Ok(contact)
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.contacts.read().await.clone()
    }

    pub async fn get(&self, address: &Address) -> Option<Contact> {
        let contacts = self.contacts.read().await;
        contacts.iter().find(|c| &c.address == address).cloned()
    }

    pub async fn contains(&self, address: &Address) -> bool {
        self.get(address).await.is_some()
    }
}
