//! Account and ban management
//!
//! Accounts are looked up through the [`AccountStore`] trait so the login
//! path does not care where they live. The in-memory store can be seeded
//! from a TOML file at startup.

pub mod ban;

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AuthError, RealmError, Result};

pub use ban::{AccountBan, BanManager, BanStore, IpBan, MemoryBanStore};

/// Player account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Stable id derived from the account name
    pub id: Uuid,
    /// Account name (normalized)
    pub name: String,
    /// Password hash (Argon2, PHC string)
    pub password_hash: String,
    /// Characters owned by the account
    pub characters: Vec<String>,
    /// Whether the account may log in
    pub enabled: bool,
}

impl Account {
    /// Create an account, hashing the given password
    pub fn new(name: &str, password: &str, characters: Vec<String>) -> Result<Self> {
        Ok(Self::with_hash(name, hash_password(password)?, characters))
    }

    /// Create an account from an existing password hash
    pub fn with_hash(name: &str, password_hash: String, characters: Vec<String>) -> Self {
        let name = normalize_name(name);
        Self {
            id: account_id(&name),
            name,
            password_hash,
            characters,
            enabled: true,
        }
    }

    /// Verify the password against the stored hash
    pub fn verify_password(&self, password: &str) -> bool {
        verify_password(password, &self.password_hash)
    }

    /// Find a character by name, ignoring case
    pub fn character(&self, name: &str) -> Option<&str> {
        self.characters
            .iter()
            .find(|c| c.eq_ignore_ascii_case(name.trim()))
            .map(String::as_str)
    }
}

/// Storage backend for accounts
pub trait AccountStore: Send + Sync {
    /// Look up an account by name
    fn find_by_name(&self, name: &str) -> Option<Account>;

    /// Look up an account by id
    fn get(&self, id: &Uuid) -> Option<Account>;

    /// Store a new account
    fn insert(&self, account: Account) -> std::result::Result<(), AuthError>;

    /// Number of stored accounts
    fn count(&self) -> usize;

    /// Check credentials and return the account on success
    fn authenticate(&self, name: &str, password: &str) -> std::result::Result<Account, AuthError> {
        let account = self
            .find_by_name(name)
            .ok_or(AuthError::InvalidCredentials)?;

        if !account.verify_password(password) {
            warn!(account = %account.name, "Failed login attempt");
            return Err(AuthError::InvalidCredentials);
        }

        if !account.enabled {
            return Err(AuthError::AccountDisabled);
        }

        debug!(account = %account.name, "Credentials accepted");
        Ok(account)
    }
}

/// In-memory account storage
#[derive(Default)]
pub struct MemoryAccountStore {
    /// Accounts by id
    accounts: RwLock<HashMap<Uuid, Account>>,
    /// Name index (normalized name -> id)
    names: RwLock<HashMap<String, Uuid>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and store an account
    pub fn register(&self, name: &str, password: &str, characters: Vec<String>) -> Result<Account> {
        if normalize_name(name).is_empty() {
            return Err(RealmError::Auth(AuthError::InvalidCredentials));
        }

        let account = Account::new(name, password, characters)?;
        self.insert(account.clone())?;

        info!(account = %account.name, account_id = %account.id, "New account registered");
        Ok(account)
    }

    /// Enable or disable an account
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let id = self
            .names
            .read()
            .get(&normalize_name(name))
            .copied()
            .ok_or(RealmError::Auth(AuthError::InvalidCredentials))?;

        if let Some(account) = self.accounts.write().get_mut(&id) {
            account.enabled = enabled;
            info!(account = %account.name, enabled, "Updated account status");
        }
        Ok(())
    }

    /// Load accounts from a TOML seed document; returns how many were added
    pub fn load_seed(&self, content: &str) -> Result<usize> {
        let seed: AccountSeedFile =
            toml::from_str(content).map_err(|e| RealmError::Config(format!("Invalid account seed: {}", e)))?;

        let mut added = 0;
        for entry in seed.accounts {
            let mut account = match (entry.password_hash, entry.password) {
                (Some(hash), _) => Account::with_hash(&entry.name, hash, entry.characters),
                (None, Some(password)) => Account::new(&entry.name, &password, entry.characters)?,
                (None, None) => {
                    warn!(account = %entry.name, "Seed account has no password, skipping");
                    continue;
                }
            };
            account.enabled = entry.enabled;

            match self.insert(account) {
                Ok(()) => added += 1,
                Err(e) => warn!(account = %entry.name, error = %e, "Skipping seed account"),
            }
        }

        Ok(added)
    }

    /// Load a seed file from disk
    pub async fn load_seed_file(&self, path: &Path) -> anyhow::Result<usize> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read accounts file: {}", path.display()))?;
        let added = self
            .load_seed(&content)
            .with_context(|| format!("Failed to load accounts file: {}", path.display()))?;
        info!(path = %path.display(), added, "Loaded seed accounts");
        Ok(added)
    }
}

impl AccountStore for MemoryAccountStore {
    fn find_by_name(&self, name: &str) -> Option<Account> {
        let id = self.names.read().get(&normalize_name(name)).copied()?;
        self.accounts.read().get(&id).cloned()
    }

    fn get(&self, id: &Uuid) -> Option<Account> {
        self.accounts.read().get(id).cloned()
    }

    fn insert(&self, account: Account) -> std::result::Result<(), AuthError> {
        let mut names = self.names.write();
        if names.contains_key(&account.name) {
            return Err(AuthError::AccountExists(account.name));
        }
        names.insert(account.name.clone(), account.id);
        self.accounts.write().insert(account.id, account);
        Ok(())
    }

    fn count(&self) -> usize {
        self.accounts.read().len()
    }
}

#[derive(Debug, Deserialize)]
struct AccountSeedFile {
    #[serde(default)]
    accounts: Vec<AccountSeed>,
}

#[derive(Debug, Deserialize)]
struct AccountSeed {
    name: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    password_hash: Option<String>,
    #[serde(default)]
    characters: Vec<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Normalize an account name (lowercase, trimmed)
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Stable account id for a normalized name
pub fn account_id(normalized_name: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, normalized_name.as_bytes())
}

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| RealmError::Internal(format!("Failed to hash password: {}", e)))?
        .to_string();

    Ok(password_hash)
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}
