//! Encrypted secret storage using SQLite.
//!
//! Persists linked marketplace accounts, their encrypted token material, and
//! the single-use OAuth state ledger. Token columns never contain plaintext
//! at rest, except the deprecated legacy columns of pre-migration rows that
//! are upgraded in place on their next write.
//!
//! # Schema
//! ```sql
//! CREATE TABLE accounts (
//!     id TEXT PRIMARY KEY,
//!     provider TEXT NOT NULL,
//!     org_id TEXT NOT NULL,
//!     provider_account_id TEXT NOT NULL,
//!     display_name TEXT NOT NULL,
//!     active INTEGER NOT NULL,
//!     profile TEXT NOT NULL,
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     UNIQUE(provider, provider_account_id, org_id)
//! );
//! CREATE TABLE secrets (
//!     account_id TEXT NOT NULL,
//!     provider TEXT NOT NULL,
//!     generation INTEGER NOT NULL,
//!     token_envelope TEXT,       -- generation 3: one envelope, whole token set
//!     access_token_enc TEXT,     -- generation 2: envelope per token
//!     refresh_token_enc TEXT,
//!     access_token_plain TEXT,   -- generation 1: pre-migration plaintext
//!     refresh_token_plain TEXT,
//!     expires_at TEXT,
//!     updated_at TEXT NOT NULL,
//!     UNIQUE(account_id, provider)
//! );
//! CREATE TABLE oauth_states (
//!     state TEXT PRIMARY KEY,
//!     code_verifier TEXT NOT NULL,
//!     user_id TEXT NOT NULL,
//!     org_id TEXT NOT NULL,
//!     provider TEXT NOT NULL,
//!     expires_at TEXT NOT NULL,
//!     used INTEGER NOT NULL
//! );
//! ```
//!
//! # Thread Safety
//! - Connection is wrapped in Mutex for safe concurrent access
//! - SQLite itself is thread-safe with serialized mode

use super::{encryption, IntegrationAccount, OAuthState, Provider, TokenSet};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Storage generation written by `put_tokens`. One AEAD envelope over the
/// whole token-set JSON.
const GEN_TOKEN_ENVELOPE: i64 = 3;

/// Historical generation: separate envelope per access/refresh token.
const GEN_SPLIT_FIELDS: i64 = 2;

/// Oldest generation: plaintext columns, pre-encryption rows.
const GEN_LEGACY_PLAINTEXT: i64 = 1;

/// One secret row resolved into its storage generation, newest candidate
/// first. Resolved exactly once at read time; no call site sniffs column
/// prefixes on its own.
#[derive(Debug)]
enum StoredSecret {
    TokenEnvelope {
        envelope: String,
    },
    SplitFields {
        access: String,
        refresh: Option<String>,
    },
    LegacyPlaintext {
        access: String,
        refresh: Option<String>,
    },
}

/// Raw secret row as it comes off disk.
struct SecretRow {
    token_envelope: Option<String>,
    access_token_enc: Option<String>,
    refresh_token_enc: Option<String>,
    access_token_plain: Option<String>,
    refresh_token_plain: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl SecretRow {
    /// Resolves every populated generation, newest to oldest. All populated
    /// generations are candidates: a corrupt newer field must not block
    /// falling back to an older, still-valid one.
    fn candidates(&self) -> Vec<StoredSecret> {
        let mut out = Vec::new();
        if let Some(envelope) = &self.token_envelope {
            out.push(StoredSecret::TokenEnvelope {
                envelope: envelope.clone(),
            });
        }
        if let Some(access) = &self.access_token_enc {
            out.push(StoredSecret::SplitFields {
                access: access.clone(),
                refresh: self.refresh_token_enc.clone(),
            });
        }
        if let Some(access) = &self.access_token_plain {
            out.push(StoredSecret::LegacyPlaintext {
                access: access.clone(),
                refresh: self.refresh_token_plain.clone(),
            });
        }
        out
    }
}

/// Encrypted secret storage backed by SQLite.
pub struct SecretStore {
    conn: Mutex<Connection>,
    key_material: String,
}

impl SecretStore {
    /// Creates or opens a secret store.
    pub fn new<P: AsRef<Path>>(db_path: P, key_material: &str) -> Result<Self> {
        encryption::validate_key_material(key_material)?;

        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                org_id TEXT NOT NULL,
                provider_account_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                profile TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(provider, provider_account_id, org_id)
            );
            CREATE TABLE IF NOT EXISTS secrets (
                account_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                generation INTEGER NOT NULL,
                token_envelope TEXT,
                access_token_enc TEXT,
                refresh_token_enc TEXT,
                access_token_plain TEXT,
                refresh_token_plain TEXT,
                expires_at TEXT,
                updated_at TEXT NOT NULL,
                UNIQUE(account_id, provider)
            );
            CREATE TABLE IF NOT EXISTS oauth_states (
                state TEXT PRIMARY KEY,
                code_verifier TEXT NOT NULL,
                user_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_accounts_provider
                ON accounts(provider, active);
            CREATE INDEX IF NOT EXISTS idx_secrets_account
                ON secrets(account_id, provider);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            key_material: key_material.to_string(),
        })
    }

    // -----------------------------------------------------------------
    // Secrets
    // -----------------------------------------------------------------

    /// Retrieves and decrypts the current token set for an account.
    ///
    /// Tries generations newest to oldest; the first attempt yielding a
    /// non-empty access token wins. Fails with `DecryptionError` only when
    /// every populated generation fails.
    pub fn get_active_tokens(&self, account_id: &str, provider: Provider) -> Result<TokenSet> {
        let row = self.read_secret_row(account_id, provider)?;
        let candidates = row.candidates();
        if candidates.is_empty() {
            return Err(Error::NotFound(format!(
                "no token material stored for account {}",
                account_id
            )));
        }

        for candidate in &candidates {
            match self.resolve_candidate(candidate, row.expires_at) {
                Ok(tokens) if !tokens.access_token.is_empty() => return Ok(tokens),
                Ok(_) => {
                    warn!(account_id, "stored generation decoded to an empty access token");
                }
                Err(e) => {
                    warn!(
                        account_id,
                        error = %e,
                        "stored generation unreadable, falling back to older generation"
                    );
                }
            }
        }

        Err(Error::Decryption(format!(
            "every storage generation failed for account {}",
            account_id
        )))
    }

    fn resolve_candidate(
        &self,
        candidate: &StoredSecret,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<TokenSet> {
        match candidate {
            StoredSecret::TokenEnvelope { envelope } => {
                let plaintext = encryption::decrypt(envelope, &self.key_material)?;
                Ok(serde_json::from_str(&plaintext)?)
            }
            StoredSecret::SplitFields { access, refresh } => {
                let access_token = encryption::decrypt(access, &self.key_material)?;
                let refresh_token = refresh
                    .as_deref()
                    .map(|r| encryption::decrypt(r, &self.key_material))
                    .transpose()?;
                Ok(TokenSet {
                    access_token,
                    refresh_token,
                    expires_at,
                    token_type: None,
                })
            }
            StoredSecret::LegacyPlaintext { access, refresh } => Ok(TokenSet {
                access_token: access.clone(),
                refresh_token: refresh.clone(),
                expires_at,
                token_type: None,
            }),
        }
    }

    /// Persists a token set, always in the newest generation.
    ///
    /// Whole-record replacement: older-generation columns are cleared so an
    /// upgraded record never regresses ("non-downgrade"), and access/refresh
    /// tokens can never desynchronize through a partial patch.
    pub fn put_tokens(
        &self,
        account_id: &str,
        provider: Provider,
        tokens: &TokenSet,
    ) -> Result<()> {
        let payload = serde_json::to_string(tokens)?;
        let envelope = encryption::encrypt(&payload, &self.key_material)?;
        let expires_at = tokens.expires_at.map(|dt| dt.to_rfc3339());
        let now = Utc::now().to_rfc3339();

        self.conn.lock().unwrap().execute(
            r#"
            INSERT INTO secrets (
                account_id, provider, generation, token_envelope,
                access_token_enc, refresh_token_enc,
                access_token_plain, refresh_token_plain,
                expires_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, NULL, NULL, NULL, NULL, ?5, ?6)
            ON CONFLICT(account_id, provider) DO UPDATE SET
                generation = excluded.generation,
                token_envelope = excluded.token_envelope,
                access_token_enc = NULL,
                refresh_token_enc = NULL,
                access_token_plain = NULL,
                refresh_token_plain = NULL,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![
                account_id,
                provider.as_str(),
                GEN_TOKEN_ENVELOPE,
                envelope,
                expires_at,
                now,
            ],
        )?;

        Ok(())
    }

    /// Reads the stored expiry without decrypting anything.
    pub fn get_expiry(
        &self,
        account_id: &str,
        provider: Provider,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = self.read_secret_row(account_id, provider)?;
        Ok(row.expires_at)
    }

    fn read_secret_row(&self, account_id: &str, provider: Provider) -> Result<SecretRow> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT token_envelope, access_token_enc, refresh_token_enc,
                   access_token_plain, refresh_token_plain, expires_at
            FROM secrets
            WHERE account_id = ?1 AND provider = ?2
            "#,
            params![account_id, provider.as_str()],
            |row| {
                Ok(SecretRow {
                    token_envelope: row.get(0)?,
                    access_token_enc: row.get(1)?,
                    refresh_token_enc: row.get(2)?,
                    access_token_plain: row.get(3)?,
                    refresh_token_plain: row.get(4)?,
                    expires_at: parse_timestamp(row.get::<_, Option<String>>(5)?),
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!(
                "no secret stored for account {} ({})",
                account_id, provider
            )),
            other => Error::Storage(other),
        })
    }

    // -----------------------------------------------------------------
    // Accounts
    // -----------------------------------------------------------------

    /// Creates or reactivates an account keyed by
    /// (provider, provider_account_id, org_id).
    pub fn upsert_account(
        &self,
        provider: Provider,
        provider_account_id: &str,
        org_id: &str,
        display_name: &str,
        profile: &serde_json::Value,
    ) -> Result<IntegrationAccount> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let profile_json = serde_json::to_string(profile)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO accounts (
                id, provider, org_id, provider_account_id,
                display_name, active, profile, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?7)
            ON CONFLICT(provider, provider_account_id, org_id) DO UPDATE SET
                display_name = excluded.display_name,
                active = 1,
                profile = excluded.profile,
                updated_at = excluded.updated_at
            "#,
            params![
                id,
                provider.as_str(),
                org_id,
                provider_account_id,
                display_name,
                profile_json,
                now,
            ],
        )?;

        conn.query_row(
            r#"
            SELECT id, provider, org_id, provider_account_id, display_name,
                   active, profile, created_at, updated_at
            FROM accounts
            WHERE provider = ?1 AND provider_account_id = ?2 AND org_id = ?3
            "#,
            params![provider.as_str(), provider_account_id, org_id],
            account_from_row,
        )
        .map_err(Error::Storage)
    }

    /// Looks up an account by id.
    pub fn get_account(&self, account_id: &str) -> Result<IntegrationAccount> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT id, provider, org_id, provider_account_id, display_name,
                   active, profile, created_at, updated_at
            FROM accounts
            WHERE id = ?1
            "#,
            params![account_id],
            account_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                Error::NotFound(format!("no account {}", account_id))
            }
            other => Error::Storage(other),
        })
    }

    /// Lists all active accounts for a provider, for the proactive sweep.
    pub fn list_active_accounts(&self, provider: Provider) -> Result<Vec<IntegrationAccount>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, provider, org_id, provider_account_id, display_name,
                   active, profile, created_at, updated_at
            FROM accounts
            WHERE provider = ?1 AND active = 1
            ORDER BY created_at
            "#,
        )?;

        let accounts = stmt
            .query_map(params![provider.as_str()], account_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    /// Marks an account inactive. Revoked accounts are deactivated, never
    /// deleted.
    pub fn deactivate_account(&self, account_id: &str) -> Result<()> {
        let updated = self.conn.lock().unwrap().execute(
            "UPDATE accounts SET active = 0, updated_at = ?2 WHERE id = ?1",
            params![account_id, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("no account {}", account_id)));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // OAuth state ledger
    // -----------------------------------------------------------------

    /// Persists a flow ticket at authorization start.
    pub fn create_state(&self, state: &OAuthState) -> Result<()> {
        self.conn.lock().unwrap().execute(
            r#"
            INSERT INTO oauth_states (
                state, code_verifier, user_id, org_id, provider, expires_at, used
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
            "#,
            params![
                state.state,
                state.code_verifier,
                state.user_id,
                state.org_id,
                state.provider.as_str(),
                state.expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Atomically claims an unused, unexpired state ticket.
    ///
    /// The conditional UPDATE marks the ticket used in the same statement
    /// that reads it, so two concurrent callback deliveries for the same
    /// state can never both succeed.
    pub fn claim_state(&self, state_value: &str) -> Result<OAuthState> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            UPDATE oauth_states
            SET used = 1
            WHERE state = ?1 AND used = 0 AND expires_at > ?2
            RETURNING state, code_verifier, user_id, org_id, provider, expires_at
            "#,
            params![state_value, now],
            |row| {
                let provider: String = row.get(4)?;
                let expires_at: String = row.get(5)?;
                Ok(OAuthState {
                    state: row.get(0)?,
                    code_verifier: row.get(1)?,
                    user_id: row.get(2)?,
                    org_id: row.get(3)?,
                    provider: Provider::from_str(&provider).map_err(|_| {
                        rusqlite::Error::InvalidColumnType(
                            4,
                            "provider".to_string(),
                            rusqlite::types::Type::Text,
                        )
                    })?,
                    expires_at: parse_timestamp(Some(expires_at)).unwrap_or_else(Utc::now),
                    used: true,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::InvalidState(
                "state absent, already used, or expired".to_string(),
            ),
            other => Error::Storage(other),
        })
    }

    /// Deletes expired state tickets. Called periodically; used-but-recent
    /// tickets are kept until expiry so replays keep hitting the used flag.
    pub fn purge_expired_states(&self) -> Result<usize> {
        let deleted = self.conn.lock().unwrap().execute(
            "DELETE FROM oauth_states WHERE expires_at <= ?1",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(deleted)
    }

    /// Count of open state tickets (monitoring).
    pub fn pending_state_count(&self) -> Result<usize> {
        let count: i64 = self.conn.lock().unwrap().query_row(
            "SELECT COUNT(*) FROM oauth_states WHERE used = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<IntegrationAccount> {
    let provider: String = row.get(1)?;
    let profile: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(IntegrationAccount {
        id: row.get(0)?,
        provider: Provider::from_str(&provider).map_err(|_| {
            rusqlite::Error::InvalidColumnType(1, "provider".to_string(), rusqlite::types::Type::Text)
        })?,
        org_id: row.get(2)?,
        provider_account_id: row.get(3)?,
        display_name: row.get(4)?,
        active: row.get::<_, i64>(5)? != 0,
        profile: serde_json::from_str(&profile).unwrap_or(serde_json::Value::Null),
        created_at: parse_timestamp(Some(created_at)).unwrap_or_else(Utc::now),
        updated_at: parse_timestamp(Some(updated_at)).unwrap_or_else(Utc::now),
    })
}
