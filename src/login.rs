use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use log::{info, warn};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::error::{EntryError, Result};
use crate::model::{Actor, Location, Role, UserRecord};
use crate::store::Store;

/// Default session lifetime: 24 hours.
pub const SESSION_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Credential data for login
#[derive(Debug, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,

    /// Password in plaintext (only transmitted, never stored)
    pub password: String,
}

/// Account data for a user created by the super admin.
#[derive(Debug, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub role: Role,
    #[serde(default)]
    pub location_id: Option<i64>,
}

/// Add a location (tenant) by name.
pub fn create_location(store: &Store, name: &str) -> Result<Location> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EntryError::Validation("location name cannot be empty".into()));
    }
    let conn = store.connection();
    let exists: Option<i64> = conn
        .query_row(
            "SELECT id FROM locations WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(EntryError::Validation(format!(
            "location '{}' already exists",
            name
        )));
    }

    conn.execute("INSERT INTO locations (name) VALUES (?1)", params![name])?;
    let id = conn.last_insert_rowid();
    info!("created location {} '{}'", id, name);
    Ok(Location {
        id,
        name: name.to_string(),
    })
}

pub fn list_locations(store: &Store) -> Result<Vec<Location>> {
    let mut stmt = store
        .connection()
        .prepare("SELECT id, name FROM locations ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok(Location {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Register a new user
///
/// The password is hashed with Argon2 before storage. Admins and field users
/// must be tied to an existing location; a super admin may have none.
///
/// # Errors
/// * empty username or password
/// * username already taken
/// * missing or unknown location
pub fn register_user(store: &Store, new_user: &NewUser) -> Result<UserRecord> {
    let username = new_user.username.trim();
    if username.is_empty() || new_user.password.is_empty() {
        return Err(EntryError::Validation(
            "username and password cannot be empty".into(),
        ));
    }
    let conn = store.connection();

    let taken: Option<i64> = conn
        .query_row(
            "SELECT id FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(EntryError::Validation("username already exists".into()));
    }

    let location = match new_user.location_id {
        Some(id) => Some(
            conn.query_row(
                "SELECT name FROM locations WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or_else(|| EntryError::NotFound(format!("location {}", id)))?,
        ),
        None if new_user.role == Role::SuperAdmin => None,
        None => {
            return Err(EntryError::Validation(format!(
                "a {} needs a location",
                new_user.role
            )));
        }
    };

    let password_hash = hash_password(&new_user.password)?;
    conn.execute(
        "INSERT INTO users (username, password_hash, role, location_id) VALUES (?1, ?2, ?3, ?4)",
        params![username, password_hash, new_user.role.as_str(), new_user.location_id],
    )?;
    let id = conn.last_insert_rowid();
    info!("registered {} '{}'", new_user.role, username);

    Ok(UserRecord {
        id,
        username: username.to_string(),
        role: new_user.role,
        location_id: new_user.location_id,
        location,
    })
}

pub fn list_users(store: &Store) -> Result<Vec<UserRecord>> {
    let mut stmt = store.connection().prepare(
        "SELECT u.id, u.username, u.role, u.location_id, l.name \
         FROM users u LEFT JOIN locations l ON u.location_id = l.id ORDER BY u.id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<i64>>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;

    let mut users = Vec::new();
    for row in rows {
        let (id, username, role, location_id, location) = row?;
        users.push(UserRecord {
            id,
            username,
            role: role.parse()?,
            location_id,
            location,
        });
    }
    Ok(users)
}

/// Verify user credentials
///
/// # Returns
/// * `Ok(Some(actor))` when the username exists and the password matches
/// * `Ok(None)` for an unknown user or a wrong password
pub fn verify_user(store: &Store, username: &str, password: &str) -> Result<Option<Actor>> {
    let found: Option<(String, String, Option<i64>)> = store
        .connection()
        .query_row(
            "SELECT password_hash, role, location_id FROM users WHERE username = ?1",
            params![username],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((hash, role, location_id)) = found else {
        return Ok(None);
    };
    if !verify_password(password, &hash)? {
        warn!("failed login for '{}'", username);
        return Ok(None);
    }

    Ok(Some(Actor {
        username: username.to_string(),
        role: role.parse()?,
        location_id,
    }))
}

/// Hash a password using Argon2
fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| EntryError::Validation("password hashing failed".into()))
}

/// Verify a password against a stored hash
fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|_| EntryError::Unauthorized("invalid password hash format".into()))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// User session data
#[derive(Debug, Clone)]
pub struct Session {
    pub actor: Actor,
    pub expires_at: SystemTime,
}

/// Active sessions keyed by session id, owned by the server state.
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        SessionStore::new(SESSION_DURATION)
    }
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        SessionStore {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Create a session for an authenticated actor and return its id.
    pub fn create(&self, actor: Actor) -> String {
        let session_id = Uuid::new_v4().to_string();
        let session = Session {
            actor,
            expires_at: SystemTime::now() + self.ttl,
        };

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|_, s| s.expires_at > SystemTime::now());
        sessions.insert(session_id.clone(), session);

        session_id
    }

    /// The actor behind a session if it exists and has not expired.
    pub fn validate(&self, session_id: &str) -> Option<Actor> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());

        sessions
            .get(session_id)
            .filter(|s| s.expires_at > SystemTime::now())
            .map(|s| s.actor.clone())
    }

    pub fn remove(&self, session_id: &str) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(session_id);
    }
}
