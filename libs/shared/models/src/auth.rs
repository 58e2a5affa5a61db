use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: Option<u64>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub app_metadata: Option<serde_json::Value>,
    pub user_metadata: Option<serde_json::Value>,
    pub aud: Option<String>,
    pub iat: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Role a caller acts under when touching the consultation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Patient,
    Doctor,
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorRole::Patient => write!(f, "patient"),
            ActorRole::Doctor => write!(f, "doctor"),
        }
    }
}

/// Authenticated caller identity as the queue engine sees it. The engine
/// checks ownership and role against this; it never authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub role: ActorRole,
}

impl User {
    /// Build the engine-facing actor from a validated token's user.
    /// Fails when the subject is not a UUID or the role claim is missing
    /// or unknown.
    pub fn to_actor(&self) -> Result<Actor, String> {
        let id = Uuid::parse_str(&self.id).map_err(|_| "User id is not a valid UUID".to_string())?;
        let role = match self.role.as_deref() {
            Some("patient") => ActorRole::Patient,
            Some("doctor") => ActorRole::Doctor,
            Some(other) => return Err(format!("Unknown role claim: {}", other)),
            None => return Err("Missing role claim".to_string()),
        };
        Ok(Actor { id, role })
    }
}
