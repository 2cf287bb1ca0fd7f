use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
    Admin,
    Parent,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Student, Role::Teacher, Role::Admin, Role::Parent];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
            Role::Parent => "parent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown role: {}", self.0)
    }
}

impl std::error::Error for UnknownRole {}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            "admin" => Ok(Role::Admin),
            "parent" => Ok(Role::Parent),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Application-level record paired one-to-one with an auth identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub role: Role,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub avatar_url: Option<String>,
    pub department: Option<String>,
}

pub const PROFILE_COLUMNS: &str = "id, role, email, first_name, last_name, avatar_url, department";

impl Profile {
    /// Maps a row selected with `PROFILE_COLUMNS`, starting at `offset`.
    pub fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Profile> {
        let role_raw: String = row.get(offset + 1)?;
        let role = role_raw.parse::<Role>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                offset + 1,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?;
        Ok(Profile {
            id: row.get(offset)?,
            role,
            email: row.get(offset + 2)?,
            first_name: row.get(offset + 3)?,
            last_name: row.get(offset + 4)?,
            avatar_url: row.get(offset + 5)?,
            department: row.get(offset + 6)?,
        })
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Partial profile update. `None` leaves a column untouched; `avatar_url`
/// and `department` use `Some(None)` to clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilePatch {
    pub role: Option<Role>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<Option<String>>,
    pub department: Option<Option<String>>,
}

impl ProfilePatch {
    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.email.is_none()
            && self.first_name.is_none()
            && self.last_name.is_none()
            && self.avatar_url.is_none()
            && self.department.is_none()
    }

    /// Reads camelCase fields from an IPC params object. Unknown keys are rejected.
    pub fn from_json(v: &serde_json::Value, allow_role: bool) -> Result<ProfilePatch, String> {
        let Some(obj) = v.as_object() else {
            return Err("patch must be an object".into());
        };
        let mut patch = ProfilePatch::default();
        for (k, val) in obj {
            match k.as_str() {
                "role" if allow_role => {
                    let s = val.as_str().ok_or("role must be string")?;
                    patch.role = Some(s.parse::<Role>().map_err(|e| e.to_string())?);
                }
                "email" => patch.email = Some(required_text(val, k)?),
                "firstName" => patch.first_name = Some(required_text(val, k)?),
                "lastName" => patch.last_name = Some(required_text(val, k)?),
                "avatarUrl" => patch.avatar_url = Some(nullable_text(val, k)?),
                "department" => patch.department = Some(nullable_text(val, k)?),
                _ => return Err(format!("unknown profile field: {}", k)),
            }
        }
        Ok(patch)
    }
}

fn required_text(v: &serde_json::Value, key: &str) -> Result<String, String> {
    let s = v
        .as_str()
        .ok_or_else(|| format!("{} must be string", key))?
        .trim();
    if s.is_empty() {
        return Err(format!("{} must not be empty", key));
    }
    Ok(s.to_string())
}

fn nullable_text(v: &serde_json::Value, key: &str) -> Result<Option<String>, String> {
    if v.is_null() {
        return Ok(None);
    }
    let s = v
        .as_str()
        .ok_or_else(|| format!("{} must be string or null", key))?
        .trim();
    Ok(if s.is_empty() { None } else { Some(s.to_string()) })
}
