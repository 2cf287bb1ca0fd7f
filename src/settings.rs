use crate::db;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Auth,
    Notifications,
    School,
}

impl Section {
    pub const ALL: [Section; 3] = [Section::Auth, Section::Notifications, Section::School];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auth" => Some(Self::Auth),
            "notifications" => Some(Self::Notifications),
            "school" => Some(Self::School),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Notifications => "notifications",
            Self::School => "school",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Auth => "setup.auth",
            Self::Notifications => "setup.notifications",
            Self::School => "setup.school",
        }
    }
}

fn default_section(section: Section) -> Value {
    match section {
        Section::Auth => json!({
            "sessionTtlMinutes": 60,
            "minPasswordLength": 8
        }),
        Section::Notifications => json!({
            "dismissAfterMs": 3000
        }),
        Section::School => json!({
            "name": "",
            "admissionsOpen": true
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

pub fn merge_section_patch(
    section: Section,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            Section::Auth => match k.as_str() {
                "sessionTtlMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 5, 10080)?));
                }
                "minPasswordLength" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 6, 128)?));
                }
                _ => return Err(format!("unknown auth field: {}", k)),
            },
            Section::Notifications => match k.as_str() {
                "dismissAfterMs" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 500, 60000)?));
                }
                _ => return Err(format!("unknown notifications field: {}", k)),
            },
            Section::School => match k.as_str() {
                "name" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "admissionsOpen" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: Section) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed stored values fall back to defaults rather than blocking start-up.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

pub fn save_section(conn: &Connection, section: Section, value: &Value) -> anyhow::Result<()> {
    db::settings_set_json(conn, section.key(), value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthSettings {
    pub session_ttl_minutes: i64,
    pub min_password_length: usize,
}

pub fn auth(conn: &Connection) -> anyhow::Result<AuthSettings> {
    let v = load_section(conn, Section::Auth)?;
    Ok(AuthSettings {
        session_ttl_minutes: v.get("sessionTtlMinutes").and_then(|x| x.as_i64()).unwrap_or(60),
        min_password_length: v
            .get("minPasswordLength")
            .and_then(|x| x.as_u64())
            .unwrap_or(8) as usize,
    })
}

pub fn dismiss_after_ms(conn: &Connection) -> anyhow::Result<u64> {
    let v = load_section(conn, Section::Notifications)?;
    Ok(v.get("dismissAfterMs").and_then(|x| x.as_u64()).unwrap_or(3000))
}

pub fn admissions_open(conn: &Connection) -> anyhow::Result<bool> {
    let v = load_section(conn, Section::School)?;
    Ok(v.get("admissionsOpen").and_then(|x| x.as_bool()).unwrap_or(true))
}
