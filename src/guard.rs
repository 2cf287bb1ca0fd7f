//! Route table and role-based access guard.

use crate::backend::AuthUser;
use crate::model::Role;
use crate::session::SessionState;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;

pub const LOGIN_PATH: &str = "/login";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum GuardDecision {
    Pending,
    Render,
    #[serde(rename_all = "camelCase")]
    Redirect {
        to: String,
        from: String,
        invalid_role: bool,
    },
}

/// Decides what a guarded view shows for the given session snapshot.
///
/// `identity` wins over `role`: a session that has an identity but no role
/// yet is still a redirect, flagged as invalid.
pub fn evaluate(
    loading: bool,
    identity: Option<&AuthUser>,
    role: Option<Role>,
    required: Role,
    from: &str,
) -> GuardDecision {
    if loading {
        return GuardDecision::Pending;
    }
    let redirect = |invalid_role| GuardDecision::Redirect {
        to: LOGIN_PATH.to_string(),
        from: from.to_string(),
        invalid_role,
    };
    match (identity, role) {
        (None, _) => redirect(false),
        (Some(_), Some(r)) if r == required => GuardDecision::Render,
        (Some(_), _) => redirect(true),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Home,
    About,
    Admission,
    Academic,
    Faculty,
    Courses,
    Contact,
    Announcements,
    Events,
    News,
    Support,
    Login,
    Dashboard(Role),
}

const PUBLIC_VIEWS: [(View, &str); 12] = [
    (View::Home, "/"),
    (View::About, "/about"),
    (View::Admission, "/admission"),
    (View::Academic, "/academic"),
    (View::Faculty, "/faculty"),
    (View::Courses, "/courses"),
    (View::Contact, "/contact"),
    (View::Announcements, "/announcements"),
    (View::Events, "/events"),
    (View::News, "/news"),
    (View::Support, "/support"),
    (View::Login, LOGIN_PATH),
];

fn normalize(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or("");
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

impl View {
    pub fn from_path(path: &str) -> Option<View> {
        let path = normalize(path);
        if let Some(rest) = path.strip_prefix("/dashboard/") {
            return Role::ALL
                .into_iter()
                .find(|r| r.as_str() == rest)
                .map(View::Dashboard);
        }
        PUBLIC_VIEWS
            .iter()
            .find(|(_, p)| *p == path)
            .map(|(view, _)| *view)
    }

    pub fn required_role(self) -> Option<Role> {
        match self {
            View::Dashboard(role) => Some(role),
            _ => None,
        }
    }

    pub fn name(self) -> String {
        match self {
            View::Dashboard(role) => format!("dashboard.{}", role),
            View::Home => "home".into(),
            View::About => "about".into(),
            View::Admission => "admission".into(),
            View::Academic => "academic".into(),
            View::Faculty => "faculty".into(),
            View::Courses => "courses".into(),
            View::Contact => "contact".into(),
            View::Announcements => "announcements".into(),
            View::Events => "events".into(),
            View::News => "news".into(),
            View::Support => "support".into(),
            View::Login => "login".into(),
        }
    }
}

pub fn dashboard_for(role: Role) -> String {
    format!("/dashboard/{}", role)
}

/// Where a freshly signed-in user lands: back to `from` when they may see
/// it, otherwise their own dashboard. `None` while anonymous.
pub fn landing(state: &SessionState, from: Option<&str>) -> Option<String> {
    let role = state.role()?;
    let wanted = from.and_then(|f| View::from_path(f).map(|v| (f, v)));
    match wanted {
        Some((f, view)) if view != View::Login => match view.required_role() {
            None => Some(f.to_string()),
            Some(r) if r == role => Some(f.to_string()),
            Some(_) => Some(dashboard_for(role)),
        },
        _ => Some(dashboard_for(role)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub view: Option<View>,
    pub decision: GuardDecision,
}

impl Resolution {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "view": self.view.map(|v| v.name()).unwrap_or_else(|| "notFound".into()),
            "decision": self.decision,
        })
    }
}

pub fn resolve(state: &SessionState, path: &str) -> Resolution {
    let view = View::from_path(path);
    let decision = match view.and_then(|v| v.required_role()) {
        Some(required) => evaluate(state.loading, state.identity(), state.role(), required, path),
        None => GuardDecision::Render,
    };
    Resolution { view, decision }
}

/// Guard bound to one requested location, re-evaluated on every session change.
pub struct RouteGuard {
    rx: watch::Receiver<SessionState>,
    path: String,
}

impl RouteGuard {
    pub fn new(rx: watch::Receiver<SessionState>, path: impl Into<String>) -> Self {
        Self {
            rx,
            path: path.into(),
        }
    }

    /// A guard over a session that never settles, for callers with no store.
    pub fn detached(path: impl Into<String>) -> Self {
        let (_tx, rx) = watch::channel(SessionState::default());
        Self::new(rx, path)
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            view: View::from_path(&self.path),
            decision: self.decision(),
        }
    }

    pub fn decision(&self) -> GuardDecision {
        resolve(&self.rx.borrow(), &self.path).decision
    }

    /// Waits for the next session change. `None` once the store is gone.
    #[cfg(test)]
    pub async fn changed(&mut self) -> Option<GuardDecision> {
        self.rx.changed().await.ok()?;
        Some(self.decision())
    }
}
