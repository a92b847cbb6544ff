use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::model::Actor;

/// Map a connection's user name to the caller it acts as:
/// `student:<ULID>`, `tutor:<ULID>`, `admin` or `admin:<ULID>`.
pub fn parse_actor(user: &str) -> Option<Actor> {
    let (role, id) = match user.split_once(':') {
        Some((role, id)) => (role, Some(id)),
        None => (user, None),
    };
    let id = id.map(Ulid::from_string).transpose().ok()?;
    match (role.to_ascii_lowercase().as_str(), id) {
        ("student", Some(id)) => Some(Actor::student(id)),
        ("tutor", Some(id)) => Some(Actor::tutor(id)),
        ("admin", None) => Some(Actor::admin()),
        ("admin", Some(id)) => Some(Actor {
            user_id: id,
            ..Actor::admin()
        }),
        _ => None,
    }
}

/// Shared-password authentication. The user name must also name a valid actor.
#[derive(Debug)]
pub struct TutorslotAuthSource {
    password: String,
}

impl TutorslotAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for TutorslotAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if parse_actor(user).is_none() {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("rejected login for unrecognised user {user:?}");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("user {user:?} is not student:<id>, tutor:<id> or admin"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
