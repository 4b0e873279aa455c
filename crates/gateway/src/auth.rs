//! Bearer-token users and daily message entitlements.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use stepweave_config::{Entitlements, UserConfig, UserType};
use stepweave_core::store::ChatStore;
use tracing::{debug, warn};

use crate::SharedState;
use crate::error::ChatError;

/// User every request runs as when no tokens are configured.
pub const LOCAL_USER: &str = "local";

/// The caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub user_type: UserType,
}

/// Token → user lookup built from `gateway.users`.
#[derive(Debug, Default)]
pub struct Users {
    by_token: HashMap<String, AuthUser>,
}

impl Users {
    pub fn new(users: &[UserConfig]) -> Self {
        let by_token = users
            .iter()
            .map(|u| {
                (
                    u.token.clone(),
                    AuthUser {
                        id: u.user_id.clone(),
                        user_type: u.user_type,
                    },
                )
            })
            .collect();
        Self { by_token }
    }

    /// Resolve the `Authorization` header value.
    ///
    /// With no configured users every caller is the local user.
    pub fn authenticate(&self, header: Option<&str>) -> Result<AuthUser, ChatError> {
        if self.by_token.is_empty() {
            return Ok(AuthUser {
                id: LOCAL_USER.into(),
                user_type: UserType::Regular,
            });
        }

        let token = header.and_then(|v| v.strip_prefix("Bearer "));
        match token.and_then(|t| self.by_token.get(t)) {
            Some(user) => Ok(user.clone()),
            None => {
                warn!("Unauthorized chat request: missing or invalid bearer token");
                Err(ChatError::Unauthorized)
            }
        }
    }
}

impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = ChatError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        state.users.authenticate(header)
    }
}

/// Reject the request once the user sent their daily allowance of messages.
pub async fn check_entitlement(
    store: &dyn ChatStore,
    entitlements: &Entitlements,
    user: &AuthUser,
) -> Result<(), ChatError> {
    let since = Utc::now() - Duration::hours(24);
    let sent = store.user_message_count_since(&user.id, since).await?;
    let allowed = entitlements.max_messages_per_day(user.user_type);
    debug!(user_id = %user.id, sent, allowed, "Checked message entitlement");

    if sent >= allowed {
        warn!(user_id = %user.id, sent, allowed, "Daily message allowance exhausted");
        return Err(ChatError::RateLimit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepweave_core::message::Message;
    use stepweave_core::store::Chat;
    use stepweave_store::InMemoryChatStore;

    fn users() -> Users {
        Users::new(&[UserConfig {
            token: "t-guest".into(),
            user_id: "guest-1".into(),
            user_type: UserType::Guest,
        }])
    }

    #[test]
    fn resolves_bearer_token() {
        let user = users().authenticate(Some("Bearer t-guest")).unwrap();
        assert_eq!(user.id, "guest-1");
        assert_eq!(user.user_type, UserType::Guest);
    }

    #[test]
    fn rejects_missing_or_unknown_token() {
        assert_eq!(users().authenticate(None), Err(ChatError::Unauthorized));
        assert_eq!(
            users().authenticate(Some("Bearer nope")),
            Err(ChatError::Unauthorized)
        );
        assert_eq!(
            users().authenticate(Some("t-guest")),
            Err(ChatError::Unauthorized)
        );
    }

    #[test]
    fn no_configured_users_means_local_user() {
        let user = Users::default().authenticate(None).unwrap();
        assert_eq!(user.id, LOCAL_USER);
    }

    #[tokio::test]
    async fn entitlement_counts_user_messages() {
        let store = InMemoryChatStore::new();
        store.save_chat(Chat::new("c1", "guest-1", "t")).await.unwrap();
        for i in 0..2 {
            store
                .upsert_message("c1", Message::user(format!("hi {i}")))
                .await
                .unwrap();
        }

        let user = AuthUser {
            id: "guest-1".into(),
            user_type: UserType::Guest,
        };
        let tight = Entitlements {
            guest_messages_per_day: 2,
            regular_messages_per_day: 10,
        };
        assert_eq!(
            check_entitlement(&store, &tight, &user).await,
            Err(ChatError::RateLimit)
        );
        assert!(
            check_entitlement(&store, &Entitlements::default(), &user)
                .await
                .is_ok()
        );
    }
}
