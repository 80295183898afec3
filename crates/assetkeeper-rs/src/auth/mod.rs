use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Operator;

#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
}

/// Bearer-token sessions for operators listed in configuration.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionStore {
    pub async fn login(&self, operators: &[Operator], username: &str, password: &str) -> Option<String> {
        let username = username.trim();
        operators
            .iter()
            .find(|op| op.username.eq_ignore_ascii_case(username) && op.password == password)?;

        let token = Uuid::new_v4().to_string();
        self.inner.write().await.insert(
            token.clone(),
            Session {
                username: username.to_lowercase(),
            },
        );
        Some(token)
    }

    pub async fn get(&self, token: &str) -> Option<Session> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn logout(&self, token: &str) -> bool {
        self.inner.write().await.remove(token).is_some()
    }
}
