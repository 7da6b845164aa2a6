//! User fixtures.

use chrono::{Duration, Utc};
use rendezvous_service::models::{CallSettings, UserRecord};
use rendezvous_service::store::MemoryStore;

/// Test user fixture.
#[derive(Debug, Clone)]
pub struct TestUser {
    username: String,
    gender: Option<String>,
    preferred_gender: Vec<String>,
    banned_for: Option<Duration>,
    settings: Option<CallSettings>,
}

impl TestUser {
    /// Create a user with no preferences.
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            gender: None,
            preferred_gender: Vec::new(),
            banned_for: None,
            settings: None,
        }
    }

    #[must_use]
    pub fn gender(mut self, gender: &str) -> Self {
        self.gender = Some(gender.to_string());
        self
    }

    /// Only match with users of this gender. Repeatable.
    #[must_use]
    pub fn prefers(mut self, gender: &str) -> Self {
        self.preferred_gender.push(gender.to_string());
        self
    }

    /// Ban the user for `duration` from now.
    #[must_use]
    pub fn banned_for(mut self, duration: Duration) -> Self {
        self.banned_for = Some(duration);
        self
    }

    /// Refuse incoming calls.
    #[must_use]
    pub fn no_call_notifications(mut self) -> Self {
        self.settings = Some(CallSettings {
            call_notifications: false,
            ..self.settings.unwrap_or_default()
        });
        self
    }

    /// Cap this user's calls at `secs`.
    #[must_use]
    pub fn max_call_duration(mut self, secs: u64) -> Self {
        self.settings = Some(CallSettings {
            max_call_duration_secs: secs,
            ..self.settings.unwrap_or_default()
        });
        self
    }

    /// Write the user (and any call settings) into `store`.
    pub fn insert(self, store: &MemoryStore) -> UserRecord {
        let mut user = store.create_user(&self.username);
        user.gender = self.gender;
        user.preferred_gender = self.preferred_gender;
        user.banned_until = self.banned_for.map(|d| Utc::now() + d);
        store.put_user(user.clone());
        if let Some(settings) = self.settings {
            store.put_call_settings(user.id, settings);
        }
        user
    }
}
