//! Content model: users, settings, categories, posts, comments, invites, and the
//! input/patch payloads accepted by the operation set.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::identity::Role;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub role: Role,
    pub verified: bool,
    pub avatar: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub id: String,
    pub user: String,
    pub theme: Theme,
    pub email_notifications: bool,
    pub push_notifications: bool,
}

impl Settings {
    /// Defaults every new account starts with.
    pub fn defaults_for(user_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user: user_id.to_string(),
            theme: Theme::Dark,
            email_notifications: true,
            push_notifications: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub value: String,
    pub label: String,
}

impl Category {
    pub fn new(value: &str, label: &str) -> Self { Self { value: value.into(), label: label.into() } }
}

pub fn default_categories() -> Vec<Category> {
    vec![
        Category::new("tech", "Technology"),
        Category::new("life", "Life"),
        Category::new("travel", "Travel"),
        Category::new("food", "Food"),
        Category::new("other", "Other"),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub author: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub author: String,
    pub title: String,
    pub content: String,
    pub category: Option<Category>,
    /// User ids; membership toggled by `like_action`.
    pub likes: BTreeSet<String>,
    pub views: u64,
    pub comments: Vec<Comment>,
    pub created_at: DateTime<Utc>,
}

impl Post {
    /// Add `user_id` to the likes when absent, remove it when present. Returns
    /// whether the user likes the post afterwards.
    pub fn toggle_like(&mut self, user_id: &str) -> bool {
        if self.likes.remove(user_id) {
            false
        } else {
            self.likes.insert(user_id.to_string());
            true
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Invite {
    pub from: String,
    pub role: Role,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailAvailability {
    pub email: String,
    pub available: bool,
}

// ---- inputs ----

#[derive(Debug, Clone, Deserialize)]
pub struct SignUpInput {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignInInput {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPostInput {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub theme: Option<Theme>,
    pub email_notifications: Option<bool>,
    pub push_notifications: Option<bool>,
}

impl SettingsPatch {
    pub fn apply(&self, s: &mut Settings) {
        if let Some(t) = self.theme { s.theme = t; }
        if let Some(v) = self.email_notifications { s.email_notifications = v; }
        if let Some(v) = self.push_notifications { s.push_notifications = v; }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar: Option<String>,
}

impl UserPatch {
    pub fn validate(&self) -> AppResult<()> {
        if let Some(n) = &self.name { validate_name(n)?; }
        if let Some(e) = &self.email { validate_email(e)?; }
        Ok(())
    }

    pub fn apply(&self, u: &mut User) {
        if let Some(n) = &self.name { u.name = n.trim().to_string(); }
        if let Some(e) = &self.email { u.email = normalize_email(e); }
        if let Some(a) = &self.avatar { u.avatar = a.clone(); }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InviteInput {
    pub email: String,
    pub role: Role,
}

pub fn normalize_email(email: &str) -> String { email.trim().to_ascii_lowercase() }

pub fn validate_email(email: &str) -> AppResult<()> {
    let e = email.trim();
    let ok = match e.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.'),
        None => false,
    };
    if ok { Ok(()) } else { Err(AppError::user("invalid_email", format!("'{}' is not a valid email address", e))) }
}

pub fn validate_name(name: &str) -> AppResult<()> {
    if name.trim().is_empty() {
        return Err(AppError::user("invalid_name", "name must not be empty"));
    }
    Ok(())
}
