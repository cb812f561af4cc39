//!
//! quillhub data store
//! -------------------
//! The `DataStore` trait is the collaborator operation bodies read and write
//! through. Lookups take small filter structs (every set field must match);
//! updates are read-modify-write under the store's own lock so concurrent
//! callers never lose each other's changes.
//!
//! `MemoryStore` is the in-process implementation used by the server binary and
//! the tests. It is usually wrapped in a `SharedStore` (`Arc<dyn DataStore>`).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::identity::Role;
use crate::model::{default_categories, normalize_email, Category, Post, Settings, SettingsPatch, User, UserPatch};

pub type SharedStore = Arc<dyn DataStore>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilter {
    pub id: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl UserFilter {
    pub fn id(id: &str) -> Self { Self { id: Some(id.to_string()), ..Default::default() } }
    pub fn email(email: &str) -> Self { Self { email: Some(normalize_email(email)), ..Default::default() } }
    pub fn name(name: &str) -> Self { Self { name: Some(name.trim().to_string()), ..Default::default() } }

    pub fn matches(&self, u: &User) -> bool {
        self.id.as_ref().map_or(true, |v| &u.id == v)
            && self.email.as_ref().map_or(true, |v| u.email.eq_ignore_ascii_case(v))
            && self.name.as_ref().map_or(true, |v| &u.name == v)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostFilter {
    pub id: Option<String>,
    pub author: Option<String>,
}

impl PostFilter {
    pub fn all() -> Self { Self::default() }
    pub fn id(id: &str) -> Self { Self { id: Some(id.to_string()), ..Default::default() } }
    pub fn author(author: &str) -> Self { Self { author: Some(author.to_string()), ..Default::default() } }

    pub fn matches(&self, p: &Post) -> bool {
        self.id.as_ref().map_or(true, |v| &p.id == v) && self.author.as_ref().map_or(true, |v| &p.author == v)
    }
}

/// Fields for a new account; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
}

pub trait DataStore: Send + Sync {
    fn find_user(&self, filter: &UserFilter) -> AppResult<Option<User>>;
    /// Fails with `duplicate_identity` when the email or name is taken.
    fn create_user(&self, user: NewUser) -> AppResult<User>;
    fn update_user(&self, id: &str, patch: &UserPatch) -> AppResult<User>;

    fn find_settings(&self, user_id: &str) -> AppResult<Option<Settings>>;
    fn create_settings(&self, settings: Settings) -> AppResult<Settings>;
    fn update_settings(&self, user_id: &str, patch: &SettingsPatch) -> AppResult<Settings>;

    fn categories(&self) -> AppResult<Vec<Category>>;
    fn find_category(&self, value: &str) -> AppResult<Option<Category>>;

    fn find_post(&self, filter: &PostFilter) -> AppResult<Option<Post>>;
    fn find_posts(&self, filter: &PostFilter) -> AppResult<Vec<Post>>;
    fn create_post(&self, post: Post) -> AppResult<Post>;
    /// Apply `f` to the post with `id` atomically and return the updated post.
    fn modify_post(&self, id: &str, f: &mut dyn FnMut(&mut Post)) -> AppResult<Post>;
}

#[derive(Debug, Default)]
struct Tables {
    users: Vec<User>,
    settings: HashMap<String, Settings>,
    categories: Vec<Category>,
    posts: Vec<Post>,
}

#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    /// Empty store seeded with the default categories.
    pub fn new() -> Self {
        Self::with_categories(default_categories())
    }

    pub fn with_categories(categories: Vec<Category>) -> Self {
        Self { tables: RwLock::new(Tables { categories, ..Default::default() }) }
    }

    pub fn shared(self) -> SharedStore { Arc::new(self) }

    pub fn user_count(&self) -> usize { self.tables.read().users.len() }

    pub fn post_count(&self) -> usize { self.tables.read().posts.len() }
}

fn user_not_found(id: &str) -> AppError { AppError::not_found("user_not_found", format!("user '{}' not found", id)) }
fn post_not_found(id: &str) -> AppError { AppError::not_found("post_not_found", format!("post '{}' not found", id)) }

impl DataStore for MemoryStore {
    fn find_user(&self, filter: &UserFilter) -> AppResult<Option<User>> {
        Ok(self.tables.read().users.iter().find(|u| filter.matches(u)).cloned())
    }

    fn create_user(&self, user: NewUser) -> AppResult<User> {
        let mut t = self.tables.write();
        let email = normalize_email(&user.email);
        let name = user.name.trim().to_string();
        if t.users.iter().any(|u| u.email.eq_ignore_ascii_case(&email) || u.name == name) {
            return Err(AppError::duplicate_identity("Username or Email duplicated!"));
        }
        let created = User {
            id: uuid::Uuid::new_v4().to_string(),
            avatar: name.clone(),
            name,
            email,
            password_hash: user.password_hash,
            role: user.role,
            verified: false,
            created_at: Utc::now(),
        };
        t.users.push(created.clone());
        debug!(user = %created.id, "store.create_user");
        Ok(created)
    }

    fn update_user(&self, id: &str, patch: &UserPatch) -> AppResult<User> {
        let mut t = self.tables.write();
        if let Some(email) = &patch.email {
            let email = normalize_email(email);
            if t.users.iter().any(|u| u.id != id && u.email == email) {
                return Err(AppError::duplicate_identity("email already in use"));
            }
        }
        if let Some(name) = &patch.name {
            let name = name.trim();
            if t.users.iter().any(|u| u.id != id && u.name == name) {
                return Err(AppError::duplicate_identity("name already in use"));
            }
        }
        let user = t.users.iter_mut().find(|u| u.id == id).ok_or_else(|| user_not_found(id))?;
        patch.apply(user);
        Ok(user.clone())
    }

    fn find_settings(&self, user_id: &str) -> AppResult<Option<Settings>> {
        Ok(self.tables.read().settings.get(user_id).cloned())
    }

    fn create_settings(&self, settings: Settings) -> AppResult<Settings> {
        let mut t = self.tables.write();
        if t.settings.contains_key(&settings.user) {
            return Err(AppError::conflict("settings_exist", format!("settings for '{}' already exist", settings.user)));
        }
        t.settings.insert(settings.user.clone(), settings.clone());
        Ok(settings)
    }

    fn update_settings(&self, user_id: &str, patch: &SettingsPatch) -> AppResult<Settings> {
        let mut t = self.tables.write();
        let s = t.settings.get_mut(user_id)
            .ok_or_else(|| AppError::not_found("settings_not_found", format!("no settings for '{}'", user_id)))?;
        patch.apply(s);
        Ok(s.clone())
    }

    fn categories(&self) -> AppResult<Vec<Category>> {
        Ok(self.tables.read().categories.clone())
    }

    fn find_category(&self, value: &str) -> AppResult<Option<Category>> {
        Ok(self.tables.read().categories.iter().find(|c| c.value == value).cloned())
    }

    fn find_post(&self, filter: &PostFilter) -> AppResult<Option<Post>> {
        Ok(self.tables.read().posts.iter().find(|p| filter.matches(p)).cloned())
    }

    fn find_posts(&self, filter: &PostFilter) -> AppResult<Vec<Post>> {
        Ok(self.tables.read().posts.iter().filter(|p| filter.matches(p)).cloned().collect())
    }

    fn create_post(&self, post: Post) -> AppResult<Post> {
        let mut t = self.tables.write();
        if t.posts.iter().any(|p| p.id == post.id) {
            return Err(AppError::conflict("post_exists", format!("post '{}' already exists", post.id)));
        }
        t.posts.push(post.clone());
        Ok(post)
    }

    fn modify_post(&self, id: &str, f: &mut dyn FnMut(&mut Post)) -> AppResult<Post> {
        let mut t = self.tables.write();
        let post = t.posts.iter_mut().find(|p| p.id == id).ok_or_else(|| post_not_found(id))?;
        f(post);
        Ok(post.clone())
    }
}
