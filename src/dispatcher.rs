//! The externally callable operation set.
//!
//! Every operation looks up its guard in `ops`, checks it against the request
//! identity before touching any collaborator, and only then runs its body.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures_util::Stream;
use serde_json::json;
use tracing::info;

use crate::config::AdminSeed;
use crate::error::{AppError, AppResult};
use crate::events::{EventBus, EventStream, NEW_POST};
use crate::identity::{hash_password, verify_password, AuthContext, CredentialIssuer, Identity, RequestContext, Role, SessionManager};
use crate::model::{
    normalize_email, validate_email, validate_name, AuthPayload, Category, Comment, EmailAvailability, Invite,
    InviteInput, NewPostInput, Post, Settings, SettingsPatch, SignInInput, SignUpInput, User, UserPatch,
};
use crate::relay::{RelayOutcome, UploadRelay};
use crate::store::{NewUser, PostFilter, SharedStore, UserFilter};

/// Guard table, one entry per operation.
pub mod ops {
    use crate::identity::{OperationGuard, Policy, Role};

    pub const CATEGORIES: OperationGuard = OperationGuard::public("category");
    pub const EMAIL_AVAILABLE: OperationGuard = OperationGuard::public("email");
    pub const POSTS: OperationGuard = OperationGuard::public("posts");
    pub const FEED: OperationGuard = OperationGuard::public("feed");
    pub const POST_AUTHOR: OperationGuard = OperationGuard::public("Post.author");
    pub const POST_LIKES: OperationGuard = OperationGuard::public("Post.likes");
    pub const SIGN_UP: OperationGuard = OperationGuard::public("signUp");
    pub const SIGN_IN: OperationGuard = OperationGuard::public("signIn");
    pub const NEW_POST_STREAM: OperationGuard = OperationGuard::public("newPost");

    pub const ME: OperationGuard = OperationGuard::authenticated("me");
    pub const POST: OperationGuard = OperationGuard::authenticated("post");
    pub const USER_SETTINGS: OperationGuard = OperationGuard::authenticated("userSettings");
    pub const USER_POSTS: OperationGuard = OperationGuard::authenticated("User.posts");
    pub const USER_SETTINGS_OF: OperationGuard = OperationGuard::authenticated("User.settings");
    pub const SETTINGS_USER: OperationGuard = OperationGuard::authenticated("Settings.user");
    pub const LIKE_ACTION: OperationGuard = OperationGuard::authenticated("likeAction");
    pub const UPDATE_SETTINGS: OperationGuard = OperationGuard::authenticated("updateSettings");
    pub const CREATE_POST: OperationGuard = OperationGuard::authenticated("createPost");
    pub const UPDATE_ME: OperationGuard = OperationGuard::authenticated("updateMe");
    pub const ADD_COMMENT: OperationGuard = OperationGuard::authenticated("addComment");
    pub const SEND_IMAGE: OperationGuard = OperationGuard::authenticated("sendImageToCloud");
    pub const SIGN_OUT: OperationGuard = OperationGuard::authenticated("signOut");

    pub const INVITE: OperationGuard =
        OperationGuard::new("invite", &[Policy::Authenticated, Policy::HasRole(Role::Admin)]);
}

pub struct Dispatcher {
    store: SharedStore,
    sessions: Arc<SessionManager>,
    relay: Arc<UploadRelay>,
    bus: Arc<EventBus>,
}

impl Dispatcher {
    pub fn new(store: SharedStore, sessions: Arc<SessionManager>, relay: Arc<UploadRelay>, bus: Arc<EventBus>) -> Self {
        Self { store, sessions, relay, bus }
    }

    pub fn auth(&self) -> AuthContext { AuthContext::new(self.sessions.clone()) }

    pub fn bus(&self) -> &Arc<EventBus> { &self.bus }

    pub fn store(&self) -> &SharedStore { &self.store }

    // ---- queries ----

    pub fn categories(&self, ctx: &RequestContext) -> AppResult<Vec<Category>> {
        ops::CATEGORIES.check(ctx.identity())?;
        self.store.categories()
    }

    pub fn email_available(&self, ctx: &RequestContext, email: &str) -> AppResult<EmailAvailability> {
        ops::EMAIL_AVAILABLE.check(ctx.identity())?;
        let email = normalize_email(email);
        let taken = self.store.find_user(&UserFilter::email(&email))?.is_some();
        Ok(EmailAvailability { email, available: !taken })
    }

    pub fn me(&self, ctx: &RequestContext) -> AppResult<User> {
        let caller = ops::ME.require(ctx.identity())?;
        self.store
            .find_user(&UserFilter::id(&caller.id))?
            .ok_or_else(|| AppError::not_found("user_not_found", "account no longer exists"))
    }

    pub fn posts(&self, ctx: &RequestContext) -> AppResult<Vec<Post>> {
        ops::POSTS.check(ctx.identity())?;
        self.store.find_posts(&PostFilter::all())
    }

    /// All posts, newest first.
    pub fn feed(&self, ctx: &RequestContext) -> AppResult<Vec<Post>> {
        ops::FEED.check(ctx.identity())?;
        let mut posts = self.store.find_posts(&PostFilter::all())?;
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(posts)
    }

    /// One of the caller's own posts.
    pub fn post(&self, ctx: &RequestContext, id: &str) -> AppResult<Option<Post>> {
        let caller = ops::POST.require(ctx.identity())?;
        let filter = PostFilter { id: Some(id.to_string()), author: Some(caller.id.clone()) };
        self.store.find_post(&filter)
    }

    pub fn user_settings(&self, ctx: &RequestContext) -> AppResult<Option<Settings>> {
        let caller = ops::USER_SETTINGS.require(ctx.identity())?;
        self.store.find_settings(&caller.id)
    }

    pub fn user_posts(&self, ctx: &RequestContext, user_id: &str) -> AppResult<Vec<Post>> {
        let caller = ops::USER_POSTS.require(ctx.identity())?;
        if caller.id != user_id {
            return Err(AppError::forbidden("not your posts"));
        }
        self.store.find_posts(&PostFilter::author(user_id))
    }

    /// Settings of `user`, visible only when `user` is the caller.
    pub fn user_settings_of(&self, ctx: &RequestContext, user: &User) -> AppResult<Option<Settings>> {
        let caller = ops::USER_SETTINGS_OF.require(ctx.identity())?;
        if caller.id != user.id {
            return Ok(None);
        }
        self.store.find_settings(&user.id)
    }

    /// Owner of `settings`, resolved only when the settings belong to the caller.
    pub fn settings_user(&self, ctx: &RequestContext, settings: &Settings) -> AppResult<Option<User>> {
        let caller = ops::SETTINGS_USER.require(ctx.identity())?;
        if caller.id != settings.user {
            return Ok(None);
        }
        self.store.find_user(&UserFilter::id(&settings.user))
    }

    pub fn post_author(&self, ctx: &RequestContext, post: &Post) -> AppResult<Option<User>> {
        ops::POST_AUTHOR.check(ctx.identity())?;
        self.store.find_user(&UserFilter::id(&post.author))
    }

    /// Users who like `post`; ids with no matching account are skipped.
    pub fn post_likes(&self, ctx: &RequestContext, post: &Post) -> AppResult<Vec<User>> {
        ops::POST_LIKES.check(ctx.identity())?;
        let mut users = Vec::with_capacity(post.likes.len());
        for id in &post.likes {
            if let Some(u) = self.store.find_user(&UserFilter::id(id))? {
                users.push(u);
            }
        }
        Ok(users)
    }

    // ---- mutations ----

    pub fn like_action(&self, ctx: &RequestContext, post_id: &str) -> AppResult<Post> {
        let caller = ops::LIKE_ACTION.require(ctx.identity())?;
        self.store.modify_post(post_id, &mut |p: &mut Post| {
            p.toggle_like(&caller.id);
        })
    }

    pub fn update_settings(&self, ctx: &RequestContext, patch: &SettingsPatch) -> AppResult<Settings> {
        let caller = ops::UPDATE_SETTINGS.require(ctx.identity())?;
        self.store.update_settings(&caller.id, patch)
    }

    /// Create a post authored by the caller and announce it on `NEW_POST`.
    pub fn create_post(&self, ctx: &RequestContext, input: NewPostInput) -> AppResult<Post> {
        let caller = ops::CREATE_POST.require(ctx.identity())?;
        if input.title.trim().is_empty() {
            return Err(AppError::user("invalid_title", "title must not be empty"));
        }
        let category = match input.category.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(value) => Some(
                self.store
                    .find_category(value)?
                    .ok_or_else(|| AppError::user("unknown_category", format!("unknown category '{}'", value)))?,
            ),
            None => None,
        };
        let post = self.store.create_post(Post {
            id: uuid::Uuid::new_v4().to_string(),
            author: caller.id.clone(),
            title: input.title.trim().to_string(),
            content: input.content,
            category,
            likes: Default::default(),
            views: 0,
            comments: Vec::new(),
            created_at: Utc::now(),
        })?;
        let receivers = self.bus.publish(NEW_POST, json!({ "newPost": &post }));
        info!(post = %post.id, author = %caller.id, receivers, "post created");
        Ok(post)
    }

    pub fn update_me(&self, ctx: &RequestContext, patch: &UserPatch) -> AppResult<User> {
        let caller = ops::UPDATE_ME.require(ctx.identity())?;
        patch.validate()?;
        self.store.update_user(&caller.id, patch)
    }

    pub fn add_comment(&self, ctx: &RequestContext, post_id: &str, content: &str) -> AppResult<Post> {
        let caller = ops::ADD_COMMENT.require(ctx.identity())?;
        if content.trim().is_empty() {
            return Err(AppError::user("invalid_comment", "comment must not be empty"));
        }
        let comment = Comment { author: caller.id.clone(), content: content.to_string(), created_at: Utc::now() };
        self.store.modify_post(post_id, &mut |p: &mut Post| p.comments.push(comment.clone()))
    }

    /// Admin only. The invite is returned to the caller, not stored.
    pub fn invite(&self, ctx: &RequestContext, input: &InviteInput) -> AppResult<Invite> {
        let caller = ops::INVITE.require(ctx.identity())?;
        validate_email(&input.email)?;
        Ok(Invite { from: caller.id.clone(), role: input.role, email: normalize_email(&input.email), created_at: Utc::now() })
    }

    pub fn sign_up(&self, ctx: &RequestContext, input: &SignUpInput) -> AppResult<AuthPayload> {
        ops::SIGN_UP.check(ctx.identity())?;
        validate_name(&input.name)?;
        validate_email(&input.email)?;
        if input.password.is_empty() {
            return Err(AppError::user("invalid_password", "password must not be empty"));
        }
        let existing = match self.store.find_user(&UserFilter::email(&input.email))? {
            Some(u) => Some(u),
            None => self.store.find_user(&UserFilter::name(&input.name))?,
        };
        if existing.is_some() {
            return Err(AppError::duplicate_identity("Username or Email duplicated!"));
        }
        let user = self.store.create_user(NewUser {
            name: input.name.clone(),
            email: input.email.clone(),
            password_hash: hash_password(&input.password)?,
            role: Role::Member,
        })?;
        self.store.create_settings(Settings::defaults_for(&user.id))?;
        let token = self.sessions.create_token(&Identity::new(user.id.clone(), user.role));
        info!(user = %user.id, "account created");
        Ok(AuthPayload { token, user })
    }

    pub fn sign_in(&self, ctx: &RequestContext, input: &SignInInput) -> AppResult<AuthPayload> {
        ops::SIGN_IN.check(ctx.identity())?;
        let user = self
            .store
            .find_user(&UserFilter::email(&input.email))?
            .filter(|u| verify_password(&u.password_hash, &input.password))
            .ok_or_else(|| AppError::unauthenticated("wrong email + password combo"))?;
        let token = self.sessions.create_token(&Identity::new(user.id.clone(), user.role));
        Ok(AuthPayload { token, user })
    }

    pub fn sign_out(&self, ctx: &RequestContext) -> AppResult<bool> {
        ops::SIGN_OUT.require(ctx.identity())?;
        Ok(ctx.token.as_deref().map(|t| self.sessions.logout(t)).unwrap_or(false))
    }

    /// Relay an uploaded image. Policy failures are errors; relay failures are
    /// returned as a `Failure` outcome.
    pub async fn relay_image<S>(&self, ctx: &RequestContext, stream: S, mime_type: &str, filename: &str) -> AppResult<RelayOutcome>
    where
        S: Stream<Item = std::io::Result<Bytes>>,
    {
        ops::SEND_IMAGE
            .run(ctx.identity(), |_| async { Ok(self.relay.relay(stream, mime_type, filename).await) })
            .await
    }

    // ---- subscriptions ----

    pub fn subscribe_new_content(&self, ctx: &RequestContext) -> AppResult<EventStream> {
        ops::NEW_POST_STREAM.check(ctx.identity())?;
        Ok(self.bus.subscribe(NEW_POST))
    }

    /// Create the configured admin account unless that email is already taken.
    pub fn seed_admin(&self, seed: &AdminSeed) -> AppResult<Option<User>> {
        if self.store.find_user(&UserFilter::email(&seed.email))?.is_some() {
            return Ok(None);
        }
        let user = self.store.create_user(NewUser {
            name: seed.name.clone(),
            email: seed.email.clone(),
            password_hash: hash_password(&seed.password)?,
            role: Role::Admin,
        })?;
        self.store.create_settings(Settings::defaults_for(&user.id))?;
        info!(user = %user.id, email = %user.email, "admin account seeded");
        Ok(Some(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{HostResponse, ImageHost, RelayConfig, RelayError};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHost(AtomicUsize);

    #[async_trait::async_trait]
    impl ImageHost for CountingHost {
        async fn upload(&self, _payload: Vec<u8>, _filename: &str, _mime_type: &str) -> Result<HostResponse, RelayError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(HostResponse { status: 200, body: r#"{"success":true}"#.into() })
        }
    }

    fn dispatcher(dir: &std::path::Path) -> (Dispatcher, Arc<CountingHost>) {
        let host = Arc::new(CountingHost(AtomicUsize::new(0)));
        let relay = UploadRelay::new(RelayConfig::new(dir), host.clone());
        let d = Dispatcher::new(
            MemoryStore::new().shared(),
            Arc::new(SessionManager::default()),
            Arc::new(relay),
            Arc::new(EventBus::default()),
        );
        (d, host)
    }

    fn sign_up(d: &Dispatcher, name: &str) -> RequestContext {
        let input = SignUpInput { name: name.into(), email: format!("{}@example.com", name), password: "pw".into() };
        let auth = d.sign_up(&RequestContext::anonymous(), &input).unwrap();
        d.auth().context_for(Some(&format!("Bearer {}", auth.token)))
    }

    fn new_post(title: &str) -> NewPostInput {
        NewPostInput { title: title.into(), content: "body".into(), category: Some("tech".into()) }
    }

    #[test]
    fn sign_up_then_sign_in() {
        let tmp = tempfile::tempdir().unwrap();
        let (d, _) = dispatcher(tmp.path());
        let ctx = sign_up(&d, "ann");
        let me = d.me(&ctx).unwrap();
        assert_eq!(me.role, Role::Member);
        assert!(d.user_settings(&ctx).unwrap().is_some());

        let anon = RequestContext::anonymous();
        let ok = d.sign_in(&anon, &SignInInput { email: "ANN@example.com".into(), password: "pw".into() }).unwrap();
        assert_eq!(ok.user.id, me.id);
        let err = d.sign_in(&anon, &SignInInput { email: "ann@example.com".into(), password: "nope".into() }).unwrap_err();
        assert_eq!(err.http_status(), 401);
    }

    #[test]
    fn duplicate_sign_up_is_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let (d, _) = dispatcher(tmp.path());
        sign_up(&d, "ann");
        let input = SignUpInput { name: "ann".into(), email: "other@example.com".into(), password: "pw".into() };
        let err = d.sign_up(&RequestContext::anonymous(), &input).unwrap_err();
        assert_eq!(err.code_str(), "duplicate_identity");
    }

    #[test]
    fn email_availability_reflects_accounts() {
        let tmp = tempfile::tempdir().unwrap();
        let (d, _) = dispatcher(tmp.path());
        let anon = RequestContext::anonymous();
        assert!(d.email_available(&anon, "ann@example.com").unwrap().available);
        sign_up(&d, "ann");
        assert!(!d.email_available(&anon, "Ann@Example.com").unwrap().available);
    }

    #[test]
    fn anonymous_create_post_has_no_effect() {
        let tmp = tempfile::tempdir().unwrap();
        let (d, _) = dispatcher(tmp.path());
        let mut sub = d.subscribe_new_content(&RequestContext::anonymous()).unwrap();
        let err = d.create_post(&RequestContext::anonymous(), new_post("t")).unwrap_err();
        assert_eq!(err.http_status(), 401);
        assert!(d.posts(&RequestContext::anonymous()).unwrap().is_empty());
        assert_eq!(d.bus().events_published(), 0);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn unknown_category_is_user_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (d, _) = dispatcher(tmp.path());
        let ctx = sign_up(&d, "ann");
        let mut input = new_post("t");
        input.category = Some("gardening".into());
        assert_eq!(d.create_post(&ctx, input).unwrap_err().code_str(), "unknown_category");
    }

    #[test]
    fn posts_are_scoped_to_owner() {
        let tmp = tempfile::tempdir().unwrap();
        let (d, _) = dispatcher(tmp.path());
        let ann = sign_up(&d, "ann");
        let bob = sign_up(&d, "bob");
        let post = d.create_post(&ann, new_post("mine")).unwrap();
        assert!(d.post(&ann, &post.id).unwrap().is_some());
        assert!(d.post(&bob, &post.id).unwrap().is_none());

        let ann_id = d.me(&ann).unwrap().id;
        assert_eq!(d.user_posts(&ann, &ann_id).unwrap().len(), 1);
        assert_eq!(d.user_posts(&bob, &ann_id).unwrap_err().http_status(), 403);
        assert_eq!(d.post_author(&bob, &post).unwrap().map(|u| u.id), Some(ann_id));
    }

    #[test]
    fn settings_links_are_scoped_to_caller() {
        let tmp = tempfile::tempdir().unwrap();
        let (d, _) = dispatcher(tmp.path());
        let ann = sign_up(&d, "ann");
        let bob = sign_up(&d, "bob");
        let ann_user = d.me(&ann).unwrap();
        let ann_settings = d.user_settings(&ann).unwrap().unwrap();

        assert_eq!(d.user_settings_of(&ann, &ann_user).unwrap(), Some(ann_settings.clone()));
        assert_eq!(d.user_settings_of(&bob, &ann_user).unwrap(), None);
        assert_eq!(d.settings_user(&ann, &ann_settings).unwrap().map(|u| u.id), Some(ann_user.id.clone()));
        assert_eq!(d.settings_user(&bob, &ann_settings).unwrap(), None);

        let anon = RequestContext::anonymous();
        assert_eq!(d.user_settings_of(&anon, &ann_user).unwrap_err().http_status(), 401);
        assert_eq!(d.settings_user(&anon, &ann_settings).unwrap_err().http_status(), 401);
    }

    #[test]
    fn like_toggles_and_comments_append() {
        let tmp = tempfile::tempdir().unwrap();
        let (d, _) = dispatcher(tmp.path());
        let ann = sign_up(&d, "ann");
        let post = d.create_post(&ann, new_post("t")).unwrap();
        let liked = d.like_action(&ann, &post.id).unwrap();
        assert_eq!(liked.likes.len(), 1);
        assert_eq!(d.post_likes(&RequestContext::anonymous(), &liked).unwrap().len(), 1);
        assert!(d.like_action(&ann, &post.id).unwrap().likes.is_empty());

        assert_eq!(d.add_comment(&ann, &post.id, "  ").unwrap_err().http_status(), 400);
        let p = d.add_comment(&ann, &post.id, "nice").unwrap();
        assert_eq!(p.comments.len(), 1);
        assert_eq!(d.add_comment(&ann, "missing", "hi").unwrap_err().http_status(), 404);
    }

    #[test]
    fn invite_needs_admin() {
        let tmp = tempfile::tempdir().unwrap();
        let (d, _) = dispatcher(tmp.path());
        let member = sign_up(&d, "ann");
        let input = InviteInput { email: "new@example.com".into(), role: Role::Member };
        assert_eq!(d.invite(&member, &input).unwrap_err().http_status(), 403);
        assert_eq!(d.invite(&RequestContext::anonymous(), &input).unwrap_err().http_status(), 401);

        let seed = AdminSeed { name: "root".into(), email: "root@example.com".into(), password: "pw".into() };
        let admin = d.seed_admin(&seed).unwrap().unwrap();
        assert!(d.seed_admin(&seed).unwrap().is_none());
        let auth = d.sign_in(&RequestContext::anonymous(), &SignInInput { email: seed.email.clone(), password: "pw".into() }).unwrap();
        let ctx = d.auth().context_for(Some(&auth.token));
        let inv = d.invite(&ctx, &input).unwrap();
        assert_eq!(inv.from, admin.id);
        assert_eq!(inv.email, "new@example.com");
    }

    #[test]
    fn sign_out_revokes_token() {
        let tmp = tempfile::tempdir().unwrap();
        let (d, _) = dispatcher(tmp.path());
        let ctx = sign_up(&d, "ann");
        assert!(d.sign_out(&ctx).unwrap());
        let token = ctx.token.clone().unwrap();
        assert!(d.auth().resolve(&token).is_none());
    }

    #[tokio::test]
    async fn anonymous_relay_never_reaches_host() {
        let tmp = tempfile::tempdir().unwrap();
        let (d, host) = dispatcher(tmp.path());
        let body = futures_util::stream::iter(vec![Ok(Bytes::from_static(b"img"))]);
        let err = d.relay_image(&RequestContext::anonymous(), body, "image/png", "a.png").await.unwrap_err();
        assert!(err.is_policy_failure());
        assert_eq!(host.0.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn member_relay_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let (d, host) = dispatcher(tmp.path());
        let ctx = sign_up(&d, "ann");
        let body = futures_util::stream::iter(vec![Ok(Bytes::from_static(b"img"))]);
        let out = d.relay_image(&ctx, body, "image/png", "a.png").await.unwrap();
        assert!(out.is_success());
        assert_eq!(host.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_post_reaches_subscriber() {
        let tmp = tempfile::tempdir().unwrap();
        let (d, _) = dispatcher(tmp.path());
        let ann = sign_up(&d, "ann");
        let mut sub = d.subscribe_new_content(&RequestContext::anonymous()).unwrap();
        let post = d.create_post(&ann, new_post("hello")).unwrap();
        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.payload["newPost"]["id"], post.id.as_str());
        assert_eq!(ev.payload["newPost"]["title"], "hello");
    }
}
