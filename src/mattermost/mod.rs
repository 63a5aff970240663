//! Mattermost API v4 client, scoped to a single run.
//!
//! One client holds one session, a [`RunCache`] of everything it has already looked up, and the
//! pacing state used to space consecutive outbound requests.

use core::fmt;
use std::collections::HashMap;
use std::time::Duration;

use http::header::{AUTHORIZATION, InvalidHeaderValue, RETRY_AFTER};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::Instant;
use tracing::instrument;

use crate::constants::{
    MAX_RATE_LIMIT_WAIT_SECS, MEMBERS_PER_PAGE, RATELIMIT_LIMIT_HEADER, RATELIMIT_REMAINING_HEADER, SESSION_TOKEN_HEADER,
    USER_LOOKUP_CHUNK,
};
use crate::util::env::{Env, Secret};

pub mod cache;
pub mod types;

use cache::RunCache;
use types::{
    Channel, ChannelId, Status, Team, TeamId, UserId, WireAppError, WireChannel,
    WireChannelMember, WireLoginUser, WireStatus, WireTeam, WireUser,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL including the `/api/v4` prefix
    pub base_url: String,
    pub login_id: String,
    pub password: Secret,
    pub timeout: Duration,
    /// Minimum spacing between consecutive outbound requests
    pub request_delay: Duration,
    /// Wait applied after a 429 which carried no `Retry-After`
    pub rate_limit_backoff: Duration,
    pub rate_limit_retries: u32,
    pub members_per_page: usize,
}

impl From<&Env> for ClientConfig {
    fn from(env: &Env) -> Self {
        Self {
            base_url: env.api_base_url(),
            login_id: env.mm_user.clone(),
            password: env.mm_password.clone(),
            timeout: env.api_timeout(),
            request_delay: env.request_delay(),
            rate_limit_backoff: env.rate_limit_backoff(),
            rate_limit_retries: env.rate_limit_retries,
            members_per_page: MEMBERS_PER_PAGE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    headers: HeaderMap,
}

/// Users resolved by a lookup, plus those which could not be.
#[derive(Debug)]
pub struct Lookup<T> {
    pub resolved: HashMap<UserId, T>,
    pub failed: Vec<LookupFailure>,
}

impl<T> Default for Lookup<T> {
    fn default() -> Self {
        Self {
            resolved: HashMap::new(),
            failed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupFailure {
    pub user_id: UserId,
    pub reason: String,
}

pub struct MattermostClient {
    http: reqwest::Client,
    config: ClientConfig,
    session: Option<Session>,
    cache: RunCache,
    last_request: Option<Instant>,
    requests_sent: usize,
}

impl MattermostClient {
    pub fn new(config: ClientConfig) -> ApiResult<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            http,
            config,
            session: None,
            cache: RunCache::default(),
            last_request: None,
            requests_sent: 0,
        })
    }

    /// Logs in with the configured credentials. Every other operation requires a session.
    #[instrument(skip(self), fields(login_id = %self.config.login_id))]
    pub async fn authenticate(&mut self) -> ApiResult<&Session> {
        let body = json!({
            "login_id": self.config.login_id,
            "password": self.config.password.expose(),
        });

        let res = self
            .send(Method::POST, "/users/login", &[], Some(&body), None)
            .await
            .map_err(|e| match e {
                ApiError::RateLimited { .. } => e,
                other => ApiError::Auth(other.to_string()),
            })?;

        let status = res.status();
        if !status.is_success() {
            let message = error_message(res).await;
            tracing::error!(code = %status, message, "login rejected");
            return Err(ApiError::Auth(format!("{status}: {message}")));
        }

        let token = res
            .headers()
            .get(SESSION_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| ApiError::Auth("login response carried no session token".into()))?;

        let user: WireLoginUser = decode("/users/login", res).await?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);

        tracing::info!(user_id = %user.id, "authenticated");
        Ok(&*self.session.insert(Session {
            user_id: user.id,
            headers,
        }))
    }

    /// Ends the session. Failure here has no bearing on the run's outcome.
    #[instrument(skip(self))]
    pub async fn logout(&mut self) -> ApiResult<()> {
        let _: Value = self.post("/users/logout", &json!({})).await?;
        self.session = None;

        tracing::debug!("logged out");
        Ok(())
    }

    /// Teams the authenticated identity belongs to
    #[instrument(skip(self))]
    pub async fn list_teams(&mut self) -> ApiResult<Vec<Team>> {
        let teams: Vec<WireTeam> = self.get("/users/me/teams", &[]).await?;

        tracing::debug!(team_count = teams.len(), "fetched teams");
        Ok(teams.into_iter().map(Team::from).collect())
    }

    /// Channels in `team_id` which the authenticated identity can see
    #[instrument(skip(self), fields(team_id = %team_id))]
    pub async fn list_channels(&mut self, team_id: &TeamId) -> ApiResult<Vec<Channel>> {
        if let Some(channels) = self.cache.channels(team_id) {
            return Ok(channels);
        }

        let wire: Vec<WireChannel> = self
            .get(&format!("/users/me/teams/{team_id}/channels"), &[])
            .await?;

        let channels: Vec<Channel> = wire.into_iter().map(|c| c.into_channel(team_id)).collect();
        tracing::debug!(channel_count = channels.len(), "fetched channels");

        self.cache.store_channels(team_id.clone(), channels.clone());
        Ok(channels)
    }

    /// Member ids of `channel_id`, walking every page of the listing
    #[instrument(skip(self), fields(channel_id = %channel_id))]
    pub async fn list_members(&mut self, channel_id: &ChannelId) -> ApiResult<Vec<UserId>> {
        if let Some(members) = self.cache.members(channel_id) {
            return Ok(members);
        }

        let per_page = self.config.members_per_page.max(1);
        let path = format!("/channels/{channel_id}/members");
        let mut members = Vec::new();

        for page in 0usize.. {
            let batch: Vec<WireChannelMember> = self
                .get(
                    &path,
                    &[("page", page.to_string()), ("per_page", per_page.to_string())],
                )
                .await?;

            let fetched = batch.len();
            members.extend(batch.into_iter().map(|m| m.user_id));

            if fetched < per_page {
                break;
            }
        }

        tracing::debug!(member_count = members.len(), "fetched channel members");
        self.cache.store_members(channel_id.clone(), members.clone());
        Ok(members)
    }

    /// Batched status lookup. Users already in the cache cost nothing.
    pub async fn get_user_statuses(&mut self, ids: &[UserId]) -> ApiResult<Lookup<Status>> {
        self.lookup_users::<StatusLookup>(ids).await
    }

    pub async fn get_user_status(&mut self, id: &UserId) -> ApiResult<Status> {
        self.lookup_user::<StatusLookup>(id).await
    }

    /// Batched username lookup. Users already in the cache cost nothing.
    pub async fn get_usernames(&mut self, ids: &[UserId]) -> ApiResult<Lookup<String>> {
        self.lookup_users::<UsernameLookup>(ids).await
    }

    pub async fn get_username(&mut self, id: &UserId) -> ApiResult<String> {
        self.lookup_user::<UsernameLookup>(id).await
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Outbound requests issued so far, retries included
    pub fn requests_sent(&self) -> usize {
        self.requests_sent
    }

    pub fn cache_hits(&self) -> usize {
        self.cache.hits()
    }

    #[instrument(skip(self, ids), fields(kind = L::NAME, user_count = ids.len()))]
    async fn lookup_users<L: UserLookup>(&mut self, ids: &[UserId]) -> ApiResult<Lookup<L::Output>> {
        let mut lookup = Lookup::default();
        let mut pending = Vec::new();

        for id in ids {
            match L::cached(&mut self.cache, id) {
                Some(value) => {
                    lookup.resolved.insert(id.clone(), value);
                }
                None => pending.push(id.clone()),
            }
        }

        for chunk in pending.chunks(USER_LOOKUP_CHUNK) {
            match self.post::<Vec<L::Wire>>(L::BATCH_PATH, &json!(chunk)).await {
                Ok(wire) => {
                    let mut by_id: HashMap<UserId, L::Output> =
                        wire.into_iter().map(L::unwrap_wire).collect();

                    for id in chunk {
                        match by_id.remove(id) {
                            Some(value) => {
                                L::store(&mut self.cache, id.clone(), value.clone());
                                lookup.resolved.insert(id.clone(), value);
                            }
                            None => lookup.failed.push(LookupFailure {
                                user_id: id.clone(),
                                reason: format!("absent from batched {} response", L::NAME),
                            }),
                        }
                    }
                }

                Err(e) if e.is_fatal() => return Err(e),

                // a bad chunk is refetched one user at a time so that only the offending users
                // are lost
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        chunk_length = chunk.len(),
                        "batched lookup failed, refetching users individually"
                    );

                    for id in chunk {
                        match L::fetch_one(self, id).await {
                            Ok(value) => {
                                lookup.resolved.insert(id.clone(), value);
                            }
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => lookup.failed.push(LookupFailure {
                                user_id: id.clone(),
                                reason: e.to_string(),
                            }),
                        }
                    }
                }
            }
        }

        tracing::debug!(
            resolved = lookup.resolved.len(),
            failed = lookup.failed.len(),
            "user lookup complete"
        );
        Ok(lookup)
    }

    #[instrument(skip(self), fields(kind = L::NAME, user_id = %id))]
    async fn lookup_user<L: UserLookup>(&mut self, id: &UserId) -> ApiResult<L::Output> {
        if let Some(value) = L::cached(&mut self.cache, id) {
            return Ok(value);
        }

        let wire: L::Wire = self.get(&L::single_path(id), &[]).await?;
        let (_, value) = L::unwrap_wire(wire);

        L::store(&mut self.cache, id.clone(), value.clone());
        Ok(value)
    }

    async fn get<T>(&mut self, path: &str, query: &[(&str, String)]) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        let headers = self.session_headers()?;
        let res = self
            .send(Method::GET, path, query, None, Some(headers))
            .await?;
        decode(path, res).await
    }

    async fn post<T>(&mut self, path: &str, body: &Value) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        let headers = self.session_headers()?;
        let res = self
            .send(Method::POST, path, &[], Some(body), Some(headers))
            .await?;
        decode(path, res).await
    }

    fn session_headers(&self) -> ApiResult<HeaderMap> {
        self.session
            .as_ref()
            .map(|s| s.headers.clone())
            .ok_or(ApiError::NotAuthenticated)
    }

    /// Sends a request, pacing it against the previous one and retrying on `429 Too Many
    /// Requests` up to the configured limit. Any other response is handed back as-is.
    #[instrument(skip(self, query, body, headers), fields(method = %method))]
    async fn send(
        &mut self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        headers: Option<HeaderMap>,
    ) -> ApiResult<reqwest::Response> {
        let url = format!("{}{path}", self.config.base_url);
        let mut attempt: u32 = 0;

        loop {
            self.pace().await;

            let mut req = self.http.request(method.clone(), &url).query(query);
            if let Some(headers) = &headers {
                req = req.headers(headers.clone());
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            self.requests_sent += 1;
            let res = req.send().await.map_err(|e| ApiError::Transient {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

            log_rate_limit(&res);

            if res.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(res);
            }

            if attempt >= self.config.rate_limit_retries {
                tracing::error!(attempts = attempt + 1, "rate limit persisted after retries");
                return Err(ApiError::RateLimited {
                    path: path.to_string(),
                    attempts: attempt + 1,
                });
            }

            let wait = rate_limit_wait(retry_after(&res), self.config.rate_limit_backoff);
            tracing::warn!(wait_ms = wait.as_millis() as u64, attempt, "rate limited, backing off");

            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    /// Sleeps off whatever remains of the configured delay since the previous request.
    async fn pace(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.config.request_delay {
                tokio::time::sleep(self.config.request_delay - elapsed).await;
            }
        }

        self.last_request = Some(Instant::now());
    }
}

/// Parses a response body into `T`, mapping non-2xx statuses onto the error taxonomy.
async fn decode<T>(path: &str, res: reqwest::Response) -> ApiResult<T>
where
    T: DeserializeOwned,
{
    let status = res.status();
    if !status.is_success() {
        let message = error_message(res).await;
        tracing::error!(code = %status, path, message, "non-2xx response");

        return Err(match status {
            StatusCode::UNAUTHORIZED => ApiError::Auth(message),
            s if s.is_server_error() => ApiError::Transient {
                path: path.to_string(),
                reason: format!("{status}: {message}"),
            },
            _ => ApiError::Rejected {
                path: path.to_string(),
                status,
                message,
            },
        });
    }

    let bytes = res.bytes().await.map_err(|e| ApiError::Transient {
        path: path.to_string(),
        reason: e.to_string(),
    })?;

    serde_json::from_slice(&bytes).map_err(|e| ApiError::Parse {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Extracts the platform's error message, falling back to the status's reason phrase.
async fn error_message(res: reqwest::Response) -> String {
    let status = res.status();
    match res.json::<WireAppError>().await {
        Ok(body) if !body.message.is_empty() => match body.id.is_empty() {
            true => body.message,
            false => format!("{} ({})", body.message, body.id),
        },
        _ => status.canonical_reason().unwrap_or("unknown error").to_string(),
    }
}

fn retry_after(res: &reqwest::Response) -> Option<Duration> {
    res.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// `Retry-After` is honoured when it asks for longer than the configured backoff, up to a cap.
fn rate_limit_wait(retry_after: Option<Duration>, backoff: Duration) -> Duration {
    let cap = Duration::from_secs(MAX_RATE_LIMIT_WAIT_SECS).max(backoff);
    retry_after.map_or(backoff, |wait| wait.max(backoff)).min(cap)
}

fn log_rate_limit(res: &reqwest::Response) {
    let remaining = res.headers().get(RATELIMIT_REMAINING_HEADER);
    let total = res.headers().get(RATELIMIT_LIMIT_HEADER);

    if let Some(remaining) = remaining
        && let Some(total) = total
    {
        tracing::debug!(ratelimit_available = ?remaining, ratelimit_total = ?total, "rate-limit bucket");
    }
}

/// A per-user attribute which can be fetched in batches or one user at a time.
trait UserLookup {
    type Output: Clone + fmt::Debug;
    type Wire: DeserializeOwned;

    const NAME: &'static str;
    const BATCH_PATH: &'static str;

    fn single_path(id: &UserId) -> String;
    async fn fetch_one(client: &mut MattermostClient, id: &UserId) -> ApiResult<Self::Output>;
    fn unwrap_wire(wire: Self::Wire) -> (UserId, Self::Output);
    fn cached(cache: &mut RunCache, id: &UserId) -> Option<Self::Output>;
    fn store(cache: &mut RunCache, id: UserId, value: Self::Output);
}

struct StatusLookup;
struct UsernameLookup;

impl UserLookup for StatusLookup {
    type Output = Status;
    type Wire = WireStatus;

    const NAME: &'static str = "status";
    const BATCH_PATH: &'static str = "/users/status/ids";

    fn single_path(id: &UserId) -> String {
        format!("/users/{id}/status")
    }

    async fn fetch_one(client: &mut MattermostClient, id: &UserId) -> ApiResult<Self::Output> {
        client.get_user_status(id).await
    }

    fn unwrap_wire(wire: Self::Wire) -> (UserId, Self::Output) {
        (wire.user_id, wire.status)
    }

    fn cached(cache: &mut RunCache, id: &UserId) -> Option<Self::Output> {
        cache.status(id)
    }

    fn store(cache: &mut RunCache, id: UserId, value: Self::Output) {
        cache.store_status(id, value)
    }
}

impl UserLookup for UsernameLookup {
    type Output = String;
    type Wire = WireUser;

    const NAME: &'static str = "username";
    const BATCH_PATH: &'static str = "/users/ids";

    fn single_path(id: &UserId) -> String {
        format!("/users/{id}")
    }

    async fn fetch_one(client: &mut MattermostClient, id: &UserId) -> ApiResult<Self::Output> {
        client.get_username(id).await
    }

    fn unwrap_wire(wire: Self::Wire) -> (UserId, Self::Output) {
        (wire.id, wire.username)
    }

    fn cached(cache: &mut RunCache, id: &UserId) -> Option<Self::Output> {
        cache.username(id)
    }

    fn store(cache: &mut RunCache, id: UserId, value: Self::Output) {
        cache.store_username(id, value)
    }
}

pub type ApiResult<T> = core::result::Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("no active session, authenticate first")]
    NotAuthenticated,

    #[error("transient failure on {path}: {reason}")]
    Transient { path: String, reason: String },

    #[error("still rate limited on {path} after {attempts} attempts")]
    RateLimited { path: String, attempts: u32 },

    #[error("unexpected response body from {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("{status} from {path}: {message}")]
    Rejected {
        path: String,
        status: StatusCode,
        message: String,
    },

    #[error("while creating a HeaderValue ({0})")]
    HeaderError(#[from] InvalidHeaderValue),

    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
}

impl ApiError {
    /// Whether this error ends the run even when it occurs during a per-user lookup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ApiError::Auth(_)
                | ApiError::NotAuthenticated
                | ApiError::RateLimited { .. }
                | ApiError::HeaderError(_)
                | ApiError::ReqwestError(_)
        )
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) const TOKEN: &str = "session-token";

    pub(crate) fn test_config(server: &MockServer) -> ClientConfig {
        ClientConfig {
            base_url: format!("{}/api/v4", server.uri()),
            login_id: "collector".into(),
            password: "hunter2".into(),
            timeout: Duration::from_secs(5),
            request_delay: Duration::ZERO,
            rate_limit_backoff: Duration::from_millis(10),
            rate_limit_retries: 1,
            members_per_page: MEMBERS_PER_PAGE,
        }
    }

    pub(crate) async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/v4/users/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_TOKEN_HEADER, TOKEN)
                    .set_body_json(json!({ "id": "collector-id", "username": "collector" })),
            )
            .mount(server)
            .await;
    }

    async fn authed_client(server: &MockServer) -> MattermostClient {
        mount_login(server).await;
        let mut client = MattermostClient::new(test_config(server)).unwrap();
        client.authenticate().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_authenticate_stores_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v4/users/login"))
            .and(body_json(json!({ "login_id": "collector", "password": "hunter2" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_TOKEN_HEADER, TOKEN)
                    .set_body_json(json!({ "id": "collector-id", "username": "collector" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users/me/teams"))
            .and(header("Authorization", "Bearer session-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{ "id": "t1", "name": "eng" }])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut client = MattermostClient::new(test_config(&server)).unwrap();
        let session = client.authenticate().await.unwrap();
        assert_eq!(session.user_id, UserId::from("collector-id"));

        let teams = client.list_teams().await.unwrap();
        assert_eq!(
            teams,
            vec![Team {
                id: "t1".into(),
                name: "eng".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v4/users/login"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "id": "api.user.login.invalid_credentials_email_username",
                "message": "Enter a valid email or username and/or password.",
                "status_code": 401
            })))
            .mount(&server)
            .await;

        let mut client = MattermostClient::new(test_config(&server)).unwrap();
        let err = client.authenticate().await.unwrap_err();

        assert!(matches!(err, ApiError::Auth(ref msg) if msg.contains("valid email")));
        assert!(client.session().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_auth_error() {
        let server = MockServer::start().await;
        let mut config = test_config(&server);
        drop(server);
        config.timeout = Duration::from_millis(500);

        let mut client = MattermostClient::new(config).unwrap();
        assert!(matches!(
            client.authenticate().await,
            Err(ApiError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_requires_session() {
        let server = MockServer::start().await;
        let mut client = MattermostClient::new(test_config(&server)).unwrap();

        assert!(matches!(
            client.list_teams().await,
            Err(ApiError::NotAuthenticated)
        ));
        assert_eq!(client.requests_sent(), 0);
    }

    #[tokio::test]
    async fn test_members_paginated() {
        let server = MockServer::start().await;
        let mut client = authed_client(&server).await;
        client.config.members_per_page = 2;

        Mock::given(method("GET"))
            .and(path("/api/v4/channels/c1/members"))
            .and(query_param("page", "0"))
            .and(query_param("per_page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "channel_id": "c1", "user_id": "u1" },
                { "channel_id": "c1", "user_id": "u2" }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v4/channels/c1/members"))
            .and(query_param("page", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{ "channel_id": "c1", "user_id": "u3" }])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let members = client.list_members(&"c1".into()).await.unwrap();
        assert_eq!(
            members,
            vec![UserId::from("u1"), UserId::from("u2"), UserId::from("u3")]
        );

        // second listing is served from the cache
        let again = client.list_members(&"c1".into()).await.unwrap();
        assert_eq!(again, members);
        assert_eq!(client.cache_hits(), 1);
    }

    #[tokio::test]
    async fn test_channels_cached_per_team() {
        let server = MockServer::start().await;
        let mut client = authed_client(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users/me/teams/t1/channels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "c1", "name": "town-square", "display_name": "Town Square", "team_id": "t1" }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let first = client.list_channels(&"t1".into()).await.unwrap();
        let sent = client.requests_sent();
        let second = client.list_channels(&"t1".into()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].name, "Town Square");
        assert_eq!(client.requests_sent(), sent);
    }

    #[tokio::test]
    async fn test_rate_limit_retried_once() {
        let server = MockServer::start().await;
        let mut client = authed_client(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users/me/teams"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users/me/teams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        assert!(client.list_teams().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_retry_after_still_backs_off() {
        let server = MockServer::start().await;
        let mut config = test_config(&server);
        config.rate_limit_backoff = Duration::from_millis(200);

        mount_login(&server).await;
        let mut client = MattermostClient::new(config).unwrap();
        client.authenticate().await.unwrap();

        Mock::given(method("GET"))
            .and(path("/api/v4/users/me/teams"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users/me/teams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        assert!(client.list_teams().await.unwrap().is_empty());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_rate_limit_wait_bounds() {
        let backoff = Duration::from_secs(5);
        let cap = Duration::from_secs(MAX_RATE_LIMIT_WAIT_SECS);

        assert_eq!(rate_limit_wait(None, backoff), backoff);
        assert_eq!(rate_limit_wait(Some(Duration::ZERO), backoff), backoff);
        assert_eq!(
            rate_limit_wait(Some(Duration::from_secs(12)), backoff),
            Duration::from_secs(12)
        );
        assert_eq!(rate_limit_wait(Some(Duration::from_secs(3600)), backoff), cap);

        // a backoff configured above the cap is still respected
        let long = Duration::from_secs(90);
        assert_eq!(rate_limit_wait(Some(Duration::from_secs(3600)), long), long);
    }

    #[tokio::test]
    async fn test_rate_limit_exhausted() {
        let server = MockServer::start().await;
        let mut client = authed_client(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users/me/teams"))
            .respond_with(ResponseTemplate::new(429))
            .expect(2)
            .mount(&server)
            .await;

        let err = client.list_teams().await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited { attempts: 2, .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        let mut client = authed_client(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users/me/teams"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client.list_teams().await.unwrap_err();
        assert!(matches!(err, ApiError::Transient { .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_malformed_body_is_parse_error() {
        let server = MockServer::start().await;
        let mut client = authed_client(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users/me/teams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "teams": [] })))
            .mount(&server)
            .await;

        assert!(matches!(
            client.list_teams().await,
            Err(ApiError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_batched_statuses_report_missing_users() {
        let server = MockServer::start().await;
        let mut client = authed_client(&server).await;

        Mock::given(method("POST"))
            .and(path("/api/v4/users/status/ids"))
            .and(body_json(json!(["u1", "u2"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "user_id": "u1", "status": "online", "manual": false, "last_activity_at": 0 }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let ids = vec![UserId::from("u1"), UserId::from("u2")];
        let lookup = client.get_user_statuses(&ids).await.unwrap();

        assert_eq!(lookup.resolved.get(&ids[0]), Some(&Status::Online));
        assert_eq!(lookup.failed.len(), 1);
        assert_eq!(lookup.failed[0].user_id, ids[1]);

        // resolved users are not requested again
        assert_eq!(client.get_user_status(&ids[0]).await.unwrap(), Status::Online);
    }

    #[tokio::test]
    async fn test_failed_batch_refetched_individually() {
        let server = MockServer::start().await;
        let mut client = authed_client(&server).await;

        Mock::given(method("POST"))
            .and(path("/api/v4/users/ids"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "id": "api.context.invalid_url_param.app_error",
                "message": "Invalid or missing user_ids in request URL."
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users/u1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": "u1", "username": "alice" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users/u2"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "id": "app.user.missing_account.const",
                "message": "We couldn't find the existing account."
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ids = vec![UserId::from("u1"), UserId::from("u2")];
        let lookup = client.get_usernames(&ids).await.unwrap();

        assert_eq!(lookup.resolved.get(&ids[0]).map(String::as_str), Some("alice"));
        assert_eq!(lookup.failed.len(), 1);
        assert!(lookup.failed[0].reason.contains("404"));
    }

    #[tokio::test]
    async fn test_request_delay_spaces_requests() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users/me/teams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.request_delay = Duration::from_millis(50);

        let mut client = MattermostClient::new(config).unwrap();
        let started = std::time::Instant::now();

        client.authenticate().await.unwrap();
        client.list_teams().await.unwrap();
        client.list_teams().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(client.requests_sent(), 3);
    }
}
