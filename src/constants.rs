pub const SERVICE_NAME: &str = "presence-snapshot";
pub const TRACER_NAME: &str = "presence-snapshot-tracer";

// MATTERMOST API
pub const API_PATH_PREFIX: &str = "/api/v4";
pub const SESSION_TOKEN_HEADER: &str = "Token";
pub const RATELIMIT_REMAINING_HEADER: &str = "X-Ratelimit-Remaining";
pub const RATELIMIT_LIMIT_HEADER: &str = "X-Ratelimit-Limit";

/// Page size used when walking a channel's member list
pub const MEMBERS_PER_PAGE: usize = 200;

/// Longest a single 429 backoff may park the run, whatever `Retry-After` asks for
pub const MAX_RATE_LIMIT_WAIT_SECS: u64 = 60;

/// Upper bound on ids sent in a single `users/ids` or `users/status/ids` request
pub const USER_LOOKUP_CHUNK: usize = 100;

// STORAGE
pub const SNAPSHOT_TABLE: &str = "channel_user_status";
pub const SNAPSHOT_COLUMN_COUNT: usize = 8;

/// Postgres refuses statements carrying more bind parameters than this
pub const PG_BIND_LIMIT: usize = 65_535;

pub const DEFAULT_LOG_FILTER: &str = "presence_snapshot=debug,sqlx=warn,reqwest=info,info";
