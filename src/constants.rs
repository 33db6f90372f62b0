/// Default length of a round's play window, counted from its lock time
pub const ROUND_SECONDS: u64 = 180;

/// Points for a correct prediction before the outcome multiplier
pub const BASE_POINTS: i64 = 10;

pub const GOAL_MULTIPLIER: i64 = 3;
pub const CORNER_MULTIPLIER: i64 = 2;
pub const YELLOW_CARD_MULTIPLIER: i64 = 1;
pub const NOTHING_MULTIPLIER: i64 = 1;

pub const RETRY_BASE_DELAY_MS: u64 = 25;
pub const RETRY_MAX_DELAY_MS: u64 = 1000;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const PROVIDER_SIGNATURE_HEADER: &str = "x-provider-signature";
pub const PROVIDER_TIMESTAMP_HEADER: &str = "x-provider-timestamp";
pub const HMAC_PREFIX: &str = "sha256=";

/// Updates buffered per live subscriber before the slowest one starts losing them
pub const LIVE_FEED_CAPACITY: usize = 1024;
pub const LIVE_HEARTBEAT_SECONDS: u64 = 25;
