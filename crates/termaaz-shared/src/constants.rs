/// Wire protocol version carried in every `join` payload.
pub const PROTOCOL_VERSION: u32 = 1;

/// Application name.
pub const APP_NAME: &str = "termaaz";

/// Heartbeat period in milliseconds.
pub const PING_INTERVAL_MS: u64 = 5_000;

/// A peer with no pong for this long is considered gone (milliseconds).
pub const PEER_TIMEOUT_MS: u64 = 15_000;

/// File transfer chunk size in bytes (64 KiB).
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum chat message length in characters.
pub const MAX_MESSAGE_LENGTH: usize = 5_000;

/// Message list is trimmed to the most recent N entries.
pub const MAX_VISIBLE_MESSAGES: usize = 100;

/// How long a typing indicator stays on without a refresh (milliseconds).
pub const TYPING_TIMEOUT_MS: u64 = 3_000;

/// Topic derivation: SHA-256 of `termaaz:<room id>:termaazation`.
/// The fixed prefix/suffix act as a de facto shared secret, not a
/// security boundary.
pub const TOPIC_PREFIX: &str = "termaaz:";
pub const TOPIC_SUFFIX: &str = ":termaazation";

/// Fixed author fields for locally generated system messages.
pub const SYSTEM_USER_ID: &str = "system";
pub const SYSTEM_USER_NAME: &str = "System";
pub const SYSTEM_USER_COLOR: &str = "#6B7280";

/// Name of the directory (under the user's chosen base) where
/// downloaded files are written.
pub const DOWNLOAD_DIR_NAME: &str = "Termaaz_Downloads";

/// User color palette, assigned randomly at identity creation.
pub const USER_COLORS: [&str; 10] = [
    "#FF6B9D", // rose
    "#C79BFF", // lavender
    "#7EB8FF", // sky blue
    "#7DFFB3", // mint
    "#FFE066", // sunshine
    "#FF9F7A", // peach
    "#B8E0FF", // ice blue
    "#FFB8D9", // pink
    "#A8FFE0", // seafoam
    "#FFD9A8", // cream
];
