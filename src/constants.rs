/// Prefix of queue ids minted locally before the server acknowledges an entry.
pub const TEMP_QUEUE_ID_PREFIX: &str = "temp-";

/// Prefix of user message ids shown before the server assigns one.
pub const OPTIMISTIC_ID_PREFIX: &str = "optimistic-";

/// Queue validation limits, mirrored from the backend's schema.
pub const MAX_QUEUE_CONTENT_CHARS: usize = 100_000;
pub const MAX_MODEL_ID_CHARS: usize = 100;

/// Event-stream frame kinds
pub const FRAME_CONTENT: &str = "content";
pub const FRAME_ERROR: &str = "error";
pub const FRAME_COMPLETE: &str = "complete";
pub const FRAME_QUEUE_PROCESSING: &str = "queue_processing";
pub const FRAME_QUEUE_INJECTED: &str = "queue_injected";

/// Stream event types handled outside the message body
pub const EVENT_PERMISSION_REQUEST: &str = "permission_request";
pub const EVENT_SYSTEM: &str = "system";

/// Header carrying the resume cursor on reconnect
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Upper bound on a single event-stream line
pub const MAX_SSE_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Delays before refetching server-side accounting after a completed turn
pub const USAGE_REFRESH_DELAY_MS: u64 = 1_000;
pub const CONTEXT_USAGE_REFRESH_DELAY_MS: u64 = 3_000;

/// Cursor table housekeeping
pub const CURSOR_RETENTION_DAYS: i64 = 7;
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];

/// Capacity of the broadcast channels for queue events and cache invalidations
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
