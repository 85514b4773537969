/// Service type browsed and advertised when nothing else is configured
pub const DEFAULT_SERVICE_TYPE: &str = "_http._tcp.";

/// Domain used when an empty domain is given
pub const DEFAULT_DOMAIN: &str = "local.";

/// Instance name of the advertised service
pub const DEFAULT_INSTANCE_NAME: &str = "mDisco";

/// TXT key written by the publisher's scheduled self-update
pub const TXT_HELLO: &str = "hello";

/// Largest single `key=value` entry a length byte can describe
pub const TXT_ENTRY_MAX_LEN: usize = 255;

/// Recommended upper bound for a whole TXT record (RFC 6763 section 6.2).
/// Not enforced; callers building records are responsible for it.
pub const TXT_RECORD_SOFT_LIMIT: usize = 1300;

/// API path prefix
pub const API_PREFIX: &str = "/v1";
