use std::str::FromStr;
use std::time::Duration;

/// What the rate limiter does when the shared store cannot answer in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitFailurePolicy {
    /// Allow the message.
    Open,
    /// Reject the message.
    Closed,
    /// Count against an in-process window and flag the result as degraded.
    Local,
}

impl FromStr for RateLimitFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown rate limit failure policy '{other}'")),
        }
    }
}

/// Collaboration service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// HS256 secret used to verify bearer tokens.
    pub jwt_secret: String,
    /// Shared store location. When absent an in-process store is used.
    pub redis_url: Option<String>,
    /// Name stamped into heartbeat replies and bus events.
    pub service_name: String,

    /// Largest inbound frame accepted from a client, in bytes.
    pub max_message_size: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// Capacity of each client's outbound queue.
    pub send_queue_size: usize,

    /// Deadline for a single frame write.
    pub write_wait: Duration,
    /// How long a connection may stay silent before it is considered dead.
    pub pong_wait: Duration,
    /// Interval between keepalive pings. Always shorter than `pong_wait`.
    pub ping_period: Duration,

    pub max_users_per_room: usize,
    pub maintenance_interval: Duration,
    /// How long an empty room survives before the sweeper evicts it.
    pub room_grace: Duration,

    /// Messages a user may send per window.
    pub message_rate_limit: u32,
    pub rate_limit_window: Duration,
    /// Budget for one shared-store rate limit round trip.
    pub rate_limit_timeout: Duration,
    pub rate_limit_failure_policy: RateLimitFailurePolicy,

    pub check_origin: bool,
    pub allowed_origins: Vec<String>,

    /// Capacity of the shared-store mirror queue.
    pub mirror_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8083,
            jwt_secret: String::new(),
            redis_url: None,
            service_name: "collaboration-service".to_string(),
            max_message_size: 4096,
            read_buffer_size: 1024,
            write_buffer_size: 1024,
            send_queue_size: 256,
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
            max_users_per_room: 100,
            maintenance_interval: Duration::from_secs(30),
            room_grace: Duration::from_secs(3600),
            message_rate_limit: 60,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_timeout: Duration::from_millis(250),
            rate_limit_failure_policy: RateLimitFailurePolicy::Local,
            check_origin: false,
            allowed_origins: Vec::new(),
            mirror_queue_size: 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing
    /// or a value cannot be parsed.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            port: parsed_var("PORT", defaults.port),
            jwt_secret: required_var("JWT_SECRET"),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            service_name: std::env::var("SERVICE_NAME")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.service_name),
            max_message_size: parsed_var("WS_MAX_MESSAGE_SIZE", defaults.max_message_size),
            read_buffer_size: parsed_var("WS_READ_BUFFER_SIZE", defaults.read_buffer_size),
            write_buffer_size: parsed_var("WS_WRITE_BUFFER_SIZE", defaults.write_buffer_size),
            send_queue_size: parsed_var("WS_SEND_QUEUE_SIZE", defaults.send_queue_size),
            write_wait: secs_var("WS_WRITE_WAIT_SECS", defaults.write_wait),
            pong_wait: secs_var("WS_PONG_WAIT_SECS", defaults.pong_wait),
            ping_period: secs_var("WS_PING_PERIOD_SECS", defaults.ping_period),
            max_users_per_room: parsed_var("WS_MAX_USERS_PER_ROOM", defaults.max_users_per_room),
            maintenance_interval: secs_var(
                "WS_MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval,
            ),
            room_grace: secs_var("WS_ROOM_GRACE_SECS", defaults.room_grace),
            message_rate_limit: parsed_var("WS_MESSAGE_RATE_LIMIT", defaults.message_rate_limit),
            rate_limit_window: secs_var("WS_RATE_LIMIT_WINDOW_SECS", defaults.rate_limit_window),
            rate_limit_timeout: millis_var(
                "WS_RATE_LIMIT_TIMEOUT_MS",
                defaults.rate_limit_timeout,
            ),
            rate_limit_failure_policy: parsed_var(
                "WS_RATE_LIMIT_FAILURE_POLICY",
                defaults.rate_limit_failure_policy,
            ),
            check_origin: parsed_var("WS_CHECK_ORIGIN", defaults.check_origin),
            allowed_origins: std::env::var("WS_ALLOWED_ORIGINS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            mirror_queue_size: parsed_var("WS_MIRROR_QUEUE_SIZE", defaults.mirror_queue_size),
        };

        if let Err(msg) = config.validate() {
            panic!("{msg}");
        }
        config
    }

    /// Checks cross-field constraints that individual parsers cannot see.
    pub fn validate(&self) -> Result<(), String> {
        if self.ping_period >= self.pong_wait {
            return Err("WS_PING_PERIOD_SECS must be shorter than WS_PONG_WAIT_SECS".to_string());
        }
        if self.send_queue_size == 0 {
            return Err("WS_SEND_QUEUE_SIZE must be greater than zero".to_string());
        }
        if self.mirror_queue_size == 0 {
            return Err("WS_MIRROR_QUEUE_SIZE must be greater than zero".to_string());
        }
        if self.max_users_per_room == 0 {
            return Err("WS_MAX_USERS_PER_ROOM must be greater than zero".to_string());
        }
        if self.message_rate_limit == 0 {
            return Err("WS_MESSAGE_RATE_LIMIT must be greater than zero".to_string());
        }
        let durations = [
            ("WS_RATE_LIMIT_WINDOW_SECS", self.rate_limit_window),
            ("WS_RATE_LIMIT_TIMEOUT_MS", self.rate_limit_timeout),
            ("WS_MAINTENANCE_INTERVAL_SECS", self.maintenance_interval),
            ("WS_PING_PERIOD_SECS", self.ping_period),
            ("WS_WRITE_WAIT_SECS", self.write_wait),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(format!("{name} must be greater than zero"));
        }
        Ok(())
    }

    /// Whether a request carrying this `Origin` header may open a socket.
    ///
    /// With checking on, a missing or empty origin is refused.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if !self.check_origin {
            return true;
        }
        match origin {
            None | Some("") => false,
            Some(origin) => self
                .allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin)),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| panic!("{name} env var is required"))
}

fn parsed_var<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .unwrap_or_else(|e| panic!("{name} has an invalid value '{raw}': {e}")),
        _ => default,
    }
}

fn secs_var(name: &str, default: Duration) -> Duration {
    Duration::from_secs(parsed_var(name, default.as_secs()))
}

fn millis_var(name: &str, default: Duration) -> Duration {
    Duration::from_millis(parsed_var(name, default.as_millis() as u64))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn ping_period_must_be_shorter_than_pong_wait() {
        let config = Config {
            ping_period: Duration::from_secs(60),
            pong_wait: Duration::from_secs(60),
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("WS_PING_PERIOD_SECS"));
    }

    #[test]
    fn failure_policy_parses_case_insensitively() {
        assert_eq!(
            "Open".parse::<RateLimitFailurePolicy>().unwrap(),
            RateLimitFailurePolicy::Open
        );
        assert_eq!(
            " closed ".parse::<RateLimitFailurePolicy>().unwrap(),
            RateLimitFailurePolicy::Closed
        );
        assert!("sometimes".parse::<RateLimitFailurePolicy>().is_err());
    }

    #[test]
    fn origin_list_is_trimmed() {
        assert_eq!(
            parse_list(" https://a.example , ,https://b.example"),
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn origin_check_disabled_accepts_everything() {
        let config = Config::default();
        assert!(config.origin_allowed(Some("https://evil.example")));
    }

    #[test]
    fn origin_check_enforces_allow_list() {
        let config = Config {
            check_origin: true,
            allowed_origins: vec!["https://forms.example".to_string()],
            ..Config::default()
        };
        assert!(config.origin_allowed(Some("https://forms.example")));
        assert!(!config.origin_allowed(Some("https://evil.example")));
    }

    #[test]
    fn origin_check_refuses_missing_origin() {
        let config = Config {
            check_origin: true,
            allowed_origins: vec!["*".to_string()],
            ..Config::default()
        };
        assert!(!config.origin_allowed(None));
        assert!(!config.origin_allowed(Some("")));
        assert!(Config::default().origin_allowed(None));
    }

    #[test]
    fn zero_intervals_and_deadlines_are_rejected() {
        let cases: [(&str, fn(&mut Config)); 4] = [
            ("WS_MAINTENANCE_INTERVAL_SECS", |c| c.maintenance_interval = Duration::ZERO),
            ("WS_PING_PERIOD_SECS", |c| c.ping_period = Duration::ZERO),
            ("WS_WRITE_WAIT_SECS", |c| c.write_wait = Duration::ZERO),
            ("WS_RATE_LIMIT_TIMEOUT_MS", |c| c.rate_limit_timeout = Duration::ZERO),
        ];
        for (name, zero) in cases {
            let mut config = Config::default();
            zero(&mut config);
            let err = config.validate().unwrap_err();
            assert!(err.contains(name), "{name}: {err}");
        }
    }
}
