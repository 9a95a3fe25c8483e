use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = collab_common::id::prefixed_ulid("conn");
/// assert!(id.starts_with("conn_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// One WebSocket connection.
    pub const CONNECTION: &str = "conn";
    /// A wire message envelope.
    pub const MESSAGE: &str = "msg";
    /// An event published to the bus.
    pub const EVENT: &str = "evt";
}
