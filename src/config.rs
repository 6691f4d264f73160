use std::time::Duration;

/// Tunable knobs for a connection, with defaults matching the protocol's own
/// defaults where one exists (`frame_max`, `heartbeat`) and sensible local
/// conventions elsewhere (connect timeout, channel capacities).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,

    /// Proposed in `peer_properties`/`tune`; the effective value is the
    /// minimum of this and the server's proposal.
    pub requested_frame_max: u32,
    /// Seconds; same negotiation rule as `requested_frame_max`.
    pub requested_heartbeat: u32,

    /// Bounds the handshake only; not a wire field.
    pub connect_timeout: Duration,
    /// Capacity of the mailbox callers use to reach the connection actor.
    pub command_channel_capacity: usize,
    /// Capacity of the bounded channel the reader task uses to hand whole
    /// frames to the actor.
    pub frame_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5552,
            vhost: "/".to_owned(),
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            requested_frame_max: 1_048_576,
            requested_heartbeat: 60,
            connect_timeout: Duration::from_secs(30),
            command_channel_capacity: 1024,
            frame_channel_capacity: 4096,
        }
    }
}

/// Fluent builder over [`Config`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: Config,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.config.vhost = vhost.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = username.into();
        self.config.password = password.into();
        self
    }

    pub fn requested_frame_max(mut self, frame_max: u32) -> Self {
        self.config.requested_frame_max = frame_max;
        self
    }

    pub fn requested_heartbeat(mut self, heartbeat: u32) -> Self {
        self.config.requested_heartbeat = heartbeat;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.command_channel_capacity = capacity;
        self
    }

    pub fn frame_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.frame_channel_capacity = capacity;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_defaults() {
        let config = Config::default();
        assert_eq!(config.requested_frame_max, 1_048_576);
        assert_eq!(config.requested_heartbeat, 60);
        assert_eq!(config.port, 5552);
    }

    #[test]
    fn builder_overrides_apply() {
        let config = ClientBuilder::new()
            .host("broker.internal")
            .port(5553)
            .vhost("/prod")
            .credentials("alice", "s3cret")
            .requested_heartbeat(30)
            .build();
        assert_eq!(config.host, "broker.internal");
        assert_eq!(config.port, 5553);
        assert_eq!(config.vhost, "/prod");
        assert_eq!(config.username, "alice");
        assert_eq!(config.requested_heartbeat, 30);
    }
}
