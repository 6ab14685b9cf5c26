use std::time::Duration;

use anyhow::bail;

/// Per-connection tuning knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Idle time before a ping packet is sent.
    pub ping_timeout: Duration,
    /// Number of unacknowledged pings before the connection is declared dead.
    pub ping_retry_count: u32,
    /// Fraction of packets (send and receive side) dropped to simulate a
    /// lossy network. Must be in `[0, 1]`.
    pub simulated_packet_loss: f32,
    /// Additional one-way delay applied to every send to simulate latency.
    pub simulated_latency: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            ping_timeout: Duration::from_millis(5_000),
            ping_retry_count: 5,
            simulated_packet_loss: 0.0,
            simulated_latency: Duration::ZERO,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.simulated_packet_loss) {
            bail!("simulated packet loss must be in [0, 1], was {}", self.simulated_packet_loss);
        }
        if self.ping_timeout.is_zero() {
            bail!("ping timeout must be non-zero");
        }
        Ok(())
    }
}

/// Interface-level configuration: handshake retry schedule, timeout sweep
/// cadence and puzzle policy.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Accept incoming connection requests. Initiating is always allowed.
    pub allow_connections: bool,
    /// Interval between timeout sweeps over all established connections.
    pub timeout_check_interval: Duration,
    /// How many times to re-send a challenge request before giving up.
    pub challenge_retry_count: u32,
    pub challenge_retry_interval: Duration,
    /// How many times to re-send a connect request before giving up.
    pub connect_retry_count: u32,
    pub connect_retry_interval: Duration,
    /// Difficulty (leading zero bits) of issued client puzzles.
    pub puzzle_difficulty: u32,
    /// Defaults applied to connections created by this interface.
    pub connection: ConnectionConfig,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        InterfaceConfig {
            allow_connections: true,
            timeout_check_interval: Duration::from_millis(1_500),
            challenge_retry_count: 4,
            challenge_retry_interval: Duration::from_millis(2_500),
            connect_retry_count: 4,
            connect_retry_interval: Duration::from_millis(2_500),
            puzzle_difficulty: crate::client_puzzle::INITIAL_PUZZLE_DIFFICULTY,
            connection: ConnectionConfig::default(),
        }
    }
}

impl InterfaceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.connection.validate()?;
        if self.puzzle_difficulty > crate::client_puzzle::MAX_PUZZLE_DIFFICULTY {
            bail!(
                "puzzle difficulty must be at most {}, was {}",
                crate::client_puzzle::MAX_PUZZLE_DIFFICULTY,
                self.puzzle_difficulty
            );
        }
        Ok(())
    }
}
