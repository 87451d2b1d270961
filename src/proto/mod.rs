//! Shared wire types for the agent ↔ gateway stream.
//!
//! Every message crossing the stream is either a [`ClientFrame`]
//! (agent → gateway) or a [`ServerFrame`] (gateway → agent), serialized as
//! JSON inside a length-prefixed frame (see [`framing`]).
//!
//! Telemetry travels as [`Envelope`]s tagged with a per-agent monotonic
//! `sequence` assigned at WAL write. Heartbeats, command results, and exec
//! frames are not WAL-backed and carry `sequence = 0`; the gateway only
//! acknowledges and deduplicates sequences greater than zero.

pub mod framing;

use serde::{Deserialize, Serialize};

/// Sequence value used by envelopes that bypass the WAL.
pub const DIRECT_SEQUENCE: u64 = 0;

/// Stable fleet identity of an agent.
///
/// Established at first connect and pinned by the gateway; a fingerprint
/// mismatch on reconnect is rejected.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Host name as reported by the OS.
    pub hostname: String,
    /// First non-loopback IPv4 address of the host.
    pub primary_ipv4: String,
    /// SHA-256 hex fingerprint of the persisted agent key.
    pub agent_key_fingerprint: String,
}

impl AgentIdentity {
    /// Derive the fleet-wide agent id from this identity.
    ///
    /// Stable across restarts on the same host: hostname plus a fingerprint
    /// prefix long enough to disambiguate rebuilt hosts.
    pub fn agent_id(&self) -> String {
        let prefix = &self.agent_key_fingerprint[..12.min(self.agent_key_fingerprint.len())];
        format!("{}-{}", self.hostname, prefix)
    }
}

/// A proxy process discovered on the agent's host.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredProxy {
    /// OS process id.
    pub pid: u32,
    /// Absolute path of the proxy binary.
    pub binary_path: String,
    /// Version string reported by the binary, if detectable.
    pub version: Option<String>,
    /// Main configuration file path, if detectable.
    pub config_path: Option<String>,
}

/// Source of a tailed log line.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    /// Access log (combined format or JSON).
    Access,
    /// Error log.
    Error,
}

/// One parsed (or raw) log line.
///
/// Access lines populate the request fields; error lines populate `level`
/// and `message`. Unparseable lines keep only `raw`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LogRecord {
    /// Event time, unix seconds.
    pub ts_unix: i64,
    /// Which log the line came from.
    pub log_type: Option<LogType>,
    pub remote_addr: Option<String>,
    pub xff: Option<String>,
    pub method: Option<String>,
    pub uri: Option<String>,
    pub status: Option<u16>,
    pub bytes: Option<u64>,
    pub request_time: Option<f64>,
    pub upstream_connect_time: Option<f64>,
    pub upstream_response_time: Option<f64>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    /// Error-log severity (error lines only).
    pub level: Option<String>,
    /// Error-log message (error lines only).
    pub message: Option<String>,
    /// Original line when parsing failed.
    pub raw: Option<String>,
}

/// Per-zone status-class counters from the proxy status endpoint.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ZoneMetric {
    /// Zone (server block / upstream) name.
    pub name: String,
    pub responses_1xx: u64,
    pub responses_2xx: u64,
    pub responses_3xx: u64,
    pub responses_4xx: u64,
    pub responses_5xx: u64,
}

/// One scrape of the proxy status endpoint.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ProxyMetric {
    /// Scrape time, unix seconds.
    pub ts_unix: i64,
    pub active: u64,
    pub accepted: u64,
    pub handled: u64,
    pub requests: u64,
    pub reading: u64,
    pub writing: u64,
    pub waiting: u64,
    /// Per-zone counters when the endpoint reports them (JSON format only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<ZoneMetric>>,
}

/// One host system sample with rates computed against the previous sample.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SystemMetric {
    /// Sample time, unix seconds.
    pub ts_unix: i64,
    pub cpu_pct: f64,
    pub cpu_user: f64,
    pub cpu_sys: f64,
    pub cpu_iowait: f64,
    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_pct: f64,
    /// Cumulative received bytes across non-loopback interfaces.
    pub rx_bytes: u64,
    /// Cumulative transmitted bytes across non-loopback interfaces.
    pub tx_bytes: u64,
    /// Receive rate in bytes/s since the previous sample (0 on first).
    pub rx_rate: f64,
    /// Transmit rate in bytes/s since the previous sample (0 on first).
    pub tx_rate: f64,
}

/// Agent status piggybacked on heartbeats.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Heartbeat {
    /// Currently discovered proxy processes.
    pub proxies: Vec<DiscoveredProxy>,
    /// Running agent version.
    pub agent_version: String,
    /// WAL bytes written but not yet acknowledged.
    pub cursor_backlog_bytes: u64,
    /// Records dropped at the collector (WAL write failures).
    pub dropped_records: u64,
    /// Config files marked degraded after a failed rollback.
    pub degraded_files: Vec<String>,
}

/// Reply to a [`Command`], correlated by `command_id`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CommandResult {
    pub command_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Command-specific artifact (backup path, fetched log text, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

/// Direction of an exec data frame.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecDirection {
    /// Gateway → agent (keyboard input).
    In,
    /// Agent → gateway (PTY output).
    Out,
}

/// One chunk of an interactive exec session, correlated by `command_id`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecFrame {
    pub command_id: String,
    pub direction: ExecDirection,
    pub bytes: Vec<u8>,
}

/// Variant payload of an [`Envelope`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvelopePayload {
    Heartbeat(Heartbeat),
    LogRecord(LogRecord),
    ProxyMetric(ProxyMetric),
    SystemMetric(SystemMetric),
    CommandResult(CommandResult),
    ExecFrame(ExecFrame),
}

impl EnvelopePayload {
    /// Short label used for logging and batch keying.
    pub fn kind_str(&self) -> &'static str {
        match self {
            EnvelopePayload::Heartbeat(_) => "heartbeat",
            EnvelopePayload::LogRecord(_) => "log_record",
            EnvelopePayload::ProxyMetric(_) => "proxy_metric",
            EnvelopePayload::SystemMetric(_) => "system_metric",
            EnvelopePayload::CommandResult(_) => "command_result",
            EnvelopePayload::ExecFrame(_) => "exec_frame",
        }
    }
}

/// Tagged message crossing the agent → gateway stream.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Monotonic per-agent counter assigned at WAL write; 0 for direct
    /// (non-WAL) envelopes.
    pub sequence: u64,
    /// Stable fleet identifier of the sending agent.
    pub agent_id: String,
    #[serde(flatten)]
    pub payload: EnvelopePayload,
}

impl Envelope {
    /// Build a direct (non-WAL, unsequenced) envelope.
    pub fn direct(agent_id: impl Into<String>, payload: EnvelopePayload) -> Self {
        Self {
            sequence: DIRECT_SEQUENCE,
            agent_id: agent_id.into(),
            payload,
        }
    }

    /// True if this envelope went through the WAL and must be acknowledged.
    pub fn is_sequenced(&self) -> bool {
        self.sequence > DIRECT_SEQUENCE
    }
}

/// Command kinds the gateway can address to an agent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    /// Reload the proxy without changing its configuration.
    ReloadConfig,
    /// Replace a managed config file with new contents.
    ApplyConfigSnippet { path: String, content: String },
    /// Append an opaque snippet to a managed config file.
    ApplyAugment { path: String, snippet: String },
    /// Restart the proxy service.
    Restart,
    /// Stop the proxy service.
    Stop,
    /// Open an interactive exec session running `command`. The session id
    /// is this command's `command_id`; its result arrives when the session
    /// ends.
    ExecOpen { command: String },
    /// Feed input bytes into the open session named by `session_id`.
    ExecInput { session_id: String, bytes: Vec<u8> },
    /// Close the session named by `session_id` and kill its child.
    ExecClose { session_id: String },
    /// Trigger an immediate self-update check and apply.
    UpdateBinary,
    /// Return the tail of the agent's own log file.
    FetchLogs { lines: u64 },
}

/// A command record, gateway → agent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Command {
    /// Unique id; the agent replies with a matching [`CommandResult`].
    pub command_id: String,
    /// Absolute deadline, unix nanoseconds. 0 means "router default".
    pub deadline_unix_ns: u64,
    #[serde(flatten)]
    pub kind: CommandKind,
}

impl Command {
    /// Build a command with a fresh id and the given deadline.
    pub fn new(kind: CommandKind, deadline_unix_ns: u64) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            deadline_unix_ns,
            kind,
        }
    }
}

/// First frame an agent sends after connecting.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Hello {
    pub identity: AgentIdentity,
    pub agent_version: String,
    pub discovered_proxies: Vec<DiscoveredProxy>,
    /// Highest sequence the agent has had acknowledged (from its cursor).
    pub last_ack_sequence: u64,
}

/// Gateway's accept reply to a [`Hello`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct HelloAck {
    /// First sequence the gateway expects on this connection.
    pub resume_from_sequence: u64,
}

/// Per-envelope acknowledgement, gateway → agent.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack {
    pub sequence: u64,
}

/// Gateway's refusal of a [`Hello`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Reject {
    pub reason: String,
}

/// Agent → gateway wire frame.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello(Hello),
    Envelope(Envelope),
}

/// Gateway → agent wire frame.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    HelloAck(HelloAck),
    Ack(Ack),
    Command(Command),
    Reject(Reject),
}
