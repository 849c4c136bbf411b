use crate::interest::InterestStats;
use crate::protocol::{message_name, ConnectionId, MessageHeader, NetworkMessage};
use std::sync::atomic::{AtomicU8, Ordering};
use tracing_subscriber::EnvFilter;

const JSON_DUMP: u8 = 0b01;
const OP_TRACE: u8 = 0b10;

static FLAGS: AtomicU8 = AtomicU8::new(0);

/// Switches read from the process environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugFlags {
    /// `TX2_DEBUG` or `TX2_DEBUG_JSON`: dump every message body as JSON.
    pub json_dump: bool,
    /// `TX2_TRACE`: per-operation traces (sends, receives, rebuilds).
    pub op_trace: bool,
}

impl DebugFlags {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key).is_some())
    }

    fn from_lookup(is_set: impl Fn(&str) -> bool) -> Self {
        Self {
            json_dump: is_set("TX2_DEBUG") || is_set("TX2_DEBUG_JSON"),
            op_trace: is_set("TX2_TRACE"),
        }
    }

    fn bits(self) -> u8 {
        let mut bits = 0;
        if self.json_dump {
            bits |= JSON_DUMP;
        }
        if self.op_trace {
            bits |= OP_TRACE;
        }
        bits
    }

    fn default_directive(self) -> &'static str {
        match (self.op_trace, self.json_dump) {
            (true, _) => "tx2_replication=trace",
            (false, true) => "tx2_replication=debug",
            (false, false) => "tx2_replication=info",
        }
    }
}

/// Reads the debug switches from the environment and installs a stderr
/// `tracing` subscriber if the process has none. `RUST_LOG` wins over the
/// level implied by the switches. Safe to call more than once.
pub fn init_debug_mode() {
    apply_flags(DebugFlags::from_env());
}

fn apply_flags(flags: DebugFlags) {
    FLAGS.store(flags.bits(), Ordering::Relaxed);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(flags.default_directive()));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        tracing::debug!("Subscriber already installed, keeping it");
    }

    tracing::info!(json_dump = flags.json_dump, op_trace = flags.op_trace, "Replication debug flags applied");
}

pub fn is_debug_enabled() -> bool {
    FLAGS.load(Ordering::Relaxed) & JSON_DUMP != 0
}

pub fn is_trace_enabled() -> bool {
    FLAGS.load(Ordering::Relaxed) & OP_TRACE != 0
}

/// Dumps `message` as JSON at debug level when JSON dumps are on.
pub fn log_message<M: NetworkMessage>(direction: &str, connection_id: Option<ConnectionId>, message: &M) {
    if !is_debug_enabled() {
        return;
    }

    match serde_json::to_string(message) {
        Ok(body) => tracing::debug!(
            connection = ?connection_id,
            id = M::ID,
            "{} {} {}",
            direction,
            M::NAME,
            body
        ),
        Err(err) => tracing::warn!("{} could not be dumped: {}", M::NAME, err),
    }
}

pub fn trace_transport_send(bytes: usize, connection_id: Option<ConnectionId>) {
    if is_trace_enabled() {
        match connection_id {
            Some(id) => tracing::trace!("send {} -> connection {}", format_bytes(bytes), id),
            None => tracing::trace!("send {} -> server", format_bytes(bytes)),
        }
    }
}

pub fn trace_transport_receive(bytes: usize, connection_id: ConnectionId) {
    if is_trace_enabled() {
        tracing::trace!("recv {} <- connection {}", format_bytes(bytes), connection_id);
    }
}

/// One line per interest rebuild.
pub fn trace_rebuild(stats: &InterestStats) {
    if is_trace_enabled() {
        tracing::trace!(
            rebuild = stats.rebuild_count,
            entities = stats.last_entity_count,
            connections = stats.last_connection_count,
            "interest rebuild: +{} spawn, -{} unspawn",
            stats.last_spawns,
            stats.last_unspawns
        );
    }
}

/// Byte count with a binary unit suffix, two decimals above 1 KiB.
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];

    if bytes < 1024 {
        return format!("{} bytes", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// `Name xCount (0xId)` for a frame header.
pub fn message_summary(header: &MessageHeader) -> String {
    format!(
        "{} x{} (0x{:04x})",
        message_name(header.message_id),
        header.count,
        header.message_id
    )
}
