use std::time::Duration;

/// Parse a `heart-beat` header value (`"cx,cy"`, milliseconds).
///
/// Fields that are missing or not a valid `u64` read as `0`; anything after
/// the second field is ignored.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut fields = header
        .split(',')
        .map(|field| field.trim().parse::<u64>().unwrap_or(0));
    let cx = fields.next().unwrap_or(0);
    let cy = fields.next().unwrap_or(0);
    (cx, cy)
}

/// Format a `heart-beat` header value from the two intervals.
pub fn format_heartbeat_header(outgoing_ms: u64, incoming_ms: u64) -> String {
    format!("{},{}", outgoing_ms, incoming_ms)
}

/// Agree on heartbeat intervals with the broker.
///
/// Returns `(outgoing, incoming)`: how often we must send, and how often the
/// broker promised to send. A direction is off (`None`) when either side
/// put `0` for it; otherwise the larger of the two intervals applies.
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> (Option<Duration>, Option<Duration>) {
    let pick = |ours: u64, theirs: u64| {
        if ours == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(ours.max(theirs)))
        }
    };
    (pick(client_out, server_in), pick(client_in, server_out))
}

/// Upper bound applied to the heartbeat grace multiplier.
pub const MAX_HEARTBEAT_GRACE: f64 = 100.0;

/// Inbound silence tolerated before the link is declared lost.
///
/// `grace` is clamped to `1.0..=MAX_HEARTBEAT_GRACE`; NaN counts as `1.0`.
pub fn inbound_deadline(incoming: Duration, grace: f64) -> Duration {
    incoming.mul_f64(grace.max(1.0).min(MAX_HEARTBEAT_GRACE))
}
