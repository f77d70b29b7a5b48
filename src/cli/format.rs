//! Output formatting for CLI display.

use jiff::Timestamp;

use crate::model::{
    CellCandidate, FixOrigin, HeartbeatState, LifecycleEvent, Observation, ObservationKind,
};
use crate::status::whole_secs;

/// Header of the CSV export.
pub(super) const CSV_HEADER: &str =
    "Timestamp,Event_Type,CID,LAC_TAC,Signal_dBm,Lat,Lon,Accuracy,Latency_ms";

const NA: &str = "N/A";

/// One CSV row per observation.
///
/// Fix failures carry their reason in the latency column.
pub(super) fn csv_row(observation: &Observation) -> String {
    let ts = observation.observed_at.to_string();
    let fields: [String; 9] = match &observation.kind {
        ObservationKind::AttachmentChanged { cell } => {
            let label = if cell.is_primary {
                "SERVING_HANDOVER"
            } else {
                "NEIGHBOR_DETECTED"
            };
            let [cid, area, signal] = cell_fields(Some(cell));
            [ts, label.into(), cid, area, signal, na(), na(), na(), na()]
        }
        ObservationKind::FixSucceeded {
            fix,
            latency_ms,
            cell,
            ..
        } => {
            let [cid, area, signal] = cell_fields(cell.as_ref());
            [
                ts,
                "AUDIT_SERVING".into(),
                cid,
                area,
                signal,
                fix.latitude.to_string(),
                fix.longitude.to_string(),
                fix.accuracy.map_or_else(na, |a| a.to_string()),
                latency_ms.to_string(),
            ]
        }
        ObservationKind::FixFailed { reason, .. } => [
            ts,
            "LOCATION_FAILURE".into(),
            na(),
            na(),
            na(),
            na(),
            na(),
            na(),
            reason.to_string(),
        ],
        ObservationKind::Lifecycle { event, .. } => [
            ts,
            csv_event_type(*event),
            na(),
            na(),
            na(),
            na(),
            na(),
            na(),
            na(),
        ],
    };
    fields.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(",")
}

fn csv_event_type(event: LifecycleEvent) -> String {
    match event {
        LifecycleEvent::AgentStarted => "SERVICE_STARTED".into(),
        LifecycleEvent::AgentStopped => "SERVICE_STOPPED".into(),
        other => format!("WATCHDOG_{}", other.as_str().to_uppercase().replace('-', "_")),
    }
}

fn cell_fields(cell: Option<&CellCandidate>) -> [String; 3] {
    match cell {
        Some(c) => [
            c.identifier.clone(),
            c.area.clone().unwrap_or_else(na),
            c.quality.map_or_else(na, |q| q.to_string()),
        ],
        None => [na(), na(), na()],
    }
}

fn na() -> String {
    NA.to_string()
}

/// Quotes a field if it would break the row.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// One human-readable line per observation.
pub(super) fn format_observation(observation: &Observation) -> String {
    let ts = observation.observed_at;
    match &observation.kind {
        ObservationKind::AttachmentChanged { cell } => {
            let role = if cell.is_primary { "serving" } else { "neighbour" };
            format!("{ts}  cell       {role} {}", describe_cell(cell))
        }
        ObservationKind::FixSucceeded {
            origin,
            fix,
            latency_ms,
            cell,
        } => {
            let accuracy = fix
                .accuracy
                .map(|a| format!(" ±{a}m"))
                .unwrap_or_default();
            let cell = cell
                .as_ref()
                .map(|c| format!(" on {}", c.identifier))
                .unwrap_or_default();
            format!(
                "{ts}  fix        {} {:.6},{:.6}{accuracy} in {latency_ms} ms{cell}",
                origin_name(*origin),
                fix.latitude,
                fix.longitude
            )
        }
        ObservationKind::FixFailed { origin, reason } => {
            format!("{ts}  fix-failed {} {reason}", origin_name(*origin))
        }
        ObservationKind::Lifecycle { event, detail, .. } => match detail {
            Some(d) => format!("{ts}  {event}  {d}"),
            None => format!("{ts}  {event}"),
        },
    }
}

fn origin_name(origin: FixOrigin) -> &'static str {
    match origin {
        FixOrigin::Periodic => "periodic",
        FixOrigin::Resurrection => "resurrection",
    }
}

fn describe_cell(cell: &CellCandidate) -> String {
    let mut out = cell.identifier.clone();
    if let Some(area) = &cell.area {
        out.push_str(&format!(" area {area}"));
    }
    if let Some(q) = cell.quality {
        out.push_str(&format!(" {q} dBm"));
    }
    out
}

/// The `cellwatch status` report.
pub(super) fn format_status(
    state: &HeartbeatState,
    requested: bool,
    status_line: Option<&str>,
    now: Timestamp,
) -> String {
    let mut lines = vec![format!(
        "Run requested:  {}",
        if requested { "yes" } else { "no" }
    )];

    lines.push(match state.last_heartbeat_at {
        Some(at) => {
            let ago = whole_secs(now.duration_since(at));
            format!("Last heartbeat: {at} ({ago:#} ago)")
        }
        None => "Last heartbeat: never".to_string(),
    });
    lines.push(match state.watchdog_scheduled_at {
        Some(at) if at > now => {
            let until = whole_secs(at.duration_since(now));
            format!("Next wake:      {at} (in {until:#})")
        }
        Some(at) => {
            let late = whole_secs(now.duration_since(at));
            format!("Next wake:      {at} (overdue by {late:#})")
        }
        None => "Next wake:      none".to_string(),
    });
    lines.push(format!("Backoff:        {}", state.backoff_count));
    if let Some(line) = status_line {
        lines.push(format!("Status:         {line}"));
    }
    lines.join("\n")
}
