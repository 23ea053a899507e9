//! Derivation of automation windows from a prediction set.

use chrono::Duration;
use common::config::AutomationConfig;
use common::{Prediction, PredictionWindow, WindowMode};

/// Build the sorted window set for one evaluation.
///
/// Pure over its inputs: only predictions on the configured route with the
/// needed timestamp produce a window. Outbound windows anticipate an
/// approaching vehicle; inbound windows trail a departed one.
pub fn build_windows(predictions: &[Prediction], cfg: &AutomationConfig) -> Vec<PredictionWindow> {
    let lead = Duration::milliseconds((cfg.lead_minutes * 60_000.0).round() as i64);
    let pass = Duration::seconds(cfg.pass_seconds as i64);

    let mut windows = Vec::new();
    for p in predictions {
        if p.route_id.as_deref() != Some(cfg.route_id.as_str()) {
            continue;
        }

        let label = p
            .headsign
            .clone()
            .or_else(|| p.route_name.clone())
            .or_else(|| p.route_id.clone())
            .unwrap_or_else(|| "Train".to_string());

        if p.direction_id == Some(0) {
            if let Some(arrival) = p.arrival_time {
                windows.push(PredictionWindow {
                    id: format!("{}:outbound-arrival", p.id),
                    mode: WindowMode::OutboundArrival,
                    direction: "Outbound".into(),
                    summary: format!("Outbound train arriving {} ({})", cfg.stop_name, label),
                    event_at: arrival,
                    start_at: arrival - lead,
                    end_at: arrival + pass,
                });
            }
        }

        if p.direction_id == Some(1) {
            if let Some(departure) = p.departure_time {
                windows.push(PredictionWindow {
                    id: format!("{}:inbound-departure", p.id),
                    mode: WindowMode::InboundDeparture,
                    direction: "Inbound".into(),
                    summary: format!("Inbound train departed {} ({})", cfg.stop_name, label),
                    event_at: departure,
                    start_at: departure + lead,
                    end_at: departure + lead + pass,
                });
            }
        }
    }

    windows.sort_by_key(|w| w.start_at);
    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 17, 0, 0).unwrap()
    }

    fn config() -> AutomationConfig {
        AutomationConfig {
            route_id: "Blue".into(),
            stop_name: "Orient Heights".into(),
            lead_minutes: 1.15,
            pass_seconds: 90,
            ..AutomationConfig::default()
        }
    }

    fn prediction(
        id: &str,
        direction_id: i32,
        arrival: Option<DateTime<Utc>>,
        departure: Option<DateTime<Utc>>,
    ) -> Prediction {
        Prediction {
            id: id.into(),
            direction_id: Some(direction_id),
            direction: if direction_id == 0 {
                "Outbound".into()
            } else {
                "Inbound".into()
            },
            status: None,
            arrival_time: arrival,
            departure_time: departure,
            minutes: None,
            route_id: Some("Blue".into()),
            route_name: Some("Blue Line".into()),
            headsign: Some("Wonderland".into()),
        }
    }

    #[test]
    fn outbound_window_spans_lead_before_to_pass_after_arrival() {
        let arrival = base() + chrono::Duration::seconds(90);
        let windows = build_windows(&[prediction("p1", 0, Some(arrival), None)], &config());

        assert_eq!(windows.len(), 1);
        let w = &windows[0];
        assert_eq!(w.mode, WindowMode::OutboundArrival);
        // Lead 1.15 min = 69s, pass 90s: the window runs [21s, 180s] from base.
        assert_eq!(w.start_at, base() + chrono::Duration::seconds(21));
        assert_eq!(w.end_at, base() + chrono::Duration::seconds(180));
        assert_eq!(w.event_at, arrival);
        assert_eq!(w.id, "p1:outbound-arrival");
    }

    #[test]
    fn inbound_window_trails_the_departure() {
        let departure = base() + chrono::Duration::seconds(60);
        let windows = build_windows(&[prediction("p2", 1, None, Some(departure))], &config());

        assert_eq!(windows.len(), 1);
        let w = &windows[0];
        assert_eq!(w.mode, WindowMode::InboundDeparture);
        assert_eq!(w.start_at, departure + chrono::Duration::seconds(69));
        assert_eq!(w.end_at, departure + chrono::Duration::seconds(159));
        assert_eq!(w.direction, "Inbound");
    }

    #[test]
    fn predictions_missing_the_needed_timestamp_are_skipped() {
        let departure = base() + chrono::Duration::seconds(60);
        // Outbound without arrival, inbound without departure.
        let windows = build_windows(
            &[
                prediction("p1", 0, None, Some(departure)),
                prediction("p2", 1, Some(departure), None),
            ],
            &config(),
        );
        assert!(windows.is_empty());
    }

    #[test]
    fn other_routes_are_ignored() {
        let arrival = base() + chrono::Duration::seconds(90);
        let mut p = prediction("p1", 0, Some(arrival), None);
        p.route_id = Some("Orange".into());
        assert!(build_windows(&[p], &config()).is_empty());

        let mut unrouted = prediction("p2", 0, Some(arrival), None);
        unrouted.route_id = None;
        assert!(build_windows(&[unrouted], &config()).is_empty());
    }

    #[test]
    fn windows_are_sorted_and_derivation_is_deterministic() {
        let predictions = vec![
            prediction(
                "late",
                0,
                Some(base() + chrono::Duration::seconds(600)),
                None,
            ),
            prediction(
                "early",
                1,
                None,
                Some(base() + chrono::Duration::seconds(30)),
            ),
            prediction(
                "middle",
                0,
                Some(base() + chrono::Duration::seconds(300)),
                None,
            ),
        ];

        let first = build_windows(&predictions, &config());
        let second = build_windows(&predictions, &config());
        assert_eq!(first, second);

        let starts: Vec<_> = first.iter().map(|w| w.start_at).collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
        assert_eq!(first[0].id, "early:inbound-departure");
    }

    #[test]
    fn summary_uses_the_trip_label() {
        let arrival = base() + chrono::Duration::seconds(90);
        let windows = build_windows(&[prediction("p1", 0, Some(arrival), None)], &config());
        assert_eq!(
            windows[0].summary,
            "Outbound train arriving Orient Heights (Wonderland)"
        );
    }
}
