//! Desktop notifications for enforcement events

use crate::executor::KillOutcome;
use crate::protocol::Event;
use notify_rust::Notification;
use tracing::warn;

pub fn send_notification(summary: &str, body: &str) -> Result<(), notify_rust::error::Error> {
    Notification::new()
        .summary(summary)
        .body(body)
        .appname("CapGuard")
        .show()?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct Notifier {
    enabled: bool,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Title and body for events worth a notification.
    pub fn message(event: &Event) -> Option<(String, String)> {
        match event {
            Event::ThresholdExceeded {
                rule, metrics, pids, ..
            } => {
                let metrics: Vec<String> = metrics.iter().map(|m| m.to_string()).collect();
                Some((
                    format!("CapGuard: {} over limit", rule),
                    format!(
                        "{} exceeded, terminating {} process(es)",
                        metrics.join(", "),
                        pids.len()
                    ),
                ))
            }
            Event::ProcessKilled {
                rule,
                pid,
                outcome: KillOutcome::Failed(reason),
            } => Some((
                format!("CapGuard: could not stop {}", rule),
                format!("PID {} - {}", pid, reason),
            )),
            _ => None,
        }
    }

    /// Blocks on the notification daemon; call from a blocking context.
    pub fn notify(&self, event: &Event) {
        if !self.enabled {
            return;
        }
        if let Some((title, body)) = Self::message(event) {
            if let Err(e) = send_notification(&title, &body) {
                warn!("Failed to send notification: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Totals;
    use crate::detector::Metric;

    #[test]
    fn exceed_event_has_message() {
        let event = Event::ThresholdExceeded {
            rule: "Blender".to_string(),
            process_name: "blender".to_string(),
            metrics: vec![Metric::Cpu, Metric::Memory],
            totals: Totals::default(),
            sustained_seconds: 5.0,
            pids: vec![10, 11],
        };
        let (title, body) = Notifier::message(&event).unwrap();
        assert_eq!(title, "CapGuard: Blender over limit");
        assert_eq!(body, "cpu, memory exceeded, terminating 2 process(es)");
    }

    #[test]
    fn successful_kill_and_status_are_silent() {
        let killed = Event::ProcessKilled {
            rule: "x".to_string(),
            pid: 1,
            outcome: KillOutcome::Terminated,
        };
        assert!(Notifier::message(&killed).is_none());
        assert!(Notifier::message(&Event::TickSkipped).is_none());
    }
}
