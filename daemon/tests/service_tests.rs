mod common;

use capguard_daemon::collector::{ProcessSample, ProcessSampler};
use capguard_daemon::config::{Rule, Settings, Thresholds};
use capguard_daemon::executor::KillOutcome;
use capguard_daemon::protocol::Event;
use capguard_daemon::service::{Monitor, MonitorOptions};
use capguard_daemon::{Error, Result};
use common::{sample, FakeSampler, RecordingEnforcer};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::timeout;

fn options(interval_seconds: u64, first_check_delay: Duration) -> MonitorOptions {
    MonitorOptions {
        interval_seconds,
        first_check_delay,
    }
}

fn spawn_idle(settings: Settings) -> Monitor {
    Monitor::spawn(
        settings,
        Arc::new(FakeSampler::default()),
        Arc::new(RecordingEnforcer::default()),
        options(5, Duration::from_secs(60)),
    )
}

/// Receive until `pred` matches or the deadline passes.
async fn wait_for_event(
    events: &mut broadcast::Receiver<Event>,
    pred: impl Fn(&Event) -> bool,
) -> Event {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_start_twice_keeps_one_timer() {
    let monitor = spawn_idle(Settings::default());
    let mut events = monitor.subscribe();

    assert!(!monitor.is_running().await.unwrap());
    assert!(monitor.start().await.unwrap());
    assert!(!monitor.start().await.unwrap());
    assert!(monitor.is_running().await.unwrap());

    assert_eq!(
        events.try_recv().unwrap(),
        Event::Started {
            interval_seconds: 5
        }
    );
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(monitor.status_line(), "monitoring started");
}

#[tokio::test]
async fn test_stop_twice() {
    let monitor = spawn_idle(Settings::default());
    assert!(!monitor.stop().await.unwrap());
    monitor.start().await.unwrap();
    assert!(monitor.stop().await.unwrap());
    assert!(!monitor.stop().await.unwrap());
    assert!(!monitor.is_running().await.unwrap());
    assert_eq!(monitor.status_line(), "monitoring stopped");
}

#[tokio::test]
async fn test_interval_is_clamped() {
    let monitor = spawn_idle(Settings::default());
    assert_eq!(monitor.set_interval(0).await.unwrap(), 1);
    assert_eq!(monitor.set_interval(4000).await.unwrap(), 3600);
    assert_eq!(monitor.set_interval(30).await.unwrap(), 30);
    assert_eq!(monitor.status().await.unwrap().interval_seconds, 30);
}

#[tokio::test]
async fn test_first_check_runs_before_first_interval() {
    let mut settings = Settings::default();
    settings.add_rule(Rule::new("app", "App").unwrap()).unwrap();
    let sampler = Arc::new(FakeSampler::default());
    sampler.set("app", vec![sample(10, "app", 1.0, 10.0)]);

    let monitor = Monitor::spawn(
        settings,
        sampler.clone(),
        Arc::new(RecordingEnforcer::default()),
        options(3600, Duration::from_millis(50)),
    );
    let mut status = monitor.watch_status();
    monitor.start().await.unwrap();

    timeout(
        Duration::from_secs(5),
        status.wait_for(|line| line.starts_with("App: 1 procs")),
    )
    .await
    .expect("first check did not run")
    .unwrap();
    assert_eq!(sampler.calls(), vec!["app".to_string()]);
}

#[tokio::test]
async fn test_sustain_zero_kills_on_first_check() {
    let mut settings = Settings::default();
    settings
        .add_rule(Rule::new("hog", "").unwrap().with_thresholds(Thresholds {
            cpu_pct: 10.0,
            sustain_seconds: 0,
            ..Thresholds::disabled()
        }))
        .unwrap();
    let sampler = Arc::new(FakeSampler::default());
    sampler.set("hog", vec![sample(42, "hog", 90.0, 10.0)]);
    let enforcer = Arc::new(RecordingEnforcer::default());

    let monitor = Monitor::spawn(
        settings,
        sampler,
        enforcer.clone(),
        options(60, Duration::from_millis(10)),
    );
    let mut events = monitor.subscribe();
    monitor.start().await.unwrap();

    let exceeded =
        wait_for_event(&mut events, |e| matches!(e, Event::ThresholdExceeded { .. })).await;
    assert!(matches!(exceeded, Event::ThresholdExceeded { pids, .. } if pids == vec![42]));
    let killed = wait_for_event(&mut events, |e| matches!(e, Event::ProcessKilled { .. })).await;
    assert_eq!(
        killed,
        Event::ProcessKilled {
            rule: "hog".to_string(),
            pid: 42,
            outcome: KillOutcome::Terminated,
        }
    );
    let status = wait_for_event(&mut events, |e| matches!(e, Event::Status { .. })).await;
    assert!(matches!(status, Event::Status { line } if line.ends_with("killed 1/1")));
    assert_eq!(enforcer.killed(), vec![42]);
}

/// Blocks every sample until the test releases it.
struct BlockingSampler {
    release: Mutex<mpsc::Receiver<()>>,
}

impl ProcessSampler for BlockingSampler {
    fn sample(&self, _pattern: &str) -> Result<Vec<ProcessSample>> {
        let _ = self
            .release
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(10));
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_slow_check_skips_overlapping_tick() {
    let mut settings = Settings::default();
    settings.add_rule(Rule::new("slow", "").unwrap()).unwrap();
    let (release, blocked) = mpsc::channel();
    let sampler = Arc::new(BlockingSampler {
        release: Mutex::new(blocked),
    });

    let monitor = Monitor::spawn(
        settings,
        sampler,
        Arc::new(RecordingEnforcer::default()),
        options(1, Duration::from_millis(10)),
    );
    let mut events = monitor.subscribe();
    monitor.start().await.unwrap();

    wait_for_event(&mut events, |e| matches!(e, Event::TickSkipped)).await;
    assert!(monitor.status().await.unwrap().tick_in_flight);

    release.send(()).unwrap();
    let status = wait_for_event(&mut events, |e| matches!(e, Event::Status { .. })).await;
    assert_eq!(
        status,
        Event::Status {
            line: "slow: no process".to_string()
        }
    );
    drop(release);
}

#[tokio::test]
async fn test_check_finishing_after_stop_keeps_stopped_status() {
    let mut settings = Settings::default();
    settings.add_rule(Rule::new("slow", "").unwrap()).unwrap();
    let (release, blocked) = mpsc::channel();
    let sampler = Arc::new(BlockingSampler {
        release: Mutex::new(blocked),
    });

    let monitor = Monitor::spawn(
        settings,
        sampler,
        Arc::new(RecordingEnforcer::default()),
        options(60, Duration::from_millis(10)),
    );
    let mut events = monitor.subscribe();
    monitor.start().await.unwrap();

    timeout(Duration::from_secs(5), async {
        while !monitor.status().await.unwrap().tick_in_flight {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("check never started");

    assert!(monitor.stop().await.unwrap());
    release.send(()).unwrap();

    // The report is still published, but the status stays "stopped".
    wait_for_event(&mut events, |e| matches!(e, Event::Status { .. })).await;
    assert_eq!(monitor.status_line(), "monitoring stopped");
    assert_eq!(monitor.status().await.unwrap().status, "monitoring stopped");
    drop(release);
}

#[tokio::test]
async fn test_rule_edits() {
    let monitor = spawn_idle(Settings::default());
    let id = monitor.add_rule(Rule::new("Game", "").unwrap()).await.unwrap();

    let duplicate = monitor.add_rule(Rule::new("game.exe", "").unwrap()).await;
    assert!(matches!(duplicate, Err(Error::DuplicateRule(_))));

    monitor
        .set_rule_thresholds(
            id,
            Some(Thresholds {
                cpu_pct: 50.0,
                sustain_seconds: -1,
                ..Thresholds::disabled()
            }),
        )
        .await
        .unwrap();
    let settings = monitor.settings().await.unwrap();
    let rule = settings.rule(id).unwrap();
    assert!(!rule.use_global_thresholds);
    assert_eq!(rule.thresholds.as_ref().unwrap().sustain_seconds, 0);

    monitor.set_rule_thresholds(id, None).await.unwrap();
    monitor.set_rule_enabled(id, false).await.unwrap();
    let settings = monitor.settings().await.unwrap();
    let rule = settings.rule(id).unwrap();
    assert!(rule.use_global_thresholds);
    // Private thresholds are kept for when the rule switches back.
    assert!(rule.thresholds.is_some());
    assert!(!rule.enabled);
    assert_eq!(monitor.status().await.unwrap().enabled_rules, 0);

    let removed = monitor.remove_rule(id).await.unwrap();
    assert_eq!(removed.process_name, "Game");
    assert!(matches!(
        monitor.remove_rule(id).await,
        Err(Error::UnknownRule(unknown)) if unknown == id
    ));
}

#[tokio::test]
async fn test_global_thresholds_are_normalized() {
    let monitor = spawn_idle(Settings::default());
    monitor
        .set_global_thresholds(Thresholds {
            cpu_pct: -5.0,
            sustain_seconds: -10,
            ..Thresholds::default()
        })
        .await
        .unwrap();
    let settings = monitor.settings().await.unwrap();
    assert_eq!(settings.global_thresholds.cpu_pct, 0.0);
    assert_eq!(settings.global_thresholds.sustain_seconds, 0);
    assert_eq!(settings.global_thresholds.memory_mb, 2048);
}
