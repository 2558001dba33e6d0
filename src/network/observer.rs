//! Network observer
//!
//! Produces [`NetworkSnapshot`]s on a `watch` channel. Snapshots are taken
//! after OS change notifications settle (debounce) and on a periodic poll
//! that covers missed notifications. Receivers only wake when the snapshot
//! actually changed.

use super::NetworkSnapshot;
use crate::backoff::calculate_backoff;
use crate::platform::NetworkInspector;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

type MonitorCommand = (&'static str, &'static [&'static str]);

pub struct NetworkObserver {
    inspector: Arc<dyn NetworkInspector>,
    poll_interval: Duration,
    debounce: Duration,
    monitor: Option<MonitorCommand>,
    tx: watch::Sender<NetworkSnapshot>,
}

impl NetworkObserver {
    pub fn new(inspector: Arc<dyn NetworkInspector>, poll_interval: Duration, debounce: Duration) -> Self {
        let (tx, _) = watch::channel(NetworkSnapshot::default());
        Self {
            inspector,
            poll_interval,
            debounce,
            monitor: None,
            tx,
        }
    }

    /// Use a long-running command whose output lines signal changes
    pub fn with_monitor(mut self, monitor: Option<MonitorCommand>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> NetworkSnapshot {
        self.tx.borrow().clone()
    }

    /// Take a snapshot now; returns whether it differed from the last one
    pub async fn refresh(&self) -> bool {
        let inspector = self.inspector.clone();
        let snapshot = match tokio::task::spawn_blocking(move || inspector.snapshot()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Network inspection task failed: {}", e);
                return false;
            }
        };

        let changed = self.tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot.clone();
            true
        });
        if changed {
            info!(
                vpn = snapshot.vpn_connected,
                interface = ?snapshot.vpn_interface,
                gateway = ?snapshot.local_gateway,
                "Network state changed"
            );
        }
        changed
    }

    /// Observe until every receiver is gone
    pub async fn run(self) {
        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel();
        let monitor = self
            .monitor
            .map(|command| tokio::spawn(run_monitor(command, trigger_tx.clone())));

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {}
                Some(()) = trigger_rx.recv() => {
                    quiesce(&mut trigger_rx, self.debounce).await;
                }
            }

            if self.tx.is_closed() {
                debug!("No snapshot subscribers left, observer stopping");
                break;
            }
            self.refresh().await;
        }

        if let Some(handle) = monitor {
            handle.abort();
        }
        drop(trigger_tx);
    }
}

/// Wait until no trigger arrived for one full debounce window
async fn quiesce(rx: &mut mpsc::UnboundedReceiver<()>, window: Duration) {
    while let Ok(Some(())) = tokio::time::timeout(window, rx.recv()).await {}
}

/// Run the platform change monitor, restarting it with backoff if it exits
async fn run_monitor(command: MonitorCommand, trigger: mpsc::UnboundedSender<()>) {
    let (program, args) = command;
    let mut attempt: u32 = 0;

    loop {
        match Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(mut child) => {
                debug!("Change monitor started: {}", program);
                if let Some(stdout) = child.stdout.take() {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(_)) = lines.next_line().await {
                        attempt = 0;
                        if trigger.send(()).is_err() {
                            return;
                        }
                    }
                }
                let _ = child.kill().await;
                warn!("Change monitor {} exited; relying on polling until it restarts", program);
            }
            Err(e) => {
                warn!("Cannot start change monitor {}: {}", program, e);
            }
        }

        attempt = attempt.saturating_add(1);
        tokio::time::sleep(calculate_backoff(attempt, 1_000, 60_000)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{DefaultRoute, InterfaceInfo, InterfaceKind};
    use crate::platform::PlatformError;
    use std::sync::Mutex;

    struct FakeInspector {
        vpn_up: Mutex<bool>,
    }

    impl NetworkInspector for FakeInspector {
        fn interfaces(&self) -> Result<Vec<InterfaceInfo>, PlatformError> {
            Ok(vec![
                InterfaceInfo { name: "eth0".into(), kind: InterfaceKind::Other, up: true },
                InterfaceInfo {
                    name: "tun0".into(),
                    kind: InterfaceKind::Tunnel,
                    up: *self.vpn_up.lock().unwrap(),
                },
            ])
        }

        fn default_routes(&self) -> Result<Vec<DefaultRoute>, PlatformError> {
            Ok(vec![DefaultRoute {
                interface: "eth0".into(),
                gateway: Some("192.168.1.1".parse().unwrap()),
                metric: 100,
                split: false,
            }])
        }
    }

    fn observer(inspector: Arc<FakeInspector>, poll: Duration) -> NetworkObserver {
        NetworkObserver::new(inspector, poll, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_refresh_only_reports_changes() {
        let inspector = Arc::new(FakeInspector { vpn_up: Mutex::new(false) });
        let observer = observer(inspector.clone(), Duration::from_secs(30));

        assert!(observer.refresh().await);
        assert!(!observer.refresh().await);
        assert!(!observer.current().vpn_connected);

        *inspector.vpn_up.lock().unwrap() = true;
        assert!(observer.refresh().await);
        let current = observer.current();
        assert!(current.vpn_connected);
        assert_eq!(current.vpn_interface.as_deref(), Some("tun0"));
        assert_eq!(current.local_gateway, Some("192.168.1.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_poll_picks_up_vpn_connect() {
        let inspector = Arc::new(FakeInspector { vpn_up: Mutex::new(false) });
        let observer = observer(inspector.clone(), Duration::from_millis(25));
        let mut rx = observer.subscribe();
        let handle = tokio::spawn(observer.run());

        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().vpn_connected);

        *inspector.vpn_up.lock().unwrap() = true;
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(rx.borrow().vpn_connected);

        drop(rx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_quiesce_waits_for_silence() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..5 {
            tx.send(()).unwrap();
        }
        quiesce(&mut rx, Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
