// tunnelkeep - Monitors
// Producer tasks for sleep-wake detection, network-change polling, and the
// periodic forced refresh. Producers only ever post into the debouncer;
// they never touch session state.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tunnelkeep_common::TriggerReason;

use crate::debounce::EventDebouncer;

/// Wall-clock source in milliseconds, injectable for tests.
pub type WallClock = Box<dyn Fn() -> i64 + Send>;

/// Route fingerprint source. `None` means no usable route.
pub type RouteProbe = Box<dyn Fn() -> Option<String> + Send>;

pub fn system_wall_clock() -> WallClock {
    Box::new(|| chrono::Utc::now().timestamp_millis())
}

/// Default route fingerprint: local address a UDP socket would source from
/// toward a well-known public endpoint. No packets are sent; a change in
/// the chosen source address means the default route moved.
pub fn udp_route_probe() -> RouteProbe {
    Box::new(|| {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:53").ok()?;
        socket.local_addr().ok().map(|a| a.ip().to_string())
    })
}

/// Gap-based sleep detector: if the wall clock jumped by more than `gap`
/// between ticks, the device slept and the transport is presumed dead.
pub fn spawn_sleep_monitor(
    interval: Duration,
    gap: Duration,
    now: WallClock,
    debouncer: EventDebouncer,
    cancel: CancellationToken,
) {
    if interval.is_zero() {
        return;
    }
    let gap = if gap.is_zero() { interval * 2 } else { gap };

    tokio::spawn(async move {
        info!("sleep monitor: gap-based detection, check every {:?}", interval);
        let mut last = now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let current = now();
            if current - last > gap.as_millis() as i64 {
                info!("wake detected (gap {}ms)", current - last);
                debouncer.post(TriggerReason::SleepWake);
            }
            last = current;
        }
    });
}

/// Polling network watcher. Compares a route fingerprint each interval and
/// posts the matching trigger on appearance, change, or loss.
pub fn spawn_network_monitor(
    interval: Duration,
    probe: RouteProbe,
    debouncer: EventDebouncer,
    cancel: CancellationToken,
) {
    if interval.is_zero() {
        return;
    }

    tokio::spawn(async move {
        info!("network monitor: polling every {:?}", interval);
        let mut prev = probe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let next = probe();
            match (&prev, &next) {
                (None, Some(addr)) => {
                    info!("network available ({addr})");
                    debouncer.post(TriggerReason::NetworkAvailable);
                }
                (Some(_), None) => {
                    info!("network lost");
                    debouncer.post(TriggerReason::NetworkDegraded);
                }
                (Some(old), Some(new)) if old != new => {
                    info!("network change detected ({old} -> {new})");
                    debouncer.post(TriggerReason::NetworkChanged);
                }
                _ => debug!("network unchanged"),
            }
            prev = next;
        }
    });
}

/// Periodic forced refresh of a healthy session.
pub fn spawn_periodic_refresh(
    interval: Duration,
    debouncer: EventDebouncer,
    cancel: CancellationToken,
) {
    if interval.is_zero() {
        return;
    }

    tokio::spawn(async move {
        info!("periodic refresh every {:?}", interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            debouncer.post(TriggerReason::PeriodicRefresh);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};

    fn immediate_debouncer() -> (EventDebouncer, tokio::sync::mpsc::UnboundedReceiver<TriggerReason>)
    {
        EventDebouncer::spawn(Duration::ZERO)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_monitor_detects_gap() {
        let (debouncer, mut rx) = immediate_debouncer();
        let clock = Arc::new(AtomicI64::new(0));
        let clock_for_monitor = clock.clone();

        spawn_sleep_monitor(
            Duration::from_secs(5),
            Duration::from_secs(30),
            Box::new(move || clock_for_monitor.load(Ordering::SeqCst)),
            debouncer,
            CancellationToken::new(),
        );

        // ticks with the wall clock tracking the monotonic clock: no event
        for _ in 0..3 {
            clock.fetch_add(5_000, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        assert!(rx.try_recv().is_err());

        // the device slept: wall clock jumped far past the check interval
        clock.fetch_add(120_000, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(rx.recv().await.unwrap(), TriggerReason::SleepWake);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_monitor_classifies_transitions() {
        let (debouncer, mut rx) = immediate_debouncer();
        let routes: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(vec![
            Some("10.0.0.2".into()), // initial
            Some("10.0.0.2".into()), // unchanged
            Some("192.168.1.7".into()), // changed
            None,                    // lost
            Some("192.168.1.7".into()), // back
        ]));
        let routes_for_probe = routes.clone();

        spawn_network_monitor(
            Duration::from_secs(5),
            Box::new(move || {
                let mut routes = routes_for_probe.lock().unwrap();
                if routes.len() > 1 {
                    routes.remove(0)
                } else {
                    routes[0].clone()
                }
            }),
            debouncer,
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(rx.recv().await.unwrap(), TriggerReason::NetworkChanged);
        assert_eq!(rx.recv().await.unwrap(), TriggerReason::NetworkDegraded);
        assert_eq!(rx.recv().await.unwrap(), TriggerReason::NetworkAvailable);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_refresh_fires_each_interval() {
        let (debouncer, mut rx) = immediate_debouncer();
        spawn_periodic_refresh(
            Duration::from_secs(3600),
            debouncer,
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert_eq!(rx.recv().await.unwrap(), TriggerReason::PeriodicRefresh);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(rx.recv().await.unwrap(), TriggerReason::PeriodicRefresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_disables_monitor() {
        let (debouncer, mut rx) = immediate_debouncer();
        spawn_periodic_refresh(Duration::ZERO, debouncer.clone(), CancellationToken::new());
        spawn_network_monitor(
            Duration::ZERO,
            Box::new(|| None),
            debouncer,
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_producer() {
        let (debouncer, mut rx) = immediate_debouncer();
        let cancel = CancellationToken::new();
        spawn_periodic_refresh(Duration::from_secs(60), debouncer, cancel.clone());

        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(rx.try_recv().is_err());
    }
}
