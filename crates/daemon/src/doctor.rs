// tunnelkeep - Doctor
// Read-only diagnostic sweep. Every check reports {title, status, detail};
// nothing here mutates config, trust store, or session state.

use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use tunnelkeep_common::{Config, DoctorItem, DoctorStatus, ErrorClass};

use crate::known_hosts::HostTrustStore;

const REMOTE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs the ordered check list. A config parse failure short-circuits the
/// sweep since every later check depends on the parsed config.
pub async fn run(
    config: Result<Config, tunnelkeep_common::Error>,
    trust_path: &Path,
    last_error_class: Option<ErrorClass>,
) -> Vec<DoctorItem> {
    let mut items = Vec::new();

    let config = match config {
        Ok(config) => {
            items.push(DoctorItem::new(
                "Configuration",
                DoctorStatus::Ok,
                format!(
                    "{} forward(s) to {}@{}:{}",
                    config.local_forwards.len(),
                    config.remote.user,
                    config.remote.host,
                    config.remote.port
                ),
            ));
            config
        }
        Err(err) => {
            items.push(DoctorItem::new(
                "Configuration",
                DoctorStatus::Error,
                err.to_string(),
            ));
            return items;
        }
    };

    items.push(check_key_file(&config));
    for spec in &config.local_forwards {
        items.push(check_local_bind(spec));
    }
    items.push(check_remote_reachable(&config).await);
    items.push(check_trust_store(trust_path));
    items.push(check_last_error(last_error_class));

    items
}

fn check_key_file(config: &Config) -> DoctorItem {
    let path = &config.remote.key_path;
    if path.is_file() {
        DoctorItem::new("Private key", DoctorStatus::Ok, path.display().to_string())
    } else {
        DoctorItem::new(
            "Private key",
            DoctorStatus::Error,
            format!("not found: {}", path.display()),
        )
    }
}

/// Attempt-bind-then-release probe on the forward's local endpoint. The
/// listener is dropped immediately so the daemon can take the port later.
fn check_local_bind(spec: &str) -> DoctorItem {
    let title = format!("Local bind {spec}");
    let forward = match tunnelkeep_common::ForwardSpec::parse(spec) {
        Ok(forward) => forward,
        Err(err) => return DoctorItem::new(&title, DoctorStatus::Error, err),
    };
    match TcpListener::bind((forward.local_host.as_str(), forward.local_port)) {
        Ok(_) => DoctorItem::new(
            &title,
            DoctorStatus::Ok,
            format!("{}:{} is free", forward.local_host, forward.local_port),
        ),
        Err(err) => DoctorItem::new(
            &title,
            DoctorStatus::Error,
            format!(
                "cannot bind {}:{}: {err}",
                forward.local_host, forward.local_port
            ),
        ),
    }
}

/// Plain TCP reach probe. Failure is WARN, not ERROR; on a roaming device
/// the remote being unreachable right now is an expected condition.
async fn check_remote_reachable(config: &Config) -> DoctorItem {
    let addr = format!("{}:{}", config.remote.host, config.remote.port);
    let attempt = tokio::time::timeout(
        REMOTE_PROBE_TIMEOUT,
        tokio::net::TcpStream::connect(&addr),
    )
    .await;
    match attempt {
        Ok(Ok(_)) => DoctorItem::new("Remote endpoint", DoctorStatus::Ok, format!("{addr} reachable")),
        Ok(Err(err)) => DoctorItem::new(
            "Remote endpoint",
            DoctorStatus::Warn,
            format!("{addr} not reachable: {err}"),
        ),
        Err(_) => DoctorItem::new(
            "Remote endpoint",
            DoctorStatus::Warn,
            format!("{addr} not reachable: timeout after {REMOTE_PROBE_TIMEOUT:?}"),
        ),
    }
}

fn check_trust_store(path: &Path) -> DoctorItem {
    if !path.is_file() {
        return DoctorItem::new(
            "Host trust store",
            DoctorStatus::Warn,
            format!(
                "no store at {}; first connect will trust the remote key",
                path.display()
            ),
        );
    }
    match HostTrustStore::load_from(path) {
        Ok(store) => DoctorItem::new(
            "Host trust store",
            DoctorStatus::Ok,
            format!("{} pinned host(s)", store.entries().len()),
        ),
        Err(err) => DoctorItem::new(
            "Host trust store",
            DoctorStatus::Warn,
            format!("unreadable: {err}"),
        ),
    }
}

fn check_last_error(class: Option<ErrorClass>) -> DoctorItem {
    match class {
        None => DoctorItem::new("Last session error", DoctorStatus::Ok, "none recorded"),
        Some(class) => DoctorItem::new(
            "Last session error",
            DoctorStatus::Warn,
            format!("last connection failure was classified as {class}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config(key_path: &Path, port: u16) -> Config {
        let text = format!(
            "local_forwards = [\"127.0.0.1:{port}:localhost:8000\"]\n\
             [remote]\n\
             user = \"deploy\"\n\
             host = \"127.0.0.1\"\n\
             port = 1\n\
             key_path = \"{}\"\n",
            key_path.display()
        );
        Config::parse(&text).unwrap()
    }

    #[tokio::test]
    async fn test_config_error_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let bad = Config::parse("local_forwards = []\n[remote]\nuser = \"a\"\nhost = \"h\"\n");
        let items = run(
            bad.map_err(tunnelkeep_common::Error::from),
            &dir.path().join("known_hosts"),
            None,
        )
        .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0].status, DoctorStatus::Error));
    }

    #[tokio::test]
    async fn test_missing_key_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = valid_config(&dir.path().join("absent_key"), 0);
        let items = run(Ok(config), &dir.path().join("known_hosts"), None).await;
        let key = items.iter().find(|i| i.title == "Private key").unwrap();
        assert!(matches!(key.status, DoctorStatus::Error));
    }

    #[tokio::test]
    async fn test_bind_probe_detects_busy_port() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::File::create(&key)
            .unwrap()
            .write_all(b"stub")
            .unwrap();

        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = holder.local_addr().unwrap().port();

        let config = valid_config(&key, busy_port);
        let items = run(Ok(config), &dir.path().join("known_hosts"), None).await;
        let bind = items
            .iter()
            .find(|i| i.title.starts_with("Local bind"))
            .unwrap();
        assert!(matches!(bind.status, DoctorStatus::Error));
        assert!(bind.detail.contains("cannot bind"));
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_warn_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, b"stub").unwrap();

        // port 1 on loopback is practically never listening
        let config = valid_config(&key, 0);
        let items = run(Ok(config), &dir.path().join("known_hosts"), None).await;
        let remote = items.iter().find(|i| i.title == "Remote endpoint").unwrap();
        assert!(matches!(remote.status, DoctorStatus::Warn));
    }

    #[tokio::test]
    async fn test_last_error_class_surfaces_as_warn() {
        let item = check_last_error(Some(ErrorClass::Timeout));
        assert!(matches!(item.status, DoctorStatus::Warn));
        assert!(item.detail.contains("timeout"));

        let clean = check_last_error(None);
        assert!(matches!(clean.status, DoctorStatus::Ok));
    }

    #[tokio::test]
    async fn test_sweep_reports_recorded_failure() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, b"stub").unwrap();

        let error_file = dir.path().join("last_error");
        crate::last_error::record(&error_file, ErrorClass::Auth);

        let config = valid_config(&key, 0);
        let items = run(
            Ok(config),
            &dir.path().join("known_hosts"),
            crate::last_error::load(&error_file),
        )
        .await;
        let last = items
            .iter()
            .find(|i| i.title == "Last session error")
            .unwrap();
        assert!(matches!(last.status, DoctorStatus::Warn));
        assert!(last.detail.contains("auth"));
    }
}
