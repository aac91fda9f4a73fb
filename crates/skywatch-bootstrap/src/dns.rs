//! DNS readiness: the agent may start before the OS resolver is up, so
//! bootstrap polls until at least one relevant host resolves.

use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::info;

use crate::proxy::ProxyInfo;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Whether `host` (a `host` or `host:port` string) currently resolves.
pub fn resolves(host: &str) -> bool {
    let bare = host.split(':').next().unwrap_or(host);
    if bare.is_empty() {
        return false;
    }
    matches!((bare, 80u16).to_socket_addrs().map(|mut a| a.next().is_some()), Ok(true))
}

/// Block until the heartbeat host or any proxy candidate resolves, or
/// `keep_running` goes false. A manually configured proxy is checked ahead
/// of the built-in table so operator configuration keeps startup fast.
pub fn wait_ready(
    heartbeat_host: &str,
    manual_proxy: Option<&ProxyInfo>,
    proxies: &[ProxyInfo],
    keep_running: &AtomicBool,
) {
    while keep_running.load(Ordering::Relaxed) {
        if resolves(heartbeat_host) {
            info!("parse host {heartbeat_host} ok, dns is ready");
            return;
        }

        if let Some(proxy) = manual_proxy {
            if resolves(&proxy.url) {
                info!("parse proxy host {} ok, dns is ready", proxy.url);
                return;
            }
        } else {
            for proxy in proxies {
                if resolves(&proxy.url) {
                    info!("parse proxy host {} ok, dns is ready", proxy.url);
                    return;
                }
            }
        }

        std::thread::sleep(RETRY_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_resolves() {
        assert!(resolves("localhost"));
        assert!(resolves("localhost:3128"));
    }

    #[test]
    fn garbage_does_not_resolve() {
        assert!(!resolves(""));
        assert!(!resolves("definitely-not-a-real-host.invalid"));
    }

    #[test]
    fn wait_ready_returns_immediately_for_resolvable_host() {
        let keep_running = AtomicBool::new(true);
        wait_ready("localhost", None, &[], &keep_running);
    }

    #[test]
    fn wait_ready_honors_shutdown() {
        let keep_running = AtomicBool::new(false);
        wait_ready("definitely-not-a-real-host.invalid", None, &[], &keep_running);
    }
}
