//! The heartbeat loop: identity report out, configuration in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use skywatch_bootstrap::ProxyManager;
use skywatch_common::config::AgentConfig;
use skywatch_common::{crypto, host};
use skywatch_registry::TaskManager;
use skywatch_transport::{http_post, HttpRequest};
use tracing::{debug, info, warn};

use crate::{parse, AGENT_VERSION};

const HEARTBEAT_URI: &str = "/agent/heartbeat";

/// Interval after a proxy re-probe, to re-establish contact quickly.
const REPROBE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct SystemInfo {
    #[serde(rename = "serialNumber")]
    serial_number: String,
    hostname: String,
    #[serde(rename = "localIPs")]
    local_ips: Vec<String>,
    name: String,
    version: String,
    arch: String,
    #[serde(rename = "freeSpace")]
    free_space: u64,
}

#[derive(Serialize)]
struct VersionInfo {
    version: String,
}

#[derive(Serialize)]
struct HeartbeatBody {
    #[serde(rename = "systemInfo")]
    system_info: SystemInfo,
    #[serde(rename = "versionInfo")]
    version_info: VersionInfo,
    #[serde(rename = "hpcClusterConfigVersion", skip_serializing_if = "Option::is_none")]
    hpc_cluster_config_version: Option<String>,
}

pub struct ControlClient {
    config: AgentConfig,
    manager: Arc<TaskManager>,
    proxy_manager: Arc<Mutex<ProxyManager>>,
    interval: Duration,
    first_interval: Duration,
    ok_count: u64,
    error_count: u64,
    continue_error_count: u32,
    response_md5: String,
}

impl ControlClient {
    pub fn new(
        config: AgentConfig,
        manager: Arc<TaskManager>,
        proxy_manager: Arc<Mutex<ProxyManager>>,
    ) -> Self {
        let interval =
            Duration::from_secs(config.get_parsed("cms.agent.heartbeat.interval", 180u64));
        let first_interval =
            Duration::from_secs(config.get_parsed("cms.agent.heartbeat.first.interval", 10u64));
        Self {
            config,
            manager,
            proxy_manager,
            interval,
            first_interval,
            ok_count: 0,
            error_count: 0,
            continue_error_count: 0,
            response_md5: String::new(),
        }
    }

    pub fn ok_count(&self) -> u64 {
        self.ok_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn continue_error_count(&self) -> u32 {
        self.continue_error_count
    }

    /// Run the heartbeat loop until shutdown. The first tick fires
    /// immediately; an unsent core-dump report is flushed right after it.
    pub fn run(&mut self, keep_running: &AtomicBool) {
        let mut next = self.tick(keep_running);
        crate::dump::send_core_dump(&self.config, &self.manager);

        while sleep_while_running(next, keep_running) {
            next = self.tick(keep_running);
        }
        info!("the control client will exit");
    }

    /// One heartbeat cycle. Returns how long to wait before the next.
    pub fn tick(&mut self, keep_running: &AtomicBool) -> Duration {
        let mut next = self.interval;
        match self.send_heartbeat() {
            Some(response) => self.handle_response(&response),
            None => {
                if self.continue_error_count > 3 {
                    self.continue_error_count = 0;
                    // the tunnel may be gone; re-establish the network
                    // identity and retry quickly
                    let info = self.proxy_manager.lock().unwrap().init(keep_running);
                    self.manager.set_cloud_agent_info(info);
                    next = REPROBE_INTERVAL;
                } else if self.ok_count == 0 {
                    next = self.first_interval;
                }
            }
        }
        next
    }

    fn heartbeat_body(&self) -> String {
        let agent_info = self.manager.cloud_agent_info();
        let hpc = self.manager.hpc_cluster();

        let body = HeartbeatBody {
            system_info: SystemInfo {
                serial_number: agent_info.serial_number.clone(),
                hostname: host::hostname(),
                local_ips: host::local_ips(),
                name: host::os_name(),
                version: host::os_version(),
                arch: host::arch().to_string(),
                free_space: host::free_disk_space(),
            },
            version_info: VersionInfo {
                version: AGENT_VERSION.to_string(),
            },
            hpc_cluster_config_version: if hpc.version.is_empty() {
                None
            } else {
                Some(hpc.version.clone())
            },
        };
        serde_json::to_string(&body).unwrap_or_default()
    }

    /// Fill in the control-plane request plumbing shared by the heartbeat
    /// and dump uploads: proxy, timeout, and the signed body headers.
    pub fn complete_request(
        manager: &TaskManager,
        config: &AgentConfig,
        uri: &str,
        body: String,
        content_type: &str,
    ) -> HttpRequest {
        let agent_info = manager.cloud_agent_info();

        let mut request = HttpRequest::new(format!("{}{}", agent_info.heartbeat_url, uri))
            .with_timeout(Duration::from_secs(15))
            .with_header("Content-Type", content_type);
        request.proxy = agent_info.proxy_url.clone();
        request.user = agent_info.user.clone();
        request.password = agent_info.password.clone();
        request.tls_verify = config.tls_verify();

        if !agent_info.access_key_id.is_empty() && !agent_info.access_secret.is_empty() {
            match crypto::calculate(body.as_bytes(), &agent_info.access_secret) {
                Ok(signature) => {
                    request = request
                        .with_header("cms-access-key", agent_info.access_key_id.clone())
                        .with_header("cms-signature", signature);
                }
                Err(e) => warn!("signing request body: {e}"),
            }
        }
        request.body = body.into_bytes();
        request
    }

    fn send_heartbeat(&mut self) -> Option<String> {
        let body = self.heartbeat_body();
        let request = Self::complete_request(
            &self.manager,
            &self.config,
            HEARTBEAT_URI,
            body,
            "text/plain",
        );
        info!(
            "send heartbeat [POST]{}, proxy: <{}>",
            request.url, request.proxy
        );

        let response = http_post(&request);
        if response.is_ok() {
            self.ok_count += 1;
            self.continue_error_count = 0;
            info!(
                "send heartbeat to [POST]{} success, len={}",
                request.url,
                response.result.len()
            );
            Some(response.result)
        } else {
            self.error_count += 1;
            self.continue_error_count += 1;
            warn!(
                "send heartbeat to [POST]{} with error HttpStatusCode={}, errMsg={}",
                request.url, response.res_code, response.error_msg
            );
            None
        }
    }

    /// Distribute a heartbeat response into the caches, unless it is
    /// byte-identical to the previous one.
    pub fn handle_response(&mut self, response: &str) {
        let md5 = crypto::md5_hex(response.as_bytes());
        if self.response_md5 == md5 {
            debug!("the heartbeat response is the same as the last, skip parse");
            return;
        }
        self.response_md5 = md5;

        parse::distribute(response, &self.manager, &self.config);
    }
}

/// Sleep in short slices so shutdown stays responsive. Returns false when
/// shutdown was requested.
pub fn sleep_while_running(duration: Duration, keep_running: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(250);

    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if !keep_running.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
    keep_running.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skywatch_common::properties::Properties;
    use skywatch_registry::model::CloudAgentInfo;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn test_setup(heartbeat_url: &str) -> (AgentConfig, Arc<TaskManager>) {
        let config = AgentConfig::new(Properties::new(), PathBuf::from("."), PathBuf::from("."));
        let manager = TaskManager::new();
        manager.set_cloud_agent_info(CloudAgentInfo {
            heartbeat_url: heartbeat_url.to_string(),
            serial_number: "sn-test".to_string(),
            ..Default::default()
        });
        (config, manager)
    }

    fn test_client(config: AgentConfig, manager: Arc<TaskManager>) -> ControlClient {
        let proxy_manager = Arc::new(Mutex::new(ProxyManager::new(config.clone())));
        ControlClient::new(config, manager, proxy_manager)
    }

    #[test]
    fn heartbeat_body_shape() {
        let (config, manager) = test_setup("http://control.example.com");
        let client = test_client(config, manager);

        let body = client.heartbeat_body();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["systemInfo"]["serialNumber"], "sn-test");
        assert_eq!(value["versionInfo"]["version"], AGENT_VERSION);
        assert!(value["systemInfo"]["arch"].is_string());
        assert!(value.get("hpcClusterConfigVersion").is_none());
    }

    #[test]
    fn hpc_version_is_echoed_when_cached() {
        let (config, manager) = test_setup("http://control.example.com");
        manager.set_hpc_cluster(skywatch_registry::model::HpcClusterItem {
            version: "v7".to_string(),
            is_valid: true,
            ..Default::default()
        });
        let client = test_client(config, manager);

        let value: serde_json::Value =
            serde_json::from_str(&client.heartbeat_body()).unwrap();
        assert_eq!(value["hpcClusterConfigVersion"], "v7");
    }

    #[test]
    fn heartbeat_success_and_failure_accounting() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/agent/heartbeat")
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create();

        let (config, manager) = test_setup(&server.url());
        let mut client = test_client(config, manager);

        assert!(client.send_heartbeat().is_some());
        assert_eq!(client.ok_count(), 1);
        assert_eq!(client.continue_error_count(), 0);
        mock.assert();

        drop(mock);
        let _not_found = server
            .mock("POST", "/agent/heartbeat")
            .with_status(404)
            .create();
        assert!(client.send_heartbeat().is_none());
        assert_eq!(client.error_count(), 1);
        assert_eq!(client.continue_error_count(), 1);
    }

    #[test]
    fn identical_responses_are_parsed_once() {
        let (config, manager) = test_setup("http://control.example.com");

        let parsed = Arc::new(AtomicUsize::new(0));
        let counted = parsed.clone();
        manager.register_raw_parser("processInfo", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let mut client = test_client(config, manager);
        let response = r#"{"processInfo":[{"name":"nginx"}]}"#;
        client.handle_response(response);
        client.handle_response(response);
        assert_eq!(parsed.load(Ordering::SeqCst), 1);

        client.handle_response(r#"{"processInfo":[{"name":"redis"}]}"#);
        assert_eq!(parsed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn signed_heartbeat_carries_access_key_headers() {
        let (config, manager) = test_setup("http://control.example.com");
        manager.set_cloud_agent_info(CloudAgentInfo {
            heartbeat_url: "http://control.example.com".into(),
            access_key_id: "ak".into(),
            access_secret: "SRDzEi8yE_YPRZH8dVG-sg".into(),
            ..Default::default()
        });

        let request = ControlClient::complete_request(
            &manager,
            &config,
            HEARTBEAT_URI,
            "{}".to_string(),
            "text/plain",
        );
        assert!(request
            .headers
            .iter()
            .any(|(name, value)| name == "cms-access-key" && value == "ak"));
        assert!(request
            .headers
            .iter()
            .any(|(name, value)| name == "cms-signature" && !value.is_empty()));
    }

    #[test]
    fn sleep_while_running_stops_on_shutdown() {
        let keep_running = AtomicBool::new(false);
        assert!(!sleep_while_running(Duration::from_secs(60), &keep_running));
    }
}
