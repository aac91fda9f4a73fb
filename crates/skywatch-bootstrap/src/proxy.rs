//! Control-plane tunnel selection.
//!
//! At startup the agent must find a route to the monitoring service: a
//! user-configured proxy, a regional tunnel from the built-in table, a
//! synthesized candidate for new regions, or a direct connection. The
//! fan-out probe runs on a temporary pool of worker threads and stops as
//! soon as one candidate answers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use skywatch_common::config::AgentConfig;
use skywatch_registry::model::CloudAgentInfo;
use tracing::{debug, info};

use skywatch_transport::{http_get, HttpRequest, HttpResponse};

use crate::{access_key, dns, serial};

pub const DEFAULT_HEARTBEAT_URL: &str = "https://cms-cloudmonitor.aliyun.com";

const REGION_PROBE_URI: &str = "/agent/latest/meta-data/region-id";
const MAX_PROBE_WORKERS: usize = 100;
const CHECK_TIMEOUT_STEP: Duration = Duration::from_secs(2);
const MAX_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Regional tunnels baked into the agent: `regionId` to `host:port`, all
/// plain http.
const BUILTIN_PROXIES: &[(&str, &str)] = &[
    ("cn-qingdao", "qdcmsproxy.aliyuncs.com:3128"),
    ("cn-qingdao", "qdcmsproxy.aliyun.com:3128"),
    ("cn-beijing", "bjcmsproxy.aliyuncs.com:3128"),
    ("cn-beijing", "bjcmsproxy.aliyun.com:3128"),
    ("cn-zhangjiakou", "cmsproxy-cn-zhangjiakou.aliyuncs.com:8080"),
    ("cn-zhangjiakou", "cmsproxy-cn-zhangjiakou.aliyun.com:8080"),
    ("cn-huhehaote", "cmsproxy-cn-huhehaote.aliyuncs.com:8080"),
    ("cn-huhehaote", "cmsproxy-cn-huhehaote.aliyun.com:8080"),
    ("cn-hangzhou", "hzcmsproxy.aliyuncs.com:3128"),
    ("cn-hangzhou", "hzcmsproxy.aliyun.com:3128"),
    ("cn-shanghai", "shcmsproxy.aliyuncs.com:3128"),
    ("cn-shanghai", "shcmsproxy.aliyun.com:3128"),
    ("cn-shenzhen", "szcmsproxy.aliyuncs.com:3128"),
    ("cn-shenzhen", "szcmsproxy.aliyun.com:3128"),
    ("cn-heyuan", "cmsproxy-cn-heyuan.aliyuncs.com:3128"),
    ("cn-heyuan", "cmsproxy-cn-heyuan.aliyun.com:3128"),
    ("cn-chengdu", "cmsproxy-cn-chengdu.aliyuncs.com:8080"),
    ("cn-hongkong", "hkcmsproxy.aliyuncs.com:3128"),
    ("cn-hongkong", "hkcmsproxy.aliyun.com:3128"),
    ("us-west-1", "mgcmsproxy.aliyuncs.com:3128"),
    ("us-west-1", "mgcmsproxy.aliyun.com:3128"),
    ("us-east-1", "mgcmsproxy.aliyuncs.com:3128"),
    ("us-east-1", "mgcmsproxy.aliyun.com:3128"),
    ("ap-southeast-1", "xjpcmsproxy.aliyuncs.com:3128"),
    ("ap-southeast-1", "xjpcmsproxy.aliyun.com:3128"),
    ("ap-southeast-2", "aucmsproxy.aliyuncs.com:8080"),
    ("ap-southeast-2", "aucmsproxy.aliyun.com:8080"),
    ("ap-southeast-3", "cmsproxy-ap-southeast-3.aliyuncs.com:8080"),
    ("ap-southeast-3", "cmsproxy-ap-southeast-3.aliyun.com:8080"),
    ("ap-southeast-5", "cmsproxy-ap-southeast-5.aliyuncs.com:8080"),
    ("ap-northeast-1", "jpcmsproxy.aliyuncs.com:8080"),
    ("ap-northeast-1", "jpcmsproxy.aliyun.com:8080"),
    ("eu-central-1", "decmsproxy.aliyuncs.com:8080"),
    ("eu-central-1", "decmsproxy.aliyun.com:8080"),
    ("eu-west-1", "cmsproxy-eu-west-1.aliyuncs.com:8080"),
    ("me-east-1", "dbcmsproxy.aliyuncs.com:8080"),
    ("me-east-1", "dbcmsproxy.aliyun.com:8080"),
    ("ap-south-1", "cmsproxy-ap-south-1.aliyuncs.com:8080"),
    ("private-domain@01", "opencmsproxy.aliyuncs.com:8080"),
    ("private-domain@01", "opencmsproxy.aliyun.com:8080"),
    ("private-domain@02", "vpc-opencmsproxy.aliyuncs.com:8080"),
    ("private-domain@02", "vpc-opencmsproxy.aliyun.com:8080"),
    ("cn-nantong", "cmsproxy-cn-nantong.aliyuncs.com:3128"),
    ("cn-nanjing", "cmsproxy-cn-nanjing.aliyun.com:3128"),
    ("cn-guangzhou", "cmsproxy-cn-guangzhou.aliyun.com:3128"),
    ("cn-wulanchabu", "cmsproxy-cn-wulanchabu.aliyun.com:3128"),
    ("ap-northeast-2", "cmsproxy-ap-northeast-2.aliyuncs.com:3128"),
    ("me-central-1", "cmsproxy-me-central-1.aliyuncs.com:3128"),
    ("cn-fuzhou", "cmsproxy-cn-fuzhou.aliyuncs.com:3128"),
    ("ap-southeast-7", "cmsproxy-ap-southeast-7.aliyun.com:3128"),
];

/// One tunnel candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyInfo {
    pub region_id: String,
    /// `host:port`, no scheme.
    pub url: String,
    pub scheme: String,
    /// "2" requests the h2 dialect of an https proxy.
    pub scheme_version: String,
    pub user: String,
    pub password: String,
}

impl ProxyInfo {
    /// The proxy URL as the transport wants it, or empty for direct.
    pub fn proxy_url(&self) -> String {
        if self.url.is_empty() {
            String::new()
        } else if self.scheme.is_empty() {
            self.url.clone()
        } else {
            format!("{}://{}", self.scheme, self.url)
        }
    }

    pub fn is_direct(&self) -> bool {
        self.url.is_empty()
    }
}

/// Network primitive used by the probes. Injectable so the concurrent
/// detection logic is testable without real tunnels.
pub trait ProbeTransport: Send + Sync {
    fn get_via(&self, url: &str, proxy: Option<&ProxyInfo>, timeout: Duration) -> HttpResponse;
}

/// Production transport on top of the blocking HTTP client.
pub struct HttpProbe {
    pub tls_verify: bool,
}

impl ProbeTransport for HttpProbe {
    fn get_via(&self, url: &str, proxy: Option<&ProxyInfo>, timeout: Duration) -> HttpResponse {
        let mut request = HttpRequest::new(url).with_timeout(timeout);
        request.tls_verify = self.tls_verify;
        if let Some(proxy) = proxy {
            if !proxy.url.is_empty() {
                request.proxy = proxy.proxy_url();
                request.proxy_scheme_version = proxy.scheme_version.clone();
                request.user = proxy.user.clone();
                request.password = proxy.password.clone();
            }
        }
        http_get(&request)
    }
}

pub struct ProxyManager {
    config: AgentConfig,
    heartbeat_url: String,
    heartbeat_host: String,
    proxies: Vec<ProxyInfo>,
    manual_proxy: Option<ProxyInfo>,
    is_auto: bool,
    check_timeout: Duration,
    serial_number: String,
    transport: Arc<dyn ProbeTransport>,
}

impl ProxyManager {
    pub fn new(config: AgentConfig) -> Self {
        let tls_verify = config.tls_verify();
        Self::with_transport(config, Arc::new(HttpProbe { tls_verify }))
    }

    pub fn with_transport(config: AgentConfig, transport: Arc<dyn ProbeTransport>) -> Self {
        let is_auto = config.get("http.proxy.auto", "true") == "true";

        let mut proxies = Vec::new();
        let mut manual_proxy = None;

        let (http_proxy, user, password) = load_http_proxy(&config);
        if let Some(proxy) = http_proxy {
            proxies.push(proxy.clone());
            manual_proxy = Some(proxy);
        }
        append_builtin_proxies(&mut proxies, &user, &password);
        if let Some(proxy) = load_socks_proxy(&config) {
            proxies.insert(0, proxy.clone());
            manual_proxy = Some(proxy);
        }

        let heartbeat_url = heartbeat_url_from(&config);
        let heartbeat_host = host_of(&heartbeat_url);
        info!("the heartbeatUrl is: {heartbeat_url}");
        info!("the heartbeatHost is {heartbeat_host}");

        Self {
            config,
            heartbeat_url,
            heartbeat_host,
            proxies,
            manual_proxy,
            is_auto,
            check_timeout: Duration::ZERO,
            serial_number: String::new(),
            transport,
        }
    }

    pub fn heartbeat_url(&self) -> &str {
        &self.heartbeat_url
    }

    pub fn heartbeat_host(&self) -> &str {
        &self.heartbeat_host
    }

    pub fn proxies(&self) -> &[ProxyInfo] {
        &self.proxies
    }

    /// Bring up the network identity. Called once at startup and again
    /// when the control client sees repeated heartbeat failures; the probe
    /// timeout grows by 2 s per call, capped at 10 s.
    pub fn init(&mut self, keep_running: &AtomicBool) -> CloudAgentInfo {
        self.check_timeout = (self.check_timeout + CHECK_TIMEOUT_STEP).min(MAX_CHECK_TIMEOUT);

        let (access_key_id, access_secret) = access_key::read_access_key(&self.config);
        info!("the accessKeyId is {access_key_id}");

        let sn = serial::discover(&self.config, !access_key_id.is_empty());
        self.serial_number = sn.value.clone();

        dns::wait_ready(
            &self.heartbeat_host,
            self.manual_proxy.as_ref(),
            &self.proxies,
            keep_running,
        );

        let proxy = self.select_proxy(keep_running);
        info!(
            "proxyInfo: regionId={}, url={}, user={}",
            proxy.region_id,
            proxy.proxy_url(),
            proxy.user
        );

        CloudAgentInfo {
            heartbeat_url: self.heartbeat_url.clone(),
            proxy_url: proxy.proxy_url(),
            user: proxy.user,
            password: proxy.password,
            access_key_id,
            access_secret,
            serial_number: sn.value,
        }
    }

    /// Pick the tunnel: manual configuration, then the region-id fast
    /// path, then the concurrent probe, then direct.
    fn select_proxy(&self, keep_running: &AtomicBool) -> ProxyInfo {
        if !self.is_auto {
            if let Some(proxy) = &self.manual_proxy {
                return proxy.clone();
            }
        }

        let region = self.region_id_from_vpc();
        if !region.is_empty() {
            if let Some(proxy) = self.proxy_for_region(&region) {
                return proxy;
            }
        }

        self.detect_from_proxies(keep_running).unwrap_or_default()
    }

    fn region_id_from_vpc(&self) -> String {
        let url = format!(
            "{}/latest/meta-data/region-id",
            self.config
                .get(serial::VPC_SERVER_KEY, serial::DEFAULT_VPC_SERVER)
        );
        let response = self
            .transport
            .get_via(&url, None, Duration::from_secs(5));
        if response.is_ok() {
            response.result.trim().to_string()
        } else {
            String::new()
        }
    }

    /// Known tunnels for `region`, each health-checked up to 3 times; new
    /// regions get synthesized `cmsproxy-<region>` candidates.
    pub fn proxy_for_region(&self, region: &str) -> Option<ProxyInfo> {
        let mut have_configured = false;
        for proxy in self.proxies.iter().filter(|p| p.region_id == region) {
            have_configured = true;
            for _ in 0..3 {
                if self.check_health(Some(proxy)) {
                    return Some(proxy.clone());
                }
            }
        }

        if !have_configured {
            for domain in ["aliyuncs.com:3128", "aliyun.com:3128"] {
                let candidate = ProxyInfo {
                    region_id: region.to_string(),
                    url: format!("cmsproxy-{region}.{domain}"),
                    scheme: "http".to_string(),
                    ..Default::default()
                };
                if self.check_health(Some(&candidate)) {
                    return Some(candidate);
                }
            }
        }

        None
    }

    /// `/check_health` must answer with the literal body `ok`.
    pub fn check_health(&self, proxy: Option<&ProxyInfo>) -> bool {
        let url = format!("{}/check_health", self.heartbeat_url);
        let response = self.transport.get_via(&url, proxy, self.check_timeout);
        response.is_ok() && response.result == "ok"
    }

    /// Fetch a body through `proxy`, retrying timeouts up to 3 times.
    fn get_with_retry(&self, url: &str, proxy: Option<&ProxyInfo>) -> Option<String> {
        for _ in 0..3 {
            let response = self.transport.get_via(url, proxy, self.check_timeout);
            if response.res_code == 0 {
                debug!(
                    "connect ({url}) via ({:?}) error: {}",
                    proxy.map(|p| p.url.as_str()),
                    response.error_msg
                );
                if response.is_timeout() {
                    continue;
                }
                return None;
            }
            if !response.is_ok() {
                return None;
            }
            return Some(response.result);
        }
        None
    }

    /// Probe one candidate by asking the control plane for this agent's
    /// region through it. A mismatched answer re-resolves by region and
    /// falls back to the probed proxy or a direct connection.
    pub fn check_proxy_with_serial(&self, proxy: &ProxyInfo) -> Option<ProxyInfo> {
        let url = format!(
            "{}{}/{}",
            self.heartbeat_url, REGION_PROBE_URI, self.serial_number
        );
        let mut region = self.get_with_retry(&url, Some(proxy))?;

        if region.len() > 2 && region.starts_with('"') && region.ends_with('"') {
            region = region[1..region.len() - 1].to_string();
        }

        if region.is_empty() || region == "unknown" || region == proxy.region_id {
            return Some(proxy.clone());
        }

        // the tunnel answered for a different region; prefer that region's
        // own tunnel, then whatever still passes a health check
        if let Some(better) = self.proxy_for_region(&region) {
            return Some(better);
        }
        for candidate in [Some(proxy), None] {
            if self.check_health(candidate) {
                return Some(candidate.cloned().unwrap_or_default());
            }
        }
        None
    }

    /// Concurrent probe over the whole candidate list; the first proxy
    /// that yields a region wins and the rest are abandoned.
    pub fn detect_from_proxies(&self, keep_running: &AtomicBool) -> Option<ProxyInfo> {
        if self.proxies.is_empty() {
            return None;
        }

        let workers = self.proxies.len().min(MAX_PROBE_WORKERS);
        let (tx, rx) = bounded::<ProxyInfo>(self.proxies.len());
        let stop = AtomicBool::new(false);

        let found = std::thread::scope(|scope| {
            for worker in 0..workers {
                let tx = tx.clone();
                let stop = &stop;
                let candidates = self
                    .proxies
                    .iter()
                    .skip(worker)
                    .step_by(workers)
                    .collect::<Vec<_>>();
                scope.spawn(move || {
                    for proxy in candidates {
                        if stop.load(Ordering::Relaxed) || !keep_running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Some(found) = self.check_proxy_with_serial(proxy) {
                            stop.store(true, Ordering::Relaxed);
                            let _ = tx.try_send(found);
                            break;
                        }
                    }
                });
            }
            drop(tx);

            let found = rx.recv().ok();
            stop.store(true, Ordering::Relaxed);
            found
        });

        if let Some(proxy) = &found {
            debug!("proxyInfo{{regionId: {}}}", proxy.region_id);
        }
        found
    }
}

fn heartbeat_url_from(config: &AgentConfig) -> String {
    let hosts = config.get("cms.agent.hosts", DEFAULT_HEARTBEAT_URL);
    let first = hosts.split(',').next().unwrap_or("").trim();
    first.trim_end_matches('/').to_string()
}

/// The bare host of a URL: scheme and path stripped.
fn host_of(url: &str) -> String {
    let rest = match url.split_once("//") {
        Some((_, rest)) => rest,
        None => url,
    };
    match rest.find('/') {
        Some(idx) => rest[..idx].to_string(),
        None => rest.to_string(),
    }
}

/// Built-in candidates in random rotation, so fleets do not all probe the
/// table in the same order.
fn append_builtin_proxies(proxies: &mut Vec<ProxyInfo>, user: &str, password: &str) {
    let start = fastrand::usize(..BUILTIN_PROXIES.len());
    for i in start..start + BUILTIN_PROXIES.len() {
        let (region_id, endpoint) = BUILTIN_PROXIES[i % BUILTIN_PROXIES.len()];
        proxies.push(ProxyInfo {
            region_id: region_id.to_string(),
            url: endpoint.to_string(),
            scheme: "http".to_string(),
            scheme_version: String::new(),
            user: user.to_string(),
            password: password.to_string(),
        });
    }
}

fn is_host_port_ok(host: &str, port: &str, allow_empty_port: bool) -> bool {
    if host.is_empty() {
        return false;
    }
    if port.is_empty() {
        return allow_empty_port;
    }
    matches!(port.parse::<u32>(), Ok(n) if n > 0 && n <= 65535)
}

fn must_match<'a>(value: &'a str, allowed: &[&'a str]) -> &'a str {
    if !value.is_empty() && allowed.contains(&value) {
        value
    } else {
        allowed[0]
    }
}

/// User-configured http proxy. The credentials come back in every case so
/// the built-in tunnels inherit them.
fn load_http_proxy(config: &AgentConfig) -> (Option<ProxyInfo>, String, String) {
    let mut user = config.get("http.proxy.user", "").trim().to_string();
    let mut password = config.get("http.proxy.password", "").trim().to_string();
    if user.is_empty() != password.is_empty() {
        user.clear();
        password.clear();
    }

    let host = config.get("http.proxy.host", "").trim().to_string();
    let port = config.get("http.proxy.port", "").trim().to_string();
    if !is_host_port_ok(&host, &port, true) {
        return (None, user, password);
    }

    let mut url = host;
    if !port.is_empty() {
        url = format!("{url}:{port}");
    }

    let scheme_raw = config.get("http.proxy.scheme", "");
    let scheme = must_match(scheme_raw.trim(), &["http", "https", "https/2"]);
    let (scheme, scheme_version) = match scheme.split_once('/') {
        Some((s, v)) => (s.trim().to_string(), v.trim().to_string()),
        None => (scheme.to_string(), String::new()),
    };

    let proxy = ProxyInfo {
        region_id: String::new(),
        url,
        scheme,
        scheme_version,
        user: user.clone(),
        password: password.clone(),
    };
    (Some(proxy), user, password)
}

/// User-configured socks proxy.
fn load_socks_proxy(config: &AgentConfig) -> Option<ProxyInfo> {
    let host = config.get("socks5.proxy.host", "").trim().to_string();
    let port = config.get("socks5.proxy.port", "").trim().to_string();
    if !is_host_port_ok(&host, &port, false) {
        return None;
    }

    let scheme_raw = config.get("socks5.proxy.scheme", "");
    let scheme = must_match(scheme_raw.trim(), &["socks5h", "socks5", "socks4", "socks4a"]);

    Some(ProxyInfo {
        region_id: String::new(),
        url: format!("{host}:{port}"),
        scheme: scheme.to_string(),
        scheme_version: String::new(),
        user: String::new(),
        password: String::new(),
    })
}
