//! The direct metric path: pre-formed [`CommonMetric`] batches shipped to
//! a per-channel endpoint with the header-signature scheme.

use std::collections::BTreeMap;

use serde::Deserialize;
use skywatch_common::crypto;
use skywatch_metrics::prometheus::metric_to_line;
use skywatch_metrics::CommonMetric;
use skywatch_transport::{gzip_compress, parse_url, HttpRequest};
use tracing::{info, warn};

use crate::channel::CloudChannel;

const API_VERSION: &str = "1.1";
const SEND_TRIES: u32 = 2;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DirectSendError {
    #[error("no metrics to send")]
    EmptyMetrics,

    #[error("invalid channel config")]
    InvalidConfig,

    #[error("wait heartbeat response for ok, as the instanceId is empty")]
    WaitingForHeartbeat,

    #[error("all retries failed")]
    SendFailed,
}

/// Per-channel upload configuration delivered beside the task config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudMetricConfig {
    #[serde(rename = "acckeyId", default)]
    pub acckey_id: String,
    #[serde(rename = "accKeySecretSign", default)]
    pub acc_key_secret_sign: String,
    #[serde(rename = "uploadEndpoint", default)]
    pub upload_endpoint: String,
    #[serde(rename = "secureToken", default)]
    pub secure_token: String,
    #[serde(rename = "needTimestamp", default)]
    pub need_timestamp: bool,
}

/// Parse and validate a channel config. The key pair and endpoint are
/// mandatory.
pub fn parse_cloud_metric_config(conf: &str) -> Option<CloudMetricConfig> {
    let config: CloudMetricConfig = match serde_json::from_str(conf) {
        Ok(c) => c,
        Err(e) => {
            warn!("the conf is not valid: {e}, conf: {conf}");
            return None;
        }
    };
    if config.acckey_id.is_empty()
        || config.acc_key_secret_sign.is_empty()
        || config.upload_endpoint.is_empty()
    {
        warn!("the conf({conf}) is invalid!");
        return None;
    }
    Some(config)
}

/// Chunk metrics into upload bodies: at most `send_size` lines each, every
/// line `\n`-terminated, sorted for a stable byte stream.
pub fn build_metric_bodies(
    metrics: &[CommonMetric],
    send_size: usize,
    need_timestamp: bool,
) -> Vec<String> {
    let mut lines: Vec<String> = metrics
        .iter()
        .map(|m| {
            let mut line = metric_to_line(m, need_timestamp);
            line.push('\n');
            line
        })
        .collect();
    lines.sort();

    lines
        .chunks(send_size.max(1))
        .map(|chunk| chunk.concat())
        .collect()
}

impl CloudChannel {
    /// Ship a pre-formed metric batch through the endpoint described by
    /// `conf`. Refuses to touch the network until the agent is registered.
    pub fn add_common_metrics(
        &self,
        metrics: &[CommonMetric],
        conf: &str,
    ) -> Result<(), DirectSendError> {
        if metrics.is_empty() {
            return Err(DirectSendError::EmptyMetrics);
        }
        let Some(config) = parse_cloud_metric_config(conf) else {
            warn!("skip metrics with invalid channel-conf({conf})");
            return Err(DirectSendError::InvalidConfig);
        };

        let node = self.manager().node_item();
        if node.instance_id.is_empty() {
            info!("wait heartbeat response for ok, as the instanceId is empty");
            return Err(DirectSendError::WaitingForHeartbeat);
        }

        let bodies =
            build_metric_bodies(metrics, self.metric_send_size(), config.need_timestamp);
        let mut all_ok = true;
        for body in bodies {
            all_ok &= self.send_metric(&body, &config);
        }
        if all_ok {
            Ok(())
        } else {
            Err(DirectSendError::SendFailed)
        }
    }

    /// Send one body with the signed `x-cms-*` header set, retrying once
    /// after a short back-off.
    pub(crate) fn send_metric(&self, body: &str, config: &CloudMetricConfig) -> bool {
        let compressed = match gzip_compress(body.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("gzip of metric body failed: {e}");
                return false;
            }
        };
        let headers = self.send_metric_headers(&compressed, config);

        for try_times in 0..SEND_TRIES {
            let mut request = HttpRequest::new(config.upload_endpoint.clone())
                .with_timeout(std::time::Duration::from_secs(2));
            request.tls_verify = self.config().tls_verify();
            request.body = compressed.clone();
            request.headers = headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();

            if self.do_send("metric", &request, try_times) {
                return true;
            }
            if try_times + 1 < SEND_TRIES && !self.retry_delay.is_zero() {
                std::thread::sleep(self.retry_delay);
            }
        }
        false
    }

    /// The signed header set. Every header participating in the signature
    /// is fixed here; mutating one afterwards would invalidate
    /// `Authorization`.
    pub(crate) fn send_metric_headers(
        &self,
        body: &[u8],
        config: &CloudMetricConfig,
    ) -> BTreeMap<String, String> {
        let node = self.manager().node_item();

        let mut headers = BTreeMap::new();
        headers.insert("User-Agent".to_string(), "Argus".to_string());
        headers.insert("Content-MD5".to_string(), crypto::md5_hex(body));
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        headers.insert("Content-Encoding".to_string(), "gzip".to_string());
        headers.insert(
            "Date".to_string(),
            jiff::Timestamp::now()
                .strftime("%a, %d %b %Y %H:%M:%S GMT")
                .to_string(),
        );
        headers.insert("x-cms-api-version".to_string(), API_VERSION.to_string());
        headers.insert(
            "x-cms-agent-version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        headers.insert(
            "x-cms-agent-instance".to_string(),
            node.instance_id.clone(),
        );
        headers.insert("x-cms-host".to_string(), self.hostname().to_string());
        headers.insert("x-cms-ip".to_string(), self.main_ip().to_string());
        headers.insert("x-cms-signature".to_string(), "hmac-sha1".to_string());
        headers.insert(
            "x-cms-instance-sn".to_string(),
            node.serial_number.clone(),
        );
        if !config.secure_token.is_empty() {
            headers.insert(
                "x-cms-security-token".to_string(),
                config.secure_token.clone(),
            );
            headers.insert("x-cms-caller-type".to_string(), "token".to_string());
        }

        let signature = sign_headers(&headers, &config.upload_endpoint, &config.acc_key_secret_sign);
        headers.insert(
            "Authorization".to_string(),
            format!("{}:{signature}", config.acckey_id),
        );
        headers
    }
}

/// Assemble the signing string and digest it:
/// verb, Content-MD5, Content-Type, Date, every `x-cms` header sorted by
/// name as `name:value` lines, then the URL path with no trailing newline.
pub fn sign_headers(
    headers: &BTreeMap<String, String>,
    endpoint: &str,
    secret: &str,
) -> String {
    let mut signing = String::from("POST\n");
    signing.push_str(headers.get("Content-MD5").map(String::as_str).unwrap_or(""));
    signing.push('\n');
    signing.push_str(headers.get("Content-Type").map(String::as_str).unwrap_or(""));
    signing.push('\n');
    signing.push_str(headers.get("Date").map(String::as_str).unwrap_or(""));
    signing.push('\n');

    // BTreeMap iteration is already in ascending byte order of the name
    for (name, value) in headers {
        if name.contains("x-cms") {
            signing.push_str(name);
            signing.push(':');
            signing.push_str(value);
            signing.push('\n');
        }
    }

    let (_, path) = parse_url(endpoint);
    signing.push_str(&path);

    crypto::sign_upload(&signing, secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PostFn;
    use skywatch_common::config::AgentConfig;
    use skywatch_common::properties::Properties;
    use skywatch_registry::model::NodeItem;
    use skywatch_registry::TaskManager;
    use skywatch_transport::HttpResponse;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    fn test_channel(
        manager: Arc<TaskManager>,
    ) -> (Arc<CloudChannel>, Arc<Mutex<Vec<HttpRequest>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let post: PostFn = Box::new(move |request| {
            seen.lock().unwrap().push(request.clone());
            HttpResponse {
                res_code: 200,
                result: r#"{"code":"Success"}"#.to_string(),
                ..Default::default()
            }
        });
        let config = AgentConfig::new(Properties::new(), PathBuf::from("."), PathBuf::from("."));
        let mut channel = CloudChannel::with_post(config, manager, post);
        channel.retry_delay = std::time::Duration::ZERO;
        (Arc::new(channel), requests)
    }

    fn registered_manager() -> Arc<TaskManager> {
        let manager = TaskManager::new();
        manager.set_node_item(NodeItem {
            instance_id: "host-abcdef1234".into(),
            serial_number: "sn-9".into(),
            ali_uid: "42".into(),
            ..Default::default()
        });
        manager
    }

    const CONF: &str = r#"{"acckeyId":"ak","accKeySecretSign":"secret",
        "uploadEndpoint":"https://hub.example.com/metric/v2/put/testNamespace",
        "needTimestamp":true}"#;

    #[test]
    fn config_parsing_validates_required_fields() {
        assert!(parse_cloud_metric_config("{]").is_none());
        assert!(parse_cloud_metric_config("[]").is_none());
        assert!(parse_cloud_metric_config("{}").is_none());

        let config = parse_cloud_metric_config(CONF).unwrap();
        assert!(config.need_timestamp);
        assert_eq!(config.upload_endpoint, "https://hub.example.com/metric/v2/put/testNamespace");
    }

    #[test]
    fn batcher_produces_ceil_m_over_n_bodies() {
        let metrics: Vec<CommonMetric> = (0..5)
            .map(|i| CommonMetric::new(format!("metric_{i}"), 1.0, 0))
            .collect();

        let bodies = build_metric_bodies(&metrics, 2, false);
        assert_eq!(bodies.len(), 3);
        for body in &bodies {
            assert!(body.lines().count() <= 2);
            assert!(body.ends_with('\n'));
        }
    }

    #[test]
    fn batcher_output_is_order_independent() {
        let a = CommonMetric::new("aaa", 1.0, 0);
        let b = CommonMetric::new("bbb", 1.0, 0);
        assert_eq!(
            build_metric_bodies(&[a.clone(), b.clone()], 10, false),
            build_metric_bodies(&[b, a], 10, false)
        );
    }

    #[test]
    fn batcher_escapes_label_values() {
        let metric =
            CommonMetric::new("test", 0.0, 0).with_tag("label", "a\\b\"c\nd");
        let bodies = build_metric_bodies(&[metric], 10, true);
        assert_eq!(bodies[0], "test{label=\"a\\\\b\\\"c\\nd\"} 0 0\n");
    }

    #[test]
    fn empty_metrics_are_refused() {
        let (channel, _) = test_channel(registered_manager());
        assert_eq!(
            channel.add_common_metrics(&[], CONF),
            Err(DirectSendError::EmptyMetrics)
        );
    }

    #[test]
    fn invalid_conf_is_refused() {
        let (channel, _) = test_channel(registered_manager());
        let metrics = [CommonMetric::new("m", 1.0, 0)];
        assert_eq!(
            channel.add_common_metrics(&metrics, "[]"),
            Err(DirectSendError::InvalidConfig)
        );
        assert_eq!(
            channel.add_common_metrics(&metrics, "{}"),
            Err(DirectSendError::InvalidConfig)
        );
    }

    #[test]
    fn unregistered_agent_is_refused_without_network_effect() {
        let (channel, requests) = test_channel(TaskManager::new());
        let metrics = [CommonMetric::new("m", 1.0, 0)];
        assert_eq!(
            channel.add_common_metrics(&metrics, CONF),
            Err(DirectSendError::WaitingForHeartbeat)
        );
        assert!(requests.lock().unwrap().is_empty());
    }

    #[test]
    fn send_carries_the_full_signed_header_set() {
        let (channel, requests) = test_channel(registered_manager());
        let metrics = [CommonMetric::new("m", 1.0, 1234)];
        channel.add_common_metrics(&metrics, CONF).unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        let header = |name: &str| {
            request
                .headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };

        assert_eq!(header("x-cms-api-version"), "1.1");
        assert_eq!(header("x-cms-signature"), "hmac-sha1");
        assert_eq!(header("x-cms-agent-instance"), "host-abcdef1234");
        assert_eq!(header("x-cms-instance-sn"), "sn-9");
        assert_eq!(header("Content-Encoding"), "gzip");
        assert!(header("Date").ends_with("GMT"));
        assert!(header("Authorization").starts_with("ak:"));
        // token headers only appear when a token is configured
        assert!(header("x-cms-security-token").is_empty());
    }

    #[test]
    fn authorization_round_trips_through_the_signing_string() {
        let (channel, requests) = test_channel(registered_manager());
        let metrics = [CommonMetric::new("m", 1.0, 1234)];
        channel.add_common_metrics(&metrics, CONF).unwrap();

        let requests = requests.lock().unwrap();
        let request = &requests[0];

        // rebuild the signature from the headers actually sent
        let headers: BTreeMap<String, String> = request
            .headers
            .iter()
            .filter(|(name, _)| name != "Authorization")
            .cloned()
            .collect();
        let recomputed = sign_headers(
            &headers,
            "https://hub.example.com/metric/v2/put/testNamespace",
            "secret",
        );

        let authorization = request
            .headers
            .iter()
            .find(|(name, _)| name == "Authorization")
            .map(|(_, value)| value.clone())
            .unwrap();
        assert_eq!(authorization, format!("ak:{recomputed}"));
    }

    #[test]
    fn signing_string_matches_the_stored_vector() {
        let mut headers = BTreeMap::new();
        headers.insert("Content-MD5".to_string(), "c9f165a6811a00647eb10f50f4bc314d".to_string());
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        headers.insert("Date".to_string(), "Tue, 13 Oct 2020 16:50:55 GMT".to_string());
        headers.insert("x-cms-agent-instance".to_string(), "host-abcdef1234".to_string());
        headers.insert("x-cms-agent-version".to_string(), "3.4.6".to_string());
        headers.insert("x-cms-api-version".to_string(), "1.1".to_string());
        headers.insert("x-cms-host".to_string(), "staragent-fenghua-coding".to_string());
        headers.insert("x-cms-ip".to_string(), "10.137.71.4".to_string());
        headers.insert("x-cms-signature".to_string(), "hmac-sha1".to_string());

        let signature = sign_headers(
            &headers,
            "https://hub.example.com/metric/v2/put/testNamespace",
            "5EB63746049CBB568BC0DBD56F453799",
        );
        assert_eq!(signature, "FC30FFFE4F5A52BEF4BABB06D6D7E43462F16141");
    }

    #[test]
    fn retries_once_then_gives_up() {
        let attempts = Arc::new(Mutex::new(0u32));
        let counted = attempts.clone();
        let post: PostFn = Box::new(move |_| {
            *counted.lock().unwrap() += 1;
            HttpResponse {
                res_code: 0,
                error_msg: "timed out".to_string(),
                ..Default::default()
            }
        });
        let config = AgentConfig::new(Properties::new(), PathBuf::from("."), PathBuf::from("."));
        let mut channel = CloudChannel::with_post(config, registered_manager(), post);
        channel.retry_delay = std::time::Duration::ZERO;

        let metrics = [CommonMetric::new("m", 1.0, 0)];
        assert_eq!(
            channel.add_common_metrics(&metrics, CONF),
            Err(DirectSendError::SendFailed)
        );
        assert_eq!(*attempts.lock().unwrap(), 2);
    }
}
