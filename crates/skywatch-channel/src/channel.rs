//! The periodic drain-and-ship loop for module results.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skywatch_common::clock::ClockSource;
use skywatch_common::config::AgentConfig;
use skywatch_common::encoding::{to_payload_string, url_encode};
use skywatch_common::{crypto, host};
use skywatch_metrics::module_data::{CollectData, MetricData};
use skywatch_registry::model::{CloudAgentInfo, CloudMsg, MetricItem, NodeItem};
use skywatch_registry::TaskManager;
use skywatch_transport::{gzip_compress, http_post, HttpRequest, HttpResponse};
use tracing::{debug, info, warn};

pub type PostFn = Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// Endpoint rotation threshold: consecutive failures on the current
/// metric item before moving to the next.
const ROTATE_AFTER_TRIES: u32 = 3;

const SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-send-loop state, touched only from the channel's own thread.
#[derive(Default)]
struct SendState {
    node_item: NodeItem,
    agent_info: CloudAgentInfo,
    metric_items: Vec<MetricItem>,
    prev_items: Option<Arc<Vec<MetricItem>>>,
    current_index: usize,
    current_try_times: u32,
}

pub struct CloudChannel {
    config: AgentConfig,
    manager: Arc<TaskManager>,
    clock: ClockSource,
    interval: Duration,
    max_msg_queue: usize,
    metric_send_size: usize,
    hostname: String,
    main_ip: String,
    queue: Mutex<VecDeque<CloudMsg>>,
    state: Mutex<SendState>,
    queue_empty_count: AtomicU32,
    ok_send_count: AtomicU64,
    error_send_count: AtomicU64,
    total_send_count: AtomicU64,
    post: PostFn,
    /// Back-off between direct-path retries; zeroed in tests.
    pub(crate) retry_delay: Duration,
}

impl CloudChannel {
    pub fn new(config: AgentConfig, manager: Arc<TaskManager>) -> Self {
        Self::with_post(config, manager, Box::new(|request| http_post(request)))
    }

    pub fn with_post(config: AgentConfig, manager: Arc<TaskManager>, post: PostFn) -> Self {
        let interval = Duration::from_secs(config.get_parsed("cms.agent.metric.interval", 15u64));
        let max_msg_queue = config.get_parsed("cms.agent.max.msg.size", 200usize);
        let metric_send_size = config.get_parsed("cms.agent.metric.send.size", 2000usize);
        Self {
            config,
            manager,
            clock: ClockSource::System,
            interval,
            max_msg_queue,
            metric_send_size,
            hostname: host::hostname(),
            main_ip: host::main_ip(),
            queue: Mutex::new(VecDeque::new()),
            state: Mutex::new(SendState::default()),
            queue_empty_count: AtomicU32::new(0),
            ok_send_count: AtomicU64::new(0),
            error_send_count: AtomicU64::new(0),
            total_send_count: AtomicU64::new(0),
            post,
            retry_delay: Duration::from_secs(2),
        }
    }

    pub fn with_clock(mut self, clock: ClockSource) -> Self {
        self.clock = clock;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn metric_send_size(&self) -> usize {
        self.metric_send_size
    }

    pub(crate) fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub(crate) fn manager(&self) -> &TaskManager {
        &self.manager
    }

    pub(crate) fn hostname(&self) -> &str {
        &self.hostname
    }

    pub(crate) fn main_ip(&self) -> &str {
        &self.main_ip
    }

    pub(crate) fn post(&self, request: &HttpRequest) -> HttpResponse {
        (self.post)(request)
    }

    /// Consecutive ticks that found the queue empty. The self monitor
    /// reads this as a liveness signal.
    pub fn queue_empty_count(&self) -> u32 {
        self.queue_empty_count.load(Ordering::Relaxed)
    }

    pub fn ok_send_count(&self) -> u64 {
        self.ok_send_count.load(Ordering::Relaxed)
    }

    pub fn error_send_count(&self) -> u64 {
        self.error_send_count.load(Ordering::Relaxed)
    }

    /// Queue a module result. The FIFO is bounded; at capacity the oldest
    /// entry is evicted (drop-head) and the producer never blocks.
    pub fn add_message(&self, name: impl Into<String>, payload: String) {
        let msg = CloudMsg {
            name: name.into(),
            timestamp: self.clock.epoch_millis() as i64,
            payload,
        };

        let exceeded = {
            let mut queue = self.queue.lock().unwrap();
            queue.push_back(msg);
            if queue.len() > self.max_msg_queue {
                queue.pop_front();
                true
            } else {
                false
            }
        };
        if exceeded {
            warn!(
                "drop msg while the size of msgQueue exceeds the maxSize({}), agent: {}",
                self.max_msg_queue,
                self.manager.node_item()
            );
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Run the reporting loop until shutdown.
    pub fn run(&self, keep_running: &AtomicBool) {
        loop {
            let next = self.tick().unwrap_or(self.interval);
            if !sleep_while_running(next, keep_running) {
                break;
            }
        }
        info!("the cloud channel will exit");
    }

    /// One reporting cycle. Returns an override for the next wait when the
    /// channel is still waiting for registration.
    pub fn tick(&self) -> Option<Duration> {
        {
            let mut state = self.state.lock().unwrap();
            state.node_item = (*self.manager.node_item()).clone();
            state.agent_info = (*self.manager.cloud_agent_info()).clone();

            let published = self.manager.metric_items();
            let replaced = match &state.prev_items {
                Some(prev) => !Arc::ptr_eq(prev, &published),
                None => true,
            };
            if replaced {
                state.metric_items = (*published).clone();
                state.prev_items = Some(published);
                state.current_index = 0;
                state.current_try_times = 0;
            }

            if state.metric_items.is_empty() {
                info!("wait for heartbeat ready!");
                return Some(Duration::from_secs(5));
            }
        }

        let msgs: Vec<CloudMsg> = {
            let mut queue = self.queue.lock().unwrap();
            queue.drain(..).collect()
        };

        if msgs.is_empty() {
            let count = self.queue_empty_count.fetch_add(1, Ordering::Relaxed) + 1;
            info!("msg queue is empty {count}!!");
        } else {
            self.queue_empty_count.store(0, Ordering::Relaxed);
            let (body, count) = self.to_payload_msgs(&msgs);
            self.send_msg(count, &body);
        }
        None
    }

    /// Transform drained messages into the upload body: one line per data
    /// point, sorted so the byte stream is a function of the message set,
    /// not arrival order.
    pub fn to_payload_msgs(&self, msgs: &[CloudMsg]) -> (String, usize) {
        let node = (*self.manager.node_item()).clone();
        let mut lines = Vec::with_capacity(128);

        for msg in msgs {
            let Some(collect) = CollectData::decode(&msg.payload, false) else {
                warn!("skip undecodable msg {}", msg.name);
                continue;
            };
            if collect.module_name != msg.name {
                warn!(
                    "skip invalid moduleName {}:{}",
                    collect.module_name, msg.name
                );
                continue;
            }
            if collect.data.is_empty() {
                warn!("skip empty data moduleName {}", collect.module_name);
                continue;
            }

            let mut err_count = 0;
            for (index, data) in collect.data.iter().enumerate() {
                match self.to_payload_metric_data(data, msg.timestamp, &node) {
                    Some(line) => lines.push(line),
                    None => {
                        err_count += 1;
                        warn!(
                            "skip empty invalid MetricData[{index}]: {}",
                            collect.module_name
                        );
                    }
                }
            }
            if err_count > 0 {
                warn!("invalid MetricData: {}", msg.payload);
            }
        }

        lines.sort();
        let count = lines.len();
        (lines.concat(), count)
    }

    /// One upload line:
    /// `<name> <ts_ms> <value> ns=<ns> <tag=v ...> <value=v ...> instanceId=<id> userId=<uid>\n`
    fn to_payload_metric_data(
        &self,
        data: &MetricData,
        timestamp_millis: i64,
        node: &NodeItem,
    ) -> Option<String> {
        if !data.check(0) {
            return None;
        }

        let mut metric_name = "";
        let mut ns = "";
        let mut content = String::new();
        for (key, value) in &data.tags {
            match key.as_str() {
                "metricName" => metric_name = value,
                "ns" => ns = value,
                _ => {
                    content.push(' ');
                    content.push_str(key);
                    content.push('=');
                    content.push_str(&url_encode(value));
                }
            }
        }

        let mut metric_value = 0.0;
        for (key, value) in &data.values {
            if key == "metricValue" {
                metric_value = *value;
            } else {
                content.push(' ');
                content.push_str(key);
                content.push('=');
                content.push_str(&to_payload_string(*value));
            }
        }

        content.push_str(" instanceId=");
        content.push_str(&url_encode(&node.instance_id));
        content.push_str(" userId=");
        content.push_str(&node.ali_uid);

        Some(format!(
            "{metric_name} {timestamp_millis} {} ns={}{content}\n",
            to_payload_string(metric_value),
            url_encode(ns)
        ))
    }

    /// Ship one framed body to the current endpoint and account the
    /// outcome, rotating endpoints after repeated failures.
    pub fn send_msg(&self, count: usize, body: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.metric_items.is_empty() {
            warn!("metricHubs is empty, can't send collect results");
            return true;
        }

        if state.current_try_times >= ROTATE_AFTER_TRIES {
            state.current_index = (state.current_index + 1) % state.metric_items.len();
            state.current_try_times = 0;
        }

        let item = state.metric_items[state.current_index].clone();
        let mut request = HttpRequest::new(item.url.clone()).with_timeout(SEND_TIMEOUT);
        request.tls_verify = self.config.tls_verify();
        if item.use_proxy {
            request.proxy = state.agent_info.proxy_url.clone();
            request.user = state.agent_info.user.clone();
            request.password = state.agent_info.password.clone();
        }
        if item.gzip {
            request = request.with_header("Content-Encoding", "gzip");
            match gzip_compress(body.as_bytes()) {
                Ok(compressed) => request.body = compressed,
                Err(e) => {
                    warn!("gzip of upload body failed: {e}");
                    return false;
                }
            }
        } else {
            request = request.with_header("Content-Type", "text/plain");
            request.body = body.as_bytes().to_vec();
        }

        if !state.agent_info.access_key_id.is_empty()
            && !state.agent_info.access_secret.is_empty()
        {
            match crypto::calculate(&request.body, &state.agent_info.access_secret) {
                Ok(signature) => {
                    request = request
                        .with_header("cms-access-key", state.agent_info.access_key_id.clone())
                        .with_header("cms-signature", signature);
                }
                Err(e) => warn!("signing upload body: {e}"),
            }
        }

        debug!("will send metric with length: {}", request.body.len());
        self.dump_last_send(body);

        let ok = self.do_send("msg", &request, 0);
        if ok {
            state.current_try_times = 0;
            self.ok_send_count.fetch_add(1, Ordering::Relaxed);
        } else {
            state.current_try_times += 1;
            self.error_send_count.fetch_add(1, Ordering::Relaxed);
        }
        let total = self.total_send_count.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "send metric summary, total={total}, ok={}, error={}, records={count}",
            self.ok_send_count(),
            self.error_send_count()
        );
        ok
    }

    /// POST and interpret the answer. An HTTP 200 with an empty body is a
    /// success; a 200 with a JSON body succeeds iff its `code` equals
    /// "Success" case-insensitively. This asymmetry is intentional, the
    /// ingestion tier answers both ways.
    pub(crate) fn do_send(&self, kind: &str, request: &HttpRequest, try_times: u32) -> bool {
        let response = self.post(request);
        if response.res_code == 0 {
            warn!(
                "send {kind} to {} error={}, tryTimes={try_times}",
                request.url, response.error_msg
            );
            return false;
        }

        if response.is_ok() {
            if response.result.is_empty() || parse_response_result(&response.result) {
                info!(
                    "send {kind} to {}, success, len={}",
                    request.url,
                    request.body.len()
                );
                return true;
            }
        }
        warn!(
            "send {kind} to {} with error responseCode={}, msg={}, tryTimes={try_times}",
            request.url, response.res_code, response.result
        );
        false
    }

    /// Keep a copy of the last framed body under the log directory as a
    /// debugging aid. Best effort, truncate-then-write.
    fn dump_last_send(&self, body: &str) {
        let path = self.config.log_dir().join("argus-last-send-cms.txt");
        let stamped = format!("{}\n{body}", jiff::Timestamp::now());
        if let Err(e) = std::fs::write(&path, stamped) {
            debug!("writing {}: {e}", path.display());
        }
    }
}

/// Whether an upload response body reports acceptance.
pub fn parse_response_result(result: &str) -> bool {
    let value: serde_json::Value = match serde_json::from_str(result) {
        Ok(v) => v,
        Err(e) => {
            warn!("the response result({result}) is invalid: {e}");
            return false;
        }
    };
    let code = value.get("code").and_then(|v| v.as_str()).unwrap_or("");
    code.eq_ignore_ascii_case("Success")
}

/// Sleep in short slices so shutdown stays responsive. Returns false once
/// shutdown is requested.
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
    use std::path::PathBuf;

    fn test_config() -> AgentConfig {
        AgentConfig::new(Properties::new(), PathBuf::from("."), PathBuf::from("."))
    }

    fn channel_with_posts(
        manager: Arc<TaskManager>,
        responses: Vec<HttpResponse>,
    ) -> (Arc<CloudChannel>, Arc<Mutex<Vec<String>>>) {
        let urls = Arc::new(Mutex::new(Vec::new()));
        let seen = urls.clone();
        let queue = Mutex::new(VecDeque::from(responses));
        let post: PostFn = Box::new(move |request| {
            seen.lock().unwrap().push(request.url.clone());
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| HttpResponse {
                    res_code: 200,
                    ..Default::default()
                })
        });
        let channel = Arc::new(CloudChannel::with_post(test_config(), manager, post));
        (channel, urls)
    }

    fn ok_response() -> HttpResponse {
        HttpResponse {
            res_code: 200,
            ..Default::default()
        }
    }

    fn error_response(code: u16) -> HttpResponse {
        HttpResponse {
            res_code: code,
            result: "server blew up".to_string(),
            ..Default::default()
        }
    }

    fn registered_manager() -> Arc<TaskManager> {
        let manager = TaskManager::new();
        manager.set_node_item(NodeItem {
            instance_id: "i-123".into(),
            ali_uid: "1234567".into(),
            ..Default::default()
        });
        manager
    }

    fn sample_payload(module: &str) -> String {
        let mut data = MetricData::default();
        data.tags.insert("metricName".into(), "cpu_utilization".into());
        data.tags.insert("ns".into(), "acs_host".into());
        data.tags.insert("targetIP".into(), "127.0.0.1".into());
        data.values.insert("metricValue".into(), 2.2);
        data.values.insert("jumps".into(), 23.0);
        CollectData {
            module_name: module.into(),
            data: vec![data],
        }
        .encode()
    }

    #[test]
    fn payload_line_format() {
        let manager = registered_manager();
        let (channel, _) = channel_with_posts(manager, vec![]);

        let msg = CloudMsg {
            name: "cpu".into(),
            timestamp: 1_706_367_779_000,
            payload: sample_payload("cpu"),
        };
        let (body, count) = channel.to_payload_msgs(&[msg]);
        assert_eq!(count, 1);
        assert_eq!(
            body,
            "cpu_utilization 1706367779000 2.2 ns=acs_host targetIP=127.0.0.1 jumps=23 instanceId=i-123 userId=1234567\n"
        );
    }

    #[test]
    fn mismatched_module_name_is_skipped() {
        let (channel, _) = channel_with_posts(registered_manager(), vec![]);
        let msg = CloudMsg {
            name: "cpu".into(),
            timestamp: 0,
            payload: sample_payload("memory"),
        };
        let (body, count) = channel.to_payload_msgs(&[msg]);
        assert_eq!(count, 0);
        assert!(body.is_empty());
    }

    #[test]
    fn empty_data_vector_is_skipped() {
        let (channel, _) = channel_with_posts(registered_manager(), vec![]);
        let payload = CollectData {
            module_name: "cpu".into(),
            data: vec![],
        }
        .encode();
        let msg = CloudMsg {
            name: "cpu".into(),
            timestamp: 0,
            payload,
        };
        let (_, count) = channel.to_payload_msgs(&[msg]);
        assert_eq!(count, 0);
    }

    #[test]
    fn invalid_data_points_are_dropped_individually() {
        let (channel, _) = channel_with_posts(registered_manager(), vec![]);
        // a record with one empty (invalid) data point
        let payload = CollectData {
            module_name: "cpu".into(),
            data: vec![MetricData::default()],
        }
        .encode();
        let msg = CloudMsg {
            name: "cpu".into(),
            timestamp: 0,
            payload,
        };
        let (_, count) = channel.to_payload_msgs(&[msg]);
        assert_eq!(count, 0);
    }

    #[test]
    fn lines_are_sorted_independent_of_arrival_order() {
        let (channel, _) = channel_with_posts(registered_manager(), vec![]);
        let make_msg = |module: &str, metric: &str| {
            let mut data = MetricData::default();
            data.tags.insert("metricName".into(), metric.into());
            data.tags.insert("ns".into(), "acs_host".into());
            data.values.insert("metricValue".into(), 1.0);
            CloudMsg {
                name: module.to_string(),
                timestamp: 1000,
                payload: CollectData {
                    module_name: module.into(),
                    data: vec![data],
                }
                .encode(),
            }
        };

        let a = make_msg("alpha", "aaa_metric");
        let z = make_msg("zulu", "zzz_metric");
        let (forward, _) = channel.to_payload_msgs(&[a.clone(), z.clone()]);
        let (backward, _) = channel.to_payload_msgs(&[z, a]);
        assert_eq!(forward, backward);
        assert!(forward.starts_with("aaa_metric "));
        assert!(forward.ends_with('\n'));
    }

    #[test]
    fn queue_is_bounded_with_drop_head() {
        let manager = registered_manager();
        let mut config = test_config();
        config.set("cms.agent.max.msg.size", "3");
        let channel = CloudChannel::with_post(
            config,
            manager,
            Box::new(|_| HttpResponse::default()),
        );

        for i in 0..5 {
            channel.add_message(format!("m{i}"), "payload".to_string());
        }
        assert_eq!(channel.queue_len(), 3);
        // oldest entries were evicted
        let queue = channel.queue.lock().unwrap();
        assert_eq!(queue.front().unwrap().name, "m2");
    }

    #[test]
    fn tick_waits_for_heartbeat_when_no_endpoints() {
        let (channel, urls) = channel_with_posts(registered_manager(), vec![]);
        channel.add_message("cpu", sample_payload("cpu"));

        let next = channel.tick();
        assert_eq!(next, Some(Duration::from_secs(5)));
        assert!(urls.lock().unwrap().is_empty());
        // message is still queued for when the endpoint arrives
        assert_eq!(channel.queue_len(), 1);
    }

    #[test]
    fn endpoint_rotation_after_three_failures() {
        let manager = registered_manager();
        manager.set_metric_items(vec![
            MetricItem {
                url: "https://endpoint-a.example.com/put".into(),
                ..Default::default()
            },
            MetricItem {
                url: "https://endpoint-b.example.com/put".into(),
                ..Default::default()
            },
        ]);

        let responses = vec![
            error_response(500),
            error_response(500),
            error_response(500),
            ok_response(),
        ];
        let (channel, urls) = channel_with_posts(manager, responses);

        for _ in 0..4 {
            channel.add_message("cpu", sample_payload("cpu"));
            assert!(channel.tick().is_none());
        }

        let urls = urls.lock().unwrap();
        assert_eq!(urls.len(), 4);
        assert!(urls[0].contains("endpoint-a"));
        assert!(urls[1].contains("endpoint-a"));
        assert!(urls[2].contains("endpoint-a"));
        assert!(urls[3].contains("endpoint-b"));

        // success on B resets the counters
        let state = channel.state.lock().unwrap();
        assert_eq!(state.current_index, 1);
        assert_eq!(state.current_try_times, 0);
    }

    #[test]
    fn replacing_the_endpoint_list_resets_the_cursor() {
        let manager = registered_manager();
        manager.set_metric_items(vec![
            MetricItem {
                url: "https://endpoint-a.example.com/put".into(),
                ..Default::default()
            },
            MetricItem {
                url: "https://endpoint-b.example.com/put".into(),
                ..Default::default()
            },
        ]);

        let responses = (0..3).map(|_| error_response(500)).collect();
        let (channel, _) = channel_with_posts(manager.clone(), responses);

        for _ in 0..3 {
            channel.add_message("cpu", sample_payload("cpu"));
            channel.tick();
        }
        assert_eq!(channel.state.lock().unwrap().current_try_times, 3);

        manager.set_metric_items(vec![MetricItem {
            url: "https://endpoint-c.example.com/put".into(),
            ..Default::default()
        }]);
        channel.add_message("cpu", sample_payload("cpu"));
        channel.tick();

        let state = channel.state.lock().unwrap();
        assert_eq!(state.current_index, 0);
        assert_eq!(state.metric_items.len(), 1);
    }

    #[test]
    fn empty_queue_increments_the_liveness_counter() {
        let manager = registered_manager();
        manager.set_metric_items(vec![MetricItem {
            url: "https://endpoint.example.com/put".into(),
            ..Default::default()
        }]);
        let (channel, _) = channel_with_posts(manager, vec![]);

        channel.tick();
        channel.tick();
        assert_eq!(channel.queue_empty_count(), 2);

        channel.add_message("cpu", sample_payload("cpu"));
        channel.tick();
        assert_eq!(channel.queue_empty_count(), 0);
    }

    #[test]
    fn gzip_endpoints_get_compressed_bodies() {
        let manager = registered_manager();
        manager.set_metric_items(vec![MetricItem {
            url: "https://endpoint.example.com/put".into(),
            gzip: true,
            ..Default::default()
        }]);

        let bodies = Arc::new(Mutex::new(Vec::new()));
        let seen = bodies.clone();
        let post: PostFn = Box::new(move |request| {
            seen.lock().unwrap().push((
                request.body.clone(),
                request.headers.clone(),
            ));
            ok_response()
        });
        let channel = CloudChannel::with_post(test_config(), manager, post);

        channel.add_message("cpu", sample_payload("cpu"));
        channel.tick();

        let bodies = bodies.lock().unwrap();
        let (body, headers) = &bodies[0];
        assert!(headers
            .iter()
            .any(|(name, value)| name == "Content-Encoding" && value == "gzip"));
        // gzip magic
        assert_eq!(&body[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn response_code_interpretation() {
        assert!(parse_response_result(r#"{"code":"Success"}"#));
        assert!(parse_response_result(r#"{"code":"success"}"#));
        assert!(parse_response_result(r#"{"code":"SUCCESS"}"#));
        assert!(!parse_response_result(r#"{"code":"Throttled"}"#));
        assert!(!parse_response_result(r#"{"other":"shape"}"#));
        assert!(!parse_response_result("not json"));
    }

    #[test]
    fn success_with_json_error_code_counts_as_failure() {
        let manager = registered_manager();
        manager.set_metric_items(vec![MetricItem {
            url: "https://endpoint.example.com/put".into(),
            ..Default::default()
        }]);
        let rejected = HttpResponse {
            res_code: 200,
            result: r#"{"code":"Forbidden"}"#.to_string(),
            ..Default::default()
        };
        let (channel, _) = channel_with_posts(manager, vec![rejected]);

        channel.add_message("cpu", sample_payload("cpu"));
        channel.tick();
        assert_eq!(channel.error_send_count(), 1);
        assert_eq!(channel.ok_send_count(), 0);
    }

    #[test]
    fn refuses_nothing_but_counts_when_signed() {
        // with access keys configured the signature headers are attached
        let manager = registered_manager();
        manager.set_cloud_agent_info(CloudAgentInfo {
            access_key_id: "ak".into(),
            access_secret: "SRDzEi8yE_YPRZH8dVG-sg".into(),
            ..Default::default()
        });
        manager.set_metric_items(vec![MetricItem {
            url: "https://endpoint.example.com/put".into(),
            ..Default::default()
        }]);

        let headers = Arc::new(Mutex::new(Vec::new()));
        let seen = headers.clone();
        let post: PostFn = Box::new(move |request| {
            seen.lock().unwrap().extend(request.headers.clone());
            ok_response()
        });
        let channel = CloudChannel::with_post(test_config(), manager, post);
        channel.add_message("cpu", sample_payload("cpu"));
        channel.tick();

        let headers = headers.lock().unwrap();
        assert!(headers.iter().any(|(name, _)| name == "cms-access-key"));
        assert!(headers.iter().any(|(name, _)| name == "cms-signature"));
    }

    #[test]
    fn last_send_dump_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::new(
            Properties::new(),
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
        );
        let manager = registered_manager();
        manager.set_metric_items(vec![MetricItem {
            url: "https://endpoint.example.com/put".into(),
            ..Default::default()
        }]);
        let channel = CloudChannel::with_post(
            config,
            manager,
            Box::new(|_| HttpResponse {
                res_code: 200,
                ..Default::default()
            }),
        );

        channel.add_message("cpu", sample_payload("cpu"));
        channel.tick();

        let dump = std::fs::read_to_string(dir.path().join("argus-last-send-cms.txt")).unwrap();
        assert!(dump.contains("cpu_utilization "));
    }
}
