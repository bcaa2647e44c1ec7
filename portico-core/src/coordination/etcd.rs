//! etcd v3 coordination client
//!
//! Pure-Rust async client over the etcd JSON gateway using reqwest. A lease
//! plays the role of the session: ephemeral nodes are keys attached to it and
//! vanish when it stops being renewed.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::{child_name, ConnectionState, CoordinationClient, SessionId};
use crate::config::CoordinationConfig;
use crate::error::{PorticoError, Result};

#[derive(Debug, Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID", default, deserialize_with = "de_i64")]
    id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeepAliveResult {
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
}

#[derive(Debug, Deserialize)]
struct KeepAliveResponse {
    #[serde(default)]
    result: Option<KeepAliveResult>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct TxnResponse {
    #[serde(default)]
    succeeded: bool,
}

/// The gateway renders int64 as JSON strings
fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom("integer out of range")),
        _ => Ok(0),
    }
}

/// Smallest key greater than every key starting with `prefix`
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

/// A granted lease and the local instant after which it must be presumed gone
#[derive(Debug, Clone, Copy)]
struct Lease {
    id: i64,
    valid_until: Instant,
}

/// Portion of the TTL given up so the local view expires before the server's
fn safety_margin(ttl: Duration) -> Duration {
    (ttl / 10).max(Duration::from_millis(100)).min(ttl / 2)
}

struct EtcdInner {
    http: Client,
    endpoints: Vec<String>,
    namespace: String,
    ttl_secs: i64,
    retry_base: Duration,
    retry_max_tries: u32,
    lease: Mutex<Option<Lease>>,
    events: watch::Sender<ConnectionState>,
}

impl EtcdInner {
    fn key(&self, path: &str) -> String {
        format!("/{}{}", self.namespace.trim_matches('/'), path)
    }

    async fn post_once<T: DeserializeOwned>(&self, endpoint: &str, api: &str, body: &Value) -> Result<T> {
        let url = format!("{}/v3/{}", endpoint.trim_end_matches('/'), api);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| PorticoError::unavailable(format!("{}: {}", url, e)))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(PorticoError::unavailable(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PorticoError::CoordinationProtocol {
                reason: format!("{} returned {}: {}", url, status, text),
            });
        }

        resp.json::<T>().await.map_err(|e| PorticoError::CoordinationProtocol {
            reason: format!("Failed to decode {} response: {}", api, e),
        })
    }

    /// POST with exponential backoff across endpoints
    async fn call<T: DeserializeOwned>(&self, api: &str, body: Value) -> Result<T> {
        let tries = self.retry_max_tries.max(1);
        let mut delay = self.retry_base;
        let mut last_error = None;

        for attempt in 0..tries {
            let endpoint = &self.endpoints[attempt as usize % self.endpoints.len()];
            match self.post_once(endpoint, api, &body).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    debug!("etcd {} attempt {}/{} failed: {}", api, attempt + 1, tries, e);
                    last_error = Some(e);
                    if attempt + 1 < tries {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| PorticoError::unavailable("no etcd endpoint answered")))
    }

    /// Lease id, if the lease has not outlived its local deadline
    fn current_lease(&self) -> Option<i64> {
        let held = *self.lease.lock();
        held.filter(|lease| Instant::now() < lease.valid_until)
            .map(|lease| lease.id)
    }

    async fn grant(&self) -> Result<SessionId> {
        let sent = Instant::now();
        let resp: LeaseGrantResponse = self.call("lease/grant", json!({ "TTL": self.ttl_secs })).await?;
        if let Some(error) = resp.error.filter(|e| !e.is_empty()) {
            return Err(PorticoError::CoordinationProtocol { reason: error });
        }
        if resp.id == 0 || resp.ttl <= 0 {
            return Err(PorticoError::CoordinationProtocol {
                reason: "lease grant returned no lease".into(),
            });
        }

        let ttl = Duration::from_secs(resp.ttl as u64);
        *self.lease.lock() = Some(Lease {
            id: resp.id,
            valid_until: sent + ttl - safety_margin(ttl),
        });
        let session = SessionId(resp.id as u64);
        self.events.send_replace(ConnectionState::Connected(session));
        info!("Coordination session {} established (ttl {}s)", session, resp.ttl);
        Ok(session)
    }

    async fn establish(&self) {
        if let Err(e) = self.grant().await {
            warn!("Failed to establish coordination session: {}", e);
        }
    }

    fn mark_lost(&self) {
        if let Some(lease) = self.lease.lock().take() {
            warn!("Coordination session {} lost", SessionId(lease.id as u64));
        }
        self.events.send_replace(ConnectionState::Lost);
    }

    fn mark_suspended(&self, reason: &str) {
        if matches!(*self.events.borrow(), ConnectionState::Connected(_)) {
            warn!("Coordination keep-alive failed, suspending: {}", reason);
            self.events.send_replace(ConnectionState::Suspended);
        }
    }

    /// Renew the lease once.
    ///
    /// Every attempt is cut off at the lease's local deadline, so a hung
    /// endpoint can never keep the session looking alive past its TTL.
    async fn renew_once(&self) {
        let held = *self.lease.lock();
        let Some(lease) = held else {
            self.establish().await;
            return;
        };
        let body = json!({ "ID": lease.id.to_string() });

        for endpoint in &self.endpoints {
            let remaining = lease.valid_until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let sent = Instant::now();
            let attempt = timeout(
                remaining,
                self.post_once::<KeepAliveResponse>(endpoint, "lease/keepalive", &body),
            )
            .await;

            match attempt {
                Ok(Ok(resp)) => {
                    let ttl = resp.result.map(|r| r.ttl).unwrap_or(0);
                    if ttl <= 0 {
                        // the server no longer knows the lease
                        self.mark_lost();
                        self.establish().await;
                        return;
                    }
                    self.extend(lease.id, sent, Duration::from_secs(ttl as u64));
                    return;
                }
                Ok(Err(e)) => self.mark_suspended(&e.to_string()),
                Err(_) => self.mark_suspended("keep-alive timed out"),
            }
        }

        if Instant::now() >= lease.valid_until {
            self.mark_lost();
            self.establish().await;
        }
    }

    fn extend(&self, id: i64, sent: Instant, ttl: Duration) {
        {
            let mut held = self.lease.lock();
            match held.as_mut() {
                Some(lease) if lease.id == id => lease.valid_until = sent + ttl - safety_margin(ttl),
                _ => return,
            }
        }
        let session = SessionId(id as u64);
        if *self.events.borrow() != ConnectionState::Connected(session) {
            info!("Coordination session {} reconnected", session);
            self.events.send_replace(ConnectionState::Connected(session));
        }
    }

    fn live_lease(&self) -> Result<i64> {
        match *self.events.borrow() {
            ConnectionState::Connected(_) => {}
            ConnectionState::Suspended => return Err(PorticoError::unavailable("connection suspended")),
            ConnectionState::Lost => return Err(PorticoError::unavailable("session lost")),
        }
        self.current_lease()
            .ok_or_else(|| PorticoError::unavailable("session expired"))
    }
}

/// Coordination client backed by an etcd cluster
pub struct EtcdCoordination {
    inner: Arc<EtcdInner>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdCoordination {
    /// Connect, establish a session and start renewing it
    pub async fn connect(config: &CoordinationConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(PorticoError::InvalidConfig {
                reason: "no coordination endpoints".into(),
            });
        }

        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.session_timeout() / 3)
            .build()
            .map_err(|e| PorticoError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let (events, _) = watch::channel(ConnectionState::Lost);
        let inner = Arc::new(EtcdInner {
            http,
            endpoints: config.endpoints.clone(),
            namespace: config.namespace.clone(),
            ttl_secs: (config.session_timeout_ms / 1000).max(1) as i64,
            retry_base: config.retry_base_sleep(),
            retry_max_tries: config.retry_max_tries,
            lease: Mutex::new(None),
            events,
        });

        inner.grant().await?;

        let period = Duration::from_millis((config.session_timeout_ms / 3).max(100));
        let task_inner = inner.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                task_inner.renew_once().await;
            }
        });

        Ok(Self {
            inner,
            keepalive_task: Mutex::new(Some(task)),
        })
    }

    /// Stop renewing and revoke the lease so ephemeral nodes go away now
    pub async fn close(&self) {
        if let Some(task) = self.keepalive_task.lock().take() {
            task.abort();
        }
        let lease = self.inner.lease.lock().take();
        if let Some(lease) = lease {
            let revoked: Result<Value> = self
                .inner
                .call("lease/revoke", json!({ "ID": lease.id.to_string() }))
                .await;
            if let Err(e) = revoked {
                warn!("Failed to revoke coordination session: {}", e);
            }
        }
        self.inner.events.send_replace(ConnectionState::Lost);
    }
}

impl Drop for EtcdCoordination {
    fn drop(&mut self) {
        if let Some(task) = self.keepalive_task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl CoordinationClient for EtcdCoordination {
    /// None once the lease is past its local deadline, even if no keep-alive
    /// has failed yet
    fn session_id(&self) -> Option<SessionId> {
        self.inner.current_lease().map(|lease| SessionId(lease as u64))
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.inner.live_lease()?;
        let key = self.inner.key(path);
        let resp: RangeResponse = self
            .inner
            .call("kv/range", json!({ "key": BASE64.encode(&key) }))
            .await?;

        match resp.kvs.into_iter().next() {
            Some(kv) => BASE64
                .decode(kv.value)
                .map(Some)
                .map_err(|e| PorticoError::corrupt(path, e)),
            None => Ok(None),
        }
    }

    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.inner.live_lease()?;
        let key = self.inner.key(path);
        let _: Value = self
            .inner
            .call(
                "kv/put",
                json!({ "key": BASE64.encode(&key), "value": BASE64.encode(&data) }),
            )
            .await?;
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<bool> {
        let lease = self.inner.live_lease()?;
        let key = BASE64.encode(self.inner.key(path));
        let resp: TxnResponse = self
            .inner
            .call(
                "kv/txn",
                json!({
                    "compare": [{
                        "key": key,
                        "result": "EQUAL",
                        "target": "CREATE",
                        "create_revision": "0",
                    }],
                    "success": [{
                        "request_put": {
                            "key": key,
                            "value": BASE64.encode(&data),
                            "lease": lease.to_string(),
                        }
                    }],
                    "failure": [],
                }),
            )
            .await?;
        Ok(resp.succeeded)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.live_lease()?;
        let key = self.inner.key(path);
        let _: Value = self
            .inner
            .call("kv/deleterange", json!({ "key": BASE64.encode(&key) }))
            .await?;
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.inner.live_lease()?;
        let prefix = format!("{}/", self.inner.key(path).trim_end_matches('/'));
        let resp: RangeResponse = self
            .inner
            .call(
                "kv/range",
                json!({
                    "key": BASE64.encode(&prefix),
                    "range_end": BASE64.encode(prefix_end(prefix.as_bytes())),
                    "keys_only": true,
                }),
            )
            .await?;

        let parent = self.inner.key(path);
        let mut names = BTreeSet::new();
        for kv in resp.kvs {
            let raw = BASE64.decode(&kv.key).map_err(|e| PorticoError::corrupt(path, e))?;
            let key = String::from_utf8_lossy(&raw);
            if let Some(name) = child_name(&parent, &key) {
                names.insert(name.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }

    fn connection_events(&self) -> watch::Receiver<ConnectionState> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::LeaderElector;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn connected(server: &MockServer) -> EtcdCoordination {
        Mock::given(method("POST"))
            .and(path("/v3/lease/grant"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ID": "7587", "TTL": "60" })))
            .mount(server)
            .await;

        let config = CoordinationConfig {
            endpoints: vec![server.uri()],
            retry_max_tries: 1,
            ..Default::default()
        };
        EtcdCoordination::connect(&config).await.unwrap()
    }

    /// Client with a 3s lease: keep-alives every second, local deadline at 2.7s
    async fn short_lease(server: &MockServer, first: i64, second: i64) -> EtcdCoordination {
        Mock::given(method("POST"))
            .and(path("/v3/lease/grant"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ID": first.to_string(), "TTL": "3" })))
            .up_to_n_times(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/lease/grant"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "ID": second.to_string(), "TTL": "3" }))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(server)
            .await;

        let config = CoordinationConfig {
            endpoints: vec![server.uri()],
            session_timeout_ms: 3_000,
            retry_max_tries: 1,
            ..Default::default()
        };
        EtcdCoordination::connect(&config).await.unwrap()
    }

    /// Record every connection state until `until` is seen
    async fn states_until(
        client: &EtcdCoordination,
        until: ConnectionState,
        within: Duration,
    ) -> Vec<ConnectionState> {
        let mut events = client.connection_events();
        let mut seen = Vec::new();
        let reached = tokio::time::timeout(within, async {
            while events.changed().await.is_ok() {
                let state = *events.borrow_and_update();
                seen.push(state);
                if state == until {
                    break;
                }
            }
        })
        .await;
        assert!(reached.is_ok(), "never reached {:?}, saw {:?}", until, seen);
        seen
    }

    #[test]
    fn test_safety_margin() {
        assert_eq!(safety_margin(Duration::from_secs(60)), Duration::from_secs(6));
        assert_eq!(safety_margin(Duration::from_secs(1)), Duration::from_millis(100));
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"/p/agents/"), b"/p/agents0".to_vec());
        assert_eq!(prefix_end(&[b'a', 0xff]), b"b".to_vec());
    }

    #[tokio::test]
    async fn test_connect_establishes_session() {
        let server = MockServer::start().await;
        let client = connected(&server).await;

        assert_eq!(client.session_id(), Some(SessionId(7587)));
        assert_eq!(
            *client.connection_events().borrow(),
            ConnectionState::Connected(SessionId(7587))
        );
    }

    #[tokio::test]
    async fn test_get_decodes_value() {
        let server = MockServer::start().await;
        let client = connected(&server).await;

        Mock::given(method("POST"))
            .and(path("/v3/kv/range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kvs": [{ "key": BASE64.encode("/portico/requests/r1"), "value": BASE64.encode("{}") }],
                "count": "1",
            })))
            .mount(&server)
            .await;

        assert_eq!(client.get("/requests/r1").await.unwrap(), Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn test_children_from_range() {
        let server = MockServer::start().await;
        let client = connected(&server).await;

        Mock::given(method("POST"))
            .and(path("/v3/kv/range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kvs": [
                    { "key": BASE64.encode("/portico/agents/edge/a1") },
                    { "key": BASE64.encode("/portico/agents/edge/a2") },
                    { "key": BASE64.encode("/portico/agents/core/a3") },
                ],
            })))
            .mount(&server)
            .await;

        assert_eq!(client.children("/agents").await.unwrap(), vec!["core", "edge"]);
    }

    #[tokio::test]
    async fn test_create_ephemeral_conflict() {
        let server = MockServer::start().await;
        let client = connected(&server).await;

        Mock::given(method("POST"))
            .and(path("/v3/kv/txn"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "header": {} })))
            .mount(&server)
            .await;

        assert!(!client.create_ephemeral("/leader", vec![]).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_keepalive_suspends_then_loses_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/lease/keepalive"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let client = short_lease(&server, 42, 43).await;

        let seen = states_until(&client, ConnectionState::Connected(SessionId(43)), Duration::from_secs(6)).await;
        assert_eq!(
            seen,
            vec![
                ConnectionState::Suspended,
                ConnectionState::Lost,
                ConnectionState::Connected(SessionId(43)),
            ]
        );
        assert_eq!(client.session_id(), Some(SessionId(43)));
    }

    #[tokio::test]
    async fn test_hung_keepalive_cannot_outlive_lease() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/lease/keepalive"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "result": { "ID": "42", "TTL": "3" } }))
                    .set_delay(Duration::from_secs(60)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/kv/txn"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "succeeded": true })))
            .mount(&server)
            .await;
        let client = Arc::new(short_lease(&server, 42, 43).await);
        let started = Instant::now();

        let elector = LeaderElector::new(client.clone(), "host-a");
        assert!(elector.try_acquire().await.unwrap());
        assert!(elector.is_leader());

        tokio::time::sleep(Duration::from_millis(2_200)).await;
        assert_eq!(*client.connection_events().borrow(), ConnectionState::Suspended);
        assert!(client.create_ephemeral("/leader", vec![]).await.is_err());

        tokio::time::sleep_until(started + Duration::from_millis(2_800)).await;
        assert!(!elector.is_leader(), "leadership outlived the lease");
        assert!(elector.ensure_leader("write").is_err());
        assert_ne!(client.session_id(), Some(SessionId(42)));
    }

    #[tokio::test]
    async fn test_expired_lease_reported_by_keepalive_is_replaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/lease/keepalive"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": { "ID": "42", "TTL": "0" } })))
            .mount(&server)
            .await;
        let client = short_lease(&server, 42, 43).await;

        let seen = states_until(&client, ConnectionState::Connected(SessionId(43)), Duration::from_millis(2_500)).await;
        assert_eq!(seen, vec![ConnectionState::Lost, ConnectionState::Connected(SessionId(43))]);
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        let client = connected(&server).await;

        Mock::given(method("POST"))
            .and(path("/v3/kv/put"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client.put("/requests/r1", vec![]).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
