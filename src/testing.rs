//! Scripted collaborators shared by unit tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::{
    config::MatrixLayout,
    device_config::DeviceConfig,
    drivers::VirtualMatrix,
    http::{HttpClient, HttpError, HttpResponse},
    matrix::{Color, MatrixDimensions, MatrixError, MatrixWriter},
    network::WifiLink,
};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

type Reply = Result<HttpResponse, HttpError>;

/// HTTP client answering by URL substring. One-shot replies are consumed
/// before the standing reply for the same pattern. Unmatched URLs get a 404.
#[derive(Default)]
pub struct FakeHttp {
    standing: Mutex<Vec<(String, Reply)>>,
    once: Mutex<Vec<(String, VecDeque<Reply>)>>,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_standing(&self, pattern: &str, reply: Reply) {
        let mut standing = self.standing.lock().unwrap();
        standing.retain(|(p, _)| p != pattern);
        standing.push((pattern.to_string(), reply));
    }

    pub fn respond(&self, pattern: &str, response: HttpResponse) {
        self.set_standing(pattern, Ok(response));
    }

    pub fn fail(&self, pattern: &str, error: HttpError) {
        self.set_standing(pattern, Err(error));
    }

    pub fn respond_once(&self, pattern: &str, response: HttpResponse) {
        let mut once = self.once.lock().unwrap();
        match once.iter_mut().find(|(p, _)| p == pattern) {
            Some((_, queue)) => queue.push_back(Ok(response)),
            None => once.push((pattern.to_string(), VecDeque::from([Ok(response)]))),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, pattern: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.contains(pattern))
            .count()
    }

    fn reply_for(&self, url: &str) -> Reply {
        {
            let mut once = self.once.lock().unwrap();
            if let Some((_, queue)) = once.iter_mut().find(|(p, q)| url.contains(p.as_str()) && !q.is_empty()) {
                if let Some(reply) = queue.pop_front() {
                    return reply;
                }
            }
        }
        self.standing
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| url.contains(p.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| Ok(HttpResponse::new(404, r#"{"message": "Not Found"}"#)))
    }

    async fn handle(&self, method: &'static str, url: &str, headers: &[(String, String)]) -> Reply {
        self.requests.lock().unwrap().push(RecordedRequest {
            method,
            url: url.to_string(),
            headers: headers.to_vec(),
        });
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.reply_for(url)
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn get(&self, url: &str, headers: &[(String, String)], _timeout: Duration) -> Reply {
        self.handle("GET", url, headers).await
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        _body: &str,
        _timeout: Duration,
    ) -> Reply {
        self.handle("POST", url, headers).await
    }
}

/// WiFi link whose state is flipped by the test.
#[derive(Debug)]
pub struct FakeLink {
    connected: AtomicBool,
    scripted: Mutex<VecDeque<bool>>,
    connect_succeeds: AtomicBool,
    access_point: AtomicBool,
    connect_calls: AtomicUsize,
}

impl FakeLink {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            scripted: Mutex::new(VecDeque::new()),
            connect_succeeds: AtomicBool::new(true),
            access_point: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Answers for the next `is_connected` calls, before the flag applies.
    pub fn script(&self, answers: &[bool]) {
        self.scripted.lock().unwrap().extend(answers.iter().copied());
    }

    pub fn set_connect_succeeds(&self, succeeds: bool) {
        self.connect_succeeds.store(succeeds, Ordering::SeqCst);
    }

    pub fn access_point_active(&self) -> bool {
        self.access_point.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WifiLink for FakeLink {
    async fn connect(&self, ssid: &str, _password: &str) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if !self.connect_succeeds.load(Ordering::SeqCst) {
            bail!("association with '{ssid}' failed");
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start_access_point(&self, _ssid: &str, _password: &str) -> Result<()> {
        self.access_point.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_access_point(&self) -> Result<()> {
        self.access_point.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        if let Some(answer) = self.scripted.lock().unwrap().pop_front() {
            return answer;
        }
        self.connected.load(Ordering::SeqCst)
    }
}

/// [`VirtualMatrix`] behind a shared handle so tests can inspect what the
/// state machine drew.
#[derive(Debug, Clone)]
pub struct SharedMatrix(pub Arc<Mutex<VirtualMatrix>>);

impl SharedMatrix {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(VirtualMatrix::new(MatrixLayout::Serpentine))))
    }

    pub fn inspect<R>(&self, f: impl FnOnce(&VirtualMatrix) -> R) -> R {
        f(&self.0.lock().unwrap())
    }

    pub fn fail_next_show(&self) {
        self.0.lock().unwrap().fail_next_show = true;
    }
}

impl MatrixWriter for SharedMatrix {
    fn init(&mut self, dimensions: MatrixDimensions) -> Result<(), MatrixError> {
        self.0.lock().unwrap().init(dimensions)
    }

    fn set_pixel(&mut self, x: usize, y: usize, color: Color) {
        self.0.lock().unwrap().set_pixel(x, y, color);
    }

    fn fill(&mut self, color: Color) {
        self.0.lock().unwrap().fill(color);
    }

    fn show(&mut self) -> Result<(), MatrixError> {
        self.0.lock().unwrap().show()
    }

    fn clear(&mut self) {
        self.0.lock().unwrap().clear();
    }

    fn set_brightness(&mut self, brightness: u8) {
        self.0.lock().unwrap().set_brightness(brightness);
    }

    fn dimensions(&self) -> MatrixDimensions {
        self.0.lock().unwrap().dimensions()
    }
}

pub fn complete_device_config() -> DeviceConfig {
    DeviceConfig {
        wifi_ssid: "home".into(),
        wifi_password: "secret".into(),
        github_token: "ghp_test".into(),
        github_username: "octocat".into(),
        repositories: vec!["octocat/hello".parse().unwrap()],
        ..DeviceConfig::default()
    }
}
