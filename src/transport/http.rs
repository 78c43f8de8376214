//! HTTP transport
//!
//! "Sending" a message POSTs its envelope to a URL derived from the channel.
//! Requests wait in three bounded sub-queues (critical/high, normal, low) and
//! are processed one at a time. A network error re-queues the request at its
//! original priority until the message's retry budget is spent; after that,
//! and for any non-2xx status, the message is handed back as a non-retriable
//! failure.
//!
//! A response body holding an envelope is delivered as an inbound message.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use super::message::{self, Envelope};
use super::{Transport, TransportEvents, Worker, send_via};
use crate::bus::message::{Message, Priority, Protocol};
use crate::config::HttpSettings;
use crate::utils::error::TransportError;

/// A prepared POST, after default headers and request interceptors ran.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub message: Message,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    /// Re-sends caused by network errors so far.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub message_id: String,
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// Hook run around every request. Both methods default to doing nothing.
pub trait HttpInterceptor: Send + Sync {
    fn on_request(&self, _request: &mut HttpRequest) {}

    fn on_response(&self, _response: &HttpResponse) {}
}

pub struct HttpTransport {
    settings: HttpSettings,
    interceptors: Vec<Arc<dyn HttpInterceptor>>,
    worker: Option<Worker>,
}

impl HttpTransport {
    pub fn new(settings: HttpSettings) -> Self {
        Self {
            settings,
            interceptors: Vec::new(),
            worker: None,
        }
    }

    /// Add an interceptor. They run in registration order.
    pub fn with_interceptor(mut self, interceptor: impl HttpInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("settings", &self.settings)
            .field("interceptors", &self.interceptors.len())
            .field("running", &self.worker.is_some())
            .finish()
    }
}

impl Transport for HttpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn connect(&mut self, events: TransportEvents) {
        self.disconnect();
        let settings = self.settings.clone();
        let interceptors = self.interceptors.clone();
        self.worker = Some(Worker::spawn(move |rx| {
            run(settings, interceptors, events, rx)
        }));
    }

    fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
            debug!("HTTP worker for {} stopped", self.settings.base_url);
        }
    }

    fn send(&self, message: Message) -> Result<(), TransportError> {
        send_via(self.worker.as_ref(), message)
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// URL a message on `channel` is posted to. A channel that already is an
/// absolute URL is used as is.
pub fn request_url(base_url: &str, channel: &str) -> String {
    if channel.starts_with("http://") || channel.starts_with("https://") || base_url.is_empty() {
        return channel.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        channel.trim_start_matches('/')
    )
}

/// The three bounded sub-queues, drained highest first.
#[derive(Debug)]
struct RequestQueues {
    queues: [VecDeque<HttpRequest>; 3],
    capacity: usize,
}

impl RequestQueues {
    fn new(capacity: usize) -> Self {
        Self {
            queues: Default::default(),
            capacity,
        }
    }

    fn slot(priority: Priority) -> usize {
        match priority {
            Priority::Critical | Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    fn push(&mut self, request: HttpRequest) -> Result<(), HttpRequest> {
        let queue = &mut self.queues[Self::slot(request.message.priority())];
        if self.capacity > 0 && queue.len() >= self.capacity {
            return Err(request);
        }
        queue.push_back(request);
        Ok(())
    }

    fn pop(&mut self) -> Option<HttpRequest> {
        self.queues.iter_mut().find_map(VecDeque::pop_front)
    }

    fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}

struct Processor {
    client: Client,
    settings: HttpSettings,
    interceptors: Vec<Arc<dyn HttpInterceptor>>,
    queues: RequestQueues,
    events: TransportEvents,
}

async fn run(
    settings: HttpSettings,
    interceptors: Vec<Arc<dyn HttpInterceptor>>,
    events: TransportEvents,
    mut outbound: UnboundedReceiver<Message>,
) {
    let client = match Client::builder().timeout(settings.timeout()).build() {
        Ok(client) => client,
        Err(e) => {
            warn!("Failed to build HTTP client: {e}");
            events.error(TransportError::Connect(e.to_string()));
            events.disconnected();
            return;
        }
    };

    // no persistent connection to establish
    events.connected();
    info!("HTTP transport ready for {}", settings.base_url);

    let mut processor = Processor {
        client,
        queues: RequestQueues::new(settings.queue_capacity),
        settings,
        interceptors,
        events,
    };

    loop {
        if processor.queues.is_empty() {
            match outbound.recv().await {
                Some(message) => processor.admit(message),
                None => return,
            }
        }
        while let Ok(message) = outbound.try_recv() {
            processor.admit(message);
        }
        processor.process_next_request().await;
    }
}

impl Processor {
    fn admit(&mut self, message: Message) {
        let body = match message::encode(&message) {
            Ok(body) => body,
            Err(e) => {
                self.events.send_failed(message, e, false);
                return;
            }
        };

        let mut request = HttpRequest {
            url: request_url(&self.settings.base_url, &message.channel),
            headers: self.settings.headers.clone(),
            body,
            attempts: 0,
            message,
        };
        for interceptor in &self.interceptors {
            interceptor.on_request(&mut request);
        }

        if let Err(request) = self.queues.push(request) {
            let err = TransportError::Capacity(format!(
                "HTTP {:?} queue full ({} requests)",
                request.message.priority(),
                self.settings.queue_capacity
            ));
            self.events.send_failed(request.message, err, false);
        }
    }

    async fn process_next_request(&mut self) {
        let Some(mut request) = self.queues.pop() else {
            return;
        };

        let mut builder = self
            .client
            .post(&request.url)
            .header(CONTENT_TYPE, "application/json")
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let reply = HttpResponse {
                    message_id: request.message.id().to_string(),
                    url: request.url.clone(),
                    status: status.as_u16(),
                    body,
                };
                for interceptor in &self.interceptors {
                    interceptor.on_response(&reply);
                }

                if status.is_success() {
                    self.events.sent(request.message.id());
                    self.deliver_body(&reply);
                } else {
                    warn!("POST {} returned {status}", request.url);
                    self.events.send_failed(
                        request.message,
                        TransportError::Send(format!("HTTP status {status}")),
                        false,
                    );
                }
            }
            Err(e) => {
                let err = if e.is_timeout() {
                    TransportError::Timeout(self.settings.timeout())
                } else {
                    TransportError::Send(e.to_string())
                };

                if request.attempts < request.message.max_retries {
                    request.attempts += 1;
                    debug!(
                        "POST {} failed ({err}), retry {}/{}",
                        request.url, request.attempts, request.message.max_retries
                    );
                    if let Err(request) = self.queues.push(request) {
                        self.events.send_failed(request.message, err, false);
                    }
                } else {
                    warn!("POST {} failed: {err}", request.url);
                    self.events.send_failed(request.message, err, false);
                }
            }
        }
    }

    fn deliver_body(&self, response: &HttpResponse) {
        if response.body.trim().is_empty() {
            return;
        }
        match Envelope::from_slice(response.body.as_bytes()) {
            Ok(envelope) => self.events.received(envelope.into_message(Protocol::Http)),
            Err(e) => debug!("Response from {} is not an envelope: {e}", response.url),
        }
    }
}
