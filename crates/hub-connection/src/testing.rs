//! In-memory hub used by the session tests.
//!
//! Plugs into [`HubClient`](crate::HubClient) through the [`Connector`]
//! trait. Requests are answered per method from a reply table, with the
//! request id echoed back; tests push broadcasts, pings, raw frames or a
//! link closure at will.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{sink, stream};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;

use ezlo_protocol::Message;

use crate::error::WsError;
use crate::transport::{Connector, WsSink, WsStream};

/// How the mock answers one method.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Result(Value),
    Error(Value),
    /// Never answers.
    Silent,
}

type ToClient = mpsc::UnboundedSender<tungstenite::Message>;

#[derive(Default)]
struct State {
    replies: Mutex<HashMap<String, Reply>>,
    requests: Mutex<Vec<Message>>,
    link: Mutex<Option<ToClient>>,
    connects: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    refuse: AtomicBool,
    connect_delay: Mutex<Duration>,
    /// Bumped on every recorded request and every connect.
    activity: Mutex<Option<watch::Sender<usize>>>,
}

impl State {
    fn bump(&self) {
        if let Some(tx) = self.activity.lock().unwrap().as_ref() {
            tx.send_modify(|n| *n += 1);
        }
    }

    fn handle_frame(&self, frame: tungstenite::Message, to_client: &ToClient) {
        let tungstenite::Message::Text(text) = frame else {
            return;
        };
        let request = Message::from_text(&text).expect("client sent malformed JSON");
        let id = request.id().map(str::to_owned);
        let method = request.method().unwrap_or_default().to_string();
        self.requests.lock().unwrap().push(request);
        self.bump();

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&method)
            .cloned()
            .unwrap_or(Reply::Result(json!({})));
        let body = match reply {
            Reply::Result(result) => json!({"id": id, "error": null, "result": result}),
            Reply::Error(error) => json!({"id": id, "error": error, "result": null}),
            Reply::Silent => return,
        };
        let _ = to_client.send(tungstenite::Message::Text(body.to_string().into()));
    }
}

#[derive(Clone)]
pub(crate) struct MockHub {
    state: Arc<State>,
}

impl MockHub {
    pub(crate) fn new() -> Self {
        let state = State::default();
        let (tx, _rx) = watch::channel(0);
        *state.activity.lock().unwrap() = Some(tx);
        Self {
            state: Arc::new(state),
        }
    }

    pub(crate) fn set_reply(&self, method: &str, reply: Reply) {
        self.state
            .replies
            .lock()
            .unwrap()
            .insert(method.to_string(), reply);
    }

    /// Makes subsequent connects fail (or succeed again).
    pub(crate) fn set_refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = delay;
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn max_concurrent_connects(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Requests received so far for `method`, in arrival order.
    pub(crate) fn requests(&self, method: &str) -> Vec<Message> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.method() == Some(method))
            .cloned()
            .collect()
    }

    pub(crate) fn request_count(&self, method: &str) -> usize {
        self.requests(method).len()
    }

    /// Waits until a request for `method` has been received.
    pub(crate) async fn wait_for_request(&self, method: &str) -> Message {
        let mut rx = self.subscribe();
        loop {
            if let Some(msg) = self.requests(method).pop() {
                return msg;
            }
            rx.changed().await.expect("mock hub dropped");
        }
    }

    /// Waits until at least `n` connects have been attempted.
    pub(crate) async fn wait_for_connects(&self, n: usize) {
        let mut rx = self.subscribe();
        while self.connect_count() < n {
            rx.changed().await.expect("mock hub dropped");
        }
    }

    fn subscribe(&self) -> watch::Receiver<usize> {
        self.state
            .activity
            .lock()
            .unwrap()
            .as_ref()
            .expect("activity channel")
            .subscribe()
    }

    /// Sends a frame on the current link. Returns false if there is none.
    pub(crate) fn send_frame(&self, frame: tungstenite::Message) -> bool {
        match self.state.link.lock().unwrap().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub(crate) fn broadcast(&self, body: Value) -> bool {
        self.send_frame(tungstenite::Message::Text(body.to_string().into()))
    }

    pub(crate) fn send_raw(&self, text: &str) -> bool {
        self.send_frame(tungstenite::Message::Text(text.into()))
    }

    /// Heartbeat.
    pub(crate) fn ping(&self) -> bool {
        self.send_frame(tungstenite::Message::Ping(Vec::<u8>::new().into()))
    }

    /// Ends the current link from the hub side.
    pub(crate) fn close_connection(&self) {
        self.state.link.lock().unwrap().take();
    }
}

impl Connector for MockHub {
    fn connect<'a>(
        &'a self,
        _url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(WsSink, WsStream), WsError>> + Send + 'a>> {
        Box::pin(async move {
            let state = self.state.clone();
            state.connects.fetch_add(1, Ordering::SeqCst);
            let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_in_flight.fetch_max(now, Ordering::SeqCst);
            state.bump();

            let delay = *state.connect_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            state.in_flight.fetch_sub(1, Ordering::SeqCst);

            if state.refuse.load(Ordering::SeqCst) {
                return Err(WsError::from(tungstenite::Error::ConnectionClosed));
            }

            let (to_client, from_hub) = mpsc::unbounded_channel::<tungstenite::Message>();
            *state.link.lock().unwrap() = Some(to_client.clone());

            let read = stream::unfold(from_hub, |mut rx| async move {
                rx.recv()
                    .await
                    .map(|frame| (Ok::<_, tungstenite::Error>(frame), rx))
            });
            // The write side only holds a weak reference to the link so a
            // hub-side close ends the read stream.
            let weak = to_client.downgrade();
            drop(to_client);
            let write = sink::unfold(
                (state, weak),
                |(state, weak), frame: tungstenite::Message| async move {
                    if let Some(tx) = weak.upgrade() {
                        state.handle_frame(frame, &tx);
                    }
                    Ok::<_, tungstenite::Error>((state, weak))
                },
            );

            Ok((Box::pin(write) as WsSink, Box::pin(read) as WsStream))
        })
    }
}
