//! STOMP-брокер в памяти для модульных тестов сессии и трекера.

use crate::config::SessionConfig;
use crate::stomp::{Command, Frame};
use crate::transport::{Connector, Transport};
use commons::errors::CourierError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use url::Url;

/// Сколько тесты ждут ожидаемого события.
pub const WAIT: Duration = Duration::from_secs(3);

/// Конфигурация сессии с короткими интервалами и без heart-beat.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        ws_url: Url::parse("ws://broker.test/ws").unwrap(),
        token: Some("test-jwt".into()),
        heartbeat: Duration::ZERO,
        reconnect_delay: Duration::from_millis(50),
        handshake_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(10),
    }
}

/// Ждать выполнения условия не дольше [`WAIT`].
pub fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub enum ServerEvent {
    Text(String),
    Close,
}

/// Фабрика соединений: каждое подключение отдаёт тесту серверный конец.
pub struct FakeConnector {
    servers: Sender<ServerEnd>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> (Arc<FakeConnector>, Receiver<ServerEnd>) {
        let (tx, rx) = unbounded();
        let connector = FakeConnector {
            servers: tx,
            failures: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        };
        (Arc::new(connector), rx)
    }

    /// Следующие `n` подключений завершатся ошибкой.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn connect(&self, _url: &Url) -> Result<Box<dyn Transport>, CourierError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CourierError::transport_err("connection refused"));
        }

        let (to_server, from_client) = unbounded();
        let (to_client, from_server) = unbounded();
        self.servers
            .send(ServerEnd {
                from_client,
                to_client,
            })
            .map_err(|_| CourierError::transport_err("брокер остановлен"))?;

        Ok(Box::new(FakeTransport {
            to_server,
            from_server,
        }))
    }
}

/// Подключение, которое перед соединением ждёт `delay`.
pub struct SlowConnector {
    inner: Arc<FakeConnector>,
    delay: Duration,
}

impl SlowConnector {
    pub fn new(inner: Arc<FakeConnector>, delay: Duration) -> Arc<SlowConnector> {
        Arc::new(SlowConnector { inner, delay })
    }
}

impl Connector for SlowConnector {
    fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, CourierError> {
        thread::sleep(self.delay);
        self.inner.connect(url)
    }
}

struct FakeTransport {
    to_server: Sender<String>,
    from_server: Receiver<ServerEvent>,
}

impl Transport for FakeTransport {
    fn send_text(&mut self, text: &str) -> Result<(), CourierError> {
        self.to_server
            .send(text.to_string())
            .map_err(|_| CourierError::transport_err("сервер отключился"))
    }

    fn recv_text(&mut self, timeout: Duration) -> Result<Option<String>, CourierError> {
        match self.from_server.recv_timeout(timeout) {
            Ok(ServerEvent::Text(text)) => Ok(Some(text)),
            Ok(ServerEvent::Close) => Err(CourierError::transport_err("сервер закрыл соединение")),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(CourierError::transport_err("сервер отключился"))
            }
        }
    }

    fn close(&mut self) {}
}

/// Серверная сторона одного соединения.
pub struct ServerEnd {
    from_client: Receiver<String>,
    to_client: Sender<ServerEvent>,
}

impl ServerEnd {
    /// Следующий сырой текст от клиента.
    pub fn next_text(&self) -> Option<String> {
        self.from_client.recv_timeout(WAIT).ok()
    }

    /// Следующий фрейм клиента (heart-beat пропускаются).
    pub fn next_frame(&self) -> Option<Frame> {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.checked_duration_since(Instant::now())?;
            let text = self.from_client.recv_timeout(left).ok()?;
            let mut frames = Frame::decode_all(&text).unwrap();
            if !frames.is_empty() {
                return Some(frames.remove(0));
            }
        }
    }

    /// Следующий фрейм обязан иметь команду `command`.
    pub fn expect(&self, command: Command) -> Frame {
        let frame = self
            .next_frame()
            .unwrap_or_else(|| panic!("клиент не прислал {command}"));
        assert_eq!(frame.command, command, "получен {:?}", frame);
        frame
    }

    /// Принять `CONNECT` и ответить `CONNECTED` без heart-beat.
    pub fn accept(&self) -> Frame {
        self.accept_with_heartbeat("0,0")
    }

    pub fn accept_with_heartbeat(&self, heartbeat: &str) -> Frame {
        let connect = self.expect(Command::Connect);
        self.send(
            Frame::new(Command::Connected)
                .header("version", "1.2")
                .header("heart-beat", heartbeat),
        );
        connect
    }

    pub fn send(&self, frame: Frame) {
        self.send_raw(&frame.encode());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(ServerEvent::Text(text.to_string()));
    }

    /// Сообщение в топик.
    pub fn message(&self, topic: &str, body: &str) {
        self.send(
            Frame::new(Command::Message)
                .header("subscription", topic)
                .header("destination", topic)
                .header("message-id", "m-1")
                .body(body),
        );
    }

    /// Разорвать соединение со стороны сервера.
    pub fn close(&self) {
        let _ = self.to_client.send(ServerEvent::Close);
    }

    /// За время `wait` клиент не прислал ни одного фрейма.
    pub fn assert_quiet(&self, wait: Duration) {
        let deadline = Instant::now() + wait;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.from_client.recv_timeout(left) {
                Ok(text) => {
                    let frames = Frame::decode_all(&text).unwrap();
                    assert!(frames.is_empty(), "неожиданные фреймы: {:?}", frames);
                }
                Err(_) => break,
            }
        }
    }
}
