//! STOMP-сессия отслеживания заказов.
//!
//! Процесс держит не больше одного физического соединения с брокером.
//! Соединение живёт, пока существует хотя бы одна [`SessionLease`]: первая
//! аренда запускает рабочий поток, освобождение последней подаёт ему сигнал
//! остановки и сразу возвращается. Следующий рабочий поток перед
//! подключением дожидается завершения предыдущего.
//!
//! Реестр подписок хранит намерения пользователя независимо от состояния
//! соединения. Рабочий поток после каждого `CONNECTED` отправляет
//! `SUBSCRIBE` для всех зарегистрированных топиков, поэтому подписки,
//! сделанные до подключения или во время переподключения, не теряются.

use crate::config::SessionConfig;
use crate::stomp::{Command, Frame, HEARTBEAT_FRAME, HeartBeat};
use crate::transport::{Connector, Transport, WsConnector};
use commons::errors::CourierError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use log::{debug, error, info, warn};
use macros::EnumDisplay;
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

static SESSIONS_COUNTER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Идентификатор сессии, рабочим потоком которой является текущий поток.
    static WORKER_OF: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Сгенерировать уникальный ID сессии.
fn gen_session_id() -> usize {
    SESSIONS_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
}

/// Состояние соединения с брокером.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumDisplay)]
pub enum ConnectionState {
    #[str("DISCONNECTED")]
    Disconnected,
    #[str("CONNECTING")]
    Connecting,
    #[str("CONNECTED")]
    Connected,
}

/// Обработчик сообщений топика.
pub type MessageHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Запись реестра подписок.
struct Subscription {
    topic: String,
    handler: MessageHandler,
    active: AtomicBool,
    /// Удерживается на время вызова обработчика.
    in_flight: Mutex<()>,
}

impl Subscription {
    fn deliver(&self, frame: &Frame) {
        let _guard = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.active.load(Ordering::SeqCst) {
            return;
        }

        if catch_unwind(AssertUnwindSafe(|| (self.handler)(frame))).is_err() {
            error!(
                "Обработчик топика {} завершился паникой, сообщение пропущено",
                self.topic
            );
        }
    }
}

/// Дескриптор подписки на топик.
///
/// Копии дескриптора указывают на одну и ту же подписку. Удаление
/// дескриптора подписку не отменяет: для этого есть
/// [`SubscriptionHandle::unsubscribe`].
#[derive(Clone)]
pub struct SubscriptionHandle {
    entry: Arc<Subscription>,
    shared: Weak<Shared>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.entry.topic
    }

    /// Подписка ещё действует.
    pub fn is_active(&self) -> bool {
        self.entry.active.load(Ordering::SeqCst)
    }

    /// Отменить подписку.
    ///
    /// Вне рабочего потока сессии дожидается завершения обработчика, если
    /// тот выполняется прямо сейчас. После возврата обработчик для этой
    /// подписки больше не вызывается. Повторный вызов ничего не делает.
    pub fn unsubscribe(&self) {
        match self.shared.upgrade() {
            Some(shared) => shared.remove(&self.entry),
            None => self.entry.active.store(false, Ordering::SeqCst),
        }
    }

    /// Оба дескриптора относятся к одной подписке.
    pub fn same_as(&self, other: &SubscriptionHandle) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.entry.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Команды рабочему потоку.
#[derive(Debug)]
enum WorkerCommand {
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

struct Worker {
    commands: Sender<WorkerCommand>,
    /// После установки поток больше не меняет состояние соединения.
    stopped: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Учёт аренд соединения.
struct Activation {
    leases: usize,
    /// Меняется при каждой остановке рабочего потока: аренды прошлых
    /// поколений при освобождении игнорируются.
    generation: u64,
    worker: Option<Worker>,
    /// Остановленный, но, возможно, ещё не завершившийся поток.
    retired: Option<JoinHandle<()>>,
}

struct Shared {
    id: usize,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<ConnectionState>,
    watchers: Mutex<Vec<Sender<ConnectionState>>>,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
    /// Канал команд текущего рабочего потока. Отдельно от `activation`,
    /// чтобы обработчики могли отписываться, пока поток останавливают.
    commands: Mutex<Option<Sender<WorkerCommand>>>,
    activation: Mutex<Activation>,
}

impl Shared {
    fn is_worker_thread(&self) -> bool {
        WORKER_OF.with(|w| w.get() == Some(self.id))
    }

    fn send_command(&self, command: WorkerCommand) {
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        match commands.as_ref() {
            Some(tx) => {
                if tx.send(command).is_err() {
                    debug!("Сессия {}: рабочий поток уже остановлен", self.id);
                }
            }
            None => debug!(
                "Сессия {}: соединение не активно, {:?} будет учтена при подключении",
                self.id, command
            ),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.update_state(next, None);
    }

    /// Сменить состояние от имени рабочего потока. Остановленный поток
    /// состояние не меняет.
    fn set_worker_state(&self, stopped: &AtomicBool, next: ConnectionState) {
        self.update_state(next, Some(stopped));
    }

    fn update_state(&self, next: ConnectionState, stopped: Option<&AtomicBool>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if stopped.is_some_and(|s| s.load(Ordering::SeqCst)) || *state == next {
            return;
        }
        info!("Сессия {}: {} -> {}", self.id, *state, next);
        *state = next;

        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|tx| tx.send(next).is_ok());
    }

    fn is_registered(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .map(|subs| subs.contains_key(topic))
            .unwrap_or(false)
    }

    fn registered_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscriptions
            .lock()
            .map(|subs| subs.keys().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    fn remove(&self, entry: &Arc<Subscription>) {
        let removed = match self.subscriptions.lock() {
            Ok(mut subs) => match subs.get(&entry.topic) {
                Some(current) if Arc::ptr_eq(current, entry) => {
                    subs.remove(&entry.topic);
                    true
                }
                _ => false,
            },
            Err(_) => {
                warn!("Сессия {}: ошибка блокировки реестра подписок", self.id);
                false
            }
        };

        entry.active.store(false, Ordering::SeqCst);
        if !self.is_worker_thread() {
            drop(entry.in_flight.lock().unwrap_or_else(PoisonError::into_inner));
        }

        if removed {
            info!("Сессия {}: отписка от {}", self.id, entry.topic);
            self.send_command(WorkerCommand::Unsubscribe(entry.topic.clone()));
        }
    }

    /// Разобрать входящий текст и раздать сообщения подписчикам.
    ///
    /// ## Ошибки
    ///
    /// [`CourierError::Transport`], если брокер прислал `ERROR`: после
    /// него соединение считается потерянным.
    fn dispatch(&self, text: &str) -> Result<(), CourierError> {
        let frames = match Frame::decode_all(text) {
            Ok(frames) => frames,
            Err(err) => {
                warn!("Сессия {}: сообщение отброшено: {}", self.id, err);
                return Ok(());
            }
        };

        for frame in frames {
            match frame.command {
                Command::Message => self.deliver(&frame),
                Command::Error => {
                    let message = frame.get("message").unwrap_or(frame.body.as_str());
                    return Err(CourierError::transport_err(format!(
                        "брокер прислал ERROR: {}",
                        message
                    )));
                }
                Command::Receipt => debug!("Сессия {}: RECEIPT {:?}", self.id, frame.get("receipt-id")),
                other => debug!("Сессия {}: пропущен фрейм {}", self.id, other),
            }
        }
        Ok(())
    }

    fn deliver(&self, frame: &Frame) {
        let Some(topic) = frame.topic() else {
            warn!("Сессия {}: MESSAGE без subscription/destination", self.id);
            return;
        };

        let entry = match self.subscriptions.lock() {
            Ok(subs) => subs.get(topic).cloned(),
            Err(_) => {
                warn!("Сессия {}: ошибка блокировки реестра подписок", self.id);
                return;
            }
        };

        match entry {
            Some(entry) => entry.deliver(frame),
            None => debug!("Сессия {}: сообщение для {} без подписки", self.id, topic),
        }
    }

    /// Остановить рабочий поток. Вызывается под блокировкой `activation`.
    ///
    /// Завершения потока не ждёт: поток закрывает соединение сам, а его
    /// дескриптор переходит к следующему рабочему потоку.
    fn stop_worker(&self, activation: &mut Activation) {
        activation.generation += 1;
        activation.leases = 0;

        let Some(worker) = activation.worker.take() else {
            return;
        };
        *self.commands.lock().unwrap_or_else(PoisonError::into_inner) = None;
        worker.stopped.store(true, Ordering::SeqCst);
        let _ = worker.commands.send(WorkerCommand::Shutdown);
        self.set_state(ConnectionState::Disconnected);

        activation.retired = Some(worker.handle);
    }

    fn release(&self, generation: u64) {
        let mut activation = self.activation.lock().unwrap_or_else(PoisonError::into_inner);
        if activation.generation != generation || activation.leases == 0 {
            return;
        }

        activation.leases -= 1;
        debug!("Сессия {}: аренда освобождена, осталось {}", self.id, activation.leases);
        if activation.leases == 0 {
            info!("Сессия {}: последняя аренда освобождена, соединение закрывается", self.id);
            self.stop_worker(&mut activation);
        }
    }
}

/// Общая сессия отслеживания.
///
/// Клоны указывают на одну и ту же сессию.
#[derive(Clone)]
pub struct TrackingSession {
    shared: Arc<Shared>,
}

impl TrackingSession {
    /// Создать сессию. Соединение открывается при первой [`activate`].
    ///
    /// [`activate`]: TrackingSession::activate
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let shared = Shared {
            id: gen_session_id(),
            config,
            connector,
            state: Mutex::new(ConnectionState::Disconnected),
            watchers: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            commands: Mutex::new(None),
            activation: Mutex::new(Activation {
                leases: 0,
                generation: 0,
                worker: None,
                retired: None,
            }),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Сессия поверх WebSocket.
    pub fn websocket(config: SessionConfig) -> Self {
        let connector = WsConnector::new(config.handshake_timeout);
        Self::new(config, Arc::new(connector))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Взять аренду соединения.
    ///
    /// Первая аренда запускает рабочий поток, который подключается к брокеру
    /// и переподключается при обрывах.
    ///
    /// ## Ошибки
    ///
    /// [`CourierError::Io`], если поток не удалось запустить.
    pub fn activate(&self) -> Result<SessionLease, CourierError> {
        let mut activation = self.shared.activation.lock()?;

        if activation.worker.is_none() {
            let previous = activation.retired.take();
            activation.worker = Some(spawn_worker(&self.shared, previous)?);
        }
        activation.leases += 1;
        debug!("Сессия {}: аренд {}", self.shared.id, activation.leases);

        Ok(SessionLease {
            shared: Arc::clone(&self.shared),
            generation: activation.generation,
        })
    }

    /// Принудительно закрыть соединение независимо от числа аренд.
    ///
    /// Выданные ранее аренды становятся недействительными. Подписки остаются
    /// в реестре и будут восстановлены при следующей [`activate`].
    ///
    /// [`activate`]: TrackingSession::activate
    pub fn deactivate_all(&self) {
        let mut activation = self
            .shared
            .activation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        info!("Сессия {}: принудительное отключение", self.shared.id);
        self.shared.stop_worker(&mut activation);
    }

    /// Дождаться завершения рабочего потока, но не дольше `timeout`.
    ///
    /// ## Returns
    ///
    /// `true`, если активного или завершающегося потока нет.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let stopped = self
                .shared
                .activation
                .lock()
                .map(|a| {
                    a.worker.is_none() && a.retired.as_ref().is_none_or(JoinHandle::is_finished)
                })
                .unwrap_or(true);
            if stopped {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.shared.config.poll_interval);
        }
    }

    /// Число действующих аренд.
    pub fn active_leases(&self) -> usize {
        self.shared
            .activation
            .lock()
            .map(|a| a.leases)
            .unwrap_or_default()
    }

    /// Подписаться на топик.
    ///
    /// Повторная подписка на уже подписанный топик ничего не отправляет
    /// брокеру и возвращает существующий дескриптор; новый обработчик при
    /// этом отбрасывается. Если соединения нет, подписка будет отправлена
    /// сразу после подключения.
    ///
    /// Обработчик вызывается в рабочем потоке сессии. Он может отменять
    /// подписки, но не должен надолго блокироваться.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<SubscriptionHandle, CourierError>
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(CourierError::value_err("пустой топик"));
        }

        let entry = {
            let mut subs = self.shared.subscriptions.lock()?;
            if let Some(existing) = subs.get(topic) {
                debug!("Сессия {}: {} уже подписан", self.shared.id, topic);
                return Ok(self.handle(Arc::clone(existing)));
            }

            let entry = Arc::new(Subscription {
                topic: topic.to_string(),
                handler: Arc::new(handler),
                active: AtomicBool::new(true),
                in_flight: Mutex::new(()),
            });
            subs.insert(topic.to_string(), Arc::clone(&entry));
            entry
        };

        info!("Сессия {}: подписка на {}", self.shared.id, topic);
        self.shared
            .send_command(WorkerCommand::Subscribe(topic.to_string()));
        Ok(self.handle(entry))
    }

    /// Отписаться от топика.
    ///
    /// ## Returns
    ///
    /// `false`, если подписки не было.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let entry = self
            .shared
            .subscriptions
            .lock()
            .ok()
            .and_then(|subs| subs.get(topic.trim()).cloned());

        match entry {
            Some(entry) => {
                self.shared.remove(&entry);
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.shared.is_registered(topic.trim())
    }

    /// Зарегистрированные топики (по алфавиту).
    pub fn topics(&self) -> Vec<String> {
        self.shared.registered_topics()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Канал изменений состояния. Первым приходит текущее состояние.
    pub fn watch_state(&self) -> Receiver<ConnectionState> {
        let (tx, rx) = unbounded();
        let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = tx.send(*state);
        self.shared
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn handle(&self, entry: Arc<Subscription>) -> SubscriptionHandle {
        SubscriptionHandle {
            entry,
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// Аренда соединения. Освобождается при удалении.
#[must_use = "соединение закрывается, как только аренда удалена"]
pub struct SessionLease {
    shared: Arc<Shared>,
    generation: u64,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.shared.release(self.generation);
    }
}

/// Запустить рабочий поток.
///
/// ## Args
///
/// - `shared` — общее состояние сессии
/// - `previous` — остановленный ранее поток, завершения которого новый поток
///   дождётся перед подключением
fn spawn_worker(
    shared: &Arc<Shared>,
    previous: Option<JoinHandle<()>>,
) -> Result<Worker, CourierError> {
    let (tx, rx) = unbounded();
    let worker_shared = Arc::clone(shared);
    let stopped = Arc::new(AtomicBool::new(false));
    let worker_stopped = Arc::clone(&stopped);

    let handle = thread::Builder::new()
        .name(format!("courier-session-{}", shared.id))
        .spawn(move || {
            if previous.is_some_and(|handle| handle.join().is_err()) {
                error!("Сессия {}: предыдущий рабочий поток завершился паникой", worker_shared.id);
            }
            run_worker(worker_shared, rx, worker_stopped)
        })?;

    *shared.commands.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx.clone());
    Ok(Worker {
        commands: tx,
        stopped,
        handle,
    })
}

fn run_worker(shared: Arc<Shared>, commands: Receiver<WorkerCommand>, stopped: Arc<AtomicBool>) {
    WORKER_OF.with(|w| w.set(Some(shared.id)));
    info!("Сессия {}: рабочий поток запущен ({})", shared.id, shared.config.ws_url);

    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        shared.set_worker_state(&stopped, ConnectionState::Connecting);

        match serve_connection(&shared, &commands, &stopped) {
            Ok(()) => break,
            Err(err) => {
                shared.set_worker_state(&stopped, ConnectionState::Disconnected);
                if err.is_recoverable() {
                    warn!(
                        "Сессия {}: соединение потеряно (попытка {}): {}. Повтор через {:?}",
                        shared.id, attempt, err, shared.config.reconnect_delay
                    );
                } else {
                    error!(
                        "Сессия {}: непредвиденная ошибка (попытка {}): {}. Повтор через {:?}",
                        shared.id, attempt, err, shared.config.reconnect_delay
                    );
                }
                if !wait_before_retry(&commands, shared.config.reconnect_delay) {
                    break;
                }
            }
        }
    }

    shared.set_worker_state(&stopped, ConnectionState::Disconnected);
    info!("Сессия {}: рабочий поток остановлен", shared.id);
}

/// Пауза перед переподключением.
///
/// ## Returns
///
/// `false`, если за время паузы пришла команда остановки.
fn wait_before_retry(commands: &Receiver<WorkerCommand>, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        let Some(left) = deadline.checked_duration_since(Instant::now()) else {
            return true;
        };
        match commands.recv_timeout(left) {
            Ok(WorkerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
            Ok(_) => continue,
            Err(RecvTimeoutError::Timeout) => return true,
        }
    }
}

/// Есть ли среди ожидающих команд остановка. Остальные команды во время
/// рукопожатия не нужны: после `CONNECTED` подписки берутся из реестра.
fn shutdown_requested(commands: &Receiver<WorkerCommand>) -> bool {
    loop {
        match commands.try_recv() {
            Ok(WorkerCommand::Shutdown) | Err(TryRecvError::Disconnected) => return true,
            Ok(_) => continue,
            Err(TryRecvError::Empty) => return false,
        }
    }
}

/// Открытое соединение с учётом heart-beat.
struct Link {
    transport: Box<dyn Transport>,
    heartbeat: HeartBeat,
    last_sent: Instant,
    last_seen: Instant,
}

impl Link {
    fn send(&mut self, frame: &Frame) -> Result<(), CourierError> {
        self.transport.send_text(&frame.encode())?;
        self.last_sent = Instant::now();
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<String>, CourierError> {
        let text = self.transport.recv_text(timeout)?;
        if text.is_some() {
            self.last_seen = Instant::now();
        }
        Ok(text)
    }

    /// Отправить heart-beat, если пора, и проверить, что сервер жив.
    fn keep_alive(&mut self) -> Result<(), CourierError> {
        let now = Instant::now();

        let outgoing = self.heartbeat.outgoing;
        if !outgoing.is_zero() && now.duration_since(self.last_sent) >= outgoing {
            self.transport.send_text(HEARTBEAT_FRAME)?;
            self.last_sent = now;
        }

        let silence_limit = self.heartbeat.incoming * 2;
        if !silence_limit.is_zero() && now.duration_since(self.last_seen) > silence_limit {
            return Err(CourierError::transport_err(format!(
                "сервер молчит дольше {:?}",
                silence_limit
            )));
        }
        Ok(())
    }
}

/// Одно соединение: подключение, рукопожатие, обслуживание.
///
/// ## Returns
///
/// `Ok(())` при штатной остановке, ошибку при потере соединения.
fn serve_connection(
    shared: &Shared,
    commands: &Receiver<WorkerCommand>,
    stopped: &AtomicBool,
) -> Result<(), CourierError> {
    let mut transport = shared.connector.connect(&shared.config.ws_url)?;
    if shutdown_requested(commands) {
        debug!("Сессия {}: остановка во время подключения", shared.id);
        transport.close();
        return Ok(());
    }
    let now = Instant::now();
    let mut link = Link {
        transport,
        heartbeat: HeartBeat::default(),
        last_sent: now,
        last_seen: now,
    };

    let result = match handshake(shared, &mut link, commands) {
        Ok(Some(heartbeat)) => {
            link.heartbeat = heartbeat;
            shared.set_worker_state(stopped, ConnectionState::Connected);
            serve(shared, &mut link, commands)
        }
        Ok(None) => Ok(()),
        Err(err) => Err(err),
    };

    link.transport.close();
    result
}

/// Отправить `CONNECT` и дождаться `CONNECTED`.
///
/// ## Returns
///
/// Согласованный heart-beat или `None`, если во время ожидания пришла
/// команда остановки.
fn handshake(
    shared: &Shared,
    link: &mut Link,
    commands: &Receiver<WorkerCommand>,
) -> Result<Option<HeartBeat>, CourierError> {
    let config = &shared.config;
    let requested = HeartBeat::symmetric(config.heartbeat);
    link.send(&Frame::connect(&config.host(), config.token.as_deref(), requested))?;

    let deadline = Instant::now() + config.handshake_timeout;
    loop {
        if shutdown_requested(commands) {
            return Ok(None);
        }
        let Some(left) = deadline.checked_duration_since(Instant::now()) else {
            return Err(CourierError::handshake_err(format!(
                "нет CONNECTED за {:?}",
                config.handshake_timeout
            )));
        };

        let Some(text) = link.recv(left.min(config.poll_interval))? else {
            continue;
        };
        for frame in Frame::decode_all(&text)? {
            match frame.command {
                Command::Connected => {
                    let server = match frame.get("heart-beat") {
                        Some(raw) => raw.parse::<HeartBeat>()?,
                        None => HeartBeat::default(),
                    };
                    let negotiated = requested.negotiate(&server);
                    info!(
                        "Сессия {}: STOMP {} установлен, heart-beat {}",
                        shared.id,
                        frame.get("version").unwrap_or("1.2"),
                        negotiated
                    );
                    return Ok(Some(negotiated));
                }
                Command::Error => {
                    let message = frame.get("message").unwrap_or(frame.body.as_str());
                    return Err(CourierError::handshake_err(message.to_string()));
                }
                other => debug!("Сессия {}: до CONNECTED пропущен {}", shared.id, other),
            }
        }
    }
}

/// Цикл обслуживания установленного соединения.
fn serve(
    shared: &Shared,
    link: &mut Link,
    commands: &Receiver<WorkerCommand>,
) -> Result<(), CourierError> {
    let mut attached: HashSet<String> = HashSet::new();
    for topic in shared.registered_topics() {
        link.send(&Frame::subscribe(&topic))?;
        debug!("Сессия {}: SUBSCRIBE {}", shared.id, topic);
        attached.insert(topic);
    }

    loop {
        loop {
            match commands.try_recv() {
                Ok(WorkerCommand::Subscribe(topic)) => {
                    if !attached.contains(&topic) && shared.is_registered(&topic) {
                        link.send(&Frame::subscribe(&topic))?;
                        debug!("Сессия {}: SUBSCRIBE {}", shared.id, topic);
                        attached.insert(topic);
                    }
                }
                Ok(WorkerCommand::Unsubscribe(topic)) => {
                    if !shared.is_registered(&topic) && attached.remove(&topic) {
                        link.send(&Frame::unsubscribe(&topic))?;
                        debug!("Сессия {}: UNSUBSCRIBE {}", shared.id, topic);
                    }
                }
                Ok(WorkerCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    if let Err(err) = link.send(&Frame::disconnect()) {
                        debug!("Сессия {}: DISCONNECT не отправлен: {}", shared.id, err);
                    }
                    return Ok(());
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        link.keep_alive()?;

        if let Some(text) = link.recv(shared.config.poll_interval)? {
            shared.dispatch(&text)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, ServerEnd, SlowConnector, WAIT, test_config, wait_until};

    const TOPIC: &str = "/topic/order/TMOF-1";

    fn session() -> (TrackingSession, Arc<FakeConnector>, Receiver<ServerEnd>) {
        let (connector, servers) = FakeConnector::new();
        let session = TrackingSession::new(test_config(), connector.clone());
        (session, connector, servers)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Frame) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move |_: &Frame| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn connected(session: &TrackingSession) -> bool {
        wait_until(|| session.connection_state() == ConnectionState::Connected)
    }

    #[test]
    fn queued_subscription_is_sent_after_connect() {
        let (session, _, servers) = session();
        let (count, handler) = counter();
        session.subscribe(TOPIC, handler).unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);

        let _lease = session.activate().unwrap();
        let server = servers.recv_timeout(WAIT).unwrap();
        let connect = server.accept();
        assert_eq!(connect.get("Authorization"), Some("Bearer test-jwt"));
        assert_eq!(connect.get("host"), Some("broker.test"));

        let subscribe = server.expect(Command::Subscribe);
        assert_eq!(subscribe.get("destination"), Some(TOPIC));
        assert_eq!(subscribe.get("id"), Some(TOPIC));
        assert!(connected(&session));

        server.message(TOPIC, r#"{"status":"IN_TRANSIT"}"#);
        assert!(wait_until(|| count.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn duplicate_subscribe_keeps_first_handler() {
        let (session, _, servers) = session();
        let _lease = session.activate().unwrap();
        let server = servers.recv_timeout(WAIT).unwrap();
        server.accept();
        assert!(connected(&session));

        let (first, first_handler) = counter();
        let (second, second_handler) = counter();
        let a = session.subscribe(TOPIC, first_handler).unwrap();
        let b = session.subscribe(TOPIC, second_handler).unwrap();
        assert!(a.same_as(&b));

        server.expect(Command::Subscribe);
        server.assert_quiet(Duration::from_millis(100));

        server.message(TOPIC, "{}");
        assert!(wait_until(|| first.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(session.topics(), vec![TOPIC.to_string()]);
    }

    #[test]
    fn no_delivery_after_unsubscribe() {
        let (session, _, servers) = session();
        let _lease = session.activate().unwrap();
        let server = servers.recv_timeout(WAIT).unwrap();
        server.accept();

        let (count, handler) = counter();
        let handle = session.subscribe(TOPIC, handler).unwrap();
        server.expect(Command::Subscribe);

        handle.unsubscribe();
        assert!(!handle.is_active());
        assert!(!session.is_subscribed(TOPIC));
        let unsubscribe = server.expect(Command::Unsubscribe);
        assert_eq!(unsubscribe.get("id"), Some(TOPIC));

        server.message(TOPIC, "{}");
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        handle.unsubscribe();
        assert!(!session.unsubscribe(TOPIC));
    }

    #[test]
    fn unsubscribe_waits_for_running_handler() {
        let (session, _, servers) = session();
        let _lease = session.activate().unwrap();
        let server = servers.recv_timeout(WAIT).unwrap();
        server.accept();

        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        let handle = session
            .subscribe(TOPIC, move |_| {
                s.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(200));
                f.store(true, Ordering::SeqCst);
            })
            .unwrap();
        server.expect(Command::Subscribe);

        server.message(TOPIC, "{}");
        assert!(wait_until(|| started.load(Ordering::SeqCst)));
        handle.unsubscribe();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let (session, _, servers) = session();
        let _lease = session.activate().unwrap();
        let server = servers.recv_timeout(WAIT).unwrap();
        server.accept();

        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let handle = session
            .subscribe(TOPIC, move |_| {
                if let Some(handle) = inner.lock().unwrap().take() {
                    handle.unsubscribe();
                }
            })
            .unwrap();
        *slot.lock().unwrap() = Some(handle);
        server.expect(Command::Subscribe);

        server.message(TOPIC, "{}");
        server.expect(Command::Unsubscribe);
        assert!(session.topics().is_empty());
    }

    #[test]
    fn unsubscribe_while_disconnected_sends_nothing_later() {
        let (session, _, servers) = session();
        let (_, handler) = counter();
        let handle = session.subscribe(TOPIC, handler).unwrap();
        handle.unsubscribe();

        let _lease = session.activate().unwrap();
        let server = servers.recv_timeout(WAIT).unwrap();
        server.accept();
        server.assert_quiet(Duration::from_millis(100));
    }

    #[test]
    fn malformed_frames_and_panics_are_isolated() {
        let (session, _, servers) = session();
        let _lease = session.activate().unwrap();
        let server = servers.recv_timeout(WAIT).unwrap();
        server.accept();

        session.subscribe("/topic/order/PANIC", |_| panic!("boom")).unwrap();
        let (count, handler) = counter();
        session.subscribe(TOPIC, handler).unwrap();
        server.expect(Command::Subscribe);
        server.expect(Command::Subscribe);

        server.send_raw("GARBAGE WITHOUT HEADERS");
        server.message("/topic/order/PANIC", "{}");
        server.message(TOPIC, "{}");

        assert!(wait_until(|| count.load(Ordering::SeqCst) == 1));
        assert_eq!(session.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn reconnects_and_restores_subscriptions() {
        let (session, connector, servers) = session();
        connector.fail_next(1);
        let (count, handler) = counter();
        session.subscribe(TOPIC, handler).unwrap();

        let _lease = session.activate().unwrap();
        let first = servers.recv_timeout(WAIT).unwrap();
        first.accept();
        first.expect(Command::Subscribe);
        assert_eq!(connector.attempts(), 2);

        first.close();
        let second = servers.recv_timeout(WAIT).unwrap();
        second.accept();
        let subscribe = second.expect(Command::Subscribe);
        assert_eq!(subscribe.get("destination"), Some(TOPIC));

        second.message(TOPIC, "{}");
        assert!(wait_until(|| count.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn handshake_error_triggers_retry() {
        let (session, connector, servers) = session();
        let _lease = session.activate().unwrap();

        let first = servers.recv_timeout(WAIT).unwrap();
        first.expect(Command::Connect);
        first.send(Frame::new(Command::Error).header("message", "Invalid token"));

        let second = servers.recv_timeout(WAIT).unwrap();
        second.accept();
        assert!(connected(&session));
        assert_eq!(connector.attempts(), 2);
    }

    #[test]
    fn silent_server_is_detected_by_heartbeat() {
        let (connector, servers) = FakeConnector::new();
        let mut config = test_config();
        config.heartbeat = Duration::from_millis(40);
        let session = TrackingSession::new(config, connector);
        let _lease = session.activate().unwrap();

        let first = servers.recv_timeout(WAIT).unwrap();
        let connect = first.accept_with_heartbeat("40,40");
        assert_eq!(connect.get("heart-beat"), Some("40,40"));
        assert_eq!(first.next_text().as_deref(), Some(HEARTBEAT_FRAME));

        let second = servers.recv_timeout(WAIT).unwrap();
        second.accept();
    }

    #[test]
    fn last_lease_closes_connection() {
        let (session, _, servers) = session();
        let a = session.activate().unwrap();
        let b = session.activate().unwrap();
        assert_eq!(session.active_leases(), 2);

        let server = servers.recv_timeout(WAIT).unwrap();
        server.accept();
        assert!(connected(&session));
        assert!(servers.try_recv().is_err());

        drop(a);
        server.assert_quiet(Duration::from_millis(50));
        assert_eq!(session.connection_state(), ConnectionState::Connected);

        drop(b);
        server.expect(Command::Disconnect);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(session.active_leases(), 0);
    }

    #[test]
    fn forced_teardown_invalidates_old_leases() {
        let (session, _, servers) = session();
        let old = session.activate().unwrap();
        let first = servers.recv_timeout(WAIT).unwrap();
        first.accept();
        assert!(connected(&session));

        session.deactivate_all();
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        first.expect(Command::Disconnect);

        let _fresh = session.activate().unwrap();
        let server = servers.recv_timeout(WAIT).unwrap();
        server.accept();
        assert!(connected(&session));

        drop(old);
        assert_eq!(session.active_leases(), 1);
        assert_eq!(session.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn state_changes_are_broadcast() {
        let (session, _, servers) = session();
        let states = session.watch_state();
        assert_eq!(states.recv().unwrap(), ConnectionState::Disconnected);

        let lease = session.activate().unwrap();
        let server = servers.recv_timeout(WAIT).unwrap();
        server.accept();
        assert_eq!(states.recv_timeout(WAIT).unwrap(), ConnectionState::Connecting);
        assert_eq!(states.recv_timeout(WAIT).unwrap(), ConnectionState::Connected);

        drop(lease);
        assert_eq!(states.recv_timeout(WAIT).unwrap(), ConnectionState::Disconnected);
        server.expect(Command::Disconnect);
        assert!(session.wait_stopped(WAIT));
        assert!(states.try_recv().is_err());
    }

    #[test]
    fn releasing_lease_does_not_wait_for_connect() {
        let (inner, servers) = FakeConnector::new();
        let connector = SlowConnector::new(inner, Duration::from_millis(400));
        let session = TrackingSession::new(test_config(), connector);

        let lease = session.activate().unwrap();
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        drop(lease);

        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(!session.wait_stopped(Duration::ZERO));

        assert!(session.wait_stopped(WAIT));
        let abandoned = servers.recv_timeout(WAIT).unwrap();
        abandoned.assert_quiet(Duration::from_millis(50));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn next_activation_waits_for_stopping_worker() {
        let (inner, servers) = FakeConnector::new();
        let connector = SlowConnector::new(inner, Duration::from_millis(200));
        let session = TrackingSession::new(test_config(), connector);

        let lease = session.activate().unwrap();
        thread::sleep(Duration::from_millis(50));
        drop(lease);
        let _again = session.activate().unwrap();

        let abandoned = servers.recv_timeout(WAIT).unwrap();
        let server = servers.recv_timeout(WAIT).unwrap();
        server.accept();
        assert!(connected(&session));
        abandoned.assert_quiet(Duration::from_millis(50));
        assert_eq!(session.active_leases(), 1);
    }

    #[test]
    fn empty_topic_is_rejected() {
        let (session, _, _) = session();
        let result = session.subscribe("  ", |_| {});
        assert!(matches!(result, Err(CourierError::ValueError(_))));
    }
}
