//! Живое отслеживание заказов поверх [`TrackingSession`].
//!
//! Каждый заказ подписан не более одного раза, сколько бы представлений
//! ([`TrackingView`]) его ни отслеживали. Обновления раздаются всем
//! представлениям заказа. После терминального статуса трекер сам отменяет
//! подписку и забывает заказ.

use crate::config::order_topic;
use crate::session::{SessionLease, SubscriptionHandle, TrackingSession};
use crate::stomp::Frame;
use commons::errors::CourierError;
use commons::models::{OrderRecord, OrderStats, OrderUpdate, TrackedOrder, UpdateOutcome};
use commons::traits::OrderSource;
use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

static VIEWS_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Сгенерировать уникальный ID представления.
fn gen_view_id() -> usize {
    VIEWS_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
}

/// Событие по отслеживаемому заказу.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    /// Статус или местоположение изменились.
    Updated(TrackedOrder),
    /// Заказ достиг терминального статуса, обновлений больше не будет.
    Finished(TrackedOrder),
}

impl OrderEvent {
    pub fn order(&self) -> &TrackedOrder {
        match self {
            OrderEvent::Updated(order) | OrderEvent::Finished(order) => order,
        }
    }
}

/// Отслеживаемый заказ и его слушатели.
struct OrderEntry {
    order: TrackedOrder,
    views: HashMap<usize, Sender<OrderEvent>>,
    handle: Option<SubscriptionHandle>,
}

struct TrackerShared {
    session: TrackingSession,
    orders: Mutex<HashMap<String, OrderEntry>>,
}

impl TrackerShared {
    /// Обработать сообщение топика заказа.
    ///
    /// Вызывается в рабочем потоке сессии.
    fn on_message(self: &Arc<Self>, tracking_number: &str, frame: &Frame) {
        let update = match frame.body.parse::<OrderUpdate>() {
            Ok(update) => update,
            Err(err) => {
                warn!("Заказ {}: {}; сообщение отброшено", tracking_number, err);
                return;
            }
        };

        let finished = {
            let mut orders = match self.orders.lock() {
                Ok(orders) => orders,
                Err(_) => {
                    error!("Трекер: ошибка блокировки реестра заказов");
                    return;
                }
            };
            let Some(entry) = orders.get_mut(tracking_number) else {
                debug!("Заказ {}: обновление после снятия с отслеживания", tracking_number);
                return;
            };

            match entry.order.apply(&update) {
                Ok(UpdateOutcome::Unchanged) => return,
                Ok(outcome) => debug!("Заказ {}: {:?}", tracking_number, outcome),
                Err(err) => {
                    warn!("{}; обновление отброшено", err);
                    return;
                }
            }

            let snapshot = entry.order.clone();
            if snapshot.is_finished() {
                info!("Заказ {}: {}, отслеживание завершено", tracking_number, snapshot.status);
                orders.remove(tracking_number).map(|entry| {
                    for tx in entry.views.values() {
                        let _ = tx.send(OrderEvent::Finished(snapshot.clone()));
                    }
                    entry.handle
                })
            } else {
                info!("Заказ {}: {}", tracking_number, snapshot);
                entry
                    .views
                    .retain(|_, tx| tx.send(OrderEvent::Updated(snapshot.clone())).is_ok());
                None
            }
        };

        if let Some(handle) = finished.flatten() {
            self.release(tracking_number, handle);
        }
    }

    /// Отсоединить представление. Последнее представление снимает заказ
    /// с отслеживания.
    fn detach(self: &Arc<Self>, tracking_number: &str, view_id: usize) {
        let handle = {
            let mut orders = match self.orders.lock() {
                Ok(orders) => orders,
                Err(_) => {
                    error!("Трекер: ошибка блокировки реестра заказов");
                    return;
                }
            };
            let Some(entry) = orders.get_mut(tracking_number) else {
                return;
            };
            entry.views.remove(&view_id);
            if !entry.views.is_empty() {
                return;
            }
            debug!("Заказ {}: последнее представление закрыто", tracking_number);
            orders.remove(tracking_number).and_then(|entry| entry.handle)
        };

        if let Some(handle) = handle {
            self.release(tracking_number, handle);
        }
    }

    /// Подписаться на топик заказа.
    fn subscribe_order(
        self: &Arc<Self>,
        tracking_number: &str,
    ) -> Result<SubscriptionHandle, CourierError> {
        let weak = Arc::downgrade(self);
        let number = tracking_number.to_string();
        self.session
            .subscribe(&order_topic(tracking_number), move |frame: &Frame| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_message(&number, frame);
                }
            })
    }

    /// Отменить подписку заказа, снятого с отслеживания.
    ///
    /// Вызывается без блокировки реестра заказов. За это время заказ могли
    /// снова взять на отслеживание и получить от сессии ту же подписку:
    /// такой заказ подписывается заново.
    fn release(self: &Arc<Self>, tracking_number: &str, handle: SubscriptionHandle) {
        handle.unsubscribe();

        let mut orders = match self.orders.lock() {
            Ok(orders) => orders,
            Err(_) => {
                error!("Трекер: ошибка блокировки реестра заказов");
                return;
            }
        };
        let Some(entry) = orders.get_mut(tracking_number) else {
            return;
        };
        if entry.handle.as_ref().is_some_and(|h| !h.is_active()) {
            match self.subscribe_order(tracking_number) {
                Ok(fresh) => {
                    debug!("Заказ {}: подписка восстановлена", tracking_number);
                    entry.handle = Some(fresh);
                }
                Err(err) => error!("Заказ {}: подписка не восстановлена: {}", tracking_number, err),
            }
        }
    }
}

/// Трекер заказов.
pub struct OrderTracker<S: OrderSource> {
    source: S,
    shared: Arc<TrackerShared>,
}

impl<S: OrderSource> OrderTracker<S> {
    /// ## Args
    ///
    /// - `session` — общая STOMP-сессия
    /// - `source` — источник начального состояния заказов (REST backend)
    pub fn new(session: TrackingSession, source: S) -> Self {
        Self {
            source,
            shared: Arc::new(TrackerShared {
                session,
                orders: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Начать отслеживание заказа.
    ///
    /// Запрашивает текущее состояние у источника. Если заказ ещё не в
    /// терминальном статусе, подписывается на его топик и держит аренду
    /// соединения, пока живёт представление.
    ///
    /// ## Ошибки
    ///
    /// [`CourierError::ValueError`] для пустого трек-номера, ошибки
    /// источника и сессии пробрасываются как есть.
    pub fn track(&self, tracking_number: &str) -> Result<TrackingView, CourierError> {
        let tracking_number = tracking_number.trim();
        if tracking_number.is_empty() {
            return Err(CourierError::value_err("пустой трек-номер"));
        }

        let snapshot = self.source.fetch_order(tracking_number)?;
        self.attach(snapshot)
    }

    /// Загрузить историю заказов и начать отслеживание незавершённых.
    ///
    /// ## Returns
    ///
    /// Историю в порядке backend и представления для нетерминальных заказов.
    /// Записи с неизвестным статусом остаются в истории, но не отслеживаются.
    pub fn track_history(&self) -> Result<(Vec<OrderRecord>, Vec<TrackingView>), CourierError> {
        let records = self.source.order_history()?;
        let views = records
            .iter()
            .filter_map(|record| {
                let tracked = record.to_tracked();
                if tracked.is_none() {
                    warn!(
                        "Заказ {}: неизвестный статус {}, не отслеживается",
                        record.tracking_number, record.status
                    );
                }
                tracked
            })
            .filter(|order| !order.is_finished())
            .map(|order| self.attach(order))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "История: {} заказов, {} отслеживаются",
            records.len(),
            views.len()
        );
        Ok((records, views))
    }

    /// Сводка по заказам истории.
    pub fn stats(&self) -> Result<OrderStats, CourierError> {
        Ok(OrderStats::from_records(&self.source.order_history()?))
    }

    /// Трек-номера заказов, которые сейчас отслеживаются.
    pub fn tracked(&self) -> Vec<String> {
        let mut numbers: Vec<String> = self
            .shared
            .orders
            .lock()
            .map(|orders| orders.keys().cloned().collect())
            .unwrap_or_default();
        numbers.sort();
        numbers
    }

    fn attach(&self, snapshot: TrackedOrder) -> Result<TrackingView, CourierError> {
        let tracking_number = snapshot.tracking_number.clone();
        let id = gen_view_id();
        let (tx, rx) = unbounded();

        if snapshot.is_finished() {
            debug!("Заказ {}: уже {}, подписка не нужна", tracking_number, snapshot.status);
            return Ok(TrackingView {
                id,
                order: snapshot,
                events: rx,
                tracker: Weak::new(),
                _lease: None,
            });
        }

        let lease = self.shared.session.activate()?;

        let current = {
            let mut orders = self.shared.orders.lock()?;
            let entry = orders
                .entry(tracking_number.clone())
                .or_insert_with(|| OrderEntry {
                    order: snapshot.clone(),
                    views: HashMap::new(),
                    handle: None,
                });

            // Свежий снимок может опережать уже известное состояние.
            let update = OrderUpdate {
                status: snapshot.status,
                current_location: snapshot.current_location.clone(),
            };
            if let Err(err) = entry.order.apply(&update) {
                debug!("Снимок устарел: {}", err);
            }

            if entry.handle.is_none() {
                entry.handle = Some(self.shared.subscribe_order(&tracking_number)?);
            }

            entry.views.insert(id, tx);
            entry.order.clone()
        };

        info!("Заказ {}: отслеживание начато ({})", tracking_number, current.status);
        Ok(TrackingView {
            id,
            order: current,
            events: rx,
            tracker: Arc::downgrade(&self.shared),
            _lease: Some(lease),
        })
    }
}

/// Представление отслеживаемого заказа.
///
/// Хранит последнее полученное состояние. Удаление представления
/// синхронно отключает его от обновлений; последнее представление заказа
/// отменяет подписку.
pub struct TrackingView {
    id: usize,
    order: TrackedOrder,
    events: Receiver<OrderEvent>,
    tracker: Weak<TrackerShared>,
    _lease: Option<SessionLease>,
}

impl TrackingView {
    pub fn tracking_number(&self) -> &str {
        &self.order.tracking_number
    }

    /// Последнее известное состояние заказа.
    pub fn current(&self) -> &TrackedOrder {
        &self.order
    }

    pub fn is_finished(&self) -> bool {
        self.order.is_finished()
    }

    /// Дождаться следующего события не дольше `timeout`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<OrderEvent> {
        let event = self.events.recv_timeout(timeout).ok()?;
        self.order = event.order().clone();
        Some(event)
    }

    /// Забрать следующее событие без ожидания.
    pub fn try_recv(&mut self) -> Option<OrderEvent> {
        match self.events.try_recv() {
            Ok(event) => {
                self.order = event.order().clone();
                Some(event)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

impl Drop for TrackingView {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.detach(&self.order.tracking_number, self.id);
        }
    }
}
