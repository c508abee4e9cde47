//! Courier Client. Локальный расчёт стоимости доставки, запросы к backend
//! и живое отслеживание заказов.

mod cli;

use chrono::{DateTime, FixedOffset, Local};
use cli::{Action, ClientSet, ExitCode, exit_err, parse_cli_args};
use commons::errors::CourierError;
use commons::init_simple_logger;
use commons::models::{OrderRecord, OrderStats, ServiceType};
use commons::pricing::{QuoteRequest, calculate_quote, surge_info};
use commons::utils::{format_currency, get_workspace_root};
use courier_client::api::{BackendApi, EstimateRequest, PublicEstimateRequest};
use courier_client::config::{ClientSettings, LOG_FOLDER, POLL_INTERVAL_MS, SHUTDOWN_WAIT_MS};
use courier_client::session::{ConnectionState, TrackingSession};
use courier_client::tracker::{OrderEvent, OrderTracker, TrackingView};
use log::{LevelFilter, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn main() {
    let client_set = parse_cli_args();
    init_logger(client_set.log_level);

    info!("Courier Client запущен: {}", client_set);

    let ClientSet {
        settings, action, ..
    } = client_set;

    let result = match action {
        Action::Quote { request, at } => {
            run_quote(&request, at);
            Ok(())
        }
        Action::Estimate {
            pickup,
            delivery,
            service,
            weight,
            trailer,
        } => run_estimate(&settings, pickup, delivery, service, weight, trailer),
        Action::Track { tracking_numbers } => run_track(&settings, &tracking_numbers),
        Action::History { live } => run_history(&settings, live),
        Action::Cancel { tracking_number } => run_cancel(&settings, &tracking_number),
    };

    if let Err(err) = result {
        let code = match err {
            CourierError::Api { .. } | CourierError::Network(_) | CourierError::Json(_) => {
                ExitCode::BackendFailed
            }
            _ => ExitCode::TrackingFailed,
        };
        exit_err(&err.to_string(), code);
    }

    info!("Courier Client завершён");
}

/// Инициализировать логгер приложения.
///
/// Используется метод [`init_simple_logger`] из крейта [`commons`].
fn init_logger(level: LevelFilter) {
    let log_folder = get_workspace_root().join(LOG_FOLDER);
    let app_name = env!("CARGO_PKG_NAME");
    if let Err(err) = init_simple_logger(app_name, log_folder, level) {
        exit_err(&err.to_string(), ExitCode::LoggerFailed);
    }
}

/// Локальный расчёт с баннером часов пик.
fn run_quote(request: &QuoteRequest, at: Option<DateTime<FixedOffset>>) {
    let at = at.unwrap_or_else(|| Local::now().fixed_offset());
    let surge = surge_info(&at);
    let quote = calculate_quote(request, &at);

    info!(
        "Расчёт {} на {}: {}",
        request.service_type,
        at.format("%Y-%m-%d %H:%M"),
        quote.total_amount
    );
    println!("{}", surge.message);
    println!("{}", quote);
}

fn run_estimate(
    settings: &ClientSettings,
    pickup: String,
    delivery: String,
    service: String,
    weight: Option<f64>,
    trailer: bool,
) -> Result<(), CourierError> {
    let api = BackendApi::new(settings)?;

    let estimate = if api.is_authenticated() {
        let service_type: ServiceType = service.parse()?;
        let request = EstimateRequest::new(pickup, delivery, service_type)
            .weight(weight)
            .with_trailer(trailer);
        api.estimate(&request)?
    } else {
        if trailer {
            warn!("Публичный расчёт не учитывает прицеп");
            println!("Note: trailer is only priced for signed-in customers.");
        }
        api.public_estimate(&PublicEstimateRequest {
            pickup_address: pickup,
            delivery_address: delivery,
            weight,
            service_type: service,
        })?
    };

    println!("Distance:  {:.1} km", estimate.distance_km);
    if let Some(base_fee) = estimate.base_fee {
        println!("Base:      {}", format_currency(base_fee));
    }
    if let Some(trailer_fee) = estimate.trailer_fee {
        println!("Trailer:   {}", format_currency(trailer_fee));
    }
    println!("Price:     {}", format_currency(estimate.price));
    Ok(())
}

fn run_track(settings: &ClientSettings, tracking_numbers: &[String]) -> Result<(), CourierError> {
    let api = Arc::new(BackendApi::new(settings)?);
    let session = TrackingSession::websocket(settings.session_config());
    let tracker = OrderTracker::new(session.clone(), api);

    let views = tracking_numbers
        .iter()
        .map(|tn| tracker.track(tn))
        .collect::<Result<Vec<_>, _>>()?;

    follow(&session, views)
}

fn run_history(settings: &ClientSettings, live: bool) -> Result<(), CourierError> {
    let api = Arc::new(BackendApi::new(settings)?);

    if !live {
        print_history(&api.history()?);
        return Ok(());
    }

    let session = TrackingSession::websocket(settings.session_config());
    let tracker = OrderTracker::new(session.clone(), api);
    let (records, views) = tracker.track_history()?;
    print_history(&records);

    follow(&session, views)
}

fn run_cancel(settings: &ClientSettings, tracking_number: &str) -> Result<(), CourierError> {
    let api = BackendApi::new(settings)?;
    api.cancel(tracking_number)?;
    println!("Order #{} cancelled.", tracking_number);
    Ok(())
}

fn print_history(records: &[OrderRecord]) {
    if records.is_empty() {
        println!("No orders yet.");
        return;
    }

    for record in records {
        println!(
            "#{} | {} | {} -> {} | {}",
            record.tracking_number,
            record.status_label(),
            record.pickup_address,
            record.delivery_address,
            format_currency(record.price)
        );
    }
    println!("{}", OrderStats::from_records(records));
}

/// Печатать обновления, пока все заказы не завершатся или пользователь
/// не нажмёт Ctrl-C.
fn follow(session: &TrackingSession, mut views: Vec<TrackingView>) -> Result<(), CourierError> {
    for view in &views {
        println!("{}", view.current());
    }
    views.retain(|view| !view.is_finished());
    if views.is_empty() {
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .map_err(|err| CourierError::value_err(format!("обработчик Ctrl-C: {err}")))?;

    let states = session.watch_state();
    let mut last_state: Option<ConnectionState> = None;

    while running.load(Ordering::SeqCst) && !views.is_empty() {
        if let Ok(state) = states.recv_timeout(Duration::from_millis(POLL_INTERVAL_MS)) {
            match state {
                ConnectionState::Connected => println!("[live] connected"),
                ConnectionState::Connecting if last_state.is_some() => println!("[live] connecting..."),
                ConnectionState::Disconnected if last_state == Some(ConnectionState::Connected) => {
                    println!("[live] connection lost, reconnecting...")
                }
                _ => {}
            }
            last_state = Some(state);
        }

        for view in views.iter_mut() {
            while let Some(event) = view.try_recv() {
                match event {
                    OrderEvent::Updated(order) => println!("{}", order),
                    OrderEvent::Finished(order) => println!("{} (final)", order),
                }
            }
        }
        views.retain(|view| !view.is_finished());
    }

    if !running.load(Ordering::SeqCst) {
        info!("Отслеживание прервано пользователем");
        println!("Stopped.");
    }

    drop(views);
    if !session.wait_stopped(Duration::from_millis(SHUTDOWN_WAIT_MS)) {
        warn!("Соединение не закрылось за {} мс", SHUTDOWN_WAIT_MS);
    }
    Ok(())
}
