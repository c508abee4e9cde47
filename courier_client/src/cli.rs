//! Обработка аргументов командной строки при запуске приложения.
//!
//! ## Пример
//!
//! ```text
//! $ courier quote --service SAME_DAY --distance 23 --weight 5
//! $ courier track TMOF-1001 TMOF-1002
//! $ courier history --live
//! ```

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};
use clap::{Parser, Subcommand};
use commons::pricing::QuoteRequest;
use courier_client::config::{ClientSettings, ENV_JWT};
use log::{LevelFilter, error};
use std::fmt::{Display, Formatter};
use std::process::exit;

/// Перечисление ошибок при завершении приложения.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Некорректные переменные окружения.
    InvalidEnvironment = 1,
    /// Не удалось инициализировать логгер.
    LoggerFailed,
    /// Backend вернул ошибку или недоступен.
    BackendFailed,
    /// Ошибка живого отслеживания.
    TrackingFailed,
}

impl ExitCode {
    /// Предоставить цифровое значение выбранного перечисления (`u8`).
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Parser)]
#[command(about = "Courier Client. Delivery price quotes and live order tracking.")]
#[command(author, version, long_about = None)]
struct CliArgs {
    /// Bearer token (JWT) for authenticated backend calls.
    #[arg(long, global = true, env = ENV_JWT, hide_env_values = true)]
    token: Option<String>,

    /// Write debug-level events to the log file.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Supported commands.
#[derive(Debug, Subcommand)]
enum Commands {
    /// Local price estimate with a fee breakdown.
    Quote {
        /// Service type (STANDARD, SAME_DAY, SWIFT_ERRAND, INSTANT, FURNITURE_MOVING).
        #[arg(short, long)]
        service: String,
        /// Distance in kilometres.
        #[arg(short, long, value_parser = non_negative_number)]
        distance: f64,
        /// Parcel weight in kilograms.
        #[arg(short, long, value_parser = non_negative_number)]
        weight: f64,
        /// Purchase amount for SWIFT_ERRAND.
        #[arg(short, long, default_value_t = 0.0, value_parser = non_negative_number)]
        purchase: f64,
        /// Add a trailer (FURNITURE_MOVING).
        #[arg(short, long)]
        trailer: bool,
        /// Moment of the quote: RFC 3339 or local `YYYY-MM-DDTHH:MM`.
        #[arg(long, value_parser = parse_moment)]
        at: Option<DateTime<FixedOffset>>,
    },
    /// Backend estimate (authenticated when a token is set, public otherwise).
    Estimate {
        #[arg(long)]
        pickup: String,
        #[arg(long)]
        delivery: String,
        #[arg(short, long)]
        service: String,
        #[arg(short, long, value_parser = non_negative_number)]
        weight: Option<f64>,
        #[arg(short, long)]
        trailer: bool,
    },
    /// Follow orders live until they are delivered or cancelled.
    Track {
        #[arg(required = true, value_parser = tracking_number)]
        tracking_numbers: Vec<String>,
    },
    /// Order history with statistics.
    History {
        /// Keep following every order that is not finished yet.
        #[arg(short, long)]
        live: bool,
    },
    /// Cancel an order.
    Cancel {
        #[arg(value_parser = tracking_number)]
        tracking_number: String,
    },
}

/// Валидатор для расстояния, веса и суммы покупки.
fn non_negative_number(s: &str) -> Result<f64, String> {
    let value: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {s}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("value must be a non-negative number: {s}"));
    }
    Ok(value)
}

/// Валидатор трек-номера.
fn tracking_number(s: &str) -> Result<String, String> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) || trimmed.contains('/') {
        return Err(format!("invalid tracking number: '{s}'"));
    }
    Ok(trimmed.to_string())
}

/// Разобрать момент расчёта: RFC 3339 или местное `YYYY-MM-DDTHH:MM`.
fn parse_moment(s: &str) -> Result<DateTime<FixedOffset>, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(s.trim()) {
        return Ok(at);
    }

    let naive = NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%dT%H:%M")
        .map_err(|_| format!("expected RFC 3339 or YYYY-MM-DDTHH:MM, got '{s}'"))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|at| at.fixed_offset())
        .ok_or_else(|| format!("local time does not exist: '{s}'"))
}

/// Действие, выбранное пользователем.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Quote {
        request: QuoteRequest,
        at: Option<DateTime<FixedOffset>>,
    },
    Estimate {
        pickup: String,
        delivery: String,
        service: String,
        weight: Option<f64>,
        trailer: bool,
    },
    Track {
        tracking_numbers: Vec<String>,
    },
    History {
        live: bool,
    },
    Cancel {
        tracking_number: String,
    },
}

impl From<Commands> for Action {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Quote {
                service,
                distance,
                weight,
                purchase,
                trailer,
                at,
            } => Action::Quote {
                request: QuoteRequest::new(service, distance, weight)
                    .purchase_amount(purchase)
                    .with_trailer(trailer),
                at,
            },
            Commands::Estimate {
                pickup,
                delivery,
                service,
                weight,
                trailer,
            } => Action::Estimate {
                pickup,
                delivery,
                service,
                weight,
                trailer,
            },
            Commands::Track { tracking_numbers } => Action::Track { tracking_numbers },
            Commands::History { live } => Action::History { live },
            Commands::Cancel { tracking_number } => Action::Cancel { tracking_number },
        }
    }
}

/// Параметры, полученные из командной строки и окружения.
pub struct ClientSet {
    /// Адреса backend и ключи.
    pub settings: ClientSettings,
    /// Уровень логирования.
    pub log_level: LevelFilter,
    /// Выбранное действие.
    pub action: Action,
}

impl Display for ClientSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} | log: {}", self.settings, self.log_level)
    }
}

impl ClientSet {
    /// Сформировать экземпляр [`ClientSet`] на основе данных из командной
    /// строки и окружения.
    ///
    /// При ошибке в переменных окружения приложение завершится.
    fn new(args: CliArgs) -> Self {
        let settings = ClientSettings::from_env()
            .unwrap_or_else(|err| exit_err(&err.to_string(), ExitCode::InvalidEnvironment))
            .with_token(args.token);
        let log_level = match args.verbose {
            true => LevelFilter::Debug,
            false => LevelFilter::Info,
        };

        Self {
            settings,
            log_level,
            action: args.command.into(),
        }
    }
}

/// Получить от пользователя настройки и команду.
///
/// ## Обработка ошибок
///
/// Некорректные аргументы обрабатывает `clap`. Ошибки окружения
/// завершают приложение с кодом [`ExitCode::InvalidEnvironment`].
pub fn parse_cli_args() -> ClientSet {
    ClientSet::new(CliArgs::parse())
}

/// Опубликовать сообщение об ошибке и завершить работу приложения.
pub fn exit_err(message: &str, code: ExitCode) -> ! {
    error!("Ошибка: {} (код {})", message, code.value());
    eprintln!("Error: {}", message);
    exit(code.value() as i32);
}
