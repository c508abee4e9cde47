//! Общая часть приложений Courier: модели заказов, дерево ошибок, локальный
//! тарифный калькулятор и фабрика логгеров.

use log::*;
use simplelog::{CombinedLogger, ConfigBuilder, WriteLogger};
use std::fs;
use std::fs::File;
use std::path::PathBuf;

pub mod config;
pub mod errors;
pub mod models;
pub mod pricing;
pub mod traits;
pub mod utils;

use errors::CourierError;

/// Фабрика по созданию индивидуальных логгеров для приложений.
///
/// Инициализация требуется один раз при запуске приложения. Далее используются
/// стандартные макросы [`log::info`], [`log::warn`], [`log::error`] для
/// логирования событий.
///
/// ## Args
///
/// - `app_name` — название приложения (будет использовано для создания файла)
/// - `log_dir` — путь к директории расположения log-файлов (при отсутствии
///   пытается создать)
/// - `level` — минимальный уровень записываемых событий
///
/// ## Пример
///
/// ```no_run
/// use log::*;
/// use commons::init_simple_logger;
/// use commons::utils::get_workspace_root;
///
/// let log_dir = get_workspace_root().join("log");
/// init_simple_logger("courier", log_dir, LevelFilter::Info).unwrap();
///
/// info!("Сессия подключена");
/// warn!("Неизвестный тип услуги, расчёт по тарифу по умолчанию");
/// error!("Backend недоступен");
/// ```
///
/// ## Returns
///
/// Путь к созданному log-файлу.
///
/// ## Ошибки
///
/// [`CourierError::Io`] при ошибке создания директории или log-файла,
/// [`CourierError::ValueError`], если логгер уже был инициализирован.
pub fn init_simple_logger(
    app_name: &str,
    log_dir: PathBuf,
    level: LevelFilter,
) -> Result<PathBuf, CourierError> {
    let config = ConfigBuilder::new()
        .set_thread_level(LevelFilter::Debug)
        .set_target_level(LevelFilter::Debug)
        .build();
    let log_file_path = log_dir.join(format!("{}.log", app_name));

    if !log_dir.exists() {
        fs::create_dir_all(&log_dir)?;
    }

    let log_file = File::create(&log_file_path)?;
    let logger = WriteLogger::new(level, config, log_file);

    CombinedLogger::init(vec![logger])
        .map_err(|e| CourierError::value_err(format!("ошибка инициализации логгера: {e}")))?;

    Ok(log_file_path)
}
