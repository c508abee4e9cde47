//! Универсальные утилиты.

use crate::config::CURRENCY_SYMBOL;
use std::path::PathBuf;

/// Округлить сумму до копеек (2 знака после запятой).
///
/// Используется только на границе вывода: внутри расчётов суммы не
/// округляются.
pub fn round_currency(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Представить сумму в денежном формате, например `R152.00`.
pub fn format_currency(amount: f64) -> String {
    format!("{}{:.2}", CURRENCY_SYMBOL, round_currency(amount))
}

/// Замаскировать секрет для вывода в консоль и лог: видны только последние
/// четыре символа.
pub fn mask_secret(secret: &str) -> String {
    let visible: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if secret.chars().count() <= 4 {
        return "****".to_string();
    }
    format!("****{}", visible)
}

/// Предоставить родительский каталог проекта.
///
/// Для `debug` это будет директория расположения `cargo.toml`, а для `release`
/// расположение скомпилированного файла.
#[cfg(debug_assertions)]
pub fn get_project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

#[cfg(not(debug_assertions))]
pub fn get_project_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Предоставить корневую директорию всего проекта.
///
/// В режиме `debug` это корень `workspace`, в `release` каталог
/// скомпилированного файла.
pub fn get_workspace_root() -> PathBuf {
    let project_root = get_project_root();
    if cfg!(debug_assertions) {
        project_root
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or(project_root)
    } else {
        project_root
    }
}
