mod history;
mod run;
mod scripts;
mod style;

pub use history::print_history;
pub use run::print_run;
pub use scripts::print_scripts;
pub use style::{
    accent, bold, configure, failure, info, muted, number, status, success, warning,
};

pub fn format_duration_ms(ms: i64) -> String {
    if ms < 1000 {
        return format!("{ms}ms");
    }

    if ms.rem_euclid(1000) == 0 {
        return format!("{}s", ms / 1000);
    }

    format!("{:.3}s", ms as f64 / 1000.0)
}

pub(crate) fn format_timestamp(ts: time::OffsetDateTime) -> String {
    ts.format(&time::macros::format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| "-".to_string())
}
