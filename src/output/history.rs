use crate::model::Run;
use crate::output::{accent, format_duration_ms, format_timestamp, info, muted, number, status};
use std::io::Write;

pub fn print_history(mut w: impl Write, runs: &[Run]) -> std::io::Result<()> {
    if runs.is_empty() {
        writeln!(w, "{} No run history yet.", info("i"))?;
        return Ok(());
    }

    for (idx, run) in runs.iter().enumerate() {
        let exit = run
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".to_string());

        writeln!(w, "{} {}", accent(&run.script_name), status(run.status))?;
        writeln!(w, "  id: {}", muted(&run.id))?;
        if !run.parameters.is_empty() {
            writeln!(w, "  parameters ({}): {}", run.mode, run.parameters)?;
        }
        writeln!(w, "  exit: {}", number(&exit))?;
        writeln!(w, "  started (UTC): {}", format_timestamp(run.started_at))?;
        writeln!(
            w,
            "  duration: {}",
            number(&format_duration_ms(run.duration_ms))
        )?;

        if idx + 1 < runs.len() {
            writeln!(w)?;
        }
    }

    Ok(())
}
