use crate::export::RunExport;
use crate::output::{accent, bold, format_duration_ms, format_timestamp, muted, number, status};
use std::io::Write;

/// Full view of one run, output included.
pub fn print_run(mut w: impl Write, run: &RunExport) -> std::io::Result<()> {
    writeln!(w, "{} {}", accent(&run.script_name), status(run.status))?;
    writeln!(w, "  id: {}", muted(&run.id))?;
    writeln!(w, "  status: {}", run.status_label)?;
    if !run.parameters.is_empty() {
        writeln!(w, "  parameters ({}): {}", run.mode, run.parameters)?;
    }
    writeln!(w, "  started (UTC): {}", format_timestamp(run.started_at))?;
    writeln!(
        w,
        "  duration: {}",
        number(&format_duration_ms(run.duration_ms))
    )?;
    writeln!(w)?;
    writeln!(w, "{}", bold("output:"))?;
    writeln!(w, "{}", run.text)
}
