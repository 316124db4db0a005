use crate::model::ScriptDescriptor;
use crate::output::{bold, info, muted};
use std::io::Write;

pub fn print_scripts(mut w: impl Write, scripts: &[ScriptDescriptor]) -> std::io::Result<()> {
    if scripts.is_empty() {
        writeln!(w, "{} {}", info("i"), muted("No scripts found."))?;
        return Ok(());
    }

    for (idx, script) in scripts.iter().enumerate() {
        writeln!(w, "{}", bold(&script.name))?;
        writeln!(w, "  path: {}", script.path.display())?;

        if let Some(interpreter) = &script.interpreter {
            writeln!(w, "  interpreter: {interpreter}")?;
        }

        if !script.parameter_hints.is_empty() {
            writeln!(w, "  parameters: {}", script.parameter_hints.join(", "))?;
        }

        if idx + 1 < scripts.len() {
            writeln!(w)?;
        }
    }

    Ok(())
}
