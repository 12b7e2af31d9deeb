// FILE: src/engine.rs
//! The STATISTICAL ENGINE seam (§1, GLOSSARY). The concrete third-party
//! embeddable interpreter is explicitly out of scope ("the identity of the
//! statistical engine itself" is excluded per §1), so this module defines
//! only the trait a worker process drives and a deterministic fake used by
//! both the worker binary's default build and the core-crate test suite.

use std::io::Write;
use std::path::Path;

/// One worker process owns exactly one `StatEngine` instance (§4.2). The
/// trait captures the four operations the worker protocol needs: blocking
/// run, cooperative interrupt, and graph enumeration/export for artefact
/// capture (§4.6). It is intentionally not `Sync` — the engine is
/// non-reentrant and every call happens on the worker's single task.
pub trait StatEngine: Send {
    /// Initialise the engine once, on the worker's main thread. On hosts
    /// where the embedded runtime's graphics subsystem requires a
    /// main-thread warm-up, the caller performs that warm-up before this
    /// returns (see `worker::process::warm_up_graphics`).
    fn init(&mut self, edition: &str) -> anyhow::Result<()>;

    /// Run a code string, writing interpreter stdout to `out`.
    fn run(&mut self, code: &str, out: &mut dyn Write) -> anyhow::Result<()>;

    /// Run a script file by path, writing interpreter stdout to `out`.
    fn run_file(&mut self, path: &Path, out: &mut dyn Write) -> anyhow::Result<()>;

    /// Cooperative interrupt of an in-progress `run`/`run_file`. Must not
    /// block; the engine observes this at its next checkpoint.
    fn break_execution(&mut self);

    /// Drop session-scoped programs/macros so a previously interrupted
    /// command cannot pollute the next one (§4.2 step 1).
    fn reset_session_state(&mut self);

    /// Names of graphs created since the list was last reset (§4.6).
    fn graph_names(&self) -> Vec<String>;

    /// Export one named graph to an image file.
    fn export_graph(&self, name: &str, path: &Path) -> anyhow::Result<()>;
}

/// Deterministic in-memory fake. Ships as the only `StatEngine` compiled
/// into the worker binary: a real embeddable-engine adapter is the
/// Non-goal's concrete counterpart and is not part of this core (see
/// DESIGN.md's Open Question resolution). It is enough to exercise every
/// path in the session manager / execution controller / output filter.
#[derive(Debug, Default)]
pub struct NullEngine {
    interrupted: bool,
    graphs: Vec<String>,
}

/// The screen-clear token the worker must strip before handing code to the
/// engine (§4.2 step 2, §8 boundary behaviour).
pub const CLEAR_SCREEN_TOKEN: &str = "cls";

impl StatEngine for NullEngine {
    fn init(&mut self, _edition: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn run(&mut self, code: &str, out: &mut dyn Write) -> anyhow::Result<()> {
        self.interrupted = false;
        for (i, raw_line) in code.lines().enumerate() {
            if self.interrupted {
                writeln!(out, "--Break--")?;
                return Ok(());
            }
            let line = if i == 0 && raw_line.trim() == CLEAR_SCREEN_TOKEN {
                continue;
            } else {
                raw_line
            };
            if line.trim_start().starts_with("display") {
                let expr = line.trim_start().trim_start_matches("display").trim();
                writeln!(out, "{}", eval_display(expr))?;
            } else if line.trim_start().starts_with("graph") {
                let name = format!("Graph{}", self.graphs.len() + 1);
                self.graphs.push(name.clone());
                writeln!(out, "(graph {} created)", name)?;
            } else if line.trim_start().starts_with("error ") {
                anyhow::bail!("{}", line.trim_start().trim_start_matches("error").trim());
            } else {
                writeln!(out, ". {}", line)?;
            }
        }
        Ok(())
    }

    fn run_file(&mut self, path: &Path, out: &mut dyn Write) -> anyhow::Result<()> {
        let code = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read script {}: {}", path.display(), e))?;
        self.run(&code, out)
    }

    fn break_execution(&mut self) {
        self.interrupted = true;
    }

    fn reset_session_state(&mut self) {
        self.interrupted = false;
        self.graphs.clear();
    }

    fn graph_names(&self) -> Vec<String> {
        self.graphs.clone()
    }

    fn export_graph(&self, name: &str, path: &Path) -> anyhow::Result<()> {
        if !self.graphs.iter().any(|g| g == name) {
            anyhow::bail!("no such graph: {}", name);
        }
        std::fs::write(path, b"\x89PNG\r\n\x1a\n")?;
        Ok(())
    }
}

fn eval_display(expr: &str) -> String {
    // A tiny subset sufficient for "display 2+2"-style smoke tests; not a
    // real expression evaluator.
    let cleaned: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
    if let Some((lhs, rhs)) = cleaned.split_once('+') {
        if let (Ok(a), Ok(b)) = (lhs.parse::<f64>(), rhs.parse::<f64>()) {
            return format_num(a + b);
        }
    }
    if let Ok(n) = cleaned.parse::<f64>() {
        return format_num(n);
    }
    expr.to_string()
}

fn format_num(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_arithmetic() {
        let mut e = NullEngine::default();
        let mut out = Vec::new();
        e.run("display 2+2", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().trim(), "4");
    }

    #[test]
    fn clear_screen_token_is_stripped_not_errored() {
        let mut e = NullEngine::default();
        let mut out = Vec::new();
        e.run("cls\ndisplay 1+1", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().trim(), "2");
    }

    #[test]
    fn break_execution_stops_subsequent_lines() {
        let mut e = NullEngine::default();
        e.break_execution();
        let mut out = Vec::new();
        e.run("display 1+1\ndisplay 2+2", &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("--Break--"));
    }

    #[test]
    fn graph_names_reset_between_commands() {
        let mut e = NullEngine::default();
        let mut out = Vec::new();
        e.run("graph twoway x y", &mut out).unwrap();
        assert_eq!(e.graph_names(), vec!["Graph1".to_string()]);
        e.reset_session_state();
        assert!(e.graph_names().is_empty());
    }
}
