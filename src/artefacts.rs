// FILE: src/artefacts.rs
//! Artefact Capture (§4.6): after a run, enumerates the engine's declared
//! graphs and exports each to disk under the session's log directory,
//! gated by `RequestContext.capture_graphs` so only the REST/editor
//! transport pays for it.

use crate::engine::StatEngine;
use crate::model::Artefact;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Directory graphs for one command land in:
/// `<log_dir>/graphs/<session_id>/<command_id>/<name>.png` (§4.6).
pub fn graphs_dir(log_dir: &Path, session_id: &str, command_id: &str) -> PathBuf {
    log_dir.join("graphs").join(session_id).join(command_id)
}

/// Exports every graph the engine currently has declared. A single
/// graph's export failure is logged and skipped rather than aborting the
/// whole command — artefact capture is best-effort, never a reason to
/// fail an otherwise-successful Result.
pub fn export_graphs(
    engine: &dyn StatEngine,
    log_dir: &Path,
    session_id: &str,
    command_id: &str,
) -> Vec<Artefact> {
    let names = engine.graph_names();
    if names.is_empty() {
        return Vec::new();
    }

    let dir = graphs_dir(log_dir, session_id, command_id);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(error = %e, dir = %dir.display(), "failed to create graphs directory, skipping artefact capture");
        return Vec::new();
    }

    let mut artefacts = Vec::with_capacity(names.len());
    for name in names {
        let path = dir.join(format!("{}.png", name));
        match engine.export_graph(&name, &path) {
            Ok(()) => artefacts.push(Artefact { name, path }),
            Err(e) => warn!(error = %e, graph = %name, "failed to export graph, skipping"),
        }
    }
    artefacts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NullEngine;

    #[test]
    fn graphs_dir_is_keyed_by_session_and_command() {
        let dir = graphs_dir(Path::new("/tmp/logs"), "default", "cmd-1");
        assert_eq!(dir, PathBuf::from("/tmp/logs/graphs/default/cmd-1"));
    }

    #[test]
    fn no_graphs_declared_produces_no_artefacts() {
        let engine = NullEngine::default();
        let dir = tempfile::tempdir().unwrap();
        let artefacts = export_graphs(&engine, dir.path(), "default", "cmd-1");
        assert!(artefacts.is_empty());
    }

    #[test]
    fn declared_graphs_are_exported_with_expected_paths() {
        let mut engine = NullEngine::default();
        let mut sink = Vec::new();
        engine.run("graph twoway scatter x y", &mut sink).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let artefacts = export_graphs(&engine, dir.path(), "default", "cmd-2");
        assert_eq!(artefacts.len(), 1);
        assert_eq!(artefacts[0].name, "Graph1");
        assert!(artefacts[0].path.exists());
    }
}
