//! Best-effort mapping from a terminal session to the OS window showing it.
//!
//! The session's process is walked up its parent chain looking for an
//! ancestor that owns a window. When the walk finds nothing, window titles
//! are matched against the session's working directory, and as a last resort
//! the newest window of the terminal application is returned. None of this is
//! guaranteed to pick the right window.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default bound on parent hops.
pub const DEFAULT_MAX_DEPTH: usize = 15;

/// One window known to the window system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    /// Window-system id.
    pub window_id: u64,
    /// Owning process.
    pub owner_pid: u32,
    /// Current title.
    pub title: String,
    /// Owning application name.
    pub app_name: String,
    /// Creation order; larger is newer.
    pub created: u64,
}

/// Parent lookups over the process table.
pub trait ProcessTree {
    /// Parent of `pid`, if known.
    fn parent(&self, pid: u32) -> Option<u32>;
}

/// Source of on-screen windows.
pub trait WindowCatalog {
    /// Windows currently open.
    fn windows(&self) -> Vec<WindowInfo>;
}

/// Snapshot of the process table taken with `sysinfo`.
#[derive(Debug, Clone, Default)]
pub struct SystemProcessTree {
    parents: HashMap<u32, u32>,
}

impl SystemProcessTree {
    /// Capture parent links for every process.
    #[must_use]
    pub fn snapshot() -> Self {
        use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new(),
        );

        let parents = system
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                process
                    .parent()
                    .map(|parent| (pid.as_u32(), parent.as_u32()))
            })
            .collect();
        Self { parents }
    }
}

impl ProcessTree for SystemProcessTree {
    fn parent(&self, pid: u32) -> Option<u32> {
        self.parents.get(&pid).copied()
    }
}

impl ProcessTree for HashMap<u32, u32> {
    fn parent(&self, pid: u32) -> Option<u32> {
        self.get(&pid).copied()
    }
}

impl WindowCatalog for Vec<WindowInfo> {
    fn windows(&self) -> Vec<WindowInfo> {
        self.clone()
    }
}

/// What is known about the session being located.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionHint {
    /// Process running inside the terminal.
    pub pid: u32,
    /// Substring expected in the window title.
    pub session_id: Option<String>,
    /// Session working directory.
    pub working_directory: Option<PathBuf>,
}

/// How a window was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    /// Owned by an ancestor `depth` hops above the session process.
    Ancestry {
        /// Hops walked.
        depth: usize,
    },
    /// Title mentions the working directory.
    WorkingDirectory,
    /// Newest window of the terminal application.
    NewestTerminalWindow,
}

/// Correlation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowMatch {
    /// Chosen window.
    pub window: WindowInfo,
    /// Heuristic that chose it.
    pub method: MatchMethod,
}

/// Window lookup over injected process and window sources.
#[derive(Debug, Clone)]
pub struct WindowCorrelator<P, C> {
    tree: P,
    catalog: C,
    terminal_app: String,
    max_depth: usize,
}

impl<P: ProcessTree, C: WindowCatalog> WindowCorrelator<P, C> {
    /// Correlator for windows of `terminal_app`.
    pub fn new(tree: P, catalog: C, terminal_app: impl Into<String>) -> Self {
        Self {
            tree,
            catalog,
            terminal_app: terminal_app.into(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Override the parent-hop bound.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Find the window most likely showing `hint`'s session.
    pub fn correlate(&self, hint: &SessionHint) -> Option<WindowMatch> {
        let windows = self.catalog.windows();
        if windows.is_empty() {
            return None;
        }

        if let Some(found) = self.by_ancestry(hint, &windows) {
            return Some(found);
        }
        if let Some(window) = by_working_directory(hint, &windows, &self.terminal_app) {
            return Some(WindowMatch {
                window: window.clone(),
                method: MatchMethod::WorkingDirectory,
            });
        }

        let newest = windows
            .iter()
            .filter(|w| w.app_name == self.terminal_app)
            .max_by_key(|w| w.created)?;
        debug!(window_id = newest.window_id, "falling back to newest terminal window");
        Some(WindowMatch {
            window: newest.clone(),
            method: MatchMethod::NewestTerminalWindow,
        })
    }

    fn by_ancestry(&self, hint: &SessionHint, windows: &[WindowInfo]) -> Option<WindowMatch> {
        let mut pid = hint.pid;
        for depth in 0..=self.max_depth {
            if pid <= 1 {
                break;
            }

            let owned: Vec<&WindowInfo> = windows.iter().filter(|w| w.owner_pid == pid).collect();
            if let Some(first) = owned.first() {
                let titled = hint.session_id.as_deref().and_then(|session| {
                    owned
                        .iter()
                        .find(|w| w.title.contains(session))
                        .copied()
                });
                let window = titled.unwrap_or(*first);
                debug!(pid, depth, window_id = window.window_id, "window found by ancestry");
                return Some(WindowMatch {
                    window: window.clone(),
                    method: MatchMethod::Ancestry { depth },
                });
            }

            match self.tree.parent(pid) {
                Some(parent) if parent != pid => pid = parent,
                _ => break,
            }
        }
        None
    }
}

/// Terminal window whose title names the hint's working directory, full
/// path first, then the last component.
fn by_working_directory<'a>(
    hint: &SessionHint,
    windows: &'a [WindowInfo],
    terminal_app: &str,
) -> Option<&'a WindowInfo> {
    let dir = hint.working_directory.as_ref()?;
    let mut terminals = windows.iter().filter(|w| w.app_name == terminal_app);
    let full = dir.to_string_lossy();
    if !full.is_empty() {
        if let Some(window) = terminals.clone().find(|w| w.title.contains(full.as_ref())) {
            return Some(window);
        }
    }

    let base = dir.file_name()?.to_string_lossy();
    if base.is_empty() {
        return None;
    }
    terminals.find(|w| w.title.contains(base.as_ref()))
}
