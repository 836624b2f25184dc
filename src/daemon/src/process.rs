//! Supervised worker abstraction and the worker factory.

use async_trait::async_trait;
use hostlink_core::config::{DaemonConfig, WorkerSelection};
use hostlink_core::error::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::deps::Dependency;
use crate::gvproxy::Gvproxy;
use crate::host::{LocalHost, ShellGuest};
use crate::inotify::Inotify;
use crate::vmnet::Vmnet;

/// A background worker run by the daemon.
///
/// `start` blocks until the token is cancelled or the worker fails;
/// returning an error cancels every sibling worker.
#[async_trait]
pub trait Process: Send + Sync {
    /// Worker name, used in logs, status and dependency errors.
    fn name(&self) -> &'static str;

    /// Run the worker until `token` is cancelled.
    async fn start(&self, token: CancellationToken) -> Result<()>;

    /// Report whether the worker is up.
    async fn alive(&self) -> Result<()>;

    /// Host prerequisites, and whether installing them needs root.
    fn dependencies(&self) -> (Vec<Box<dyn Dependency>>, bool);
}

/// The kinds of worker the daemon knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Vmnet,
    Gvproxy,
    Inotify,
}

impl WorkerKind {
    /// Worker kinds enabled by a selection, in start order.
    pub fn selected(selection: &WorkerSelection) -> Vec<WorkerKind> {
        let mut kinds = Vec::new();
        if selection.vmnet {
            kinds.push(WorkerKind::Vmnet);
        }
        if selection.gvproxy {
            kinds.push(WorkerKind::Gvproxy);
        }
        if selection.inotify {
            kinds.push(WorkerKind::Inotify);
        }
        kinds
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerKind::Vmnet => crate::vmnet::NAME,
            WorkerKind::Gvproxy => crate::gvproxy::NAME,
            WorkerKind::Inotify => crate::inotify::NAME,
        }
    }

    /// Construct a fresh worker of this kind.
    pub fn build(&self, config: &DaemonConfig) -> Arc<dyn Process> {
        match self {
            WorkerKind::Vmnet => Arc::new(Vmnet::new(&config.profile, Arc::new(LocalHost::new()))),
            WorkerKind::Gvproxy => Arc::new(Gvproxy::new(config)),
            WorkerKind::Inotify => Arc::new(Inotify::new(
                config,
                Arc::new(ShellGuest::new(config.guest_shell())),
            )),
        }
    }
}

/// Build every worker selected by the configuration.
pub fn processes(config: &DaemonConfig) -> Vec<Arc<dyn Process>> {
    WorkerKind::selected(&config.workers)
        .iter()
        .map(|kind| kind.build(config))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_core::config::Profile;

    #[test]
    fn test_selected_order() {
        let selection = WorkerSelection {
            vmnet: true,
            gvproxy: true,
            inotify: true,
        };
        assert_eq!(
            WorkerKind::selected(&selection),
            vec![WorkerKind::Vmnet, WorkerKind::Gvproxy, WorkerKind::Inotify]
        );
    }

    #[test]
    fn test_selected_empty() {
        assert!(WorkerKind::selected(&WorkerSelection::default()).is_empty());
    }

    #[test]
    fn test_processes_match_names() {
        let mut config = DaemonConfig::new(Profile::with_root("default", "/tmp/hostlink-test"));
        config.workers.gvproxy = true;
        config.workers.inotify = true;

        let names: Vec<&str> = processes(&config).iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["gvproxy", "inotify"]);
    }

    #[test]
    fn test_only_vmnet_requires_root() {
        let mut config = DaemonConfig::new(Profile::with_root("default", "/tmp/hostlink-test"));
        config.workers = WorkerSelection {
            vmnet: true,
            gvproxy: true,
            inotify: true,
        };

        for process in processes(&config) {
            let (deps, root) = process.dependencies();
            if process.name() == "vmnet" {
                assert!(root);
                assert_eq!(deps.len(), 3);
            } else {
                assert!(!root);
                assert!(deps.is_empty());
            }
        }
    }
}
