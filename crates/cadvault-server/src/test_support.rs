use std::time::Duration;

use cadvault_git::{Coordinator, EngineConfig};
use git2::{Repository, Signature};
use tempfile::TempDir;

use crate::handlers::AppState;

pub struct TestDirs {
    _remote: TempDir,
    _work: TempDir,
}

/// App state backed by a fresh bare remote holding one seed commit.
pub fn state() -> (AppState, TestDirs) {
    let remote = TempDir::new().unwrap();
    let repo = Repository::init_bare(remote.path()).unwrap();
    {
        let blob = repo.blob(b"vault\n").unwrap();
        let mut builder = repo.treebuilder(None).unwrap();
        builder.insert("README.md", blob, 0o100644).unwrap();
        let tree = repo.find_tree(builder.write().unwrap()).unwrap();
        let sig = Signature::now("seed", "seed@example.com").unwrap();
        repo.commit(Some("refs/heads/main"), &sig, &sig, "seed", &tree, &[])
            .unwrap();
    }

    let work = TempDir::new().unwrap();
    let mut config = EngineConfig::new(remote.path().to_string_lossy(), work.path())
        .with_admins(["admin"]);
    config.network_timeout = Duration::from_secs(10);
    let coordinator = Coordinator::open(config).unwrap();

    (
        AppState { coordinator },
        TestDirs {
            _remote: remote,
            _work: work,
        },
    )
}
