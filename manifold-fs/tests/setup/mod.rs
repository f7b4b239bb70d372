use std::sync::Arc;

use manifold::factory::{Backends, ObjectDocumentFactory, StorageRouting};
use manifold_fs::FsBackend;
use rand::Rng;
use tempfile::TempDir;

pub struct Harness {
    // Held for its Drop: the temp dir lives as long as the harness.
    #[allow(dead_code)]
    pub dir: TempDir,
    pub fs: FsBackend,
    pub backends: Arc<Backends>,
    pub factory: ObjectDocumentFactory,
}

pub async fn harness() -> anyhow::Result<Harness> {
    let dir = tempfile::tempdir()?;
    let fs = FsBackend::new(dir.path());
    fs.initialize().await?;

    let mut backends = Backends::new();
    backends.register("default", Arc::new(fs.backend()));
    let backends = Arc::new(backends);

    let factory = ObjectDocumentFactory::new(
        Arc::clone(&backends),
        StorageRouting::new().with_default("default"),
    );

    Ok(Harness {
        dir,
        fs,
        backends,
        factory,
    })
}

pub fn random_object_id() -> String {
    format!("obj-{}", rand::thread_rng().gen::<u32>())
}
