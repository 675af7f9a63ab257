//! Pause-Container Registry (spec §3, §4.7, §9 supplemented reconciliation
//! sweep).
//!
//! Generalizes the teacher's `Manager`'s `DashMap` store from "server id
//! -> Server" to "alloc id -> pause container id." Persists no state of
//! its own: it is rebuilt on startup by scanning the engine for
//! containers carrying [`ALLOC_ID_LABEL`].

use dashmap::DashMap;

use crate::engine::{Engine, EngineResult};
use crate::task::ALLOC_ID_LABEL;

/// Name prefix the reconciler matches pause containers on, in addition
/// to the reserved label (spec §6 "Pause-container name prefix").
pub const PAUSE_CONTAINER_NAME_PREFIX: &str = "/nomad_init_";

#[derive(Default)]
pub struct PauseRegistry {
    by_alloc: DashMap<String, String>,
}

impl PauseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, alloc_id: &str) -> Option<String> {
        self.by_alloc.get(alloc_id).map(|r| r.value().clone())
    }

    pub fn insert(&self, alloc_id: &str, container_id: &str) {
        self.by_alloc.insert(alloc_id.to_string(), container_id.to_string());
    }

    pub fn remove(&self, alloc_id: &str) -> Option<String> {
        self.by_alloc.remove(alloc_id).map(|(_, id)| id)
    }

    pub fn len(&self) -> usize {
        self.by_alloc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_alloc.is_empty()
    }

    pub fn pause_container_name(alloc_id: &str) -> String {
        format!("{PAUSE_CONTAINER_NAME_PREFIX}{alloc_id}")
    }

    /// Rebuilds the registry by listing every container carrying the
    /// reserved alloc-id label, including stopped ones.
    pub async fn reconcile(&self, engine: &dyn Engine) -> EngineResult<usize> {
        let containers = engine.container_list(true, ALLOC_ID_LABEL).await?;
        let mut restored = 0;

        for container in containers {
            let is_pause = container
                .names
                .iter()
                .any(|name| name.starts_with(PAUSE_CONTAINER_NAME_PREFIX));
            if !is_pause {
                continue;
            }
            if let Some(alloc_id) = container.labels.get(ALLOC_ID_LABEL) {
                self.by_alloc.insert(alloc_id.clone(), container.id.clone());
                restored += 1;
            }
        }

        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ContainerSummary;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeEngine {
        containers: Vec<ContainerSummary>,
    }

    #[async_trait]
    impl Engine for FakeEngine {
        async fn image_pull(&self, _r: &str, _a: Option<&str>) -> EngineResult<crate::engine::PullStream> {
            unimplemented!()
        }
        async fn image_inspect(&self, _r: &str) -> EngineResult<crate::engine::ImageInspect> {
            unimplemented!()
        }
        async fn image_load(&self, _p: &std::path::Path) -> EngineResult<()> {
            unimplemented!()
        }
        async fn image_remove(&self, _id: &str, _f: bool) -> EngineResult<()> {
            unimplemented!()
        }
        async fn container_create(&self, _s: &crate::engine::ContainerCreateSpec) -> EngineResult<String> {
            unimplemented!()
        }
        async fn container_inspect(&self, _id: &str) -> EngineResult<crate::engine::ContainerInspect> {
            unimplemented!()
        }
        async fn container_start(&self, _id: &str) -> EngineResult<()> {
            unimplemented!()
        }
        async fn container_stop(&self, _id: &str, _t: i64) -> EngineResult<()> {
            unimplemented!()
        }
        async fn container_kill(&self, _id: &str, _s: &str) -> EngineResult<()> {
            unimplemented!()
        }
        async fn container_remove(&self, _id: &str, _f: bool, _v: bool) -> EngineResult<()> {
            unimplemented!()
        }
        async fn container_list(&self, _all: bool, _label_filter: &str) -> EngineResult<Vec<ContainerSummary>> {
            Ok(self.containers.clone())
        }
        async fn container_by_name(&self, _n: &str) -> EngineResult<Option<ContainerSummary>> {
            unimplemented!()
        }
        async fn container_wait(&self, _id: &str) -> EngineResult<i64> {
            unimplemented!()
        }
        async fn container_stats(&self, _id: &str) -> EngineResult<crate::engine::StatsStream> {
            unimplemented!()
        }
        async fn exec_create(&self, _c: &str, _s: &crate::engine::ExecSpec) -> EngineResult<String> {
            unimplemented!()
        }
        async fn exec_start(&self, _id: &str) -> EngineResult<crate::engine::ExecOutputStream> {
            unimplemented!()
        }
        async fn exec_inspect(&self, _id: &str) -> EngineResult<crate::engine::ExecInspect> {
            unimplemented!()
        }
        async fn exec_resize(&self, _id: &str, _w: u16, _h: u16) -> EngineResult<()> {
            unimplemented!()
        }
        async fn server_version(&self) -> EngineResult<String> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn reconcile_restores_pause_containers_by_label() {
        let mut labels = HashMap::new();
        labels.insert(ALLOC_ID_LABEL.to_string(), "alloc-1".to_string());

        let engine = FakeEngine {
            containers: vec![
                ContainerSummary { id: "pause1".into(), names: vec!["/nomad_init_alloc-1".into()], labels: labels.clone() },
                ContainerSummary { id: "other".into(), names: vec!["/unrelated".into()], labels: HashMap::new() },
            ],
        };

        let registry = PauseRegistry::new();
        let restored = registry.reconcile(&engine).await.unwrap();

        assert_eq!(restored, 1);
        assert_eq!(registry.get("alloc-1"), Some("pause1".to_string()));
        assert_eq!(registry.len(), 1);
    }
}
