//! Session → agent-instance mapping.
//!
//! Every session gets its own instance; reuse happens on config match,
//! recreation on config drift, and eviction by TTL or LRU pressure. The
//! map's lock covers only reads, writes, and the double-checked creation
//! path, and never an agent turn.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use time::OffsetDateTime;

use parley::providers::ProviderFactory;

use crate::agent::instance::{AgentInstance, AgentProfile, TurnDeps};
use crate::config::AgentManagerSettings;
use crate::error::{AgentError, AgentResult};
use crate::session::SessionDescriptor;
use crate::tools::{ToolAdapter, ToolRuntime, ToolServerRegistry};

struct AgentEntry {
    instance: Arc<AgentInstance>,
    profile: AgentProfile,
    tool_servers: HashSet<String>,
    created_at: OffsetDateTime,
    last_used: OffsetDateTime,
}

/// Counters exposed by the stats endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentStats {
    pub total: usize,
    /// Used within the last five minutes.
    pub active: usize,
    pub idle: usize,
    pub max_instances: usize,
    pub instance_ttl_seconds: u64,
}

/// Admin view of one live instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSessionInfo {
    pub session_id: String,
    pub provider: String,
    pub model: String,
    pub tool_servers: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used: OffsetDateTime,
}

pub struct AgentManager {
    settings: AgentManagerSettings,
    providers: Arc<dyn ProviderFactory>,
    registry: Arc<ToolServerRegistry>,
    tool_runtime: Arc<ToolRuntime>,
    deps: Arc<TurnDeps>,
    agents: Mutex<HashMap<String, AgentEntry>>,
}

impl AgentManager {
    pub fn new(
        settings: AgentManagerSettings,
        providers: Arc<dyn ProviderFactory>,
        registry: Arc<ToolServerRegistry>,
        tool_runtime: Arc<ToolRuntime>,
        deps: Arc<TurnDeps>,
    ) -> Self {
        Self {
            settings,
            providers,
            registry,
            tool_runtime,
            deps,
            agents: Mutex::new(HashMap::new()),
        }
    }

    fn build_adapters(&self, server_ids: &HashSet<String>) -> Vec<Arc<ToolAdapter>> {
        let ids: Vec<String> = server_ids.iter().cloned().collect();
        self.registry
            .tools_for(&ids)
            .into_iter()
            .map(|(descriptor, transport)| {
                Arc::new(ToolAdapter::new(
                    descriptor,
                    transport,
                    Arc::clone(&self.tool_runtime),
                ))
            })
            .collect()
    }

    /// Return the session's instance, creating or recreating as needed.
    ///
    /// Safe under concurrent callers for the same session: the whole
    /// check-then-create path runs under the map lock, so simultaneous
    /// first-acquires produce exactly one instance.
    pub fn acquire(
        &self,
        descriptor: &SessionDescriptor,
        profile: AgentProfile,
    ) -> AgentResult<Arc<AgentInstance>> {
        let session_id = &descriptor.session_id;
        let now = OffsetDateTime::now_utc();
        let mut agents = self.agents.lock();

        if let Some(entry) = agents.get_mut(session_id) {
            if entry.profile == profile {
                entry.last_used = now;
                log::debug!("reusing agent instance for session {}", session_id);
                return Ok(Arc::clone(&entry.instance));
            }
            log::info!(
                "agent config changed for session {} ({}/{} -> {}/{}), recreating",
                session_id,
                entry.profile.provider,
                entry.profile.model,
                profile.provider,
                profile.model
            );
            agents.remove(session_id);
        }

        if agents.len() >= self.settings.max_instances {
            let evicted = Self::evict_lru(&mut agents, self.settings.evict_batch);
            log::info!("agent capacity reached, evicted {} oldest instances", evicted);
        }

        let provider = self.providers.build(&profile.params)?;
        // New instances bind every currently registered server; the tool
        // set is retargeted later without touching the instance.
        let tool_servers: HashSet<String> = self.registry.server_ids().into_iter().collect();
        let adapters = self.build_adapters(&tool_servers);

        let instance = Arc::new(AgentInstance::new(
            session_id,
            &descriptor.thread_id,
            profile.clone(),
            provider,
            adapters,
            Arc::clone(&self.deps),
        ));
        agents.insert(
            session_id.clone(),
            AgentEntry {
                instance: Arc::clone(&instance),
                profile,
                tool_servers,
                created_at: now,
                last_used: now,
            },
        );
        log::info!("created agent instance for session {}", session_id);
        Ok(instance)
    }

    /// Drop the mapping and its tool-set record.
    pub fn release(&self, session_id: &str) -> bool {
        let removed = self.agents.lock().remove(session_id).is_some();
        if removed {
            self.deps.contexts.remove(session_id);
            self.deps.coordinator.remove_session(session_id);
            log::info!("released agent instance for session {}", session_id);
        }
        removed
    }

    /// Replace the instance's tool set with adapters sourced from the named
    /// servers. The instance (and its memory binding) is preserved.
    pub fn set_tool_servers(
        &self,
        session_id: &str,
        server_ids: HashSet<String>,
    ) -> AgentResult<()> {
        let mut agents = self.agents.lock();
        let entry = agents
            .get_mut(session_id)
            .ok_or_else(|| AgentError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let adapters = self.build_adapters(&server_ids);
        entry.instance.set_tools(adapters);
        entry.tool_servers = server_ids;
        Ok(())
    }

    pub fn add_tool_server(&self, session_id: &str, server_id: &str) -> AgentResult<()> {
        let current = self.tool_servers(session_id)?;
        let mut updated = current;
        updated.insert(server_id.to_string());
        self.set_tool_servers(session_id, updated)
    }

    pub fn remove_tool_server(&self, session_id: &str, server_id: &str) -> AgentResult<()> {
        let mut current = self.tool_servers(session_id)?;
        current.remove(server_id);
        self.set_tool_servers(session_id, current)
    }

    pub fn tool_servers(&self, session_id: &str) -> AgentResult<HashSet<String>> {
        self.agents
            .lock()
            .get(session_id)
            .map(|e| e.tool_servers.clone())
            .ok_or_else(|| AgentError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Refresh tool adapters for every session bound to `server_id`.
    /// Used after a server registers, unregisters, or changes its catalog.
    pub fn reload_for_server(&self, server_id: &str) -> Vec<String> {
        let mut agents = self.agents.lock();
        let mut affected = Vec::new();
        for (session_id, entry) in agents.iter_mut() {
            if entry.tool_servers.contains(server_id) {
                let adapters = self.build_adapters(&entry.tool_servers);
                entry.instance.set_tools(adapters);
                affected.push(session_id.clone());
            }
        }
        log::info!(
            "reloaded {} agent(s) for tool server '{}'",
            affected.len(),
            server_id
        );
        affected
    }

    pub fn stats(&self) -> AgentStats {
        let now = OffsetDateTime::now_utc();
        let agents = self.agents.lock();
        let active = agents
            .values()
            .filter(|e| now - e.last_used < time::Duration::seconds(300))
            .count();
        AgentStats {
            total: agents.len(),
            active,
            idle: agents.len() - active,
            max_instances: self.settings.max_instances,
            instance_ttl_seconds: self.settings.instance_ttl_seconds,
        }
    }

    pub fn list_sessions(&self) -> Vec<AgentSessionInfo> {
        let agents = self.agents.lock();
        let mut infos: Vec<AgentSessionInfo> = agents
            .iter()
            .map(|(session_id, entry)| AgentSessionInfo {
                session_id: session_id.clone(),
                provider: entry.profile.provider.clone(),
                model: entry.profile.model.clone(),
                tool_servers: entry.tool_servers.iter().cloned().collect(),
                created_at: entry.created_at,
                last_used: entry.last_used,
            })
            .collect();
        infos.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        infos
    }

    pub fn len(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.lock().is_empty()
    }

    /// Evict instances idle past the configured TTL. Returns the count.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = OffsetDateTime::now_utc()
            - time::Duration::seconds(self.settings.instance_ttl_seconds as i64);
        let mut agents = self.agents.lock();
        let before = agents.len();
        agents.retain(|session_id, entry| {
            let keep = entry.last_used > cutoff;
            if !keep {
                log::info!("evicting idle agent instance for session {}", session_id);
            }
            keep
        });
        before - agents.len()
    }

    fn evict_lru(agents: &mut HashMap<String, AgentEntry>, batch: usize) -> usize {
        let mut by_age: Vec<(String, OffsetDateTime)> = agents
            .iter()
            .map(|(id, e)| (id.clone(), e.last_used))
            .collect();
        by_age.sort_by_key(|(_, last_used)| *last_used);
        let victims: Vec<String> = by_age
            .into_iter()
            .take(batch.max(1))
            .map(|(id, _)| id)
            .collect();
        for id in &victims {
            agents.remove(id);
        }
        victims.len()
    }

    /// Spawn the periodic eviction sweeper (instances + stale contexts).
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = self.settings.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = manager.sweep_expired();
                if evicted > 0 {
                    log::info!("sweeper evicted {} expired agent instances", evicted);
                }
                let stale = manager.deps.contexts.sweep_stale();
                if stale > 0 {
                    log::debug!("sweeper dropped {} stale execution contexts", stale);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestHarness;

    fn profile(provider: &str, model: &str) -> AgentProfile {
        let params = parley::LLMParams::new().provider(provider).model(model);
        AgentProfile {
            provider: provider.to_string(),
            model: model.to_string(),
            params,
        }
    }

    async fn descriptor(harness: &TestHarness, user: &str) -> SessionDescriptor {
        harness.sessions.create(user, None).await.unwrap()
    }

    // ── Acquire / reuse ────────────────────────────────────────────────────

    #[tokio::test]
    async fn acquire_reuses_instance_for_same_config() {
        let harness = TestHarness::new().await;
        let manager = harness.agent_manager(AgentManagerSettings::default());
        let desc = descriptor(&harness, "alice").await;

        let first = manager.acquire(&desc, profile("scripted", "m1")).unwrap();
        let second = manager.acquire(&desc, profile("scripted", "m1")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn acquire_recreates_on_config_change() {
        let harness = TestHarness::new().await;
        let manager = harness.agent_manager(AgentManagerSettings::default());
        let desc = descriptor(&harness, "alice").await;

        let first = manager.acquire(&desc, profile("scripted", "m1")).unwrap();
        let second = manager.acquire(&desc, profile("scripted", "m2")).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);
        assert_eq!(second.profile().model, "m2");
    }

    #[tokio::test]
    async fn distinct_sessions_get_distinct_instances() {
        let harness = TestHarness::new().await;
        let manager = harness.agent_manager(AgentManagerSettings::default());
        let a = descriptor(&harness, "alice").await;
        let b = descriptor(&harness, "bob").await;

        let ia = manager.acquire(&a, profile("scripted", "m1")).unwrap();
        let ib = manager.acquire(&b, profile("scripted", "m1")).unwrap();
        assert!(!Arc::ptr_eq(&ia, &ib));
        assert_eq!(ia.thread_id(), a.thread_id);
        assert_eq!(ib.thread_id(), b.thread_id);
    }

    #[tokio::test]
    async fn concurrent_first_acquire_yields_single_instance() {
        let harness = TestHarness::new().await;
        let manager = Arc::new(harness.agent_manager(AgentManagerSettings::default()));
        let desc = descriptor(&harness, "alice").await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let desc = desc.clone();
            handles.push(tokio::spawn(async move {
                manager.acquire(&desc, profile("scripted", "m1")).unwrap()
            }));
        }
        let instances: Vec<_> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
        assert_eq!(manager.len(), 1);
    }

    // ── Capacity ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn capacity_pressure_triggers_lru_batch_eviction() {
        let harness = TestHarness::new().await;
        let settings = AgentManagerSettings {
            max_instances: 3,
            evict_batch: 2,
            ..Default::default()
        };
        let manager = harness.agent_manager(settings);

        let mut descs = Vec::new();
        for i in 0..3 {
            let desc = descriptor(&harness, &format!("user{}", i)).await;
            manager.acquire(&desc, profile("scripted", "m1")).unwrap();
            descs.push(desc);
            // Distinct last_used ordering.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let fresh = descriptor(&harness, "newcomer").await;
        manager.acquire(&fresh, profile("scripted", "m1")).unwrap();

        // Two oldest evicted, newest survivor + newcomer remain.
        assert_eq!(manager.len(), 2);
        assert!(manager.len() <= 3);
        assert!(manager.tool_servers(&descs[0].session_id).is_err());
        assert!(manager.tool_servers(&descs[2].session_id).is_ok());
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired_instances() {
        let harness = TestHarness::new().await;
        let settings = AgentManagerSettings {
            instance_ttl_seconds: 3600,
            ..Default::default()
        };
        let manager = harness.agent_manager(settings);
        let old = descriptor(&harness, "old").await;
        let fresh = descriptor(&harness, "fresh").await;
        manager.acquire(&old, profile("scripted", "m1")).unwrap();
        manager.acquire(&fresh, profile("scripted", "m1")).unwrap();

        {
            let mut agents = manager.agents.lock();
            agents.get_mut(&old.session_id).unwrap().last_used =
                OffsetDateTime::now_utc() - time::Duration::hours(2);
        }

        assert_eq!(manager.sweep_expired(), 1);
        assert_eq!(manager.len(), 1);
        assert!(manager.tool_servers(&fresh.session_id).is_ok());
    }

    // ── Tool-set retargeting ───────────────────────────────────────────────

    #[tokio::test]
    async fn set_tool_servers_preserves_the_instance() {
        let harness = TestHarness::new().await;
        let manager = harness.agent_manager(AgentManagerSettings::default());
        let desc = descriptor(&harness, "alice").await;
        let instance = manager.acquire(&desc, profile("scripted", "m1")).unwrap();
        assert!(!instance.tool_names().is_empty());

        manager
            .set_tool_servers(&desc.session_id, HashSet::new())
            .unwrap();
        let same = manager.acquire(&desc, profile("scripted", "m1")).unwrap();
        assert!(Arc::ptr_eq(&instance, &same));
        assert!(same.tool_names().is_empty());
    }

    #[tokio::test]
    async fn add_and_remove_tool_server_are_deltas() {
        let harness = TestHarness::new().await;
        let manager = harness.agent_manager(AgentManagerSettings::default());
        let desc = descriptor(&harness, "alice").await;
        manager.acquire(&desc, profile("scripted", "m1")).unwrap();

        manager
            .set_tool_servers(&desc.session_id, HashSet::new())
            .unwrap();
        manager
            .add_tool_server(&desc.session_id, harness.server_id())
            .unwrap();
        assert!(
            manager
                .tool_servers(&desc.session_id)
                .unwrap()
                .contains(harness.server_id())
        );

        manager
            .remove_tool_server(&desc.session_id, harness.server_id())
            .unwrap();
        assert!(manager.tool_servers(&desc.session_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn reload_for_server_refreshes_bound_sessions_only() {
        let harness = TestHarness::new().await;
        let manager = harness.agent_manager(AgentManagerSettings::default());
        let bound = descriptor(&harness, "alice").await;
        let unbound = descriptor(&harness, "bob").await;
        let instance = manager.acquire(&bound, profile("scripted", "m1")).unwrap();
        manager.acquire(&unbound, profile("scripted", "m1")).unwrap();
        manager
            .set_tool_servers(&unbound.session_id, HashSet::new())
            .unwrap();

        // Unregister, then reload: the bound session loses its adapters but
        // keeps its instance (and memory).
        harness.registry.unregister(harness.server_id()).unwrap();
        let affected = manager.reload_for_server(harness.server_id());
        assert_eq!(affected, vec![bound.session_id.clone()]);

        let same = manager.acquire(&bound, profile("scripted", "m1")).unwrap();
        assert!(Arc::ptr_eq(&instance, &same));
        assert!(same.tool_names().is_empty());
    }

    // ── Stats ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stats_splits_active_and_idle() {
        let harness = TestHarness::new().await;
        let manager = harness.agent_manager(AgentManagerSettings::default());
        let a = descriptor(&harness, "alice").await;
        let b = descriptor(&harness, "bob").await;
        manager.acquire(&a, profile("scripted", "m1")).unwrap();
        manager.acquire(&b, profile("scripted", "m1")).unwrap();

        {
            let mut agents = manager.agents.lock();
            agents.get_mut(&a.session_id).unwrap().last_used =
                OffsetDateTime::now_utc() - time::Duration::minutes(10);
        }

        let stats = manager.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.max_instances, 100);
    }

    #[tokio::test]
    async fn release_removes_mapping_and_tool_record() {
        let harness = TestHarness::new().await;
        let manager = harness.agent_manager(AgentManagerSettings::default());
        let desc = descriptor(&harness, "alice").await;
        manager.acquire(&desc, profile("scripted", "m1")).unwrap();

        assert!(manager.release(&desc.session_id));
        assert!(manager.is_empty());
        assert!(manager.tool_servers(&desc.session_id).is_err());
        assert!(!manager.release(&desc.session_id));
    }
}
