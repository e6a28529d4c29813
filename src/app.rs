//! Application state and bootstrap wiring.
//!
//! [`App`] owns one instance of every component and the channels between
//! them. Startup is tolerant by design: a missing upstream session boots the
//! gateway serving KV snapshots only (with `/auth/vortex/login` exposed for
//! re-auth), and a dead KV degrades rate limits to per-process counters.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::batcher::SnapshotBatcher;
use crate::config::Settings;
use crate::constants::{channels, keys};
use crate::db::Db;
use crate::error::{GatewayError, Result};
use crate::gateway::rooms::{Rooms, spawn_fanout};
use crate::kv::KvStore;
use crate::metrics::Stats;
use crate::mux::{Multiplexer, MuxHandle};
use crate::policy::ApiKeyPolicy;
use crate::registry::InstrumentRegistry;
use crate::upstream::{
    self, FeedConfig, FeedHandle, FeedManager, StatusBroadcaster, TokenStore, VortexClient,
};

/// Deadline for the cross-instance stats scatter-gather.
const STATS_GATHER_DEADLINE: Duration = Duration::from_millis(250);

/// Everything a request handler can reach.
pub struct App {
    pub settings: Settings,
    pub kv: KvStore,
    pub db: Db,
    pub stats: Stats,
    pub registry: InstrumentRegistry,
    pub policy: ApiKeyPolicy,
    pub vortex: VortexClient,
    pub tokens: TokenStore,
    pub feed: FeedHandle,
    pub mux: MuxHandle,
    pub rooms: Rooms,
    pub batcher: SnapshotBatcher,
    pub status: StatusBroadcaster,
    pub audit: AuditLog,
    pub instance_id: Uuid,
}

impl App {
    /// Wire up every component. Fatal only on config and persistence
    /// failures; the KV and the upstream session are allowed to be absent.
    pub async fn bootstrap(settings: Settings) -> Result<Arc<App>> {
        let kv = KvStore::connect(&settings.redis_url).await;
        let db = Db::connect(&settings.database_url).await?;
        let stats = Stats::new();
        let audit = AuditLog::spawn(db.clone());
        let registry = InstrumentRegistry::new(db.clone(), kv.clone());
        let policy = ApiKeyPolicy::new(db.clone(), kv.clone(), stats.clone());

        // Seed the access token: KV cache first, then the persisted session.
        let mut initial_token = kv.get(keys::VORTEX_ACCESS_TOKEN).await;
        if initial_token.is_none() {
            match db.active_upstream_session("vortex").await {
                Ok(Some(session)) if session.expires_at > Utc::now() => {
                    initial_token = Some(session.access_token);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "could not read persisted session"),
            }
        }
        if initial_token.is_none() {
            tracing::warn!("no upstream session; serving snapshots only until /auth/vortex/login");
        }
        let tokens = TokenStore::new(initial_token);

        let provider = kv
            .get(keys::GLOBAL_PROVIDER)
            .await
            .unwrap_or_else(|| "vortex".to_owned());
        let status = StatusBroadcaster::new(kv.clone(), provider);

        let vortex = VortexClient::new(
            settings.vortex_api_base.clone(),
            &settings.vortex_api_key,
            tokens.clone(),
        )?;

        let (desired_tx, desired_rx) = watch::channel(upstream::DesiredSet::new());
        let feed = FeedManager::spawn(
            FeedConfig {
                ws_url: settings.vortex_ws_url.clone(),
                ..FeedConfig::default()
            },
            tokens.clone(),
            registry.type_hints(),
            desired_rx,
            status.clone(),
            stats.clone(),
        );
        let mux = Multiplexer::spawn(desired_tx, feed.clone(), status.watch());

        let rooms = Rooms::new();
        spawn_fanout(rooms.clone(), feed.clone(), kv.clone(), stats.clone());

        let batcher = SnapshotBatcher::new(
            vortex.clone(),
            Duration::from_millis(settings.batch_window_ms),
        );

        let app = Arc::new(App {
            settings,
            kv,
            db,
            stats,
            registry,
            policy,
            vortex,
            tokens,
            feed,
            mux,
            rooms,
            batcher,
            status,
            audit,
            instance_id: Uuid::new_v4(),
        });
        app.clone().spawn_stats_responder();
        app.clone().spawn_stream_status_listener();
        Ok(app)
    }

    /// Follow `stream:status` transitions published by peer instances so an
    /// admin start/stop against any instance converges the whole fleet. The
    /// handler is level-triggered (acts only when the local posture differs),
    /// so echoes of our own publishes are no-ops.
    fn spawn_stream_status_listener(self: Arc<Self>) {
        let mut rx = self.kv.subscribe(channels::STREAM_STATUS);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let Ok(remote) = serde_json::from_str::<upstream::StreamStatus>(&payload) else {
                    continue;
                };
                let local = self.status.current();
                if remote.provider_name != local.provider_name {
                    self.status
                        .update(|s| s.provider_name = remote.provider_name.clone())
                        .await;
                }
                if remote.is_streaming != local.is_streaming {
                    if remote.is_streaming {
                        if let Err(e) = self.start_streaming().await {
                            tracing::warn!(error = %e, "peer started streaming; local start failed");
                        }
                    } else {
                        self.stop_streaming().await;
                    }
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Upstream session lifecycle
    // -----------------------------------------------------------------------

    /// Complete a Vortex login: exchange the redirect's `auth` token, then
    /// run the activation sequence — persist the session, cache the token in
    /// KV with its JWT-derived TTL, swap the in-process token, and start (or
    /// bounce) the feed. Each step is best-effort individually; a feed
    /// restart failure never invalidates the persisted token.
    pub async fn complete_vortex_login(&self, auth_token: &str) -> Result<String> {
        let (access_token, expires_at) = upstream::auth::exchange_session(
            &self.vortex,
            &self.settings.vortex_application_id,
            auth_token,
            &self.settings.vortex_api_key,
        )
        .await?;

        if let Err(e) = self
            .db
            .activate_upstream_session("vortex", &access_token, expires_at)
            .await
        {
            tracing::warn!(error = %e, "session persistence failed; continuing");
        } else {
            tracing::info!(%expires_at, "upstream session persisted");
        }

        let ttl = upstream::auth::token_ttl_secs(expires_at, Utc::now());
        self.kv
            .set(
                keys::VORTEX_ACCESS_TOKEN,
                &access_token,
                Some(Duration::from_secs(ttl)),
            )
            .await;

        self.tokens.set(Some(access_token.clone()));
        self.status.update(|s| s.auth_required = false).await;

        if self.status.current().is_streaming {
            self.feed.reconnect().await;
            tracing::info!("upstream feed reconnecting with fresh token");
        } else if let Err(e) = self.start_streaming().await {
            tracing::warn!(error = %e, "feed start after login failed");
        }

        Ok(access_token)
    }

    /// Start streaming. Rejected while no upstream session exists.
    pub async fn start_streaming(&self) -> Result<()> {
        if !self.tokens.is_present() {
            return Err(GatewayError::AuthRequired);
        }
        self.feed.start().await;
        Ok(())
    }

    /// Stop streaming.
    pub async fn stop_streaming(&self) {
        self.feed.stop().await;
    }

    /// Upstream said 401: the session is dead. Deactivate it everywhere,
    /// stop streaming, and surface `auth_required` on `stream:status`.
    pub async fn on_upstream_unauthorized(&self) {
        tracing::warn!("upstream session rejected; dropping token and stopping stream");
        if let Err(e) = self.db.deactivate_upstream_session("vortex").await {
            tracing::warn!(error = %e, "session deactivation failed");
        }
        self.kv.del(keys::VORTEX_ACCESS_TOKEN).await;
        self.tokens.set(None);
        self.feed.stop().await;
        self.status
            .update(|s| {
                s.is_streaming = false;
                s.upstream_connected = false;
                s.auth_required = true;
            })
            .await;
    }

    // -----------------------------------------------------------------------
    // Cross-instance stats
    // -----------------------------------------------------------------------

    fn spawn_stats_responder(self: Arc<Self>) {
        let mut queries = self.kv.subscribe(channels::STATS_QUERY);
        tokio::spawn(async move {
            while let Some(query_id) = queries.recv().await {
                let snapshot = self.instance_stats().await;
                let reply = channels::stats_reply(query_id.trim());
                if let Ok(payload) = serde_json::to_string(&snapshot) {
                    self.kv.publish(&reply, &payload).await;
                }
            }
        });
    }

    /// This instance's stats block.
    pub async fn instance_stats(&self) -> serde_json::Value {
        json!({
            "instance": self.instance_id,
            "counters": self.stats.snapshot(),
            "mux": self.mux.stats().await,
            "upstream": self.feed.health(),
            "stream": self.status.current(),
        })
    }

    /// Scatter-gather stats from every instance over pub/sub, with a 250 ms
    /// deadline. Partial results are acceptable and flagged.
    pub async fn gather_stats(&self) -> serde_json::Value {
        let local = self.instance_stats().await;
        if !self.kv.is_available() {
            return json!({ "instances": [local], "partial": false });
        }

        let query_id = Uuid::new_v4().to_string();
        let mut replies = self.kv.subscribe(&channels::stats_reply(&query_id));
        self.kv.publish(channels::STATS_QUERY, &query_id).await;

        let mut instances = vec![local];
        let deadline = tokio::time::sleep(STATS_GATHER_DEADLINE);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                reply = replies.recv() => {
                    let Some(reply) = reply else { break };
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&reply) {
                        // The responder task answers its own query too.
                        if value.get("instance")
                            != Some(&json!(self.instance_id))
                        {
                            instances.push(value);
                        }
                    }
                }
                _ = &mut deadline => break,
            }
        }
        // With pub/sub there is no membership roster; the deadline implies
        // instances may be missing.
        json!({ "instances": instances, "partial": true })
    }
}
