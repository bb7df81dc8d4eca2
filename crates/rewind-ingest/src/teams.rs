//! Token-to-team resolution.
//!
//! Envelopes either carry an explicit `team_id` or an opaque ingestion token.
//! The token table is maintained by the upstream capture service in the
//! shared store; this worker reads it through a [`BackgroundRefresher`] so a
//! flaky store degrades to serving the last-known mapping rather than
//! dropping events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use rewind_core::TeamRef;
use rewind_state::SharedStore;

use crate::error::Result;
use crate::refresher::{BackgroundRefresher, LoaderFuture};

/// Shared-store key holding the `token -> team_id` map.
pub const TOKEN_TABLE_KEY: &str = "team-tokens";

type TokenTable = Arc<HashMap<String, u64>>;

#[derive(Clone)]
pub struct TeamRegistry {
    refresher: BackgroundRefresher<TokenTable>,
}

impl TeamRegistry {
    pub fn new(refresher: BackgroundRefresher<TokenTable>) -> Self {
        Self { refresher }
    }

    /// Registry fed from the shared store's token table.
    pub fn from_shared_store(store: Arc<dyn SharedStore>, interval: Duration) -> Self {
        let loader = move || -> LoaderFuture<TokenTable> {
            let store = store.clone();
            Box::pin(async move {
                let raw = store.read_map(TOKEN_TABLE_KEY).await?;
                let mut table = HashMap::with_capacity(raw.len());
                for (token, team_id) in raw {
                    match team_id.parse::<u64>() {
                        Ok(id) => {
                            table.insert(token, id);
                        }
                        Err(_) => {
                            warn!(token = %token, value = %team_id, "Ignoring unparseable team id");
                        }
                    }
                }
                Ok(Arc::new(table))
            })
        };

        Self::new(BackgroundRefresher::new("team-tokens", interval, loader))
    }

    /// Resolve a wire-level team reference to a team id.
    ///
    /// Explicit ids pass straight through; tokens go through the cached
    /// table. `Ok(None)` means the token is unknown and the event should be
    /// dropped with cause `unknown_team`.
    pub async fn resolve(&self, team: &TeamRef) -> Result<Option<u64>> {
        match team {
            TeamRef::Id(id) => Ok(Some(*id)),
            TeamRef::Token(token) => {
                let table = self.refresher.get().await?;
                Ok(table.get(token).copied())
            }
        }
    }
}
