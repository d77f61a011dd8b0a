// =============================================================================
// Central Application State — JetTrade Execution Engine
// =============================================================================
//
// Ties every subsystem together. Nothing here is a global: each component is
// constructed once, handed its collaborators explicitly, and shared via Arc.
// The HTTP layer and background tasks all hold the same `Arc<AppState>`.
//
// Thread safety: subsystems manage their own interior mutability
// (parking_lot locks, copy-on-write maps, atomics); AppState itself is
// immutable after construction.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tracing::warn;

use crate::broker::client::BrokerRouter;
use crate::broker::token::TokenCache;
use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::directory::{Directory, LastPriceCache};
use crate::exits::ExitMachine;
use crate::intake::{AcceptedSignal, SignalIntake};
use crate::pipeline::ExecutionPipeline;
use crate::reconcile::Reconciler;
use crate::risk_gate::RiskGate;
use crate::scheduler::{KeyedSerializer, RateGovernor, Scheduler};
use crate::store::TradeStore;
use crate::tracker::PositionTracker;

/// Queue depth between intake and the pipeline.
const PIPELINE_QUEUE_DEPTH: usize = 256;

pub struct AppState {
    pub config: EngineConfig,
    pub bus: EventBus,
    pub scheduler: Scheduler,

    pub directory: Arc<dyn Directory>,
    pub store: Arc<TradeStore>,
    pub market: Arc<LastPriceCache>,
    pub tracker: Arc<PositionTracker>,

    pub tokens: Arc<TokenCache>,
    pub router: Arc<BrokerRouter>,
    pub governor: Arc<RateGovernor>,
    pub serializer: Arc<KeyedSerializer>,

    pub gate: Arc<RiskGate>,
    pub intake: Arc<SignalIntake>,
    pub exits: Arc<ExitMachine>,
    pub pipeline: Arc<ExecutionPipeline>,
    pub reconciler: Arc<Reconciler>,

    /// Engine start, for uptime reporting.
    pub start_time: Instant,
}

impl AppState {
    /// Wire every subsystem. Returns the state and the receiving end of the
    /// intake -> pipeline queue (handed to the pipeline task in main).
    pub fn build(
        config: EngineConfig,
        directory: Arc<dyn Directory>,
        store: Arc<TradeStore>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<AcceptedSignal>)> {
        let bus = EventBus::new();
        let market = Arc::new(LastPriceCache::new());
        let tracker = Arc::new(PositionTracker::new(market.clone()));

        // Restart recovery: open virtual positions come back from the store;
        // exit states rebuild implicitly (every restored key is IDLE).
        tracker.restore(store.open_position_rows());

        let session_tz: Tz = config.session_timezone.parse().unwrap_or_else(|_| {
            warn!(
                tz = %config.session_timezone,
                "unknown session timezone — falling back to America/Chicago"
            );
            chrono_tz::America::Chicago
        });

        let tokens = Arc::new(TokenCache::new(directory.clone(), bus.clone()));
        let router = Arc::new(BrokerRouter::new(tokens.clone()));
        let governor = Arc::new(RateGovernor::new(config.api_rpm_limit, config.api_burst));
        let serializer = Arc::new(KeyedSerializer::new());

        let gate = Arc::new(RiskGate::new(
            store.clone(),
            session_tz,
            config.session_close_hour,
        ));

        let (pipeline_tx, pipeline_rx) = mpsc::channel(PIPELINE_QUEUE_DEPTH);
        let intake = Arc::new(SignalIntake::new(
            directory.clone(),
            store.clone(),
            gate.clone(),
            router.clone(),
            bus.clone(),
            pipeline_tx,
        ));

        let exits = Arc::new(ExitMachine::new(
            router.clone(),
            governor.clone(),
            store.clone(),
            tracker.clone(),
            bus.clone(),
            config.clone(),
        ));

        let pipeline = Arc::new(ExecutionPipeline::new(
            directory.clone(),
            tracker.clone(),
            store.clone(),
            router.clone(),
            tokens.clone(),
            governor.clone(),
            serializer.clone(),
            exits.clone(),
            market.clone(),
            bus.clone(),
            config.clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(
            directory.clone(),
            tracker.clone(),
            store.clone(),
            router.clone(),
            governor.clone(),
            serializer.clone(),
            exits.clone(),
            market.clone(),
            bus.clone(),
            config.clone(),
        ));

        let state = Arc::new(Self {
            config,
            bus,
            scheduler: Scheduler::new(),
            directory,
            store,
            market,
            tracker,
            tokens,
            router,
            governor,
            serializer,
            gate,
            intake,
            exits,
            pipeline,
            reconciler,
            start_time: Instant::now(),
        });

        Ok((state, pipeline_rx))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("tracker", &self.tracker)
            .field("tokens", &self.tokens)
            .field("governor", &self.governor)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::FileDirectory;
    use uuid::Uuid;

    #[tokio::test]
    async fn build_wires_every_subsystem() {
        let directory = Arc::new(FileDirectory::empty("unused.json"));
        let store_path =
            std::env::temp_dir().join(format!("jettrade-app-{}.json", Uuid::new_v4()));
        let store = Arc::new(TradeStore::open(store_path).unwrap());

        let (state, _rx) = AppState::build(EngineConfig::default(), directory, store).unwrap();
        assert!(state.tracker.open_positions().is_empty());
        assert_eq!(state.bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn restart_restores_open_positions() {
        use crate::tracker::{Entry, VirtualPosition};
        use crate::types::Side;

        let directory = Arc::new(FileDirectory::empty("unused.json"));
        let store_path =
            std::env::temp_dir().join(format!("jettrade-app-{}.json", Uuid::new_v4()));
        let store = Arc::new(TradeStore::open(&store_path).unwrap());
        store.upsert_open_position(&VirtualPosition {
            id: "p-1".into(),
            recorder_id: "r-1".into(),
            ticker: "MNQU5".into(),
            side: Side::Long,
            total_qty: 1.0,
            avg_price: 25600.0,
            entries: vec![Entry {
                price: 25600.0,
                qty: 1.0,
                ts: chrono::Utc::now(),
            }],
            opened_at: chrono::Utc::now(),
        });

        let (state, _rx) = AppState::build(EngineConfig::default(), directory, store).unwrap();
        assert_eq!(state.tracker.open_positions().len(), 1);
        // Every restored key starts IDLE in the exit machine.
        assert_eq!(
            state.exits.state("any-trader", "MNQU5"),
            crate::exits::ExitState::Idle
        );
    }
}
