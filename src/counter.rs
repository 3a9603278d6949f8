//! Counter app — the reducer and root saga the binary runs.
//!
//! Actions use the `{"type": "..."}` wire shape:
//!
//! ```json
//! {"type": "INC"}
//! {"type": "INC_ASYNC", "delay_ms": 500}
//! ```

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::saga::{SagaContext, SagaError};
use crate::store::Store;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub value: i64,
    /// Delayed increments requested but not yet applied.
    pub pending: u32,
}

fn default_delay_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CounterAction {
    Inc,
    Dec,
    Reset,
    /// Increment after a delay; handled by the root saga.
    IncAsync {
        #[serde(default = "default_delay_ms")]
        delay_ms: u64,
    },
    /// Put by the saga once an `IncAsync` delay has elapsed.
    IncAsyncDone,
}

impl FromStr for CounterAction {
    type Err = String;

    /// Accepts a JSON action or one of the shorthands `inc`, `dec`, `reset`,
    /// `inc-async [ms]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with('{') {
            return serde_json::from_str(s).map_err(|e| format!("invalid action json: {e}"));
        }

        let mut words = s.split_whitespace();
        let action = match (words.next(), words.next()) {
            (Some("inc"), None) => Self::Inc,
            (Some("dec"), None) => Self::Dec,
            (Some("reset"), None) => Self::Reset,
            (Some("inc-async"), None) => Self::IncAsync {
                delay_ms: default_delay_ms(),
            },
            (Some("inc-async"), Some(ms)) => Self::IncAsync {
                delay_ms: ms.parse().map_err(|e| format!("invalid delay '{ms}': {e}"))?,
            },
            _ => return Err(format!("unknown action: '{s}'")),
        };
        if words.next().is_some() {
            return Err(format!("unexpected trailing input: '{s}'"));
        }
        Ok(action)
    }
}

pub fn reduce(state: &CounterState, action: &CounterAction) -> CounterState {
    match action {
        CounterAction::Inc => CounterState {
            value: state.value.saturating_add(1),
            ..state.clone()
        },
        CounterAction::Dec => CounterState {
            value: state.value.saturating_sub(1),
            ..state.clone()
        },
        CounterAction::Reset => CounterState::default(),
        CounterAction::IncAsync { .. } => CounterState {
            pending: state.pending.saturating_add(1),
            ..state.clone()
        },
        CounterAction::IncAsyncDone => CounterState {
            value: state.value.saturating_add(1),
            pending: state.pending.saturating_sub(1),
        },
    }
}

async fn increment_later(
    ctx: SagaContext<CounterState, CounterAction>,
    action: CounterAction,
) -> Result<(), SagaError> {
    let CounterAction::IncAsync { delay_ms } = action else {
        return Ok(());
    };
    debug!(delay_ms, "delayed increment scheduled");
    ctx.delay(Duration::from_millis(delay_ms)).await?;
    ctx.put(CounterAction::IncAsyncDone)
}

/// Root routine: one delayed increment per `INC_ASYNC`.
pub async fn root_saga(ctx: SagaContext<CounterState, CounterAction>) -> Result<(), SagaError> {
    ctx.take_every(
        |a| matches!(a, CounterAction::IncAsync { .. }),
        increment_later,
    );
    Ok(())
}

/// Wait until no delayed increment is pending, for at most `limit`.
/// Returns `false` if some were still pending when the time ran out.
pub async fn wait_until_drained(
    store: &Store<CounterState, CounterAction>,
    limit: Duration,
) -> bool {
    let (tx, mut rx) = watch::channel(u32::MAX);
    let mut sub = store.subscribe(move |state: &CounterState| {
        tx.send_replace(state.pending);
    });

    // Read after subscribing so a change in between is not missed.
    let drained = store.get_state().pending == 0
        || tokio::time::timeout(limit, rx.wait_for(|p| *p == 0))
            .await
            .is_ok_and(|r| r.is_ok());
    sub.unsubscribe();
    drained
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_actions() {
        assert_eq!("{\"type\":\"INC\"}".parse(), Ok(CounterAction::Inc));
        assert_eq!(
            "{\"type\":\"INC_ASYNC\"}".parse(),
            Ok(CounterAction::IncAsync { delay_ms: 1_000 })
        );
        assert_eq!(
            r#"{"type":"INC_ASYNC","delay_ms":5}"#.parse(),
            Ok(CounterAction::IncAsync { delay_ms: 5 })
        );
        assert!("{\"type\":\"EXPLODE\"}".parse::<CounterAction>().is_err());
    }

    #[test]
    fn parses_shorthands() {
        assert_eq!(" dec ".parse(), Ok(CounterAction::Dec));
        assert_eq!("reset".parse(), Ok(CounterAction::Reset));
        assert_eq!(
            "inc-async 250".parse(),
            Ok(CounterAction::IncAsync { delay_ms: 250 })
        );
        assert!("inc-async soon".parse::<CounterAction>().is_err());
        assert!("inc twice".parse::<CounterAction>().is_err());
        assert!("".parse::<CounterAction>().is_err());
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_string(&CounterAction::IncAsyncDone).unwrap();
        assert_eq!(json, r#"{"type":"INC_ASYNC_DONE"}"#);
    }

    #[test]
    fn reducer_tracks_pending_increments() {
        let s = reduce(&CounterState::default(), &CounterAction::IncAsync { delay_ms: 1 });
        assert_eq!(s, CounterState { value: 0, pending: 1 });
        let s = reduce(&s, &CounterAction::IncAsyncDone);
        assert_eq!(s, CounterState { value: 1, pending: 0 });
        let s = reduce(&s, &CounterAction::IncAsyncDone);
        assert_eq!(s.pending, 0);
        assert_eq!(reduce(&s, &CounterAction::Reset), CounterState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn drained_once_delayed_increments_land() {
        let app = crate::bootstrap(reduce, CounterState::default(), root_saga).unwrap();
        app.store().dispatch(CounterAction::IncAsync { delay_ms: 300 }).unwrap();
        app.store().dispatch(CounterAction::IncAsync { delay_ms: 600 }).unwrap();

        assert!(wait_until_drained(app.store(), Duration::from_secs(1)).await);
        assert_eq!(app.store().get_state().value, 2);
        assert_eq!(app.store().listener_count(), 0);
        app.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_limit() {
        let app = crate::bootstrap(reduce, CounterState::default(), root_saga).unwrap();
        app.store().dispatch(CounterAction::IncAsync { delay_ms: 5_000 }).unwrap();

        assert!(!wait_until_drained(app.store(), Duration::from_millis(100)).await);
        assert_eq!(app.store().get_state().pending, 1);
        app.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn drained_immediately_when_nothing_pending() {
        let store = Store::new(reduce, CounterState::default());
        assert!(wait_until_drained(&store, Duration::from_millis(1)).await);
    }

    #[test]
    fn reducer_saturates_at_bounds() {
        let top = CounterState {
            value: i64::MAX,
            pending: u32::MAX,
        };
        assert_eq!(reduce(&top, &CounterAction::Inc).value, i64::MAX);
        assert_eq!(
            reduce(&top, &CounterAction::IncAsync { delay_ms: 1 }).pending,
            u32::MAX
        );
        assert_eq!(reduce(&top, &CounterAction::IncAsyncDone).value, i64::MAX);

        let bottom = CounterState {
            value: i64::MIN,
            pending: 0,
        };
        assert_eq!(reduce(&bottom, &CounterAction::Dec).value, i64::MIN);
    }
}
