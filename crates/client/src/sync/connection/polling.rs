//! Fixed-interval snapshot polling.
//!
//! Runs underneath the push transports in `Auto` mode as a safety net, and
//! alone in `Polling` mode, where it also owns the connection state.

use tokio::time::MissedTickBehavior;

use super::{ConnectionState, Session};

pub(super) async fn run(session: &Session, owns_state: bool) {
    let mut ticker = tokio::time::interval(session.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if owns_state {
        session.set_state(ConnectionState::Connecting);
    }

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let fetched = tokio::select! {
            _ = session.cancel.cancelled() => return,
            fetched = session.snapshots.fetch_snapshot(&session.project_id) => fetched,
        };

        match fetched {
            Ok(view) => {
                crate::log_debug!("polled snapshot for {}", session.project_id);
                session.push_snapshot(view);
                if owns_state {
                    session.set_state(ConnectionState::Connected);
                }
            }
            Err(e) => {
                crate::log_warn!("snapshot poll for {} failed: {}", session.project_id, e);
                if owns_state {
                    session.set_state(ConnectionState::Failed {
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}
