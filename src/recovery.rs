use std::sync::Arc;

use anyhow::{anyhow, bail};
use tokio::time;
use tracing::{debug, info, warn};

use crate::connection_record::{ConnectionRecord, ConnectionState};
use crate::supervisor::Supervisor;

/// Re-connects an initiator's logical connection after its transport connection failed. There
///  is at most one of these per record at any time, guarded by the record's `recovery_active`
///  flag, and it runs until the connection is established again or closed.
pub(crate) async fn run_recovery(supervisor: Arc<Supervisor>, record: Arc<ConnectionRecord>) {
    let config = supervisor.config();
    let mut num_attempts = 0u32;

    loop {
        if record.state() == ConnectionState::Closed {
            debug!("connection was closed, stopping recovery");
            break;
        }
        if config.max_recovery_attempts.is_some_and(|max| num_attempts >= max) {
            warn!("giving up on {:?} after {} recovery attempts", record.id(), num_attempts);
            supervisor.finish_close(&record);
            break;
        }
        num_attempts += 1;

        match attempt_rejoin(&supervisor, &record).await {
            Ok(()) => {
                if record.state() == ConnectionState::Closed {
                    continue;
                }
                if !should_continue(&record) {
                    info!("recovered {:?} after {} attempt(s)", record.id(), num_attempts);
                    return;
                }
                // the new transport connection failed right away, start over
                num_attempts = 0;
            }
            Err(e) => {
                warn!("recovery attempt #{} for {:?} failed: {}", num_attempts, record.id(), e);
                time::sleep(config.recovery_backoff).await;
            }
        }
    }

    record.lock().recovery_active = false;
}

/// Clears the recovery flag unless the connection is dead again. Checking and clearing happen
///  under the record's lock so that a transport failure in between can not go unnoticed.
fn should_continue(record: &ConnectionRecord) -> bool {
    let mut inner = record.lock();
    if inner.state == ConnectionState::Dead {
        return true;
    }
    inner.recovery_active = false;
    false
}

async fn attempt_rejoin(supervisor: &Arc<Supervisor>, record: &Arc<ConnectionRecord>) -> anyhow::Result<()> {
    let config = supervisor.config();
    let addr = record.remote_addr();

    debug!("opening transport connection to {:?}", addr);
    let connection = time::timeout(config.transport_connect_timeout, supervisor.provider().connect(addr)).await
        .map_err(|_| anyhow!("timeout opening a transport connection to {:?}", addr))??;

    let transport = supervisor.spawn_transport(connection, None);
    if !supervisor.begin_rejoin(record, &transport) {
        transport.close();
        return Ok(());
    }

    let mut state = record.subscribe();
    let reached = time::timeout(
        config.rejoin_attempt_timeout,
        state.wait_for(|s| !matches!(s, ConnectionState::Initiating | ConnectionState::RejoinInitiating)),
    ).await;

    match reached {
        Ok(Ok(s)) if matches!(*s, ConnectionState::Established | ConnectionState::Closed) => Ok(()),
        Ok(Ok(s)) => bail!("transport connection failed during re-join ({:?})", *s),
        Ok(Err(_)) => bail!("connection record was dropped"),
        Err(_) => {
            supervisor.abandon_rejoin(record, &transport);
            bail!("re-join was not acknowledged within {:?}", config.rejoin_attempt_timeout)
        }
    }
}
