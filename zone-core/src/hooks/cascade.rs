//! Cascade worker: performs the SQL-effectful side of §4.3's table rules
//! that a pure `dispatch()` mapping can't — deleting sessions or flows a
//! hook has decided must go away.
//!
//! Grounded in [`crate::wal::sink::ChangeLogSink`]'s "spawn a detached
//! task per unit of work, log failures, never propagate them" shape.
//! Every delete issued here is itself a WAL write: the replication
//! consumer picks it back up and re-dispatches it (e.g. a `flows` delete
//! re-enters [`super::dispatch::dispatch`] and produces the
//! `ExpireFlow`/`Flow(delete)` events the live channels actually react
//! to). This worker never touches a channel's cache directly — per
//! spec §5, that cache is owned exclusively by its own channel task.

use sqlx::PgPool;

use crate::pubsub::{DomainEvent, PubSub, Topic};

pub struct CascadeWorker {
    pool: PgPool,
    pubsub: PubSub,
}

impl CascadeWorker {
    #[must_use]
    pub fn new(pool: PgPool, pubsub: PubSub) -> Self {
        Self { pool, pubsub }
    }

    /// Runs until the mailbox closes (process shutdown). Each event is
    /// handled in its own spawned task so a slow or failing delete never
    /// delays the next cascade in the queue.
    pub async fn run(self) {
        let (_id, mut rx) = self.pubsub.subscribe(&Topic::cascade());
        while let Some(event) = rx.recv().await {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                if let Err(e) = handle(&pool, event).await {
                    tracing::error!("cascade worker: {e}");
                }
            });
        }
    }
}

async fn handle(pool: &PgPool, event: DomainEvent) -> Result<(), sqlx::Error> {
    match event {
        DomainEvent::CascadeDeleteActorSessions { actor_id } => {
            sqlx::query("DELETE FROM tokens WHERE client_id IN (SELECT id FROM clients WHERE actor_id = $1)")
                .bind(actor_id.into_inner())
                .execute(pool)
                .await?;
            sqlx::query("DELETE FROM portal_sessions WHERE actor_id = $1")
                .bind(actor_id.into_inner())
                .execute(pool)
                .await?;
        }
        DomainEvent::CascadeDeleteAuthProviderSessions { auth_provider_id } => {
            sqlx::query(
                "DELETE FROM portal_sessions WHERE actor_id IN \
                 (SELECT id FROM actors WHERE auth_provider_id = $1)",
            )
            .bind(auth_provider_id.into_inner())
            .execute(pool)
            .await?;
            sqlx::query(
                "DELETE FROM tokens WHERE client_id IN \
                 (SELECT c.id FROM clients c JOIN actors a ON a.id = c.actor_id \
                  WHERE a.auth_provider_id = $1)",
            )
            .bind(auth_provider_id.into_inner())
            .execute(pool)
            .await?;
        }
        DomainEvent::CascadeExpireFlowsForPolicy { policy_id } => {
            sqlx::query("DELETE FROM flows WHERE policy_id = $1")
                .bind(policy_id.into_inner())
                .execute(pool)
                .await?;
        }
        DomainEvent::CascadeExpireFlowsForMembership { actor_id, group_id } => {
            sqlx::query(
                "DELETE FROM flows WHERE client_id IN (SELECT id FROM clients WHERE actor_id = $1) \
                 AND policy_id IN (SELECT id FROM policies WHERE actor_group_id = $2)",
            )
            .bind(actor_id.into_inner())
            .bind(group_id.into_inner())
            .execute(pool)
            .await?;
        }
        DomainEvent::CascadeDeleteClientAuthorizations { client_id } => {
            sqlx::query("DELETE FROM flows WHERE client_id = $1")
                .bind(client_id.into_inner())
                .execute(pool)
                .await?;
        }
        DomainEvent::CascadeExpireFlowsForResource { resource_id } => {
            sqlx::query("DELETE FROM flows WHERE resource_id = $1")
                .bind(resource_id.into_inner())
                .execute(pool)
                .await?;
        }
        _ => {}
    }
    Ok(())
}
